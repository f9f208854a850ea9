// src/config.rs

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| format!("parsing config file {path}"))?;
        Ok(config)
    }

    /// Missing file falls back to defaults; a present but invalid file is an
    /// error so a typo never silently reverts the deployment to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
