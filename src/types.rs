// src/types.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Detection labels the perception model can emit. The set is closed by the
/// wire schema; anything else fails validation at the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Knife,
    Gun,
    LyingDown,
    Cigarette,
}

impl Label {
    pub const ALL: [Label; 4] = [Label::Knife, Label::Gun, Label::LyingDown, Label::Cigarette];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knife => "knife",
            Self::Gun => "gun",
            Self::LyingDown => "lying_down",
            Self::Cigarette => "cigarette",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    Danger,
    Emergency,
    Illegal,
}

impl CaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Danger => "danger",
            Self::Emergency => "emergency",
            Self::Illegal => "illegal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Idle,
    Moving,
    Patrolling,
    Detected,
}

impl RobotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Moving => "moving",
            Self::Patrolling => "patrolling",
            Self::Detected => "detected",
        }
    }
}

/// Patrol zones. The robot reports its current zone with every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    A,
    B,
    #[serde(rename = "BASE")]
    Base,
}

/// A single raw detection inside a frame. Has no identity of its own until
/// the tracker associates it to a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: Label,
    pub confidence: f32,
    /// [x1, y1, x2, y2] in pixels, x1 < x2 and y1 < y2.
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
}

/// One smoothed output record per live track per frame tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedDetection {
    pub track_id: u64,
    pub label: Label,
    pub confidence: f32,
    pub bbox: [i32; 4],
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub intake: IntakeConfig,
    pub tracker: TrackerConfig,
    pub decision: DecisionConfig,
    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener for detector frame results.
    pub detector_bind: String,
    /// Listener for robot detection packets (telemetry piggyback).
    pub robot_bind: String,
    /// Listener for operator commands from the GUI.
    pub command_bind: String,
    /// Listener for GUI event subscribers.
    pub gui_bind: String,
    /// Address of the robot controller that receives movement commands.
    pub robot_controller_addr: String,
    /// Robot ids assigned to ingest connections, in accept order.
    pub robot_ids: Vec<String>,
    /// Capacity of the stage hand-off channels.
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            detector_bind: "0.0.0.0:9003".to_string(),
            robot_bind: "0.0.0.0:9001".to_string(),
            command_bind: "0.0.0.0:9006".to_string(),
            gui_bind: "0.0.0.0:9004".to_string(),
            robot_controller_addr: "127.0.0.1:9101".to_string(),
            robot_ids: vec!["robot_1".to_string()],
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Maximum buffered frames per source before the oldest is evicted.
    pub capacity: usize,
    /// Frames older than this (now - capture time) are dropped as stale.
    pub staleness_ms: i64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            staleness_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU to match a detection to an existing track of the same label.
    pub min_iou: f32,
    /// Consecutive misses before a track is destroyed.
    pub miss_threshold: u32,
    /// Alpha-beta filter position gain.
    pub alpha: f32,
    /// Alpha-beta filter velocity gain.
    pub beta: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.15,
            miss_threshold: 3,
            alpha: 0.5,
            beta: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Evidence window length W, in seconds.
    pub window_secs: f64,
    /// Fraction of window frames that must exceed the label threshold.
    pub trigger_ratio: f32,
    /// Minimum samples in the window before the vote is meaningful.
    /// Guards against a single early frame counting as 100%.
    pub min_samples: usize,
    /// Zero-evidence duration after which an open case auto-closes.
    pub cooldown_secs: f64,
    /// Per-label smoothed-confidence thresholds.
    pub thresholds: HashMap<Label, f32>,
    /// Label to case-type policy map. Labels absent here never open a case.
    pub case_mapping: HashMap<Label, CaseType>,
}

impl DecisionConfig {
    pub fn threshold_for(&self, label: Label) -> f32 {
        self.thresholds.get(&label).copied().unwrap_or(0.5)
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert(Label::Knife, 0.60);
        thresholds.insert(Label::Gun, 0.60);
        thresholds.insert(Label::LyingDown, 0.55);
        thresholds.insert(Label::Cigarette, 0.50);

        let mut case_mapping = HashMap::new();
        case_mapping.insert(Label::Knife, CaseType::Danger);
        case_mapping.insert(Label::Gun, CaseType::Danger);
        case_mapping.insert(Label::LyingDown, CaseType::Emergency);
        case_mapping.insert(Label::Cigarette, CaseType::Illegal);

        Self {
            window_secs: 2.0,
            trigger_ratio: 0.40,
            min_samples: 5,
            cooldown_secs: 5.0,
            thresholds,
            case_mapping,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Operator account recorded on case logs.
    pub user_id: String,
    /// Timeout for delivering a command to the robot controller.
    pub command_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: "operator".to_string(),
            command_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Address of the case-log store.
    pub store_addr: String,
    /// Per-write timeout.
    pub write_timeout_ms: u64,
    /// Base backoff between retries; doubles per attempt.
    pub backoff_ms: u64,
    /// Attempts before a batch is abandoned with an alert.
    pub max_attempts: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:9005".to_string(),
            write_timeout_ms: 1000,
            backoff_ms: 200,
            max_attempts: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_schema() {
        assert_eq!(serde_json::to_string(&Label::LyingDown).unwrap(), "\"lying_down\"");
        assert_eq!(serde_json::to_string(&Location::Base).unwrap(), "\"BASE\"");
        assert_eq!(serde_json::to_string(&RobotStatus::Patrolling).unwrap(), "\"patrolling\"");
        assert_eq!(serde_json::to_string(&CaseType::Illegal).unwrap(), "\"illegal\"");
    }

    #[test]
    fn default_policy_covers_every_label() {
        let cfg = DecisionConfig::default();
        for label in Label::ALL {
            assert!(cfg.case_mapping.contains_key(&label));
            assert!(cfg.thresholds.contains_key(&label));
        }
    }
}
