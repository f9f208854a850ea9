// src/pipeline/metrics.rs
//
// Production observability. Tracks counts and rates for every stage.
// Export via logs or a /metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames_received: Arc<AtomicU64>,
    pub frames_dispatched: Arc<AtomicU64>,
    pub stale_frames: Arc<AtomicU64>,
    pub evicted_frames: Arc<AtomicU64>,
    pub malformed_messages: Arc<AtomicU64>,
    pub tracks_created: Arc<AtomicU64>,
    pub cases_opened: Arc<AtomicU64>,
    pub cases_closed: Arc<AtomicU64>,
    pub sessions_drained: Arc<AtomicU64>,
    pub persistence_retries: Arc<AtomicU64>,
    pub persistence_failures: Arc<AtomicU64>,
    pub commands_undelivered: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: Arc::new(AtomicU64::new(0)),
            frames_dispatched: Arc::new(AtomicU64::new(0)),
            stale_frames: Arc::new(AtomicU64::new(0)),
            evicted_frames: Arc::new(AtomicU64::new(0)),
            malformed_messages: Arc::new(AtomicU64::new(0)),
            tracks_created: Arc::new(AtomicU64::new(0)),
            cases_opened: Arc::new(AtomicU64::new(0)),
            cases_closed: Arc::new(AtomicU64::new(0)),
            sessions_drained: Arc::new(AtomicU64::new(0)),
            persistence_retries: Arc::new(AtomicU64::new(0)),
            persistence_failures: Arc::new(AtomicU64::new(0)),
            commands_undelivered: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_dispatched.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            fps: self.fps(),
            stale_frames: self.stale_frames.load(Ordering::Relaxed),
            evicted_frames: self.evicted_frames.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            tracks_created: self.tracks_created.load(Ordering::Relaxed),
            cases_opened: self.cases_opened.load(Ordering::Relaxed),
            cases_closed: self.cases_closed.load(Ordering::Relaxed),
            sessions_drained: self.sessions_drained.load(Ordering::Relaxed),
            persistence_retries: self.persistence_retries.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            commands_undelivered: self.commands_undelivered.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames_received: u64,
    pub frames_dispatched: u64,
    pub fps: f64,
    pub stale_frames: u64,
    pub evicted_frames: u64,
    pub malformed_messages: u64,
    pub tracks_created: u64,
    pub cases_opened: u64,
    pub cases_closed: u64,
    pub sessions_drained: u64,
    pub persistence_retries: u64,
    pub persistence_failures: u64,
    pub commands_undelivered: u64,
    pub elapsed_secs: f64,
}
