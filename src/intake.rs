// src/intake.rs
//
// De-jitter intake queue. Absorbs network/processing jitter between the
// detector and the decision path without letting stale or out-of-order
// frames replay into the temporal reasoning (the "ghosting" failure mode).
//
// Admission: frame_id strictly above the highest id already dispatched for
// this source, and capture time within the staleness bound. Buffered frames
// are kept id-sorted so dispatch is strictly increasing per source, and the
// buffer is bounded: overflow evicts the oldest frame, trading completeness
// for freshness.

use crate::codec::DetectionResult;
use crate::error::PipelineError;
use crate::types::IntakeConfig;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::debug;

pub struct DejitterQueue {
    buffered: VecDeque<DetectionResult>,
    last_dispatched: Option<u64>,
    capacity: usize,
    staleness: Duration,
    evicted: u64,
    dropped_stale: u64,
    dropped_out_of_order: u64,
}

impl DejitterQueue {
    pub fn new(config: &IntakeConfig) -> Self {
        Self {
            buffered: VecDeque::with_capacity(config.capacity),
            last_dispatched: None,
            capacity: config.capacity.max(1),
            staleness: Duration::milliseconds(config.staleness_ms),
            evicted: 0,
            dropped_stale: 0,
            dropped_out_of_order: 0,
        }
    }

    /// Admit a frame or reject it as stale. Rejection is an observability
    /// signal, not a hard failure; callers count it and move on.
    pub fn push(&mut self, frame: DetectionResult, now: DateTime<Utc>) -> Result<(), PipelineError> {
        if let Some(last) = self.last_dispatched {
            if frame.frame_id <= last {
                self.dropped_out_of_order += 1;
                return Err(PipelineError::StaleFrame {
                    frame_id: frame.frame_id,
                    reason: "frame_id not beyond last dispatched",
                });
            }
        }
        if now.signed_duration_since(frame.timestamp) > self.staleness {
            self.dropped_stale += 1;
            return Err(PipelineError::StaleFrame {
                frame_id: frame.frame_id,
                reason: "capture time beyond staleness bound",
            });
        }

        // Insert id-sorted from the back; a duplicate of a buffered frame is
        // dropped the same way a replayed id would be.
        let mut insert_at = self.buffered.len();
        for (i, buffered) in self.buffered.iter().enumerate().rev() {
            if buffered.frame_id == frame.frame_id {
                self.dropped_out_of_order += 1;
                return Err(PipelineError::StaleFrame {
                    frame_id: frame.frame_id,
                    reason: "duplicate of buffered frame",
                });
            }
            if buffered.frame_id < frame.frame_id {
                break;
            }
            insert_at = i;
        }
        self.buffered.insert(insert_at, frame);

        if self.buffered.len() > self.capacity {
            if let Some(oldest) = self.buffered.pop_front() {
                self.evicted += 1;
                debug!(
                    frame_id = oldest.frame_id,
                    "intake full, evicting oldest buffered frame"
                );
            }
        }
        Ok(())
    }

    /// Dispatch the next frame in strictly increasing frame_id order.
    pub fn pop(&mut self) -> Option<DetectionResult> {
        let frame = self.buffered.pop_front()?;
        self.last_dispatched = Some(frame.frame_id);
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn dropped_stale(&self) -> u64 {
        self.dropped_stale
    }

    pub fn dropped_out_of_order(&self) -> u64 {
        self.dropped_out_of_order
    }
}
