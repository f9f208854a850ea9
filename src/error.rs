// src/error.rs
//
// Typed errors for the aggregation pipeline. None of these is fatal to the
// process: the supervisor logs, counts, and keeps serving other sessions.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    /// Schema or range violation in an incoming message. The message is
    /// dropped whole; nothing is partially applied.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Frame rejected by the de-jitter intake queue. Counted, not reported.
    #[error("stale frame {frame_id}: {reason}")]
    StaleFrame { frame_id: u64, reason: &'static str },

    /// Operator command addressed to a missing or already-closed case.
    #[error("stale command for case {case_id}")]
    StaleCommand { case_id: u64 },

    /// Case-log write failed after retries. In-memory state stays
    /// authoritative.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A robot's ingest connection went away; its session must be drained.
    #[error("session lost for robot {robot_id}")]
    SessionLost { robot_id: String },
}
