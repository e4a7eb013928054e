use std::time::Duration;

use thiserror::Error;

use crate::types::WorkerId;

#[derive(Error, Debug)]
pub enum Error {
    /// The assignor produced a result that breaks its own invariants. This is
    /// a bug in the assignor and the epoch is never distributed.
    #[error("assignment inconsistency: {0}")]
    AssignmentInconsistency(String),

    #[error("worker {worker} did not apply epoch {epoch} in time")]
    ApplyTimeout { worker: WorkerId, epoch: u64 },

    #[error("worker {worker} failed to apply assignment: {reason}")]
    ApplyFailed { worker: WorkerId, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("cluster not stable after {waited:?}, unconverged workers: {unconverged:?}")]
    StabilityTimeout {
        waited: Duration,
        unconverged: Vec<WorkerId>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::AssignmentInconsistency(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
