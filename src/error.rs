//! Error types shared across the queue, the processor and the HTTP layer.

use thiserror::Error;

use crate::engine::EngineError;
use crate::{JobId, Status};

/// A job description that can never be rendered. Raised before enqueue.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Duration must be a positive number of seconds, got {0}")]
    InvalidDuration(f64),

    #[error("Lyric line {index} starts at {start} after it ends at {end}")]
    InvalidLyric { index: usize, start: f64, end: f64 },
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {0} is being processed")]
    JobProcessing(JobId),

    #[error("Job {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition { id: JobId, from: Status, to: Status },

    #[error("Job {0} does not hold the processing marker")]
    MarkerNotHeld(JobId),

    #[error("Processing marker is already held by job {0}")]
    MarkerHeld(JobId),

    #[error("Job {0} not found")]
    JobNotFound(JobId),
}

/// Failure of a single video type sub-step.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to stage render inputs: {0}")]
    Staging(#[from] std::io::Error),

    #[error("Failed to encode render inputs: {0}")]
    Props(#[from] serde_json::Error),
}
