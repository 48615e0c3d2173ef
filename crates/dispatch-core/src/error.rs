use std::sync::Arc;

use thiserror::Error;

/// Call dispatch errors
///
/// The type is `Clone` because a single failure is delivered both through a
/// task's result future and to the caller of [`Task::execute`](crate::task::Task::execute).
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (config file, CDR file)
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Malformed JSON in a configuration source
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Service bounds that cannot be sampled (`r_min > r_max`)
    #[error("Invalid service bounds: r_min {r_min} > r_max {r_max}")]
    InvalidBounds { r_min: u32, r_max: u32 },

    /// Queue-related errors
    #[error("Queue error: {0}")]
    Queue(String),

    /// A pool was asked to admit a task before a queue was installed
    #[error("No task queue installed")]
    QueueNotInstalled,

    /// The task failed while being serviced
    #[error("Task {call_id} failed: {reason}")]
    TaskFailed { call_id: u64, reason: String },

    /// The task promise was already resolved
    #[error("Result for call {0} already resolved")]
    AlreadyResolved(u64),

    /// The promise was replaced after admission or more than once
    #[error("Promise for call from {0} cannot be replaced")]
    PromiseLocked(String),

    /// The task was dropped without ever being resolved
    #[error("Call {0} was abandoned before a result was produced")]
    Abandoned(u64),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Queue error
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a new TaskFailed error
    pub fn task_failed<S: Into<String>>(call_id: u64, reason: S) -> Self {
        Self::TaskFailed {
            call_id,
            reason: reason.into(),
        }
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
