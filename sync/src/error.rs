//! Error types for the reconciliation engine

use o365_sync_core::api::GraphError;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Why a unit of work was not attempted
///
/// These are "nothing to do" outcomes rather than failures: the task
/// boundary logs them and does not re-queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("remote directory is not configured")]
    NotConfigured,

    #[error("no credential available: {0}")]
    NoCredentials(String),

    #[error("no owner available for {0}")]
    NoOwner(String),

    #[error("no mapping for {0}")]
    NoMapping(String),

    #[error("unknown local record: {0}")]
    UnknownLocal(String),
}

/// Comprehensive error type for reconciliation
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Remote API errors
    #[error("Remote error: {0}")]
    Remote(#[from] GraphError),

    /// Precondition not met; nothing was attempted
    #[error("Skipped: {0}")]
    Skipped(#[from] SkipReason),

    /// Persistence layer errors
    #[error("Store error: {0}")]
    Store(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed task input
    #[error("Invalid data for task '{task}': {message}")]
    InvalidTaskData { task: String, message: String },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Generic errors with context
    #[error("Error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SyncError {
    /// Create a new store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a new invalid task data error
    pub fn invalid_task_data(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTaskData {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn no_mapping(what: impl Into<String>) -> Self {
        Self::Skipped(SkipReason::NoMapping(what.into()))
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            Self::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    /// Whether re-running the same unit of work could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_retryable() || e.is_transport_or_decode(),
            Self::Io(_) | Self::Store(_) => true,
            _ => false,
        }
    }
}
