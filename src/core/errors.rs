use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Base64 decode error: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage server error: status code {status_code}, message: {message}")]
    StorageStatus {
        status_code: u16,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Queue is full: capacity {capacity}")]
    QueueFull {
        capacity: usize,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Owner mismatch: queue belongs to {expected}, task belongs to {actual}")]
    OwnerMismatch {
        expected: String,
        actual: String,
    },

    #[error("{count} uploads still active")]
    ActiveUploads {
        count: usize,
    },

    #[error("Queue worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn storage_status(status_code: u16, message: impl Into<String>) -> Self {
        Self::StorageStatus {
            status_code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// 瞬时故障才值得自动重试，坏输入重试多少次结果都一样
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::StorageStatus { .. }
                | Self::Transport(_)
                | Self::Http(_)
        )
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
