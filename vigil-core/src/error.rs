use thiserror::Error;

#[derive(Error, Debug)]
pub enum VigilError {
    /// Admission rejected; the caller may retry after backing off.
    #[error("capacity exceeded: {running} of {limit} job slots in use")]
    Capacity { running: usize, limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("scan process exited with status {exit_code:?}: {reason}")]
    SubprocessFailure {
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("failed to spawn scan process: {0}")]
    SpawnFailure(String),

    #[error("storage inconsistency: {0}")]
    StorageInconsistency(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a local retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VigilError::TransientIo(_))
    }
}

impl From<sqlx::Error> for VigilError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                VigilError::NotFound("database row".to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                VigilError::TransientIo(format!("database: {err}"))
            }
            other => VigilError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
