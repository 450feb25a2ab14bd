use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("unknown job status '{0}'")]
    UnknownStatus(String),

    #[error("unknown sort key '{0}'")]
    UnknownSort(String),
}
