use thiserror::Error;

/// Request-level failures of the job API. None of them mutates scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("wrong request ID, please use UUIDv4 format")]
    InvalidId,
    #[error("request with the same ID is already processing")]
    Duplicate,
    #[error("request with ID {0} not found")]
    NotFound(String),
    #[error("service is shutting down")]
    ShuttingDown,
}

impl JobError {
    /// Stable machine code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::InvalidId => "INVALID_ID",
            JobError::Duplicate => "DUPLICATE_ID",
            JobError::NotFound(_) => "JOB_NOT_FOUND",
            JobError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            JobError::ShuttingDown => 503,
            _ => 400,
        }
    }
}
