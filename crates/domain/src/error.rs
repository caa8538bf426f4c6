use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("a run is already in progress for this key")]
    Busy,
    #[error("external service failed: {0}")]
    External(String),
    #[error("storage error: {0}")]
    Storage(String),
}
