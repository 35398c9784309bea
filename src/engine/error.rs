use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-fixable input problem.
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// The slot was taken between browsing and committing.
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    /// Nobody is free at the requested time under "any staff".
    #[error("no staff available on {date} at {}", .time.format("%H:%M"))]
    NoCapacity { date: NaiveDate, time: NaiveTime },
    #[error("request with idempotency key {0:?} is already in progress")]
    DuplicateRequest(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
