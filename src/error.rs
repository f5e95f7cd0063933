//! Error kinds propagated through every layer.
//!
//! The store and oracle raise kinds; the engine reacts per its failure model;
//! the socket layer reports them as `error` frames and the request front-end
//! translates them to HTTP statuses. `Internal` carries detail for the log
//! only — clients see a generic message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("daily limit exceeded")]
    DailyLimitExceeded,

    #[error("rate limited, retry after {retry_after_secs}s")]
    ResourceExhausted { retry_after_secs: u64 },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error")]
    Internal(String),
}

impl Error {
    pub fn internal(detail: impl Into<String>) -> Self {
        Error::Internal(detail.into())
    }

    /// Stable machine-readable code carried on wire frames and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated => "UNAUTHENTICATED",
            Error::PermissionDenied => "PERMISSION_DENIED",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Error::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            Error::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Error::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Error::Internal(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::Unauthenticated => 401,
            Error::PermissionDenied => 403,
            Error::InvalidArgument(_) => 400,
            Error::InsufficientFunds | Error::DailyLimitExceeded => 400,
            Error::FailedPrecondition(_) | Error::AlreadyExists(_) => 409,
            Error::NotFound(_) => 404,
            Error::ResourceExhausted { .. } => 429,
            Error::DeadlineExceeded => 504,
            Error::Internal(_) => 500,
        }
    }

    /// Kinds worth exactly one retry on a mutating store call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DeadlineExceeded)
    }

    /// Message safe to show a client. Internal detail stays in the log.
    pub fn client_message(&self) -> String {
        match self {
            Error::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Internal(format!("storage: {e}"))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Internal(format!("codec: {e}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
