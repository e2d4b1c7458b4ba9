use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found")]
    NotFound,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage unavailable for {entity} {id}: {message}")]
    Unavailable {
        entity: &'static str,
        id: String,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    AlreadyExists,
    Conflict,
    InsufficientFunds,
    InvalidTransition,
    Cancelled,
    Unavailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::InvalidInput(_) => ErrorCode::InvalidInput,
            AppError::NotFound => ErrorCode::NotFound,
            AppError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::Cancelled => ErrorCode::Cancelled,
            AppError::Unavailable { .. } => ErrorCode::Unavailable,
            AppError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Storage hiccups and lost optimistic races can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Unavailable { .. } | AppError::Conflict(_))
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        AppError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Storage failure without an aggregate identity yet; see [`ResultExt::for_entity`].
    pub fn unavailable(message: impl Into<String>) -> Self {
        AppError::Unavailable {
            entity: "storage",
            id: String::new(),
            message: message.into(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Attaches the failing aggregate's identity to storage errors.
///
/// Only `Unavailable` is rewritten; every other kind passes through untouched.
pub trait ResultExt<T> {
    fn for_entity(self, entity: &'static str, id: impl ToString) -> AppResult<T>;
}

impl<T> ResultExt<T> for AppResult<T> {
    fn for_entity(self, entity: &'static str, id: impl ToString) -> AppResult<T> {
        self.map_err(|err| match err {
            AppError::Unavailable { message, .. } => AppError::Unavailable {
                entity,
                id: id.to_string(),
                message,
            },
            other => other,
        })
    }
}
