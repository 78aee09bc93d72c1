//! Status errors returned by the session runtime.

use std::fmt;

use dataflow_ir::IrError;
use thiserror::Error;

/// Coarse class of a [`SessionError`], for callers that branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Internal,
    Cancelled,
    DeadlineExceeded,
    Aborted,
    Unimplemented,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
        };
        f.write_str(s)
    }
}

/// A failed status. Cloned freely: one latched step error is handed to every
/// partition, every rendezvous waiter and the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Internal: {0}")]
    Internal(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),
}

impl SessionError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SessionError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SessionError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SessionError::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        SessionError::Cancelled(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        SessionError::DeadlineExceeded(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            SessionError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            SessionError::Internal(_) => ErrorCode::Internal,
            SessionError::Cancelled(_) => ErrorCode::Cancelled,
            SessionError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            SessionError::Aborted(_) => ErrorCode::Aborted,
            SessionError::Unimplemented(_) => ErrorCode::Unimplemented,
        }
    }

    /// The message without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            SessionError::InvalidArgument(m)
            | SessionError::NotFound(m)
            | SessionError::AlreadyExists(m)
            | SessionError::FailedPrecondition(m)
            | SessionError::Internal(m)
            | SessionError::Cancelled(m)
            | SessionError::DeadlineExceeded(m)
            | SessionError::Aborted(m)
            | SessionError::Unimplemented(m) => m,
        }
    }

    /// Same code, message prefixed with `context`.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        let msg = format!("{}: {}", context, self.message());
        match self.code() {
            ErrorCode::InvalidArgument => SessionError::InvalidArgument(msg),
            ErrorCode::NotFound => SessionError::NotFound(msg),
            ErrorCode::AlreadyExists => SessionError::AlreadyExists(msg),
            ErrorCode::FailedPrecondition => SessionError::FailedPrecondition(msg),
            ErrorCode::Internal => SessionError::Internal(msg),
            ErrorCode::Cancelled => SessionError::Cancelled(msg),
            ErrorCode::DeadlineExceeded => SessionError::DeadlineExceeded(msg),
            ErrorCode::Aborted => SessionError::Aborted(msg),
            ErrorCode::Unimplemented => SessionError::Unimplemented(msg),
        }
    }
}

impl From<IrError> for SessionError {
    fn from(err: IrError) -> Self {
        let msg = err.to_string();
        match err {
            IrError::TensorNotFound { .. } | IrError::NodeNotFound { .. } => {
                SessionError::NotFound(msg)
            }
            IrError::UnplacedNode { .. } => SessionError::Internal(msg),
            IrError::Unsupported(_) => SessionError::Unimplemented(msg),
            _ => SessionError::InvalidArgument(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// First-error-wins update of a shared status slot.
pub(crate) fn update_status(status: &mut Result<()>, new: Result<()>) {
    if status.is_ok() {
        if let Err(e) = new {
            *status = Err(e);
        }
    }
}
