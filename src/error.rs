//! Hadron error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The target object does not exist.
    #[error("object {0} does not exist")]
    ObjectNotFound(String),
    /// The target bucket does not exist.
    #[error("bucket {0} does not exist")]
    BucketNotFound(String),
    /// The backing store failed to serve a request.
    #[error("backend error: {0}")]
    Backend(String),
    /// A peer or connection failure in the streaming transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// The operation was cooperatively canceled.
    #[error("{0} aborted")]
    Aborted(String),
    /// The target job does not exist.
    #[error("job {0} does not exist")]
    XactNotFound(String),
    /// No node of the given cluster map version is eligible for placement.
    #[error("cluster map v{0} has no eligible nodes")]
    NoEligibleNodes(u64),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error: {0}")]
    Ise(anyhow::Error),
}

/// An extension trait for classifying errors which carry an `AppError`.
pub trait AppErrorExt {
    /// Check if this error indicates that an object or bucket does not exist.
    fn is_not_found(&self) -> bool;

    /// Check if this error is the result of cooperative cancellation.
    fn is_aborted(&self) -> bool;

    /// Check if this error originated in the streaming transport.
    fn is_transport(&self) -> bool;
}

impl AppErrorExt for anyhow::Error {
    fn is_not_found(&self) -> bool {
        matches!(self.downcast_ref::<AppError>(), Some(AppError::ObjectNotFound(_) | AppError::BucketNotFound(_)))
    }

    fn is_aborted(&self) -> bool {
        matches!(self.downcast_ref::<AppError>(), Some(AppError::Aborted(_)))
    }

    fn is_transport(&self) -> bool {
        matches!(self.downcast_ref::<AppError>(), Some(AppError::Transport(_)))
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
