use std::sync::{Arc, Mutex};

use tracing::error;

use crate::jobs::{JobId, QueueName};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no driver registered under '{0}'")]
    UnknownDriver(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("handle '{0}' is no longer leased")]
    HandleExpired(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("handler already registered for name '{0}'")]
    HandlerAlreadyRegistered(&'static str),
    #[error("handler not found for job '{0}'")]
    NoHandler(String),
    #[error("job {name} ({id}) failed: {source}")]
    JobFailed {
        id: JobId,
        name: String,
        #[source]
        source: StdError,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable identifier exposed to HTTP callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownDriver(_) => "unknown_driver",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::Serialization(_) => "serialization_error",
            Error::HandleExpired(_) => "handle_expired",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::HandlerAlreadyRegistered(_) => "handler_already_registered",
            Error::NoHandler(_) => "no_handler",
            Error::JobFailed { .. } => "job_failed",
            Error::Config(_) => "config",
        }
    }

    /// Transient failures that a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }

    pub(crate) fn unknown_connection(queue: &QueueName) -> Self {
        Error::InvalidArgument(format!("no connection configured for queue '{}'", queue))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendUnavailable(e.to_string())
    }
}

#[cfg(feature = "backend-redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        match e.kind() {
            redis::ErrorKind::TypeError => Error::Serialization(e.to_string()),
            _ => Error::BackendUnavailable(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Error::Serialization(e.to_string())
            }
            sqlx::Error::Configuration(_) => Error::Config(e.to_string()),
            _ => Error::BackendUnavailable(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub trait ErrorHandler: Send + Sync {
    fn job_failed(&self, job_id: &JobId, job_name: &str, error: &Error);
}

#[derive(Clone, Default)]
pub struct ErrorHandlers {
    handlers: Arc<Mutex<Vec<Box<dyn ErrorHandler>>>>,
}

impl std::fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandlers").finish()
    }
}

impl ErrorHandlers {
    pub(crate) fn add(&mut self, handler: impl ErrorHandler + 'static) {
        match self.handlers.lock() {
            Ok(mut handlers) => handlers.push(Box::new(handler)),
            Err(e) => error!("failed to lock handlers: {}", e),
        }
    }
}

impl ErrorHandler for ErrorHandlers {
    fn job_failed(&self, job_id: &JobId, job_name: &str, error: &Error) {
        match self.handlers.lock() {
            Ok(handlers) => {
                for handler in handlers.iter() {
                    handler.job_failed(job_id, job_name, error);
                }
            }
            Err(e) => {
                error!("failed to lock handlers: {}", e);
            }
        }
    }
}
