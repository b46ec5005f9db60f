use std::time::Duration;
use thiserror::Error;

use crate::request::ThrottleSignal;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the HTTP call itself (connect, DNS, TLS, body read).
#[derive(Debug, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::new(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("response contained unexpected status code: {status}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("rate limited, resume in {:?}", .0.resume_after)]
    Throttled(ThrottleSignal),

    #[error("timeout after {elapsed:?} waiting for {resource} to become consistent")]
    Timeout { resource: String, elapsed: Duration },

    #[error("reconciliation of {resource} was cancelled")]
    Cancelled { resource: String },

    #[error("reconciliation task {name} did not complete: {message}")]
    TaskFailed { name: String, message: String },

    #[error("secret length must be at least 2, got {0}")]
    InvalidSecretLength(usize),

    #[error("random source failure: {0}")]
    Random(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The throttle signal carried by this error, looking through context wrappers.
    pub fn throttle_signal(&self) -> Option<ThrottleSignal> {
        match self {
            Error::Throttled(signal) => Some(*signal),
            Error::Context { source, .. } => source.throttle_signal(),
            _ => None,
        }
    }

    /// Last observed status code of an exhausted request, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::UnexpectedStatus { status, .. } => Some(*status),
            Error::Context { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Context { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Validation(err.to_string())
    }
}

/// Attach the operation being attempted to an error, e.g. "failed to create API key".
pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| Error::Context {
            context: context.into(),
            source: Box::new(err.into()),
        })
    }
}
