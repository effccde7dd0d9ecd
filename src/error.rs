//! Error types for the VNet core.

use std::error::Error as StdError;
use std::net::IpAddr;
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// VNet-specific errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VnetError {
    /// Malformed configuration or parameter. Never retried.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// TUN read/write failure or another I/O-class fault. Causes forwarder
    /// exit and manager shutdown.
    #[error("I/O error: {0}")]
    Io(#[source] ErrorContext),

    /// Network-stack failure (endpoint creation, address registration).
    /// Treated with the same severity as an I/O error.
    #[error("network stack error: {0}")]
    Stack(#[source] ErrorContext),

    /// Cooperative shutdown. Expected at teardown and elided from aggregates
    /// when any other error is present.
    #[error("operation canceled")]
    Canceled,

    /// Inbound TCP connection to an address with no bound handler. Recovered
    /// locally by refusing the attempt with a TCP reset.
    #[error("no TCP handler for {0}")]
    NoHandler(IpAddr),

    /// Error returned from a handler body. The connection is closed; the
    /// manager is unaffected.
    #[error("handler error: {0}")]
    Handler(#[source] ErrorContext),

    /// Collection of errors observed during one run.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<VnetError>),
}

impl VnetError {
    /// Create an I/O error with context only.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(ErrorContext::new(message))
    }

    /// Create an I/O error with preserved source.
    pub fn io_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Io(ErrorContext::with_source(message, source))
    }

    /// Create a network-stack error with context only.
    pub fn stack(message: impl Into<String>) -> Self {
        Self::Stack(ErrorContext::new(message))
    }

    /// Create a network-stack error with preserved source.
    pub fn stack_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Stack(ErrorContext::with_source(message, source))
    }

    /// Create a handler error with context only.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(ErrorContext::new(message))
    }

    /// Create a configuration/parameter error.
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter(message.into())
    }

    /// Returns true for cooperative-shutdown errors.
    pub fn is_canceled(&self) -> bool {
        matches!(self, VnetError::Canceled)
    }

    /// Collapse the errors observed during a run into one value.
    ///
    /// `Canceled` entries are dropped whenever any other error is present;
    /// a single survivor is returned unwrapped.
    pub fn aggregate(mut errors: Vec<VnetError>) -> Option<VnetError> {
        if errors.iter().any(|e| !e.is_canceled()) {
            errors.retain(|e| !e.is_canceled());
        }
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(VnetError::Aggregate(errors)),
        }
    }
}

impl From<std::io::Error> for VnetError {
    fn from(err: std::io::Error) -> Self {
        VnetError::Io(ErrorContext::with_source("I/O failure", err))
    }
}

/// Result type alias for VNet operations.
pub type VnetResult<T> = Result<T, VnetError>;
