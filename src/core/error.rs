//! Unified error handling for batchgate
//!
//! Every failure the gateway can observe is one variant of [`BatchError`].
//! Per-item failures are converted into error `ResponseItem`s as early as
//! possible; only submission and retrieval failures reach the caller as
//! real errors.

use std::fmt;

use http::StatusCode;

/// Unified error types for the batch gateway
#[derive(Debug)]
pub enum BatchError {
    /// Malformed envelope, zero items or too many items
    ClientInput(String),

    /// Internal target names a service missing from the target map
    UnrecognizedService(String),

    /// The outbound request could not be built (bad method, URL or header)
    RequestConstruction(String),

    /// The outbound call failed at the transport level
    Transport(String),

    /// The outbound response body could not be decoded
    Decode(String),

    /// Queue producer/consumer failures
    Queue(String),

    /// Result store failures
    Store(String),

    /// Async submission aborted because queue or store was unavailable
    Submission(String),

    /// Correlation record never existed or its TTL elapsed
    NotFoundOrExpired(String),

    /// Fault raised inside a worker loop
    WorkerFault(String),

    /// Configuration-related errors
    Configuration(String),

    /// JSON encoding/decoding errors
    Serialization(serde_json::Error),

    /// Internal system errors
    Internal(String),
}

impl BatchError {
    /// Stable tag used in JSON error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::ClientInput(_) => "client_input",
            BatchError::UnrecognizedService(_) => "unrecognized_service",
            BatchError::RequestConstruction(_) => "request_construction",
            BatchError::Transport(_) => "transport",
            BatchError::Decode(_) => "decode",
            BatchError::Queue(_) => "queue",
            BatchError::Store(_) => "store",
            BatchError::Submission(_) => "submission",
            BatchError::NotFoundOrExpired(_) => "not_found_or_expired",
            BatchError::WorkerFault(_) => "worker_fault",
            BatchError::Configuration(_) => "configuration",
            BatchError::Serialization(_) => "serialization",
            BatchError::Internal(_) => "internal",
        }
    }

    /// HTTP status the error maps to when it reaches a caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BatchError::ClientInput(_) => StatusCode::BAD_REQUEST,
            BatchError::NotFoundOrExpired(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Queue and store failures, including the ones already wrapped as a
    /// submission failure.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            BatchError::Queue(_) | BatchError::Store(_) | BatchError::Submission(_)
        )
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::ClientInput(msg) => write!(f, "Invalid batch request: {msg}"),
            BatchError::UnrecognizedService(name) => write!(f, "Unrecognized service: {name}"),
            BatchError::RequestConstruction(msg) => {
                write!(f, "Unable to construct request: {msg}")
            }
            BatchError::Transport(msg) => write!(f, "Request failed: {msg}"),
            BatchError::Decode(msg) => write!(f, "Unable to decode response: {msg}"),
            BatchError::Queue(msg) => write!(f, "Queue error: {msg}"),
            BatchError::Store(msg) => write!(f, "Result store error: {msg}"),
            BatchError::Submission(msg) => write!(f, "Async submission failed: {msg}"),
            BatchError::NotFoundOrExpired(id) => write!(
                f,
                "The async batch request {id} can not be found. It may have expired."
            ),
            BatchError::WorkerFault(msg) => write!(f, "Worker fault: {msg}"),
            BatchError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            BatchError::Serialization(err) => write!(f, "Serialization error: {err}"),
            BatchError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BatchError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        BatchError::Serialization(err)
    }
}

impl From<http::Error> for BatchError {
    fn from(err: http::Error) -> Self {
        BatchError::RequestConstruction(err.to_string())
    }
}

impl From<reqwest::Error> for BatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BatchError::Decode(err.to_string())
        } else if err.is_builder() {
            BatchError::RequestConstruction(err.to_string())
        } else {
            BatchError::Transport(err.to_string())
        }
    }
}

/// Result type alias for batch operations
pub type BatchResult<T> = std::result::Result<T, BatchError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> BatchResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> BatchResult<T> {
        self.map_err(|e| BatchError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! store_error {
    ($msg:expr) => {
        $crate::core::BatchError::Store($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::BatchError::Store(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! queue_error {
    ($msg:expr) => {
        $crate::core::BatchError::Queue($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::BatchError::Queue(format!($fmt, $($arg)*))
    };
}
