//! Error types for the model cache

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error types that can occur while fetching, caching or streaming an object
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Cache store is closed")]
    StoreClosed,

    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Cached data corrupted: {0}")]
    Corrupted(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("http {status}")]
    OriginStatus { status: u16 },

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Stream protocol violation: {0}")]
    Protocol(String),

    #[error("Download worker terminated unexpectedly")]
    WorkerTerminated,

    #[error("Request cancelled before the object was complete")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        let kind = match &err {
            CacheError::Timeout(_) => std::io::ErrorKind::TimedOut,
            CacheError::WorkerTerminated => std::io::ErrorKind::BrokenPipe,
            CacheError::Cancelled => std::io::ErrorKind::ConnectionAborted,
            CacheError::Corrupted(_) | CacheError::Protocol(_) => std::io::ErrorKind::InvalidData,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl CacheError {
    /// Determine if this error is absorbed locally by a fallback path
    ///
    /// Recoverable errors never reach the stream consumer:
    /// - corruption of a cached entry (purge and re-download)
    /// - individual store read/write hiccups (skip caching for this request)
    /// - an unavailable store (degraded, network-only mode)
    ///
    /// Everything else terminates the current request.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CacheError::Corrupted(_) => true,
            CacheError::Store(_) => true,
            CacheError::StoreClosed => true,
            CacheError::StoreUnavailable(_) => true,
            CacheError::Io(_) => true,
            CacheError::Serialization(_) => true,

            CacheError::Config(_) => false,
            CacheError::Http(_) => false,
            CacheError::OriginStatus { .. } => false,
            CacheError::Timeout(_) => false,
            CacheError::Protocol(_) => false,
            CacheError::WorkerTerminated => false,
            CacheError::Cancelled => false,
        }
    }

    /// Create an error from a non-success HTTP status code
    pub fn from_http_status(status: u16) -> Self {
        if (400..600).contains(&status) {
            CacheError::OriginStatus { status }
        } else {
            CacheError::Http(format!("unexpected status {}", status))
        }
    }

    /// Classify a reqwest failure
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CacheError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            CacheError::from_http_status(status.as_u16())
        } else {
            CacheError::Http(err.to_string())
        }
    }
}
