//! Error types for the optimizer service

use thiserror::Error;

/// Result type alias for optimizer operations
pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Main error type for optimizer operations
#[derive(Error, Debug)]
pub enum OptimizerError {
    /// I/O errors (datafile loading, directory walks)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse/serialize errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Redis client errors (connection, protocol)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested datafile is not in the repository
    #[error("datafile not found: {path}")]
    DatafileNotFound { path: String },

    /// Datafile exists but doesn't have the expected shape
    #[error("invalid datafile {path}: {reason}")]
    InvalidDatafile { path: String, reason: String },

    /// Counter store reachable but a specific op failed transiently
    #[error("store error: {0}")]
    Store(String),

    /// Generic error with added context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<OptimizerError>,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl OptimizerError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        OptimizerError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        OptimizerError::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        OptimizerError::Store(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        OptimizerError::Other(msg.into())
    }

    /// Whether this error should be reported to callers as a 5xx they may
    /// retry, rather than a definitive failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, OptimizerError::Redis(_) | OptimizerError::Store(_))
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
