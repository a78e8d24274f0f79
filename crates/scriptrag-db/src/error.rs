//! Error types for scriptrag-db
//!
//! Only a handful of these ever reach pool callers:
//! - `Timeout` and `PoolClosed` from acquisition
//! - `Connection` when the pool has to open a new connection and the driver refuses
//!
//! Everything else (unhealthy connections, failed closes) is absorbed by the
//! pool and only shows up in stats and logs.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for scriptrag-db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Opening or closing a connection failed (retriable)
    Connection,
    /// Statement execution failed
    Query,
    /// Timed out waiting for a connection (retriable)
    Timeout,
    /// The pool has been shut down
    PoolClosed,
    /// Invalid settings
    Configuration,
    /// Value conversion failed
    TypeConversion,
    /// Runtime failures (task panics and the like)
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

/// Main error type for scriptrag-db
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Opening, probing or closing a connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No connection became available before the deadline
    #[error("timeout: {message}")]
    Timeout {
        message: String,
        waited: Option<Duration>,
    },

    /// The pool no longer hands out connections
    #[error("pool closed")]
    PoolClosed,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::PoolClosed => ErrorCategory::PoolClosed,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this is an acquisition timeout
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error carrying the offending SQL and driver error
    pub fn query_with_sql(
        sql: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Query {
            message: source.to_string(),
            sql: Some(sql.into()),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            waited: None,
        }
    }

    /// Create the timeout returned when acquisition gives up
    pub fn acquire_timeout(waited: Duration) -> Self {
        Self::Timeout {
            message: format!("no connection available after {}ms", waited.as_millis()),
            waited: Some(waited),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("background task failed: {err}"))
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Timeout => write!(f, "timeout"),
            Self::PoolClosed => write!(f, "pool_closed"),
            Self::Configuration => write!(f, "configuration"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
