//! Error types for flowlink-datasource
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (pool exhaustion, transient connection failures)
//! - Non-retriable errors (configuration, driver resolution, security setup)

use std::fmt;
use thiserror::Error;

/// Result type for flowlink-datasource operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Descriptor missing or invalid required fields (fatal at init)
    Configuration,
    /// Explicit and discovery driver resolution both failed (fatal)
    DriverLoad,
    /// No matching catalog entry or registered provider
    NotFound,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Realm or credential setup failed (fatal for credentialed descriptors)
    SecurityInit,
    /// Background credential renewal failed (logged only, non-fatal)
    Renewal,
    /// Operation attempted after close
    Closed,
    /// Connection-level failure (retriable)
    Connection,
    /// Filesystem I/O failure
    Io,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::PoolExhausted | Self::Connection)
    }
}

/// Main error type for flowlink-datasource
#[derive(Error, Debug)]
pub enum Error {
    /// Descriptor missing or invalid required fields
    #[error("configuration error: {message}")]
    Configuration {
        /// What is missing or malformed
        message: String,
    },

    /// Both explicit and discovery driver resolution failed
    #[error("driver load error: {message}")]
    DriverLoad {
        /// Resolution failure detail
        message: String,
    },

    /// No matching catalog entry or registered provider
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up
        message: String,
    },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted {
        /// Borrow failure detail
        message: String,
    },

    /// Realm or credential setup failed
    #[error("security init error: {message}")]
    SecurityInit {
        /// Setup failure detail
        message: String,
        /// Underlying cause, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Background credential renewal attempt failed
    #[error("renewal failure: {message}")]
    Renewal {
        /// Renewal failure detail
        message: String,
    },

    /// Operation attempted after close
    #[error("client is closed")]
    Closed,

    /// Connection-level failure
    #[error("connection error: {message}")]
    Connection {
        /// Failure detail
        message: String,
        /// Underlying cause, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Filesystem I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor (de)serialization failure
    #[error("descriptor serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::Serde(_) => ErrorCategory::Configuration,
            Self::DriverLoad { .. } => ErrorCategory::DriverLoad,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::SecurityInit { .. } => ErrorCategory::SecurityInit,
            Self::Renewal { .. } => ErrorCategory::Renewal,
            Self::Closed => ErrorCategory::Closed,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a driver load error
    pub fn driver_load(message: impl Into<String>) -> Self {
        Self::DriverLoad {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a security init error
    pub fn security(message: impl Into<String>) -> Self {
        Self::SecurityInit {
            message: message.into(),
            source: None,
        }
    }

    /// Create a security init error with source
    pub fn security_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SecurityInit {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a renewal failure
    pub fn renewal(message: impl Into<String>) -> Self {
        Self::Renewal {
            message: message.into(),
        }
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
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::DriverLoad => write!(f, "driver_load"),
            Self::NotFound => write!(f, "not_found"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::SecurityInit => write!(f, "security_init"),
            Self::Renewal => write!(f, "renewal"),
            Self::Closed => write!(f, "closed"),
            Self::Connection => write!(f, "connection"),
            Self::Io => write!(f, "io"),
        }
    }
}
