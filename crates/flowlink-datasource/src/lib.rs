//! # flowlink-datasource
//!
//! Datasource connectivity subsystem for the Flowlink workflow platform.
//!
//! This crate provisions pooled, credential-aware database connectivity from
//! declarative connection descriptors, with vendor drivers resolved out of an
//! on-disk artifact repository.
//!
//! ## Features
//!
//! - **Driver Catalog**: Two-level on-disk repository of vendor driver
//!   artifacts, indexed once per scan with deterministic default selection
//! - **Isolated Loading Contexts**: Each resolution runs inside an immutable,
//!   explicitly-passed artifact scope; concurrent resolutions never observe
//!   each other's artifacts
//! - **Driver Resolution**: Explicit driver first, registry-wide discovery on
//!   mismatch
//! - **Policy-Driven Pooling**: Bounded multiplexed pools for relational
//!   backends, capacity-1 session pools for session-oriented engines
//! - **Credential Lifecycle**: Keytab-derived identities with a cancellable
//!   background renewal schedule
//! - **Client Facade**: One entry point composing the above behind a strict
//!   lifecycle with ordered shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowlink_datasource::prelude::*;
//!
//! let catalog = Arc::new(DriverCatalog::scan(&CatalogConfig::from_env()?));
//! let contexts = Arc::new(ContextManager::new());
//! let mut registry = DriverRegistry::new();
//! registry.register(DbType::PostgreSql, postgres_factory());
//!
//! let provider = ClientProvider::new(catalog, contexts, Arc::new(registry));
//!
//! let descriptor = ConnectionDescriptor::new(DbType::PostgreSql, "postgres://h:5432/db")
//!     .with_user("etl")
//!     .with_secret("pw");
//!
//! let client = provider.create_client(descriptor).await?;
//! let conn = client.get_connection().await?;
//! conn.execute("select 1").await?;
//! client.close().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod catalog;
pub mod client;
pub mod context;
pub mod credential;
pub mod descriptor;
pub mod error;
pub mod pool;
pub mod resolver;

pub use error::{Error, ErrorCategory, Result};

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Descriptor types
    pub use crate::descriptor::{
        decode_secret, encode_secret, ConnectionDescriptor, DbType, SecurityConfig,
    };

    // Catalog types
    pub use crate::catalog::{CatalogConfig, DriverCatalog, DRIVER_DIR_ENV, PLUGIN_DIR_ENV};

    // Loading context types
    pub use crate::context::{ActiveContext, ContextManager, LoadingContext};

    // Resolution types
    pub use crate::resolver::{
        Connection, Driver, DriverFactory, DriverRegistry, ResolvedDriver,
    };

    // Pool types
    pub use crate::pool::{
        DriverPool, PoolConfig, PoolPolicy, PoolStats, PooledConnection, DEFAULT_MAX_ACTIVE,
        DEFAULT_MAX_IDLE, DEFAULT_MIN_IDLE, DEFAULT_VALIDATION_QUERY,
    };

    // Credential types
    pub use crate::credential::{
        CredentialLease, Identity, SharedIdentity, DEFAULT_RENEWAL_INTERVAL,
    };

    // Client types
    pub use crate::client::{ClientProvider, ClientState, DataSourceClient};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_exports() {
        let _ = DbType::PostgreSql;
        let _ = PoolPolicy::SingleSession;
        let _ = ClientState::Created;
        assert_eq!(DEFAULT_MAX_ACTIVE, 50);
    }

    #[test]
    fn test_error_reexported_at_root() {
        let err: crate::Error = crate::Error::config("x");
        assert_eq!(err.category(), crate::ErrorCategory::Configuration);
    }
}
