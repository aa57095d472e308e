//! Datasource client facade
//!
//! Composes the catalog, context manager, resolver, pool factory and
//! credential manager behind a per-connection lifecycle:
//!
//! ```text
//! Created -> PreInit -> EnvChecked -> Initialized -> Open -> Closed
//! ```
//!
//! [`ClientProvider::create_client`] drives the whole pipeline and returns
//! a ready client, or an error and no client at all; there is never a
//! partially-usable client. Session-engine backends get a secondary
//! single-session pool bound to the same resolved driver, and a credential
//! lease when the descriptor carries a security configuration.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::catalog::DriverCatalog;
use crate::context::ContextManager;
use crate::credential::{CredentialLease, SharedIdentity, DEFAULT_RENEWAL_INTERVAL};
use crate::descriptor::{ConnectionDescriptor, DbType};
use crate::error::{Error, Result};
use crate::pool::{DriverPool, PoolConfig, PooledConnection};
use crate::resolver::{self, DriverRegistry};

/// Client lifecycle states.
///
/// The intermediate states are traversed inside
/// [`ClientProvider::create_client`] and surfaced in logs; a client handed
/// to the caller is always `Open`, and the only transition after that is
/// `Open -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed, nothing allocated
    Created,
    /// Background execution resources allocated
    PreInit,
    /// Backend-specific preconditions validated
    EnvChecked,
    /// Driver resolved and pool(s) built
    Initialized,
    /// Serving connections
    Open,
    /// Closed (terminal)
    Closed,
}

/// A provisioned datasource client
#[async_trait]
pub trait DataSourceClient: Send + Sync + std::fmt::Debug {
    /// Borrow a connection from the client's pool
    async fn get_connection(&self) -> Result<PooledConnection>;

    /// Whether a connection can currently be borrowed
    async fn test_connection(&self) -> bool;

    /// Stop background work and release pools and identity. Idempotent.
    async fn close(&self);

    /// Current lifecycle state
    fn state(&self) -> ClientState;

    /// The backend this client serves
    fn db_type(&self) -> DbType;

    /// The authenticated identity, for credentialed backends
    fn identity(&self) -> Option<SharedIdentity> {
        None
    }
}

/// Builds datasource clients from connection descriptors.
pub struct ClientProvider {
    catalog: Arc<DriverCatalog>,
    contexts: Arc<ContextManager>,
    registry: Arc<DriverRegistry>,
    renewal_interval: std::time::Duration,
}

impl ClientProvider {
    /// Create a provider over the process-scoped catalog, context manager
    /// and driver registry
    pub fn new(
        catalog: Arc<DriverCatalog>,
        contexts: Arc<ContextManager>,
        registry: Arc<DriverRegistry>,
    ) -> Self {
        Self {
            catalog,
            contexts,
            registry,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
        }
    }

    /// Override the credential renewal interval
    pub fn with_renewal_interval(mut self, interval: std::time::Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    /// Provision a client for a descriptor.
    ///
    /// Any failure aborts construction entirely; already-acquired resources
    /// are torn down before the error is returned.
    pub async fn create_client(
        &self,
        descriptor: ConnectionDescriptor,
    ) -> Result<Box<dyn DataSourceClient>> {
        tracing::info!(descriptor = ?descriptor, "creating datasource client");
        tracing::debug!(state = ?ClientState::PreInit, db_type = %descriptor.db_type, "client construction started");

        self.check_env(&descriptor)?;
        tracing::debug!(state = ?ClientState::EnvChecked, db_type = %descriptor.db_type, "environment validated");

        if descriptor.db_type.is_session_engine() {
            self.init_session_client(descriptor).await
        } else {
            self.init_common_client(descriptor).await
        }
    }

    /// Validate backend-specific preconditions; fail fast, return no client.
    fn check_env(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        if descriptor.url.is_empty() {
            return Err(Error::config("descriptor has empty connection url"));
        }
        if descriptor.user.is_empty() {
            return Err(Error::config("descriptor has empty user"));
        }

        if let Some(security) = &descriptor.security {
            if !descriptor.db_type.is_session_engine() {
                return Err(Error::config(format!(
                    "security config is not supported for '{}'",
                    descriptor.db_type
                )));
            }
            if security.principal.is_empty() {
                return Err(Error::config("security config has empty principal"));
            }
            if security.keytab_path.as_os_str().is_empty() {
                return Err(Error::config("security config has empty keytab path"));
            }
            if security.realm_conf_path.as_os_str().is_empty() {
                return Err(Error::config("security config has empty realm conf path"));
            }
        }

        Ok(())
    }

    /// Resolve a driver and build the primary pool for a descriptor.
    ///
    /// Fills in the default catalog artifact when the descriptor names
    /// none, then creates and activates an isolated loading context for the
    /// duration of resolution and pool construction. The built pools retain
    /// the context; the activation window closes when this returns.
    async fn init_pools(
        &self,
        descriptor: &mut ConnectionDescriptor,
        session_pool_wanted: bool,
    ) -> Result<(Arc<DriverPool>, Option<Arc<DriverPool>>)> {
        let artifact = match &descriptor.driver_artifact_path {
            Some(path) => path.clone(),
            None => {
                tracing::warn!(
                    db_type = %descriptor.db_type,
                    "no driver artifact specified, selecting catalog default"
                );
                self.catalog.default_artifact(descriptor.db_type)?
            }
        };
        descriptor.driver_artifact_path = Some(artifact.clone());

        let plugin_dir = self.catalog.plugin_path(descriptor.db_type);
        let context = self.contexts.create_context(&artifact, &plugin_dir);
        let active = self.contexts.activate(&context);

        let resolved = resolver::resolve(active.context(), &self.registry, descriptor)?;

        let primary =
            DriverPool::build(resolved.clone(), descriptor, PoolConfig::standard()).await?;

        let session = if session_pool_wanted {
            match DriverPool::build(resolved, descriptor, PoolConfig::single_session()).await {
                Ok(pool) => Some(pool),
                Err(e) => {
                    primary.close().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok((primary, session))
    }

    async fn init_common_client(
        &self,
        mut descriptor: ConnectionDescriptor,
    ) -> Result<Box<dyn DataSourceClient>> {
        let (pool, _) = self.init_pools(&mut descriptor, false).await?;
        tracing::debug!(state = ?ClientState::Initialized, db_type = %descriptor.db_type, "pools built");
        tracing::info!(db_type = %descriptor.db_type, "datasource client ready");
        Ok(Box::new(CommonClient {
            core: ClientCore::new(descriptor, pool),
        }))
    }

    async fn init_session_client(
        &self,
        mut descriptor: ConnectionDescriptor,
    ) -> Result<Box<dyn DataSourceClient>> {
        // Credential lease before pools, so a security failure costs no pools.
        let lease = match &descriptor.security {
            Some(security) => {
                let mut lease = CredentialLease::init(security).await?;
                lease.start_renewal(self.renewal_interval);
                Some(lease)
            }
            None => None,
        };

        let (primary, session) = match self.init_pools(&mut descriptor, true).await {
            Ok(pools) => pools,
            Err(e) => {
                // Renewal must not outlive a failed construction.
                if let Some(mut lease) = lease {
                    lease.stop().await;
                }
                return Err(e);
            }
        };
        let session = session.expect("session pool requested");
        tracing::debug!(state = ?ClientState::Initialized, db_type = %descriptor.db_type, "pools built");

        tracing::info!(db_type = %descriptor.db_type, "session-engine datasource client ready");
        Ok(Box::new(SessionEngineClient {
            core: ClientCore::new(descriptor, primary),
            session_pool: session,
            lease: Mutex::new(lease),
        }))
    }
}

/// State shared by both client flavors
struct ClientCore {
    descriptor: ConnectionDescriptor,
    pool: Arc<DriverPool>,
    state: parking_lot::Mutex<ClientState>,
}

impl ClientCore {
    fn new(descriptor: ConnectionDescriptor, pool: Arc<DriverPool>) -> Self {
        Self {
            descriptor,
            pool,
            state: parking_lot::Mutex::new(ClientState::Open),
        }
    }

    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Transition to Closed; returns false when already closed
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ClientState::Closed {
            return false;
        }
        *state = ClientState::Closed;
        true
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ClientState::Closed {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

/// Client for multiplex-safe backends: one standard pool.
struct CommonClient {
    core: ClientCore,
}

impl std::fmt::Debug for CommonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonClient")
            .field("db_type", &self.core.descriptor.db_type)
            .field("state", &self.core.state())
            .finish()
    }
}

#[async_trait]
impl DataSourceClient for CommonClient {
    async fn get_connection(&self) -> Result<PooledConnection> {
        self.core.ensure_open()?;
        self.core.pool.borrow().await
    }

    async fn test_connection(&self) -> bool {
        self.get_connection().await.is_ok()
    }

    async fn close(&self) {
        if !self.core.mark_closed() {
            return;
        }
        tracing::info!(db_type = %self.core.descriptor.db_type, "closing datasource client");
        self.core.pool.close().await;
    }

    fn state(&self) -> ClientState {
        self.core.state()
    }

    fn db_type(&self) -> DbType {
        self.core.descriptor.db_type
    }
}

/// Client for session-oriented backends: connections come from the
/// single-session pool; the standard pool serves auxiliary work.
struct SessionEngineClient {
    core: ClientCore,
    session_pool: Arc<DriverPool>,
    lease: Mutex<Option<CredentialLease>>,
}

impl std::fmt::Debug for SessionEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngineClient")
            .field("db_type", &self.core.descriptor.db_type)
            .field("state", &self.core.state())
            .field("credentialed", &self.identity().is_some())
            .finish()
    }
}

#[async_trait]
impl DataSourceClient for SessionEngineClient {
    async fn get_connection(&self) -> Result<PooledConnection> {
        self.core.ensure_open()?;
        self.session_pool.borrow().await
    }

    async fn test_connection(&self) -> bool {
        self.get_connection().await.is_ok()
    }

    async fn close(&self) {
        if !self.core.mark_closed() {
            return;
        }
        tracing::info!(db_type = %self.core.descriptor.db_type, "closing session-engine datasource client");

        // Shutdown ordering: renewal fully stopped before pools and
        // identity go away.
        if let Some(mut lease) = self.lease.lock().await.take() {
            lease.stop().await;
        }
        self.session_pool.close().await;
        self.core.pool.close().await;
    }

    fn state(&self) -> ClientState {
        self.core.state()
    }

    fn db_type(&self) -> DbType {
        self.core.descriptor.db_type
    }

    fn identity(&self) -> Option<SharedIdentity> {
        self.lease
            .try_lock()
            .ok()
            .and_then(|lease| lease.as_ref().map(CredentialLease::identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_env_rejects_incomplete_descriptor() {
        let provider = ClientProvider::new(
            Arc::new(DriverCatalog::scan(&crate::catalog::CatalogConfig::new(
                "/nonexistent",
                "/nonexistent",
            ))),
            Arc::new(ContextManager::new()),
            Arc::new(DriverRegistry::new()),
        );

        let descriptor = ConnectionDescriptor::new(DbType::PostgreSql, "");
        assert!(matches!(
            provider.check_env(&descriptor),
            Err(Error::Configuration { .. })
        ));

        let descriptor = ConnectionDescriptor::new(DbType::PostgreSql, "postgres://h/db");
        assert!(matches!(
            provider.check_env(&descriptor),
            Err(Error::Configuration { .. })
        ));

        let descriptor = ConnectionDescriptor::new(DbType::PostgreSql, "postgres://h/db")
            .with_user("etl");
        assert!(provider.check_env(&descriptor).is_ok());
    }

    #[test]
    fn test_check_env_rejects_security_on_relational_backend() {
        let provider = ClientProvider::new(
            Arc::new(DriverCatalog::scan(&crate::catalog::CatalogConfig::new(
                "/nonexistent",
                "/nonexistent",
            ))),
            Arc::new(ContextManager::new()),
            Arc::new(DriverRegistry::new()),
        );

        let descriptor = ConnectionDescriptor::new(DbType::MySql, "mysql://h/db")
            .with_user("etl")
            .with_security(crate::descriptor::SecurityConfig {
                realm_conf_path: "/etc/krb5.conf".into(),
                principal: "etl@REALM".into(),
                keytab_path: "/etc/etl.keytab".into(),
            });
        assert!(matches!(
            provider.check_env(&descriptor),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_check_env_requires_wellformed_security() {
        let provider = ClientProvider::new(
            Arc::new(DriverCatalog::scan(&crate::catalog::CatalogConfig::new(
                "/nonexistent",
                "/nonexistent",
            ))),
            Arc::new(ContextManager::new()),
            Arc::new(DriverRegistry::new()),
        );

        let descriptor = ConnectionDescriptor::new(DbType::Hive, "hive2://h:10000/default")
            .with_user("etl")
            .with_security(crate::descriptor::SecurityConfig {
                realm_conf_path: "/etc/krb5.conf".into(),
                principal: String::new(),
                keytab_path: "/etc/etl.keytab".into(),
            });
        assert!(matches!(
            provider.check_env(&descriptor),
            Err(Error::Configuration { .. })
        ));
    }
}
