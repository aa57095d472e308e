//! Driver traits, registry and resolution
//!
//! Drivers are provided by vendor artifacts located through the catalog;
//! this crate dispatches to them through a [`DriverRegistry`] mapping each
//! [`DbType`] to a factory function, populated once at startup. Resolution
//! tries the explicitly requested driver first and falls back to
//! enumerating every registered provider (discovery) when the explicit
//! driver rejects the connection target.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::LoadingContext;
use crate::descriptor::{ConnectionDescriptor, DbType};
use crate::error::{Error, Result};

/// A live connection handed out by a driver
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Check that the connection is alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A vendor database driver
#[async_trait]
pub trait Driver: Send + Sync {
    /// The backend this driver serves
    fn db_type(&self) -> DbType;

    /// Reported protocol major version
    fn version(&self) -> u32;

    /// Whether this driver accepts the given connection URL
    fn accepts(&self, url: &str) -> bool;

    /// Open a connection. The secret arrives already decoded.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        secret: &str,
    ) -> Result<Box<dyn Connection>>;
}

/// Factory instantiating a driver inside a loading context
pub type DriverFactory =
    Arc<dyn Fn(&LoadingContext) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Registry mapping database types to driver factories.
///
/// Populated once at startup by the embedding service; iteration order is
/// deterministic ([`DbType`] order), which makes discovery reproducible.
pub struct DriverRegistry {
    factories: BTreeMap<DbType, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a driver factory for a database type
    pub fn register(&mut self, db_type: DbType, factory: DriverFactory) {
        self.factories.insert(db_type, factory);
    }

    /// Get the factory registered for a type
    pub fn get(&self, db_type: DbType) -> Option<&DriverFactory> {
        self.factories.get(&db_type)
    }

    /// Whether a type has a registered factory
    pub fn contains(&self, db_type: DbType) -> bool {
        self.factories.contains_key(&db_type)
    }

    /// Number of registered factories
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Iterate registered (type, factory) pairs in deterministic order
    pub fn iter(&self) -> impl Iterator<Item = (DbType, &DriverFactory)> {
        self.factories.iter().map(|(t, f)| (*t, f))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated driver bound to the context it was resolved in.
///
/// Immutable once produced. The context affinity keeps the driver resolving
/// consistently after the activation window closes.
#[derive(Clone)]
pub struct ResolvedDriver {
    /// The driver instance
    pub driver: Arc<dyn Driver>,
    /// Concrete type identity
    pub db_type: DbType,
    /// Reported protocol major version
    pub version: u32,
    /// Owning loading context
    pub context: Arc<LoadingContext>,
}

impl std::fmt::Debug for ResolvedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDriver")
            .field("db_type", &self.db_type)
            .field("version", &self.version)
            .field("context", &self.context.id())
            .finish()
    }
}

/// Instantiate the named driver type inside `context` and validate it
/// against the connection URL.
///
/// Fails when no factory is registered for the type, the factory cannot
/// instantiate inside the context, or the driver rejects the URL.
pub fn resolve_explicit(
    context: &Arc<LoadingContext>,
    registry: &DriverRegistry,
    db_type: DbType,
    url: &str,
) -> Result<ResolvedDriver> {
    let factory = registry
        .get(db_type)
        .ok_or_else(|| Error::driver_load(format!("no driver provider registered for '{db_type}'")))?;

    let driver = factory(context)?;
    if !driver.accepts(url) {
        tracing::warn!(db_type = %db_type, "explicit driver cannot accept url");
        return Err(Error::driver_load(format!(
            "driver for '{db_type}' does not accept the connection url"
        )));
    }

    tracing::info!(db_type = %db_type, version = driver.version(), "loaded explicit driver");
    Ok(ResolvedDriver {
        version: driver.version(),
        db_type: driver.db_type(),
        driver,
        context: Arc::clone(context),
    })
}

/// Enumerate every registered provider inside `context` and return the
/// first whose `accepts` predicate is true, recording its reported version
/// and concrete identity.
pub fn resolve_by_discovery(
    context: &Arc<LoadingContext>,
    registry: &DriverRegistry,
    url: &str,
) -> Result<ResolvedDriver> {
    for (db_type, factory) in registry.iter() {
        let driver = match factory(context) {
            Ok(driver) => driver,
            Err(e) => {
                tracing::warn!(db_type = %db_type, error = %e, "skipping provider that failed to instantiate");
                continue;
            }
        };
        if driver.accepts(url) {
            tracing::info!(
                db_type = %db_type,
                version = driver.version(),
                "discovery resolved driver"
            );
            return Ok(ResolvedDriver {
                version: driver.version(),
                db_type: driver.db_type(),
                driver,
                context: Arc::clone(context),
            });
        }
    }
    Err(Error::not_found(
        "no registered driver provider accepts the connection url",
    ))
}

/// Resolve a validated driver for a descriptor: explicit first, discovery
/// on mismatch. Both failing is fatal (`DriverLoad`); the caller must fix
/// the configuration before retrying.
pub fn resolve(
    context: &Arc<LoadingContext>,
    registry: &DriverRegistry,
    descriptor: &ConnectionDescriptor,
) -> Result<ResolvedDriver> {
    match resolve_explicit(context, registry, descriptor.db_type, &descriptor.url) {
        Ok(resolved) => Ok(resolved),
        Err(explicit_err) => {
            tracing::warn!(
                db_type = %descriptor.db_type,
                error = %explicit_err,
                "explicit driver not suitable, trying discovery"
            );
            resolve_by_discovery(context, registry, &descriptor.url).map_err(|_| {
                Error::driver_load(format!(
                    "no driver accepts url for '{}': {explicit_err}",
                    descriptor.db_type
                ))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextManager;
    use std::path::Path;

    struct StubDriver {
        db_type: DbType,
        scheme: &'static str,
    }

    #[async_trait]
    impl Driver for StubDriver {
        fn db_type(&self) -> DbType {
            self.db_type
        }

        fn version(&self) -> u32 {
            42
        }

        fn accepts(&self, url: &str) -> bool {
            url.starts_with(self.scheme)
        }

        async fn connect(
            &self,
            _descriptor: &ConnectionDescriptor,
            _secret: &str,
        ) -> Result<Box<dyn Connection>> {
            Err(Error::connection("stub driver cannot connect"))
        }
    }

    fn stub_factory(db_type: DbType, scheme: &'static str) -> DriverFactory {
        Arc::new(move |_ctx: &LoadingContext| {
            Ok(Arc::new(StubDriver { db_type, scheme }) as Arc<dyn Driver>)
        })
    }

    fn test_context() -> Arc<LoadingContext> {
        ContextManager::new().create_context(Path::new("/opt/stub.jar"), Path::new("/nonexistent"))
    }

    #[test]
    fn test_registry_populated_once() {
        let mut registry = DriverRegistry::new();
        assert!(registry.is_empty());
        registry.register(DbType::PostgreSql, stub_factory(DbType::PostgreSql, "postgres:"));
        registry.register(DbType::MySql, stub_factory(DbType::MySql, "mysql:"));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(DbType::MySql));
        assert!(!registry.contains(DbType::Oracle));
    }

    #[test]
    fn test_resolve_explicit_match() {
        let mut registry = DriverRegistry::new();
        registry.register(DbType::PostgreSql, stub_factory(DbType::PostgreSql, "postgres:"));

        let ctx = test_context();
        let resolved =
            resolve_explicit(&ctx, &registry, DbType::PostgreSql, "postgres://h/db").unwrap();
        assert_eq!(resolved.db_type, DbType::PostgreSql);
        assert_eq!(resolved.version, 42);
        assert_eq!(resolved.context.id(), ctx.id());
    }

    #[test]
    fn test_resolve_explicit_mismatch() {
        let mut registry = DriverRegistry::new();
        registry.register(DbType::PostgreSql, stub_factory(DbType::PostgreSql, "postgres:"));

        let ctx = test_context();
        let err = resolve_explicit(&ctx, &registry, DbType::PostgreSql, "mysql://h/db").unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));

        // Unregistered type is also a mismatch
        let err = resolve_explicit(&ctx, &registry, DbType::Oracle, "oracle://h/db").unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
    }

    #[test]
    fn test_resolve_falls_back_to_discovery() {
        let mut registry = DriverRegistry::new();
        registry.register(DbType::PostgreSql, stub_factory(DbType::PostgreSql, "postgres:"));
        registry.register(DbType::MySql, stub_factory(DbType::MySql, "mysql:"));

        let ctx = test_context();
        // Descriptor claims postgresql but the url is mysql; discovery finds it.
        let descriptor = ConnectionDescriptor::new(DbType::PostgreSql, "mysql://h:3306/db");
        let resolved = resolve(&ctx, &registry, &descriptor).unwrap();
        assert_eq!(resolved.db_type, DbType::MySql);
    }

    #[test]
    fn test_resolve_fails_when_nothing_accepts() {
        let mut registry = DriverRegistry::new();
        registry.register(DbType::PostgreSql, stub_factory(DbType::PostgreSql, "postgres:"));

        let ctx = test_context();
        let descriptor = ConnectionDescriptor::new(DbType::PostgreSql, "oracle://h:1521/db");
        let err = resolve(&ctx, &registry, &descriptor).unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_discovery_skips_failing_factories() {
        let mut registry = DriverRegistry::new();
        registry.register(
            DbType::ClickHouse,
            Arc::new(|_ctx: &LoadingContext| Err(Error::driver_load("artifact unreadable"))),
        );
        registry.register(DbType::MySql, stub_factory(DbType::MySql, "mysql:"));

        let ctx = test_context();
        let resolved = resolve_by_discovery(&ctx, &registry, "mysql://h/db").unwrap();
        assert_eq!(resolved.db_type, DbType::MySql);
    }
}
