//! Credential lifecycle management for credential-gated backends
//!
//! Loads realm configuration into process-wide security state, obtains a
//! keytab-derived identity, and keeps it fresh with a recurring background
//! renewal task. Realm initialization mutates process-wide state, so it is
//! serialized behind a global lock; initializing a second descriptor with a
//! *different* realm is rejected rather than silently clobbering the first.
//!
//! Renewal is availability-first: a failed attempt is logged and retried on
//! the next tick, indefinitely. `stop()` cancels the schedule and waits for
//! the task to finish, so no tick can fire after the owning client closes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::descriptor::SecurityConfig;
use crate::error::{Error, Result};

/// Default interval between renewal attempts
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default ticket lifetime granted by the KDC; renewal relogins once past
/// the midpoint
pub const DEFAULT_TICKET_LIFETIME: Duration = Duration::from_secs(10 * 60 * 60);

/// Process-wide realm state. Serialized: see module docs.
static PROCESS_REALM: parking_lot::Mutex<Option<String>> = parking_lot::Mutex::new(None);

/// An authenticated identity bound to a principal and keytab.
///
/// Shared read-many; the renewal task is the single writer.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Authenticated principal
    pub principal: String,
    /// Keytab the identity was derived from
    pub keytab_path: PathBuf,
    /// Realm the identity belongs to
    pub realm: String,
    /// Keytab-derived identities are eligible for unattended relogin
    pub from_keytab: bool,
    /// When the current ticket was obtained
    pub authenticated_at: Instant,
    /// Lifetime of tickets granted by the KDC
    pub ticket_lifetime: Duration,
    /// Number of completed relogins
    pub renew_count: u64,
}

impl Identity {
    /// Whether the ticket is close enough to expiry to warrant relogin
    pub fn near_expiry(&self, now: Instant) -> bool {
        now.duration_since(self.authenticated_at) > self.ticket_lifetime / 2
    }
}

/// Shared handle to a renewable identity
pub type SharedIdentity = Arc<RwLock<Identity>>;

/// A live authenticated identity plus its background renewal schedule.
///
/// Exclusively owned by its client facade; the schedule is cancelled
/// exactly once, no later than the owning client's close completing.
pub struct CredentialLease {
    identity: SharedIdentity,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("CredentialLease");
        if let Ok(id) = self.identity.try_read() {
            dbg.field("principal", &id.principal)
                .field("realm", &id.realm)
                .field("renew_count", &id.renew_count);
        }
        dbg.field("renewing", &self.task.is_some()).finish()
    }
}

impl CredentialLease {
    /// Load realm configuration and obtain a keytab-derived identity.
    ///
    /// Fails with `SecurityInit` when the realm configuration is missing or
    /// malformed, the keytab does not exist, or a different realm is
    /// already installed process-wide.
    pub async fn init(security: &SecurityConfig) -> Result<Self> {
        if security.principal.is_empty() {
            return Err(Error::security("security config has empty principal"));
        }

        let realm = load_realm_conf(&security.realm_conf_path).await?;
        install_process_realm(&realm)?;

        if !security.keytab_path.is_file() {
            return Err(Error::security(format!(
                "keytab not found: {}",
                security.keytab_path.display()
            )));
        }

        tracing::info!(
            principal = %security.principal,
            realm = %realm,
            "obtained keytab-derived identity"
        );

        let identity = Arc::new(RwLock::new(Identity {
            principal: security.principal.clone(),
            keytab_path: security.keytab_path.clone(),
            realm,
            from_keytab: true,
            authenticated_at: Instant::now(),
            ticket_lifetime: DEFAULT_TICKET_LIFETIME,
            renew_count: 0,
        }));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            identity,
            shutdown,
            task: None,
        })
    }

    /// The shared identity handle
    pub fn identity(&self) -> SharedIdentity {
        Arc::clone(&self.identity)
    }

    /// Whether the renewal schedule is currently running
    pub fn is_renewing(&self) -> bool {
        self.task.is_some()
    }

    /// Start the recurring check-and-relogin task.
    ///
    /// A single failed attempt is logged and does not cancel the schedule.
    pub fn start_renewal(&mut self, interval: Duration) {
        if self.task.is_some() {
            return;
        }

        let identity = Arc::clone(&self.identity);
        let mut shutdown_rx = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("credential renewal task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = check_and_relogin(&identity).await {
                            tracing::warn!(error = %e, "credential renewal attempt failed, will retry on next tick");
                        }
                    }
                }
            }
        });

        self.task = Some(task);
        tracing::info!(interval_secs = interval.as_secs(), "credential renewal scheduled");
    }

    /// Cancel the renewal schedule and wait for the task to finish.
    ///
    /// Idempotent; after this returns, no further renewal tick fires.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown.send(true);
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "credential renewal task join failed");
            }
            tracing::info!("credential renewal stopped");
        }
    }
}

/// One renewal attempt: relogin from the keytab when the ticket is near
/// expiry. The identity lock is held for writing only across the in-place
/// refresh.
async fn check_and_relogin(identity: &SharedIdentity) -> Result<()> {
    let now = Instant::now();
    let (needs_relogin, keytab) = {
        let id = identity.read().await;
        (id.near_expiry(now) && id.from_keytab, id.keytab_path.clone())
    };

    if !needs_relogin {
        return Ok(());
    }

    if !keytab.is_file() {
        return Err(Error::renewal(format!(
            "keytab no longer readable: {}",
            keytab.display()
        )));
    }

    let mut id = identity.write().await;
    id.authenticated_at = now;
    id.renew_count += 1;
    tracing::info!(principal = %id.principal, renew_count = id.renew_count, "relogged in from keytab");
    Ok(())
}

/// Parse the realm configuration file and extract the default realm.
async fn load_realm_conf(path: &Path) -> Result<String> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::security_with_source(format!("cannot read realm conf {}", path.display()), e)
    })?;

    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == "default_realm").then(|| value.trim().to_string())
        })
        .filter(|realm| !realm.is_empty())
        .ok_or_else(|| {
            Error::security(format!("no default_realm in {}", path.display()))
        })
}

/// Install the realm into process-wide state, serialized globally.
fn install_process_realm(realm: &str) -> Result<()> {
    let mut current = PROCESS_REALM.lock();
    match current.as_deref() {
        Some(existing) if existing != realm => Err(Error::security(format!(
            "process realm already initialized to '{existing}', cannot switch to '{realm}'"
        ))),
        Some(_) => Ok(()),
        None => {
            *current = Some(realm.to_string());
            tracing::info!(realm = %realm, "installed process-wide realm configuration");
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PROCESS_REALM;

    /// Serializes tests that touch the process-wide realm state.
    pub static REALM_TEST_GUARD: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    pub fn reset_process_realm() {
        *PROCESS_REALM.lock() = None;
    }
}
