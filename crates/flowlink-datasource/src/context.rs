//! Isolated loading contexts for driver resolution
//!
//! A [`LoadingContext`] is an ephemeral, immutable resolution scope holding
//! the set of artifact locations for one resolution attempt: the explicit
//! driver artifact plus everything under the vendor plugin directory.
//! Contexts are passed explicitly through resolution and pool construction;
//! there is no thread-bound ambient scope, so concurrent resolutions can
//! never observe each other's artifacts.
//!
//! [`ContextManager::activate`] brackets the window in which a context may
//! be used for resolution. The returned guard deactivates exactly once on
//! drop, on every exit path.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// An immutable resolution scope for one driver resolution attempt.
///
/// Discarded after the owning pool captures driver affinity; the pool keeps
/// its own `Arc` so resolution stays consistent after the activation window
/// closes.
pub struct LoadingContext {
    id: u64,
    explicit_artifact: PathBuf,
    vendor_plugin_dir: PathBuf,
    artifacts: BTreeSet<PathBuf>,
}

impl LoadingContext {
    /// Unique id of this context within its manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The explicitly requested driver artifact
    pub fn explicit_artifact(&self) -> &Path {
        &self.explicit_artifact
    }

    /// The vendor plugin directory combined into this scope
    pub fn vendor_plugin_dir(&self) -> &Path {
        &self.vendor_plugin_dir
    }

    /// The full resolvable artifact set, in deterministic order
    pub fn artifacts(&self) -> impl Iterator<Item = &Path> {
        self.artifacts.iter().map(PathBuf::as_path)
    }

    /// Whether a path is resolvable inside this scope
    pub fn contains(&self, path: &Path) -> bool {
        self.artifacts.contains(path)
    }
}

impl std::fmt::Debug for LoadingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingContext")
            .field("id", &self.id)
            .field("explicit_artifact", &self.explicit_artifact)
            .field("vendor_plugin_dir", &self.vendor_plugin_dir)
            .field("artifacts", &self.artifacts.len())
            .finish()
    }
}

/// Builds and tracks isolated loading contexts.
///
/// One manager is process-scoped state held behind a single handle; it owns
/// nothing mutable beyond the active-context bookkeeping used to enforce
/// balanced activation.
pub struct ContextManager {
    next_id: AtomicU64,
    active: Mutex<HashSet<u64>>,
}

impl ContextManager {
    /// Create a new context manager
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Build a context whose resolvable set is the explicit artifact plus
    /// every artifact file under the vendor plugin directory.
    ///
    /// A missing plugin directory is tolerated; the scope then contains only
    /// the explicit artifact.
    pub fn create_context(
        &self,
        explicit_artifact: &Path,
        vendor_plugin_dir: &Path,
    ) -> Arc<LoadingContext> {
        let mut artifacts = BTreeSet::new();
        artifacts.insert(explicit_artifact.to_path_buf());

        if let Ok(entries) = std::fs::read_dir(vendor_plugin_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    artifacts.insert(path);
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            context = id,
            explicit = %explicit_artifact.display(),
            plugin_dir = %vendor_plugin_dir.display(),
            artifacts = artifacts.len(),
            "created loading context"
        );

        Arc::new(LoadingContext {
            id,
            explicit_artifact: explicit_artifact.to_path_buf(),
            vendor_plugin_dir: vendor_plugin_dir.to_path_buf(),
            artifacts,
        })
    }

    /// Activate a context for the duration of driver resolution and pool
    /// construction. The guard deactivates on drop, exactly once, on every
    /// exit path.
    pub fn activate(&self, context: &Arc<LoadingContext>) -> ActiveContext<'_> {
        self.active.lock().insert(context.id);
        ActiveContext {
            manager: self,
            context: Arc::clone(context),
        }
    }

    /// Whether a context is currently activated
    pub fn is_active(&self, context: &LoadingContext) -> bool {
        self.active.lock().contains(&context.id)
    }

    /// Number of currently activated contexts
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped activation of a [`LoadingContext`].
pub struct ActiveContext<'a> {
    manager: &'a ContextManager,
    context: Arc<LoadingContext>,
}

impl ActiveContext<'_> {
    /// The activated context
    pub fn context(&self) -> &Arc<LoadingContext> {
        &self.context
    }
}

impl Drop for ActiveContext<'_> {
    fn drop(&mut self) {
        self.manager.active.lock().remove(&self.context.id);
        tracing::debug!(context = self.context.id, "deactivated loading context");
    }
}
