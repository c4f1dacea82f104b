//! State snapshot format
//!
//! The snapshot is the serialized state tree plus a version tag. It is
//! written best-effort after accepted updates and read once at startup.

use super::actor_handle::StateActorHandle;
use super::types::{now_ms, StateTree};
use tracing::debug;

/// State snapshot for JSON serialization
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateSnapshot {
    /// Timestamp of snapshot creation (milliseconds since epoch)
    pub timestamp: u64,
    /// Version of the snapshot format
    pub version: String,
    /// Full state tree at snapshot time
    pub tree: StateTree,
}

impl StateSnapshot {
    /// Current snapshot format version
    pub const VERSION: &'static str = "2.0.0";

    /// Create a new snapshot of a tree
    pub fn from_tree(tree: &StateTree) -> Self {
        Self {
            timestamp: now_ms(),
            version: Self::VERSION.to_string(),
            tree: tree.clone(),
        }
    }

    /// Whether this snapshot was written by a compatible version
    pub fn is_compatible(&self) -> bool {
        self.version.split('.').next() == Self::VERSION.split('.').next()
    }

    /// Seed a running store from this snapshot
    pub fn restore_into(&self, store: &StateActorHandle) {
        let entries: usize = self.tree.categories.values().map(|c| c.len()).sum();
        debug!(
            entries,
            timestamp = self.timestamp,
            "Restoring state snapshot"
        );
        store.hydrate(self.tree.clone());
    }
}
