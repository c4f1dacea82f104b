//! Command enums for the state actor
//!
//! Every mutation of the state tree travels through this one channel, which
//! makes the actor the single writer. Hot-path commands are fire-and-forget;
//! queries carry a oneshot sender for the reply.

use super::types::{Category, CategoryEntries, Origin, Partial, StateChange, StateTree};
use tokio::sync::{mpsc, oneshot};

/// Identifier of a registered subscription
pub type SubscriptionId = u64;

/// Which updates a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Every accepted update regardless of origin
    All,
    /// Only updates that arrived from another device
    RemoteOnly,
}

impl SubscriptionFilter {
    pub fn accepts(&self, origin: Origin) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::RemoteOnly => origin == Origin::Remote,
        }
    }
}

/// Commands for the state actor
pub enum StateCommand {
    // -------------------------------------------------------------------------
    // Hot path commands (no response - fire and forget)
    // -------------------------------------------------------------------------
    /// Merge device values into a category
    UpdateCategory {
        category: Category,
        partial: Partial,
        origin: Origin,
    },

    /// Merge a hub snapshot as origin `remote` without touching live local entries
    MergeInitialSync { category: Category, partial: Partial },

    /// Mirror the hub connection state into the tree
    SetOnline(bool),

    /// Seed entries from a persisted tree (marked stale, live data wins)
    Hydrate(StateTree),

    // -------------------------------------------------------------------------
    // Request-response commands
    // -------------------------------------------------------------------------
    /// Copy of one category
    GetCategory {
        category: Category,
        response: oneshot::Sender<CategoryEntries>,
    },

    /// Copy of the whole tree
    GetAll {
        response: oneshot::Sender<StateTree>,
    },

    // -------------------------------------------------------------------------
    // Subscription and lifecycle commands
    // -------------------------------------------------------------------------
    /// Register a change listener
    Subscribe {
        id: SubscriptionId,
        filter: SubscriptionFilter,
        listener: mpsc::UnboundedSender<StateChange>,
    },

    /// Remove a change listener
    Unsubscribe { id: SubscriptionId },

    /// Stop the actor
    Shutdown,
}

impl std::fmt::Debug for StateCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateCommand::UpdateCategory {
                category,
                partial,
                origin,
            } => f
                .debug_struct("UpdateCategory")
                .field("category", category)
                .field("devices", &partial.len())
                .field("origin", origin)
                .finish(),
            StateCommand::MergeInitialSync { category, partial } => f
                .debug_struct("MergeInitialSync")
                .field("category", category)
                .field("devices", &partial.len())
                .finish(),
            StateCommand::SetOnline(online) => f.debug_tuple("SetOnline").field(online).finish(),
            StateCommand::Hydrate(tree) => f
                .debug_struct("Hydrate")
                .field("categories", &tree.categories.len())
                .finish(),
            StateCommand::GetCategory { category, .. } => f
                .debug_struct("GetCategory")
                .field("category", category)
                .finish_non_exhaustive(),
            StateCommand::GetAll { .. } => f.debug_struct("GetAll").finish_non_exhaustive(),
            StateCommand::Subscribe { id, filter, .. } => f
                .debug_struct("Subscribe")
                .field("id", id)
                .field("filter", filter)
                .finish_non_exhaustive(),
            StateCommand::Unsubscribe { id } => {
                f.debug_struct("Unsubscribe").field("id", id).finish()
            }
            StateCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts() {
        assert!(SubscriptionFilter::All.accepts(Origin::Bus));
        assert!(SubscriptionFilter::All.accepts(Origin::Remote));
        assert!(SubscriptionFilter::RemoteOnly.accepts(Origin::Remote));
        assert!(!SubscriptionFilter::RemoteOnly.accepts(Origin::Bus));
        assert!(!SubscriptionFilter::RemoteOnly.accepts(Origin::Synthetic));
    }

    #[test]
    fn test_command_debug_is_compact() {
        let cmd = StateCommand::Unsubscribe { id: 3 };
        assert_eq!(format!("{:?}", cmd), "Unsubscribe { id: 3 }");
    }
}
