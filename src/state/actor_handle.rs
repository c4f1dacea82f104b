//! Cloneable front door to the state store
//!
//! Writers (router, sync client) never wait: their updates are plain channel
//! sends. Readers await a oneshot reply carrying an owned copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::commands::{StateCommand, SubscriptionFilter, SubscriptionId};
use super::persistence::StateSnapshot;
use super::types::{Category, CategoryEntries, DeviceValue, Origin, Partial, StateChange, StateTree};

/// Cloneable access to the running store
///
/// Writes (`update_category`, `update_device`, `set_online`, `hydrate`,
/// `merge_initial_sync`) return immediately. Reads (`get_category`,
/// `get_all`, `snapshot`) yield an empty result once the actor is gone.
/// `subscribe` sees every accepted update, `subscribe_remote_only` only the
/// ones that came from other devices.
#[derive(Clone)]
pub struct StateActorHandle {
    cmd_tx: mpsc::UnboundedSender<StateCommand>,
    next_subscription_id: Arc<AtomicU64>,
}

impl StateActorHandle {
    /// Wrap the command sender of an already running actor
    pub fn new(cmd_tx: mpsc::UnboundedSender<StateCommand>) -> Self {
        Self {
            cmd_tx,
            next_subscription_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start a store for `local_device_id`; see [`super::StateActor::spawn`]
    pub fn spawn(
        local_device_id: impl Into<String>,
        persistence_tx: Option<mpsc::Sender<super::persistence_actor::PersistenceCommand>>,
        outbound_tx: Option<mpsc::UnboundedSender<StateChange>>,
    ) -> Self {
        super::actor::StateActor::spawn(local_device_id, persistence_tx, outbound_tx)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Merge device values into a category
    pub fn update_category(&self, category: Category, partial: Partial, origin: Origin) {
        let _ = self.cmd_tx.send(StateCommand::UpdateCategory {
            category,
            partial,
            origin,
        });
    }

    /// Merge a single device value
    pub fn update_device(
        &self,
        category: Category,
        device_id: impl Into<String>,
        value: DeviceValue,
        origin: Origin,
    ) {
        self.update_category(category, Partial::from([(device_id.into(), value)]), origin);
    }

    /// Merge a category from the hub's `initialSync`
    ///
    /// Devices with a live local (`bus` or `synthetic`) entry are skipped.
    pub fn merge_initial_sync(&self, category: Category, partial: Partial) {
        let _ = self
            .cmd_tx
            .send(StateCommand::MergeInitialSync { category, partial });
    }

    /// Mirror the hub connection state into the tree
    pub fn set_online(&self, online: bool) {
        let _ = self.cmd_tx.send(StateCommand::SetOnline(online));
    }

    /// Seed the tree from a persisted snapshot
    ///
    /// Restored entries are marked stale; entries already set by live data
    /// are left untouched.
    pub fn hydrate(&self, tree: StateTree) {
        let _ = self.cmd_tx.send(StateCommand::Hydrate(tree));
    }

    // -------------------------------------------------------------------------
    // Query methods (async with oneshot response)
    // -------------------------------------------------------------------------

    /// Copy of one category (empty if the actor is gone)
    pub async fn get_category(&self, category: Category) -> CategoryEntries {
        let (response, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StateCommand::GetCategory { category, response })
            .is_err()
        {
            return CategoryEntries::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Copy of the whole tree
    pub async fn get_all(&self) -> StateTree {
        let (response, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StateCommand::GetAll { response })
            .is_err()
        {
            return StateTree::new("");
        }
        rx.await.unwrap_or_else(|_| StateTree::new(""))
    }

    /// Versioned snapshot of the whole tree
    pub async fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::from_tree(&self.get_all().await)
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Receive every accepted update regardless of origin
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(SubscriptionFilter::All)
    }

    /// Receive only updates merged from other devices
    pub fn subscribe_remote_only(&self) -> Subscription {
        self.subscribe_with(SubscriptionFilter::RemoteOnly)
    }

    fn subscribe_with(&self, filter: SubscriptionFilter) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (listener, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(StateCommand::Subscribe {
            id,
            filter,
            listener,
        });
        Subscription {
            id,
            rx,
            cmd_tx: Some(self.cmd_tx.clone()),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle methods
    // -------------------------------------------------------------------------

    /// Whether the actor is still receiving commands
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Stop the actor once it has applied everything sent before
    pub fn shutdown(&self) {
        if self.cmd_tx.send(StateCommand::Shutdown).is_err() {
            trace!("State actor already stopped");
        }
    }
}

/// A registered change listener
///
/// Deregisters itself on [`Subscription::unsubscribe`] or when dropped.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<StateChange>,
    cmd_tx: Option<mpsc::UnboundedSender<StateCommand>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next change, or `None` once the store has stopped
    pub async fn recv(&mut self) -> Option<StateChange> {
        self.rx.recv().await
    }

    /// Next change if one is already buffered
    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving changes
    pub fn unsubscribe(mut self) {
        self.deregister();
    }

    fn deregister(&mut self) {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(StateCommand::Unsubscribe { id: self.id });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.cmd_tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_handle_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<StateActorHandle>();
    }

    #[tokio::test]
    async fn test_is_alive_when_channel_open() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = StateActorHandle::new(tx);
        assert!(handle.is_alive());
    }

    #[tokio::test]
    async fn test_is_alive_when_channel_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx); // Close the receiver
        let handle = StateActorHandle::new(tx);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_queries_on_dead_actor_return_empty() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = StateActorHandle::new(tx);
        assert!(handle.get_category(Category::Lights).await.is_empty());
        assert!(handle.get_all().await.categories.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_receives_every_origin() {
        let handle = StateActorHandle::spawn("panel", None, None);
        let mut sub = handle.subscribe();

        handle.update_device(Category::Tanks, "lpg", DeviceValue::Tank { level: 60 }, Origin::Bus);
        handle.update_device(Category::Tanks, "lpg", DeviceValue::Tank { level: 61 }, Origin::Remote);

        let first = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(first.origin, Origin::Bus);
        let second = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(second.origin, Origin::Remote);
        assert_eq!(second.partial["lpg"], DeviceValue::Tank { level: 61 });
    }

    #[tokio::test]
    async fn test_remote_only_subscription_filters() {
        let handle = StateActorHandle::spawn("panel", None, None);
        let mut sub = handle.subscribe_remote_only();

        handle.update_device(Category::Tanks, "lpg", DeviceValue::Tank { level: 60 }, Origin::Bus);
        handle.update_device(Category::Tanks, "lpg", DeviceValue::Tank { level: 61 }, Origin::Remote);

        let change = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(change.origin, Origin::Remote);
        handle.get_all().await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let handle = StateActorHandle::spawn("panel", None, None);
        let mut kept = handle.subscribe();
        let dropped = handle.subscribe();
        assert_ne!(kept.id(), dropped.id());
        dropped.unsubscribe();

        handle.update_device(
            Category::WaterDevices,
            "water_pump",
            DeviceValue::WaterDevice { is_on: true },
            Origin::Bus,
        );
        assert!(timeout(Duration::from_secs(1), kept.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_contains_tree() {
        let handle = StateActorHandle::spawn("panel", None, None);
        handle.update_device(Category::Tanks, "lpg", DeviceValue::Tank { level: 60 }, Origin::Bus);

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.tree.local_device_id, "panel");
        assert!(snapshot.tree.entry(Category::Tanks, "lpg").is_some());
    }
}
