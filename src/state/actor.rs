//! StateActor - single writer of the canonical state tree
//!
//! Every mutation arrives as a [`StateCommand`] on one channel and is applied
//! sequentially, so no two merges ever interleave. Accepted updates are
//! fanned out to subscribers, snapshotted best-effort, and (for bus-origin
//! deltas only) forwarded to the sync outbound channel.

use super::actor_handle::StateActorHandle;
use super::commands::{StateCommand, SubscriptionFilter, SubscriptionId};
use super::persistence::StateSnapshot;
use super::persistence_actor::PersistenceCommand;
use super::types::{now_ms, Category, CategoryEntries, Origin, Partial, StateChange, StateEntry, StateTree};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

/// Registered change listener
struct Subscriber {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    listener: mpsc::UnboundedSender<StateChange>,
}

/// Actor responsible for the state tree
///
/// ```text
/// router / sync client ──► command_rx ──► StateActor ──► subscribers
///                                            │  ├──────► persistence_tx (snapshot)
///                                            │  └──────► outbound_tx (origin bus only)
///                                            ▼
///                                        StateTree
/// ```
pub struct StateActor {
    tree: StateTree,

    subscribers: Vec<Subscriber>,

    /// Receiver for incoming commands
    command_rx: mpsc::UnboundedReceiver<StateCommand>,

    /// Sender for persistence commands
    persistence_tx: Option<mpsc::Sender<PersistenceCommand>>,

    /// Deltas to relay to other devices
    outbound_tx: Option<mpsc::UnboundedSender<StateChange>>,

    /// Counter for tracking total updates processed
    update_count: u64,
}

impl StateActor {
    /// Spawn a new StateActor and return a handle for interacting with it
    ///
    /// `persistence_tx` and `outbound_tx` are optional so the store can run
    /// without a database or without a hub connection.
    pub fn spawn(
        local_device_id: impl Into<String>,
        persistence_tx: Option<mpsc::Sender<PersistenceCommand>>,
        outbound_tx: Option<mpsc::UnboundedSender<StateChange>>,
    ) -> StateActorHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let actor = StateActor {
            tree: StateTree::new(local_device_id),
            subscribers: Vec::new(),
            command_rx: cmd_rx,
            persistence_tx,
            outbound_tx,
            update_count: 0,
        };

        info!(device_id = %actor.tree.local_device_id, "StateActor spawned");

        tokio::spawn(actor.run());

        StateActorHandle::new(cmd_tx)
    }

    /// Main run loop; ends on `Shutdown` or when every handle is dropped
    async fn run(mut self) {
        debug!("StateActor run loop started");

        while let Some(cmd) = self.command_rx.recv().await {
            trace!(?cmd, "Processing command");

            match cmd {
                StateCommand::UpdateCategory {
                    category,
                    partial,
                    origin,
                } => {
                    self.handle_update_category(category, partial, origin);
                }
                StateCommand::MergeInitialSync { category, partial } => {
                    self.handle_initial_sync(category, partial);
                }
                StateCommand::SetOnline(online) => {
                    if self.tree.online != online {
                        debug!(online, "Hub connectivity changed");
                        self.tree.online = online;
                    }
                }
                StateCommand::Hydrate(tree) => {
                    self.handle_hydrate(tree);
                }
                StateCommand::GetCategory { category, response } => {
                    let result = self.handle_get_category(category);
                    let _ = response.send(result);
                }
                StateCommand::GetAll { response } => {
                    let _ = response.send(self.tree.clone());
                }
                StateCommand::Subscribe {
                    id,
                    filter,
                    listener,
                } => {
                    self.subscribers.push(Subscriber {
                        id,
                        filter,
                        listener,
                    });
                    debug!(subscriber_id = id, ?filter, "Added subscriber");
                }
                StateCommand::Unsubscribe { id } => {
                    self.subscribers.retain(|s| s.id != id);
                    debug!(subscriber_id = id, "Removed subscriber");
                }
                StateCommand::Shutdown => {
                    info!("StateActor received shutdown command");
                    break;
                }
            }
        }

        info!(
            update_count = self.update_count,
            "StateActor run loop terminated"
        );
    }

    /// Merge device values into one category
    fn handle_update_category(&mut self, category: Category, partial: Partial, origin: Origin) {
        let now = now_ms();
        let mut merged = Partial::new();

        for (device_id, value) in partial {
            if !value.matches(category) {
                warn!(%category, device_id = %device_id, ?value, "Discarding value of the wrong shape");
                continue;
            }
            merged.insert(device_id, value.normalized());
        }

        if merged.is_empty() {
            return;
        }

        let entries = self.tree.categories.entry(category).or_default();
        for (device_id, value) in &merged {
            entries.insert(
                device_id.clone(),
                StateEntry {
                    value: value.clone(),
                    last_updated_at: now,
                    origin,
                    stale: false,
                },
            );
        }

        self.tree.last_update_at = now;
        self.update_count += 1;

        trace!(%category, ?origin, devices = merged.len(), "State updated");

        self.request_snapshot();

        let change = StateChange {
            category,
            partial: merged,
            origin,
            at: now,
        };

        if origin == Origin::Bus {
            if let Some(outbound) = &self.outbound_tx {
                if outbound.send(change.clone()).is_err() {
                    trace!("Outbound channel closed, delta not relayed");
                }
            }
        }

        self.notify_subscribers(&change);
    }

    /// Merge the hub's snapshot; a live entry observed or generated here wins
    /// over the hub's possibly older copy
    fn handle_initial_sync(&mut self, category: Category, mut partial: Partial) {
        if let Some(entries) = self.tree.categories.get(&category) {
            partial.retain(|device_id, _| {
                entries
                    .get(device_id)
                    .map_or(true, |entry| entry.origin == Origin::Remote || entry.stale)
            });
        }
        if partial.is_empty() {
            trace!(%category, "Initial sync holds nothing newer than local state");
            return;
        }
        self.handle_update_category(category, partial, Origin::Remote);
    }

    /// Seed entries from a snapshot; anything already live is kept
    fn handle_hydrate(&mut self, snapshot: StateTree) {
        let mut restored = 0usize;
        for (category, entries) in snapshot.categories {
            let current = self.tree.categories.entry(category).or_default();
            for (device_id, entry) in entries {
                if current.contains_key(&device_id) || !entry.value.matches(category) {
                    continue;
                }
                current.insert(
                    device_id,
                    StateEntry {
                        stale: true,
                        ..entry
                    },
                );
                restored += 1;
            }
        }
        self.tree.last_update_at = self.tree.last_update_at.max(snapshot.last_update_at);
        debug!(restored, "Hydrated state from snapshot");
    }

    fn handle_get_category(&self, category: Category) -> CategoryEntries {
        self.tree
            .categories
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    /// Ask the persistence actor for a save without blocking the writer
    fn request_snapshot(&self) {
        let Some(persistence_tx) = &self.persistence_tx else {
            return;
        };
        match persistence_tx.try_send(PersistenceCommand::Save(StateSnapshot::from_tree(&self.tree))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("Persistence channel full, snapshot skipped");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Persistence actor stopped, snapshot skipped");
            }
        }
    }

    /// Deliver a change to matching subscribers, dropping closed ones
    fn notify_subscribers(&mut self, change: &StateChange) {
        self.subscribers.retain(|subscriber| {
            if !subscriber.filter.accepts(change.origin) {
                return !subscriber.listener.is_closed();
            }
            subscriber.listener.send(change.clone()).is_ok()
        });
    }
}
