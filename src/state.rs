//! Canonical state store - per-device values grouped by category
//!
//! One actor owns the tree and applies every update in order. Accepted bus
//! deltas are forwarded to the sync layer, remote deltas are only merged,
//! and the whole tree is snapshotted to sled so a restart starts warm.

mod actor;
mod actor_handle;
mod builders;
mod commands;
mod persistence;
pub mod persistence_actor;
mod types;

pub use actor::StateActor;
pub use actor_handle::{StateActorHandle, Subscription};
pub use builders::{delta_from_event, heartbeat_value, HEARTBEAT_DEVICE_ID};
pub use commands::{SubscriptionFilter, SubscriptionId};
pub use persistence::StateSnapshot;
pub use persistence_actor::{
    open_database, PersistenceActor, PersistenceActorHandle, PersistenceCommand, DEFAULT_DEBOUNCE_MS,
};
pub use types::{
    now_ms, Category, CategoryEntries, DeviceValue, Origin, Partial, StateChange, StateEntry, StateTree,
};
