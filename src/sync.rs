//! Multi-device synchronization through the relay hub
//!
//! Devices exchange JSON envelopes over one websocket each. Local bus
//! deltas go out as `stateUpdate`, remote deltas come back in and are
//! merged as origin `remote`, so nothing merged from the hub is ever sent
//! back to it.

mod backoff;
mod client;
mod envelope;
mod error;
mod queue;
mod status;

#[cfg(test)]
mod tests;

pub use backoff::ReconnectPolicy;
pub use client::{SyncClient, SyncHandle};
pub use envelope::{EnvelopeKind, IdentityClaim, SyncEnvelope, HUB_SOURCE_ID};
pub use error::SyncError;
pub use queue::{OfflineQueue, QueuedEnvelope, OFFLINE_QUEUE_TREE};
pub use status::ConnectionStatus;
