//! Offline queue - outbound deltas held while the hub is unreachable
//!
//! Bounded FIFO in memory, mirrored into the `offline_queue` tree of the
//! device database so queued deltas survive a restart. Keys are big-endian
//! sequence numbers, so sled's key order is the queue order.

use super::envelope::SyncEnvelope;
use super::error::SyncError;
use crate::state::{Category, Partial};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// Name of the sled tree holding queued deltas
pub const OFFLINE_QUEUE_TREE: &str = "offline_queue";

/// One delta waiting for the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEnvelope {
    pub category: Category,
    pub payload: Partial,
    /// Timestamp (milliseconds since epoch)
    pub enqueued_at: u64,
}

impl QueuedEnvelope {
    pub fn to_envelope(&self, source_device_id: &str) -> Result<SyncEnvelope, SyncError> {
        SyncEnvelope::state_update(source_device_id, self.category, &self.payload)
    }
}

/// Bounded FIFO of queued deltas
pub struct OfflineQueue {
    capacity: usize,
    entries: VecDeque<(u64, QueuedEnvelope)>,
    next_seq: u64,
    tree: Option<sled::Tree>,
}

impl OfflineQueue {
    /// Queue without persistence
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            next_seq: 0,
            tree: None,
        }
    }

    /// Queue backed by the `offline_queue` tree, reloading anything left over
    pub fn persistent(db: &sled::Db, capacity: usize) -> Result<Self, SyncError> {
        let tree = db.open_tree(OFFLINE_QUEUE_TREE)?;
        let mut queue = Self {
            tree: Some(tree.clone()),
            ..Self::in_memory(capacity)
        };

        for item in tree.iter() {
            let (key, value) = item?;
            let Some(seq) = decode_seq(&key) else {
                warn!("Dropping offline queue entry with a bad key");
                tree.remove(key)?;
                continue;
            };
            match serde_json::from_slice::<QueuedEnvelope>(&value) {
                Ok(entry) => {
                    queue.entries.push_back((seq, entry));
                    queue.next_seq = seq + 1;
                }
                Err(e) => {
                    warn!(seq, "Dropping unreadable offline queue entry: {}", e);
                    tree.remove(key)?;
                }
            }
        }

        while queue.entries.len() > queue.capacity {
            queue.evict_oldest();
        }

        if !queue.entries.is_empty() {
            info!(pending = queue.entries.len(), "Restored offline queue");
        }
        Ok(queue)
    }

    /// Append a delta, evicting the oldest one when full
    ///
    /// Returns the evicted entry, if any.
    pub fn push(&mut self, entry: QueuedEnvelope) -> Option<QueuedEnvelope> {
        let evicted = if self.entries.len() >= self.capacity {
            let evicted = self.evict_oldest();
            warn!(
                capacity = self.capacity,
                "Offline queue full, dropped oldest delta"
            );
            evicted
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(tree) = &self.tree {
            match serde_json::to_vec(&entry) {
                Ok(bytes) => {
                    if let Err(e) = tree.insert(seq.to_be_bytes(), bytes) {
                        error!(seq, "Failed to persist offline queue entry: {}", e);
                    }
                }
                Err(e) => error!(seq, "Failed to serialize offline queue entry: {}", e),
            }
        }

        debug!(seq, category = %entry.category, pending = self.entries.len() + 1, "Queued delta");
        self.entries.push_back((seq, entry));
        evicted
    }

    /// Oldest queued delta
    pub fn front(&self) -> Option<&QueuedEnvelope> {
        self.entries.front().map(|(_, entry)| entry)
    }

    /// Remove and return the oldest queued delta
    pub fn pop_front(&mut self) -> Option<QueuedEnvelope> {
        let (seq, entry) = self.entries.pop_front()?;
        self.forget(seq);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Flush pending sled writes
    pub fn flush(&self) {
        if let Some(tree) = &self.tree {
            if let Err(e) = tree.flush() {
                error!("Failed to flush offline queue: {}", e);
            }
        }
    }

    fn evict_oldest(&mut self) -> Option<QueuedEnvelope> {
        let (seq, entry) = self.entries.pop_front()?;
        self.forget(seq);
        Some(entry)
    }

    fn forget(&self, seq: u64) {
        if let Some(tree) = &self.tree {
            if let Err(e) = tree.remove(seq.to_be_bytes()) {
                error!(seq, "Failed to remove offline queue entry: {}", e);
            }
        }
    }
}

fn decode_seq(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
