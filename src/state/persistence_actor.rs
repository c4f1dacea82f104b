//! Snapshot writer task backed by sled
//!
//! The store hands over a full [`StateSnapshot`] after every accepted update.
//! Bursts are coalesced: the first save arms a deadline `debounce_ms` in the
//! future, later saves only replace the pending snapshot, and the newest one
//! is written when the deadline passes.
//!
//! Background write failures are logged and dropped: the in-memory tree stays
//! authoritative and the next accepted update produces a fresh snapshot.

use super::persistence::StateSnapshot;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Default debounce window in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Key holding the snapshot blob
const SNAPSHOT_KEY: &[u8] = b"state_snapshot";

/// Capacity of the command channel; the store skips a save when it is full
const COMMAND_BUFFER: usize = 100;

/// Open (or create) the device database shared by snapshot and offline queue
pub fn open_database(path: impl AsRef<Path>) -> Result<sled::Db> {
    let path = path.as_ref();
    let db = sled::open(path)
        .with_context(|| format!("Failed to open sled database at: {}", path.display()))?;
    info!("Opened state database at: {}", path.display());
    Ok(db)
}

/// Requests understood by the snapshot writer
#[derive(Debug)]
pub enum PersistenceCommand {
    /// Replace the pending snapshot (debounced)
    Save(StateSnapshot),
    /// Read the last snapshot written to disk
    Load(oneshot::Sender<Option<StateSnapshot>>),
    /// Write the pending snapshot now and report the outcome
    Flush(oneshot::Sender<Result<()>>),
    /// Write the pending snapshot and stop
    Shutdown,
}

/// Synchronous access to the snapshot key
#[derive(Clone)]
struct SnapshotStore {
    db: sled::Db,
}

impl SnapshotStore {
    fn write(&self, snapshot: &StateSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot).context("Failed to serialize snapshot")?;
        self.db
            .insert(SNAPSHOT_KEY, bytes)
            .context("Failed to write snapshot")?;
        self.db.flush().context("Failed to flush sled")?;
        Ok(())
    }

    /// Last compatible snapshot, if any
    fn read(&self) -> Option<StateSnapshot> {
        let bytes = match self.db.get(SNAPSHOT_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No snapshot stored yet");
                return None;
            }
            Err(e) => {
                error!("Failed to read snapshot from sled: {}", e);
                return None;
            }
        };

        let snapshot: StateSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Discarding unreadable snapshot: {}", e);
                return None;
            }
        };

        if !snapshot.is_compatible() {
            warn!(version = %snapshot.version, "Ignoring snapshot from incompatible version");
            return None;
        }

        debug!(version = %snapshot.version, timestamp = snapshot.timestamp, "Read snapshot");
        Some(snapshot)
    }
}

/// Debounced snapshot writer
pub struct PersistenceActor {
    store: SnapshotStore,
    command_rx: mpsc::Receiver<PersistenceCommand>,
    debounce: Duration,
    /// Newest unsaved snapshot and when it is due
    pending: Option<(StateSnapshot, Instant)>,
    writes: u64,
}

/// Cloneable sender side of the snapshot writer
#[derive(Clone)]
pub struct PersistenceActorHandle {
    cmd_tx: mpsc::Sender<PersistenceCommand>,
}

impl PersistenceActor {
    /// Start the writer over an open database
    ///
    /// A `debounce_ms` of 0 writes every snapshot as it arrives.
    pub fn spawn(db: sled::Db, debounce_ms: u64) -> PersistenceActorHandle {
        let (cmd_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let actor = PersistenceActor {
            store: SnapshotStore { db },
            command_rx,
            debounce: Duration::from_millis(debounce_ms),
            pending: None,
            writes: 0,
        };
        tokio::spawn(actor.run());

        PersistenceActorHandle { cmd_tx }
    }

    async fn run(mut self) {
        debug!(debounce_ms = self.debounce.as_millis() as u64, "Snapshot writer started");

        loop {
            let deadline = self.pending.as_ref().map(|(_, due)| *due);

            let cmd = tokio::select! {
                cmd = self.command_rx.recv() => cmd,
                _ = sleep_until_opt(deadline) => {
                    trace!("Debounce window elapsed");
                    self.write_pending().await.ok();
                    continue;
                }
            };

            match cmd {
                Some(PersistenceCommand::Save(snapshot)) => {
                    // keep the first deadline so a steady stream still gets written
                    let due = match &self.pending {
                        Some((_, due)) => *due,
                        None => Instant::now() + self.debounce,
                    };
                    self.pending = Some((snapshot, due));
                    if self.debounce.is_zero() {
                        self.write_pending().await.ok();
                    }
                }
                Some(PersistenceCommand::Load(reply)) => {
                    let _ = reply.send(self.store.read());
                }
                Some(PersistenceCommand::Flush(reply)) => {
                    let _ = reply.send(self.write_pending().await);
                }
                Some(PersistenceCommand::Shutdown) | None => {
                    self.write_pending().await.ok();
                    info!(writes = self.writes, "Snapshot writer stopped");
                    return;
                }
            }
        }
    }

    /// Write the pending snapshot, if any, on the blocking pool
    async fn write_pending(&mut self) -> Result<()> {
        let Some((snapshot, _)) = self.pending.take() else {
            return Ok(());
        };

        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.write(&snapshot))
            .await
            .context("Snapshot write task panicked")
            .and_then(|r| r);

        match &result {
            Ok(()) => {
                self.writes += 1;
                trace!(writes = self.writes, "Snapshot written");
            }
            Err(e) => error!("Snapshot not persisted: {:#}", e),
        }
        result
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PersistenceActorHandle {
    /// Queue a snapshot; it is written within the debounce window
    pub async fn save_snapshot(&self, snapshot: StateSnapshot) -> Result<()> {
        self.cmd_tx
            .send(PersistenceCommand::Save(snapshot))
            .await
            .context("Snapshot writer has stopped")
    }

    /// Snapshot currently on disk (pending saves are not included)
    pub async fn load_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PersistenceCommand::Load(reply))
            .await
            .context("Snapshot writer has stopped")?;
        rx.await.context("Snapshot writer dropped the load request")
    }

    /// Write any pending snapshot now
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PersistenceCommand::Flush(reply))
            .await
            .context("Snapshot writer has stopped")?;
        rx.await.context("Snapshot writer dropped the flush request")?
    }

    /// Ask the writer to persist what it holds and stop
    pub fn shutdown(&self) {
        if self.cmd_tx.try_send(PersistenceCommand::Shutdown).is_err() {
            debug!("Snapshot writer already stopped or busy");
        }
    }

    /// Sender the state actor uses for non-blocking save requests
    pub fn cmd_tx(&self) -> mpsc::Sender<PersistenceCommand> {
        self.cmd_tx.clone()
    }
}
