//! Router module - per-device ingestion pipeline
//!
//! The Router is the hot path between the bus and the state store:
//! - decodes each frame with the configured tables
//! - filters noise and duplicates through the change detector
//! - merges accepted values into the store as origin `bus`
//! - optionally relays local raw frames to the hub
//! - writes a synthetic heartbeat when the bus goes quiet

mod change_detector;

pub use change_detector::ChangeDetector;

use crate::bus::{Decoder, Frame, RawFrameData};
use crate::config::AppConfig;
use crate::state::{delta_from_event, heartbeat_value, Category, Origin, StateActorHandle, HEARTBEAT_DEVICE_ID};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Where a frame entered this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Captured from the local bus
    Local,
    /// Relayed through the hub by a device with bus access
    Relay,
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub frames: u64,
    pub decoded: u64,
    pub accepted: u64,
    pub relayed: u64,
    pub heartbeats: u64,
}

/// Outcome of processing one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not a frame any table knows about
    Ignored,
    /// Decoded but not a meaningful change
    Suppressed { category: Category, device_id: String },
    /// Merged into the store
    Accepted { category: Category, device_id: String },
}

/// Decode -> detect -> store pipeline owned by the main loop
pub struct Router {
    decoder: Decoder,
    detector: ChangeDetector,
    store: StateActorHandle,
    /// Raw frame relay to the hub, present only when relaying is enabled
    relay_tx: Option<mpsc::UnboundedSender<RawFrameData>>,
    stats: RouterStats,
}

impl Router {
    /// Create a new Router from configuration
    pub fn new(
        config: &AppConfig,
        store: StateActorHandle,
        relay_tx: Option<mpsc::UnboundedSender<RawFrameData>>,
    ) -> Self {
        Self {
            decoder: Decoder::new(&config.decoder),
            detector: ChangeDetector::new(&config.detector),
            store,
            relay_tx,
            stats: RouterStats::default(),
        }
    }

    /// Run one frame through the pipeline
    ///
    /// Never awaits: store updates and relays are channel sends.
    pub fn process_frame(&mut self, frame: &Frame, origin: FrameOrigin) -> FrameOutcome {
        self.process_frame_at(frame, origin, Instant::now())
    }

    fn process_frame_at(&mut self, frame: &Frame, origin: FrameOrigin, now: Instant) -> FrameOutcome {
        self.stats.frames += 1;

        // Relayed frames are never relayed again
        if origin == FrameOrigin::Local {
            if let Some(relay_tx) = &self.relay_tx {
                if relay_tx.send(RawFrameData::from(frame)).is_ok() {
                    self.stats.relayed += 1;
                }
            }
        }

        let Some(event) = self.decoder.decode(frame) else {
            trace!(id = %frame.id_hex(), "Frame not decoded");
            return FrameOutcome::Ignored;
        };
        self.stats.decoded += 1;

        let (category, device_id, value) = delta_from_event(&event);

        if !self.detector.should_accept(category, &device_id, &value, now) {
            return FrameOutcome::Suppressed {
                category,
                device_id,
            };
        }

        debug!(%category, device_id = %device_id, ?value, ?origin, "Accepted bus change");
        self.store
            .update_device(category, device_id.clone(), value, Origin::Bus);
        self.stats.accepted += 1;

        FrameOutcome::Accepted {
            category,
            device_id,
        }
    }

    /// Write the synthetic heartbeat if the bus has been quiet for a window
    ///
    /// Returns true when a heartbeat was written.
    pub fn check_heartbeat(&mut self) -> bool {
        self.check_heartbeat_at(Instant::now())
    }

    fn check_heartbeat_at(&mut self, now: Instant) -> bool {
        let Some(quiet_for) = self.detector.heartbeat_due(now) else {
            return false;
        };
        debug!(quiet_ms = quiet_for.as_millis() as u64, "Bus quiet, writing heartbeat");
        self.store.update_device(
            Category::System,
            HEARTBEAT_DEVICE_ID,
            heartbeat_value(quiet_for),
            Origin::Synthetic,
        );
        self.stats.heartbeats += 1;
        true
    }

    /// Drop expired duplicate-cache entries
    pub fn purge_expired(&mut self) -> usize {
        let purged = self.detector.purge_expired(Instant::now());
        if purged > 0 {
            trace!(purged, "Purged duplicate cache");
        }
        purged
    }

    /// Update configuration (hot-reload)
    ///
    /// Rebuilds the decoder tables and applies new detector thresholds; last
    /// known device values are kept.
    pub fn update_config(&mut self, config: &AppConfig) {
        info!("Updating decoder tables and detector thresholds (hot-reload)");
        self.decoder = Decoder::new(&config.decoder);
        self.detector.update_config(&config.detector);
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn store(&self) -> &StateActorHandle {
        &self.store
    }
}
