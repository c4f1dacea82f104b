//! Change detection - decides which decoded values are worth publishing
//!
//! The bus repeats status broadcasts continuously and dimmers jitter by a
//! step or two. Only meaningful changes reach the state store:
//! - lights: on/off flipped or brightness moved more than the tolerance
//! - water devices: on/off flipped
//! - tanks: level changed
//! - climate: raw payload changed
//!
//! A short-lived duplicate cache (SHA-1 of category, device and value)
//! rejects exact re-sends before any comparison runs.

use crate::config::DetectorConfig;
use crate::state::{Category, DeviceValue};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Last accepted value for one device
#[derive(Debug, Clone)]
struct Accepted {
    value: DeviceValue,
    digest: String,
    at: Instant,
}

/// Per-device change filter with an idle heartbeat clock
#[derive(Debug)]
pub struct ChangeDetector {
    brightness_tolerance: u8,
    duplicate_window: Duration,
    heartbeat_window: Duration,
    /// (category, device id) -> last accepted value
    last: HashMap<(Category, String), Accepted>,
    /// digest -> when it was accepted
    recent: HashMap<String, Instant>,
    last_accept: Instant,
}

impl ChangeDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            brightness_tolerance: config.brightness_tolerance,
            duplicate_window: config.duplicate_window(),
            heartbeat_window: config.heartbeat_window(),
            last: HashMap::new(),
            recent: HashMap::new(),
            last_accept: Instant::now(),
        }
    }

    /// Apply new thresholds; known values are kept
    pub fn update_config(&mut self, config: &DetectorConfig) {
        self.brightness_tolerance = config.brightness_tolerance;
        self.duplicate_window = config.duplicate_window();
        self.heartbeat_window = config.heartbeat_window();
    }

    /// Decide whether `value` is a meaningful change for this device
    ///
    /// An accepted value becomes the new last-known value.
    pub fn should_accept(
        &mut self,
        category: Category,
        device_id: &str,
        value: &DeviceValue,
        now: Instant,
    ) -> bool {
        let digest = value_digest(category, device_id, value);

        if let Some(seen) = self.recent.get(&digest) {
            if now.saturating_duration_since(*seen) < self.duplicate_window {
                trace!(%category, device_id, "Duplicate suppressed");
                return false;
            }
        }

        let key = (category, device_id.to_string());
        let changed = match self.last.get(&key) {
            None => true,
            Some(previous) => self.differs(&previous.value, value),
        };

        if !changed {
            trace!(%category, device_id, "Below change threshold");
            return false;
        }

        if let Some(previous) = self.last.get(&key) {
            self.recent.remove(&previous.digest);
        }
        self.recent.insert(digest.clone(), now);
        self.last.insert(
            key,
            Accepted {
                value: value.clone(),
                digest,
                at: now,
            },
        );
        self.last_accept = now;
        true
    }

    fn differs(&self, previous: &DeviceValue, next: &DeviceValue) -> bool {
        match (previous, next) {
            (
                DeviceValue::Light {
                    is_on: was_on,
                    brightness: was,
                },
                DeviceValue::Light { is_on, brightness },
            ) => was_on != is_on || was.abs_diff(*brightness) > self.brightness_tolerance,
            (DeviceValue::WaterDevice { is_on: was_on }, DeviceValue::WaterDevice { is_on }) => {
                was_on != is_on
            }
            (DeviceValue::Tank { level: was }, DeviceValue::Tank { level }) => was != level,
            (DeviceValue::Climate { raw: was }, DeviceValue::Climate { raw }) => was != raw,
            (previous, next) => previous != next,
        }
    }

    /// Quiet period to report if nothing was accepted for a whole window
    ///
    /// Restarts the window when it fires, so one heartbeat is produced per
    /// quiet window.
    pub fn heartbeat_due(&mut self, now: Instant) -> Option<Duration> {
        let quiet_for = now.saturating_duration_since(self.last_accept);
        if quiet_for < self.heartbeat_window {
            return None;
        }
        self.last_accept = now;
        Some(quiet_for)
    }

    /// Drop duplicate-cache entries older than the window
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let window = self.duplicate_window;
        let before = self.recent.len();
        self.recent
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        before - self.recent.len()
    }

    /// Number of devices with a known value
    pub fn tracked_devices(&self) -> usize {
        self.last.len()
    }

    /// When this device last had a value accepted
    pub fn last_accepted_at(&self, category: Category, device_id: &str) -> Option<Instant> {
        self.last
            .get(&(category, device_id.to_string()))
            .map(|accepted| accepted.at)
    }

    /// Number of live duplicate-cache entries
    pub fn cached_digests(&self) -> usize {
        self.recent.len()
    }
}

fn value_digest(category: Category, device_id: &str, value: &DeviceValue) -> String {
    let mut hasher = Sha1::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(device_id.as_bytes());
    hasher.update([0u8]);
    // Serializing these shapes cannot fail; an empty body still hashes
    hasher.update(serde_json::to_vec(value).unwrap_or_default());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChangeDetector {
        ChangeDetector::new(&DetectorConfig::default())
    }

    fn light(is_on: bool, brightness: u8) -> DeviceValue {
        DeviceValue::Light { is_on, brightness }
    }

    #[test]
    fn test_first_observation_accepted() {
        let mut d = detector();
        assert!(d.should_accept(Category::Lights, "porch", &light(false, 0), Instant::now()));
        assert_eq!(d.tracked_devices(), 1);
    }

    #[test]
    fn test_identical_light_within_window_accepted_once() {
        let mut d = detector();
        let now = Instant::now();
        assert!(d.should_accept(Category::Lights, "porch", &light(true, 50), now));
        assert!(!d.should_accept(
            Category::Lights,
            "porch",
            &light(true, 50),
            now + Duration::from_millis(100)
        ));
    }

    #[test]
    fn test_brightness_tolerance() {
        let mut d = detector();
        let now = Instant::now();
        assert!(d.should_accept(Category::Lights, "porch", &light(true, 50), now));
        // delta 2 is noise
        assert!(!d.should_accept(Category::Lights, "porch", &light(true, 52), now));
        // delta 3 is a change
        assert!(d.should_accept(Category::Lights, "porch", &light(true, 53), now));
    }

    #[test]
    fn test_on_off_flip_always_accepted() {
        let mut d = detector();
        let now = Instant::now();
        assert!(d.should_accept(Category::Lights, "porch", &light(true, 1), now));
        assert!(d.should_accept(Category::Lights, "porch", &light(false, 0), now));
        // returning to a recent value is still a change
        assert!(d.should_accept(Category::Lights, "porch", &light(true, 1), now));
    }

    #[test]
    fn test_water_device_only_on_flip() {
        let mut d = detector();
        let now = Instant::now();
        let on = DeviceValue::WaterDevice { is_on: true };
        let off = DeviceValue::WaterDevice { is_on: false };
        assert!(d.should_accept(Category::WaterDevices, "water_pump", &on, now));
        assert!(!d.should_accept(
            Category::WaterDevices,
            "water_pump",
            &on,
            now + Duration::from_secs(5)
        ));
        assert!(d.should_accept(Category::WaterDevices, "water_pump", &off, now));
    }

    #[test]
    fn test_tank_level_change() {
        let mut d = detector();
        let now = Instant::now();
        let later = now + Duration::from_secs(10);
        assert!(d.should_accept(Category::Tanks, "lpg", &DeviceValue::Tank { level: 50 }, now));
        assert!(!d.should_accept(Category::Tanks, "lpg", &DeviceValue::Tank { level: 50 }, later));
        assert!(d.should_accept(Category::Tanks, "lpg", &DeviceValue::Tank { level: 51 }, later));
    }

    #[test]
    fn test_climate_raw_change() {
        let mut d = detector();
        let now = Instant::now();
        let a = DeviceValue::Climate { raw: vec![1, 2] };
        let b = DeviceValue::Climate { raw: vec![1, 3] };
        assert!(d.should_accept(Category::Climate, "19FFE244", &a, now));
        assert!(!d.should_accept(Category::Climate, "19FFE244", &a, now));
        assert!(d.should_accept(Category::Climate, "19FFE244", &b, now));
    }

    #[test]
    fn test_devices_are_independent() {
        let mut d = detector();
        let now = Instant::now();
        assert!(d.should_accept(Category::Lights, "porch", &light(true, 50), now));
        assert!(d.should_accept(Category::Lights, "awning", &light(true, 50), now));
    }

    #[test]
    fn test_purge_expired() {
        let mut d = detector();
        let now = Instant::now();
        d.should_accept(Category::Lights, "porch", &light(true, 50), now);
        d.should_accept(Category::Tanks, "lpg", &DeviceValue::Tank { level: 10 }, now);
        assert_eq!(d.cached_digests(), 2);

        assert_eq!(d.purge_expired(now + Duration::from_millis(500)), 0);
        assert_eq!(d.purge_expired(now + Duration::from_secs(3)), 2);
        assert_eq!(d.cached_digests(), 0);
        // last-known values survive a purge
        assert_eq!(d.tracked_devices(), 2);
    }

    #[test]
    fn test_heartbeat_after_quiet_window() {
        let mut d = detector();
        let start = Instant::now();
        d.should_accept(Category::Lights, "porch", &light(true, 50), start);

        assert!(d.heartbeat_due(start + Duration::from_secs(10)).is_none());
        let quiet = d.heartbeat_due(start + Duration::from_secs(31)).unwrap();
        assert!(quiet >= Duration::from_secs(30));
        // window restarts after firing
        assert!(d.heartbeat_due(start + Duration::from_secs(32)).is_none());
    }

    #[test]
    fn test_update_config_changes_tolerance() {
        let mut d = detector();
        let now = Instant::now();
        d.should_accept(Category::Lights, "porch", &light(true, 50), now);

        d.update_config(&DetectorConfig {
            brightness_tolerance: 10,
            ..DetectorConfig::default()
        });
        assert!(!d.should_accept(Category::Lights, "porch", &light(true, 58), now));
        assert!(d.last_accepted_at(Category::Lights, "porch").is_some());
    }
}
