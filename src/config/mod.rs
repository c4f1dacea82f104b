//! Configuration management for Coachlink
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.
//! Every section has defaults, so an empty file describes a device with a
//! local `candump can0` capture talking to a hub on localhost.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::fs;

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Identity this device claims on the hub
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub hub_server: HubServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            hub: HubConfig::default(),
            bus: BusConfig::default(),
            decoder: DecoderConfig::default(),
            detector: DetectorConfig::default(),
            persistence: PersistenceConfig::default(),
            hub_server: HubServerConfig::default(),
        }
    }
}

/// Hub connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hub_url")]
    pub url: String,
    /// Relay locally captured frames to bus-less devices
    #[serde(default)]
    pub relay_raw_frames: bool,
    #[serde(default = "default_queue_capacity")]
    pub offline_queue_capacity: usize,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_hub_url(),
            relay_raw_frames: false,
            offline_queue_capacity: default_queue_capacity(),
            reconnect: ReconnectSettings::default(),
            watchdog: WatchdogSettings::default(),
        }
    }
}

/// Reconnection backoff parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Connection watchdog parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogSettings {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Local bus access
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Capture process producing candump-style lines; `null` for a bus-less device
    #[serde(default = "default_capture")]
    pub capture: Option<CaptureConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capture: default_capture(),
        }
    }
}

/// Capture process command line
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_program")]
    pub program: String,
    #[serde(default = "default_capture_args")]
    pub args: Vec<String>,
}

/// Decoder tables: DGNs, instance maps and calibration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecoderConfig {
    #[serde(default = "default_light_status_dgn")]
    pub light_status_dgn: u32,
    /// byte[3] value that marks a dimmer frame as a status report
    #[serde(default = "default_light_status_marker")]
    pub light_status_marker: u8,
    #[serde(default = "default_tank_status_dgn")]
    pub tank_status_dgn: u32,
    /// Light instance -> device id
    #[serde(default = "default_lights")]
    pub lights: BTreeMap<u8, String>,
    /// Water device instance -> device id (reported on the dimmer status DGN)
    #[serde(default = "default_water_devices")]
    pub water_devices: BTreeMap<u8, String>,
    /// Tank instance -> device id and calibration
    #[serde(default = "default_tanks")]
    pub tanks: BTreeMap<u8, TankConfig>,
    /// Arbitration id prefixes (uppercase hex) passed through as climate frames
    #[serde(default = "default_climate_prefixes")]
    pub climate_prefixes: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            light_status_dgn: default_light_status_dgn(),
            light_status_marker: default_light_status_marker(),
            tank_status_dgn: default_tank_status_dgn(),
            lights: default_lights(),
            water_devices: default_water_devices(),
            tanks: default_tanks(),
            climate_prefixes: default_climate_prefixes(),
        }
    }
}

/// Single tank definition
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TankConfig {
    pub device_id: String,
    /// Added to the computed percentage before clamping
    #[serde(default)]
    pub calibration_offset: i16,
}

/// Change detector tolerances and timers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorConfig {
    /// Brightness changes must exceed this many points
    #[serde(default = "default_brightness_tolerance")]
    pub brightness_tolerance: u8,
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,
    #[serde(default = "default_heartbeat_window_ms")]
    pub heartbeat_window_ms: u64,
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            brightness_tolerance: default_brightness_tolerance(),
            duplicate_window_ms: default_duplicate_window_ms(),
            heartbeat_window_ms: default_heartbeat_window_ms(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

impl DetectorConfig {
    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_window_ms)
    }
}

/// Snapshot persistence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Listen address when running as the hub
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubServerConfig {
    #[serde(default = "default_hub_listen")]
    pub listen: String,
}

impl Default for HubServerConfig {
    fn default() -> Self {
        Self {
            listen: default_hub_listen(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty file is a valid "all defaults" config
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            anyhow::bail!("device_id cannot be empty");
        }

        if !(self.hub.url.starts_with("ws://") || self.hub.url.starts_with("wss://")) {
            anyhow::bail!("hub.url must use ws:// or wss:// (got '{}')", self.hub.url);
        }
        if self.hub.offline_queue_capacity == 0 {
            anyhow::bail!("hub.offline_queue_capacity must be at least 1");
        }

        let reconnect = &self.hub.reconnect;
        if reconnect.initial_delay_ms == 0 {
            anyhow::bail!("hub.reconnect.initial_delay_ms must be positive");
        }
        if reconnect.multiplier < 1.0 {
            anyhow::bail!(
                "hub.reconnect.multiplier must be >= 1.0 (got {})",
                reconnect.multiplier
            );
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            anyhow::bail!("hub.reconnect.max_delay_ms must be >= initial_delay_ms");
        }

        let watchdog = &self.hub.watchdog;
        if watchdog.ping_interval_ms == 0 || watchdog.idle_timeout_ms <= watchdog.ping_interval_ms {
            anyhow::bail!("hub.watchdog.idle_timeout_ms must exceed a non-zero ping_interval_ms");
        }

        if let Some(capture) = &self.bus.capture {
            if capture.program.trim().is_empty() {
                anyhow::bail!("bus.capture.program cannot be empty");
            }
        }

        self.decoder
            .validate()
            .context("Invalid decoder configuration")?;

        if self.detector.brightness_tolerance > 100 {
            anyhow::bail!(
                "detector.brightness_tolerance {} is larger than the brightness range",
                self.detector.brightness_tolerance
            );
        }
        if self.detector.purge_interval_ms == 0 || self.detector.heartbeat_window_ms == 0 {
            anyhow::bail!("detector timers must be positive");
        }

        Ok(())
    }
}

impl DecoderConfig {
    /// Device ids must be unique across categories and instances must not overlap
    /// on the shared dimmer DGN
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let ids = self
            .lights
            .values()
            .chain(self.water_devices.values())
            .chain(self.tanks.values().map(|t| &t.device_id));

        for id in ids {
            if id.trim().is_empty() {
                anyhow::bail!("device ids cannot be empty");
            }
            if !seen.insert(id.as_str()) {
                anyhow::bail!("device id '{}' is mapped more than once", id);
            }
        }

        for instance in self.water_devices.keys() {
            if self.lights.contains_key(instance) {
                anyhow::bail!(
                    "instance {} is mapped both as a light and a water device",
                    instance
                );
            }
        }

        for prefix in &self.climate_prefixes {
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
                anyhow::bail!("climate prefix '{}' is not a hex string", prefix);
            }
        }

        if self.light_status_dgn > 0x1FFFF || self.tank_status_dgn > 0x1FFFF {
            anyhow::bail!("DGN values are 17-bit");
        }

        Ok(())
    }
}

// Default value functions
fn default_device_id() -> String { "coach-panel".to_string() }
fn default_true() -> bool { true }
fn default_hub_url() -> String { "ws://127.0.0.1:8787/sync".to_string() }
fn default_queue_capacity() -> usize { 500 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 1.5 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 10 }
fn default_ping_interval_ms() -> u64 { 15_000 }
fn default_idle_timeout_ms() -> u64 { 45_000 }
fn default_capture() -> Option<CaptureConfig> {
    Some(CaptureConfig {
        program: default_capture_program(),
        args: default_capture_args(),
    })
}
fn default_capture_program() -> String { "candump".to_string() }
fn default_capture_args() -> Vec<String> { vec!["can0".to_string()] }
fn default_light_status_dgn() -> u32 { crate::bus::DGN_DC_DIMMER_STATUS_3 }
fn default_light_status_marker() -> u8 { 0xFC }
fn default_tank_status_dgn() -> u32 { crate::bus::DGN_TANK_STATUS }
fn default_brightness_tolerance() -> u8 { 2 }
fn default_duplicate_window_ms() -> u64 { 2000 }
fn default_heartbeat_window_ms() -> u64 { 30_000 }
fn default_purge_interval_ms() -> u64 { 1000 }
fn default_debounce_ms() -> u64 { 500 }
fn default_hub_listen() -> String { "0.0.0.0:8787".to_string() }

fn default_lights() -> BTreeMap<u8, String> {
    [
        (17, "entry"),
        (18, "living_ceiling"),
        (19, "kitchen_ceiling"),
        (20, "dinette"),
        (21, "hall"),
        (22, "bath_ceiling"),
        (23, "vanity"),
        (24, "porch"),
        (25, "awning"),
        (26, "bedroom_ceiling"),
        (27, "bedroom_reading_left"),
        (28, "bedroom_reading_right"),
    ]
    .into_iter()
    .map(|(instance, id)| (instance, id.to_string()))
    .collect()
}

fn default_water_devices() -> BTreeMap<u8, String> {
    [(40, "water_pump"), (41, "water_heater")]
        .into_iter()
        .map(|(instance, id)| (instance, id.to_string()))
        .collect()
}

fn default_tanks() -> BTreeMap<u8, TankConfig> {
    [
        (0, "fresh_water", 0),
        (1, "black_water", 0),
        (2, "gray_water", -7),
        (3, "lpg", 0),
    ]
    .into_iter()
    .map(|(instance, id, offset)| {
        (
            instance,
            TankConfig {
                device_id: id.to_string(),
                calibration_offset: offset,
            },
        )
    })
    .collect()
}

fn default_climate_prefixes() -> Vec<String> {
    vec!["19FFE2".to_string(), "19FF9C".to_string(), "19FFE1".to_string()]
}
