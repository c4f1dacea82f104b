//! Frame decoder - raw bus frames to semantic device events
//!
//! Only the message subset observed on the coach is decoded: dimmer status
//! (lights and the two switched water devices), tank status, and climate
//! frames which are passed through untouched. Anything else, including
//! truncated frames and unmapped instances, decodes to `None`.

use std::collections::HashMap;

use tracing::trace;

use super::dgn::Dgn;
use super::frame::Frame;
use crate::config::{DecoderConfig, TankConfig};

/// Full scale of the dimmer brightness byte
const DIMMER_FULL_SCALE: f64 = 200.0;

/// Resolution assumed when a tank frame does not report one
const DEFAULT_TANK_RESOLUTION: u8 = 4;

/// Semantic event decoded from one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    LightStatus {
        device_id: String,
        is_on: bool,
        /// Percent, 0-100
        brightness: u8,
    },
    TankStatus {
        device_id: String,
        relative_level: u8,
        resolution: u8,
        /// Calibrated percent, 0-100
        level: u8,
    },
    WaterDeviceStatus {
        device_id: String,
        is_on: bool,
    },
    /// Opaque climate/HVAC payload
    ClimateRaw { source_id: String, raw: Vec<u8> },
}

impl DecodedEvent {
    /// Logical device this event describes
    pub fn device_id(&self) -> &str {
        match self {
            DecodedEvent::LightStatus { device_id, .. }
            | DecodedEvent::TankStatus { device_id, .. }
            | DecodedEvent::WaterDeviceStatus { device_id, .. } => device_id,
            DecodedEvent::ClimateRaw { source_id, .. } => source_id,
        }
    }
}

/// Stateless frame decoder built from the configured tables
#[derive(Debug, Clone)]
pub struct Decoder {
    light_status_dgn: Dgn,
    light_status_marker: u8,
    tank_status_dgn: Dgn,
    lights: HashMap<u8, String>,
    water_devices: HashMap<u8, String>,
    tanks: HashMap<u8, TankConfig>,
    climate_prefixes: Vec<String>,
}

impl Decoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            light_status_dgn: Dgn(config.light_status_dgn),
            light_status_marker: config.light_status_marker,
            tank_status_dgn: Dgn(config.tank_status_dgn),
            lights: config.lights.clone().into_iter().collect(),
            water_devices: config.water_devices.clone().into_iter().collect(),
            tanks: config.tanks.clone().into_iter().collect(),
            climate_prefixes: config
                .climate_prefixes
                .iter()
                .map(|p| p.to_ascii_uppercase())
                .collect(),
        }
    }

    /// Decode a frame, or `None` if it is malformed, unmapped or not of interest
    pub fn decode(&self, frame: &Frame) -> Option<DecodedEvent> {
        let id_hex = frame.id_hex();
        if self.climate_prefixes.iter().any(|p| id_hex.starts_with(p)) {
            return Some(DecodedEvent::ClimateRaw {
                source_id: id_hex,
                raw: frame.data.clone(),
            });
        }

        let dgn = frame.dgn();
        if dgn == self.light_status_dgn {
            self.decode_dimmer_status(frame)
        } else if dgn == self.tank_status_dgn {
            self.decode_tank_status(frame)
        } else {
            None
        }
    }

    fn decode_dimmer_status(&self, frame: &Frame) -> Option<DecodedEvent> {
        let instance = *frame.data.first()?;

        // Switched water devices share the dimmer DGN; only byte[2] matters
        if let Some(device_id) = self.water_devices.get(&instance) {
            let state = *frame.data.get(2)?;
            return Some(DecodedEvent::WaterDeviceStatus {
                device_id: device_id.clone(),
                is_on: state > 0,
            });
        }

        let Some(device_id) = self.lights.get(&instance) else {
            trace!(instance, "Dimmer status for unmapped instance");
            return None;
        };

        let raw = *frame.data.get(2)?;
        let marker = *frame.data.get(3)?;
        if marker != self.light_status_marker {
            // Command echo, not a status report
            trace!(instance, marker, "Dimmer frame without status marker");
            return None;
        }

        let brightness = light_brightness_percent(raw);
        Some(DecodedEvent::LightStatus {
            device_id: device_id.clone(),
            is_on: brightness > 0,
            brightness,
        })
    }

    fn decode_tank_status(&self, frame: &Frame) -> Option<DecodedEvent> {
        if frame.data.len() < 3 {
            return None;
        }
        let instance = frame.data[0];
        let relative_level = frame.data[2];
        let resolution = match frame.data.get(3).copied() {
            None | Some(0) | Some(0xFF) => DEFAULT_TANK_RESOLUTION,
            Some(bits) => bits,
        };

        let Some(tank) = self.tanks.get(&instance) else {
            trace!(instance, "Tank status for unmapped instance");
            return None;
        };

        Some(DecodedEvent::TankStatus {
            device_id: tank.device_id.clone(),
            relative_level,
            resolution,
            level: tank_level_percent(relative_level, resolution, tank.calibration_offset),
        })
    }
}

/// Convert a 0-200 dimmer byte into a clamped percentage
pub fn light_brightness_percent(raw: u8) -> u8 {
    let percent = (f64::from(raw) * 100.0 / DIMMER_FULL_SCALE).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Tank percentage from a relative level and its resolution in bits
///
/// Small levels at the default 4-bit resolution are read as quarter steps;
/// everything else is proportional to the full scale of the resolution.
/// The calibration offset is applied before clamping to 0-100.
pub fn tank_level_percent(relative_level: u8, resolution: u8, calibration_offset: i16) -> u8 {
    let base = if resolution == DEFAULT_TANK_RESOLUTION && relative_level <= 4 {
        f64::from(relative_level) * 25.0
    } else {
        let full_scale = 2f64.powi(i32::from(resolution)) - 1.0;
        (f64::from(relative_level) * 100.0 / full_scale).round()
    };

    (base + f64::from(calibration_offset)).clamp(0.0, 100.0) as u8
}
