//! Builder functions to construct state deltas from decoded bus events
//!
//! Maps each [`DecodedEvent`] onto the category and value shape the state
//! tree stores.

use super::types::{Category, DeviceValue};
use crate::bus::DecodedEvent;
use std::time::Duration;

/// Device id of the synthetic idle heartbeat entry
pub const HEARTBEAT_DEVICE_ID: &str = "bus_heartbeat";

/// Category, device id and value for a decoded event
pub fn delta_from_event(event: &DecodedEvent) -> (Category, String, DeviceValue) {
    match event {
        DecodedEvent::LightStatus {
            device_id,
            is_on,
            brightness,
        } => (
            Category::Lights,
            device_id.clone(),
            DeviceValue::Light {
                is_on: *is_on,
                brightness: *brightness,
            },
        ),
        DecodedEvent::TankStatus {
            device_id, level, ..
        } => (
            Category::Tanks,
            device_id.clone(),
            DeviceValue::Tank { level: *level },
        ),
        DecodedEvent::WaterDeviceStatus { device_id, is_on } => (
            Category::WaterDevices,
            device_id.clone(),
            DeviceValue::WaterDevice { is_on: *is_on },
        ),
        DecodedEvent::ClimateRaw { source_id, raw } => (
            Category::Climate,
            source_id.clone(),
            DeviceValue::Climate { raw: raw.clone() },
        ),
    }
}

/// Value written when the bus has been quiet for `quiet_for`
pub fn heartbeat_value(quiet_for: Duration) -> DeviceValue {
    DeviceValue::Heartbeat {
        quiet_for_ms: quiet_for.as_millis() as u64,
    }
}
