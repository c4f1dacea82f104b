//! Hub wire format
//!
//! Every message exchanged with the hub is a JSON text frame holding one
//! [`SyncEnvelope`]. The only exception is the identity claim a client sends
//! right after connecting: `{"deviceId": "..."}`.

use super::error::SyncError;
use crate::bus::RawFrameData;
use crate::state::{now_ms, Category, Partial};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Sender id the hub uses for envelopes it originates
pub const HUB_SOURCE_ID: &str = "hub";

/// Envelope kinds understood by clients and the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    StateUpdate,
    RawFrameRelay,
    CommandExecuted,
    InitialSync,
    SubscriptionAck,
    Error,
}

/// One message on the hub connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub source_device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RawFrameData>,
    /// Timestamp (milliseconds since epoch)
    #[serde(default)]
    pub sent_at: u64,
}

/// First message a client sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityClaim {
    pub device_id: String,
}

impl SyncEnvelope {
    fn new(kind: EnvelopeKind, source_device_id: impl Into<String>) -> Self {
        Self {
            kind,
            source_device_id: source_device_id.into(),
            category: None,
            payload: None,
            data: None,
            sent_at: now_ms(),
        }
    }

    /// Delta for one category
    pub fn state_update(
        source_device_id: impl Into<String>,
        category: Category,
        partial: &Partial,
    ) -> Result<Self, SyncError> {
        let mut envelope = Self::new(EnvelopeKind::StateUpdate, source_device_id);
        envelope.category = Some(category);
        envelope.payload = Some(serde_json::to_value(partial)?);
        Ok(envelope)
    }

    /// Raw bus frame for devices without bus access
    pub fn raw_frame(source_device_id: impl Into<String>, data: RawFrameData) -> Self {
        let mut envelope = Self::new(EnvelopeKind::RawFrameRelay, source_device_id);
        envelope.data = Some(data);
        envelope
    }

    /// Merged hub snapshot: category -> device -> value
    pub fn initial_sync(snapshot: Value) -> Self {
        let mut envelope = Self::new(EnvelopeKind::InitialSync, HUB_SOURCE_ID);
        envelope.payload = Some(snapshot);
        envelope
    }

    pub fn subscription_ack(device_id: &str) -> Self {
        let mut envelope = Self::new(EnvelopeKind::SubscriptionAck, HUB_SOURCE_ID);
        envelope.payload = Some(json!({ "deviceId": device_id }));
        envelope
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut envelope = Self::new(EnvelopeKind::Error, HUB_SOURCE_ID);
        envelope.payload = Some(json!({ "message": message.into() }));
        envelope
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Device values carried by a `stateUpdate`
    pub fn partial(&self) -> Result<Partial, SyncError> {
        match &self.payload {
            Some(payload) => Ok(serde_json::from_value(payload.clone())?),
            None => Ok(Partial::new()),
        }
    }

    /// Categories carried by an `initialSync`
    ///
    /// Unknown categories and devices whose value cannot be read are skipped.
    pub fn initial_sync_categories(&self) -> BTreeMap<Category, Partial> {
        let mut categories = BTreeMap::new();
        let Some(Value::Object(payload)) = &self.payload else {
            return categories;
        };
        for (name, devices) in payload {
            let Some(category) = Category::from_str(name) else {
                debug!(category = %name, "Skipping unknown category in initial sync");
                continue;
            };
            let Value::Object(devices) = devices else {
                continue;
            };
            let partial: Partial = devices
                .iter()
                .filter_map(|(id, value)| {
                    serde_json::from_value(value.clone())
                        .ok()
                        .map(|value| (id.clone(), value))
                })
                .collect();
            if !partial.is_empty() {
                categories.insert(category, partial);
            }
        }
        categories
    }

    /// Human readable message of an `error` envelope
    pub fn error_message(&self) -> Option<&str> {
        self.payload.as_ref()?.get("message")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceValue;

    fn lights_partial() -> Partial {
        Partial::from([(
            "bedroom_ceiling".to_string(),
            DeviceValue::Light {
                is_on: true,
                brightness: 100,
            },
        )])
    }

    #[test]
    fn test_state_update_wire_shape() {
        let envelope = SyncEnvelope::state_update("panel", Category::Lights, &lights_partial()).unwrap();
        let json: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(json["kind"], "stateUpdate");
        assert_eq!(json["sourceDeviceId"], "panel");
        assert_eq!(json["category"], "lights");
        assert_eq!(json["payload"]["bedroom_ceiling"]["isOn"], true);
        assert_eq!(json["payload"]["bedroom_ceiling"]["brightness"], 100);
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_partial_parses_back() {
        let envelope = SyncEnvelope::state_update("panel", Category::Lights, &lights_partial()).unwrap();
        let parsed = SyncEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed.partial().unwrap(), lights_partial());
    }

    #[test]
    fn test_raw_frame_relay_shape() {
        let data = RawFrameData {
            id: "19FEDA9F".to_string(),
            data: vec![0x1A, 0xFF],
            interface: "can0".to_string(),
            timestamp: 7,
        };
        let envelope = SyncEnvelope::raw_frame("gateway", data.clone());
        let json: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "rawFrameRelay");
        assert_eq!(json["data"]["id"], "19FEDA9F");
        assert_eq!(json["data"]["data"], json!([26, 255]));
        assert_eq!(SyncEnvelope::from_json(&json.to_string()).unwrap().data, Some(data));
    }

    #[test]
    fn test_initial_sync_skips_unknown() {
        let envelope = SyncEnvelope::initial_sync(json!({
            "tanks": {"lpg": {"level": 60}, "broken": "nope"},
            "satellites": {"x": {"level": 1}}
        }));
        let categories = envelope.initial_sync_categories();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[&Category::Tanks]["lpg"], DeviceValue::Tank { level: 60 });
        assert!(!categories[&Category::Tanks].contains_key("broken"));
    }

    #[test]
    fn test_identity_claim_is_not_an_envelope() {
        let claim = serde_json::to_string(&IdentityClaim {
            device_id: "panel".to_string(),
        })
        .unwrap();
        assert_eq!(claim, r#"{"deviceId":"panel"}"#);
        assert!(SyncEnvelope::from_json(&claim).is_err());
    }

    #[test]
    fn test_error_envelope_message() {
        let envelope = SyncEnvelope::error("bad frame");
        assert_eq!(envelope.error_message(), Some("bad frame"));
        assert_eq!(envelope.source_device_id, HUB_SOURCE_ID);
    }
}
