//! Device state type definitions
//!
//! Defines the categories, per-device values and entries held by the
//! canonical state tree, and the change notifications it publishes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Device id -> value, the unit of merge for one category
pub type Partial = BTreeMap<String, DeviceValue>;

/// Device id -> entry for one category
pub type CategoryEntries = BTreeMap<String, StateEntry>;

/// Current timestamp in milliseconds since epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Top-level grouping of devices in the state tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Lights,
    Tanks,
    WaterDevices,
    Climate,
    /// Synthetic entries (bus heartbeat)
    System,
}

impl Category {
    /// All possible categories
    pub fn all() -> &'static [Category] {
        &[
            Category::Lights,
            Category::Tanks,
            Category::WaterDevices,
            Category::Climate,
            Category::System,
        ]
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "lights" => Some(Category::Lights),
            "tanks" => Some(Category::Tanks),
            "waterDevices" => Some(Category::WaterDevices),
            "climate" => Some(Category::Climate),
            "system" => Some(Category::System),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Lights => "lights",
            Category::Tanks => "tanks",
            Category::WaterDevices => "waterDevices",
            Category::Climate => "climate",
            Category::System => "system",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value held for one device; the shape depends on the category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceValue {
    Light {
        #[serde(rename = "isOn")]
        is_on: bool,
        /// Percent, 0-100
        brightness: u8,
    },
    Tank {
        /// Percent, 0-100
        level: u8,
    },
    WaterDevice {
        #[serde(rename = "isOn")]
        is_on: bool,
    },
    Climate {
        raw: Vec<u8>,
    },
    Heartbeat {
        #[serde(rename = "quietForMs")]
        quiet_for_ms: u64,
    },
}

impl DeviceValue {
    /// Whether this value shape belongs in the given category
    pub fn matches(&self, category: Category) -> bool {
        matches!(
            (self, category),
            (DeviceValue::Light { .. }, Category::Lights)
                | (DeviceValue::Tank { .. }, Category::Tanks)
                | (DeviceValue::WaterDevice { .. }, Category::WaterDevices)
                | (DeviceValue::Climate { .. }, Category::Climate)
                | (DeviceValue::Heartbeat { .. }, Category::System)
        )
    }

    /// Clamp percentages into 0-100
    pub fn normalized(self) -> Self {
        match self {
            DeviceValue::Light { is_on, brightness } => DeviceValue::Light {
                is_on,
                brightness: brightness.min(100),
            },
            DeviceValue::Tank { level } => DeviceValue::Tank {
                level: level.min(100),
            },
            other => other,
        }
    }
}

/// Origin of a state entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Observed on the local bus (or a relayed raw frame)
    Bus,
    /// Generated locally without a bus observation (heartbeat)
    Synthetic,
    /// Received from another device through the hub
    Remote,
}

/// One device's entry in the state tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub value: DeviceValue,
    /// Timestamp (milliseconds since epoch)
    pub last_updated_at: u64,
    pub origin: Origin,
    /// Restored from a snapshot and not confirmed since
    #[serde(default)]
    pub stale: bool,
}

/// The canonical state of one device process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTree {
    pub categories: BTreeMap<Category, CategoryEntries>,
    pub local_device_id: String,
    /// Timestamp of the last accepted update (milliseconds since epoch)
    pub last_update_at: u64,
    /// Whether the hub connection is currently up
    pub online: bool,
}

impl StateTree {
    pub fn new(local_device_id: impl Into<String>) -> Self {
        Self {
            categories: BTreeMap::new(),
            local_device_id: local_device_id.into(),
            last_update_at: 0,
            online: false,
        }
    }

    /// Look up a single entry
    pub fn entry(&self, category: Category, device_id: &str) -> Option<&StateEntry> {
        self.categories.get(&category)?.get(device_id)
    }

    /// Values only, grouped by category (the shape exchanged with the hub)
    pub fn values(&self) -> BTreeMap<Category, Partial> {
        self.categories
            .iter()
            .map(|(category, entries)| {
                let values = entries
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.value.clone()))
                    .collect();
                (*category, values)
            })
            .collect()
    }
}

/// Notification published for every accepted update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub category: Category,
    /// Values actually merged
    pub partial: Partial,
    pub origin: Origin,
    /// Timestamp (milliseconds since epoch)
    pub at: u64,
}
