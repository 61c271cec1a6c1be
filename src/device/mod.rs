//! # Device Model
//!
//! Local view of the devices owned by the logged in user, their do-not-disturb
//! status and the telemetry published by relay devices.
//!
//! ```text
//! device/
//! ├── registry.rs   - snapshot of owned devices, replaced wholesale per listDevices
//! ├── status.rs     - current status and its change history
//! └── telemetry.rs  - relay state and power readings, independent of ownership
//! ```
//!
//! All three stores are plain data owned by the session task. They are mutated
//! one message at a time, so none of them needs a lock.

pub mod registry;
pub mod status;
pub mod telemetry;

pub use registry::{DeviceRegistry, ReconcileOutcome, RegistryError};
pub use status::{StatusEvent, StatusOutcome, StatusTracker};
pub use telemetry::{OfflineReason, PowerReading, RelayState, TelemetryCache, TelemetryError};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Display format used for registration and status timestamps,
/// e.g. `Sunday, Aug 1, 2021, 06:44 PM`.
const DISPLAY_TIMESTAMP_FORMAT: &str = "%A, %b %-d, %Y, %I:%M %p";

pub fn display_timestamp(at: DateTime<Local>) -> String {
    at.format(DISPLAY_TIMESTAMP_FORMAT).to_string()
}

/// Device category as used on the wire (`task` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Led,
    Button,
    /// Button and LED. Receives status updates and may request status changes.
    Both,
    Shelly,
    Alexa,
}

impl Task {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Task::Led => "led",
            Task::Button => "button",
            Task::Both => "both",
            Task::Shelly => "shelly",
            Task::Alexa => "alexa",
        }
    }

    /// Human readable device type
    pub fn label(&self) -> &'static str {
        match self {
            Task::Led => "LED",
            Task::Button => "Button",
            Task::Both => "Button and LED",
            Task::Shelly => "Shelly",
            Task::Alexa => "Alexa",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown device task: {0}")]
pub struct UnknownTask(pub String);

impl FromStr for Task {
    type Err = UnknownTask;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "led" => Ok(Task::Led),
            "button" => Ok(Task::Button),
            "both" => Ok(Task::Both),
            "shelly" => Ok(Task::Shelly),
            "alexa" => Ok(Task::Alexa),
            other => Err(UnknownTask(other.to_string())),
        }
    }
}

/// Parsed form of the JSON document carried in a device's `description` field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescription {
    pub user_description: String,
    pub registration_timestamp: String,
    pub is_dummy: bool,
}

/// Key whose presence, whatever its value, marks the dummy device.
const DUMMY_MARKER: &str = "is_dummy";

/// Wire layout of the description document.
///
/// Field order is significant: the serialized string is part of the signed
/// register message, so it must stay `is_dummy`/`userDescription` first and
/// `registrationTimestamp` last.
#[derive(Debug, Serialize, Deserialize)]
struct DescriptionWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_dummy: Option<serde_json::Value>,
    #[serde(
        rename = "userDescription",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    user_description: Option<String>,
    #[serde(rename = "registrationTimestamp", default)]
    registration_timestamp: String,
}

impl DeviceDescription {
    pub fn user(user_description: impl Into<String>, registration_timestamp: impl Into<String>) -> Self {
        Self {
            user_description: user_description.into(),
            registration_timestamp: registration_timestamp.into(),
            is_dummy: false,
        }
    }

    pub fn dummy(registration_timestamp: impl Into<String>) -> Self {
        Self {
            user_description: String::new(),
            registration_timestamp: registration_timestamp.into(),
            is_dummy: true,
        }
    }

    /// Serializes to the JSON string embedded in register commands.
    pub fn to_wire_string(&self) -> Result<String, serde_json::Error> {
        let wire = if self.is_dummy {
            DescriptionWire {
                is_dummy: Some(serde_json::Value::String(String::new())),
                user_description: None,
                registration_timestamp: self.registration_timestamp.clone(),
            }
        } else {
            DescriptionWire {
                is_dummy: None,
                user_description: Some(self.user_description.clone()),
                registration_timestamp: self.registration_timestamp.clone(),
            }
        };
        serde_json::to_string(&wire)
    }

    /// Accepts either the embedded JSON string or an inline object.
    pub fn from_wire(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let fields: serde_json::Map<String, serde_json::Value> = match value {
            serde_json::Value::String(raw) => serde_json::from_str(raw)?,
            other => serde_json::from_value(other.clone())?,
        };
        let is_dummy = fields.contains_key(DUMMY_MARKER);
        let wire: DescriptionWire = serde_json::from_value(serde_json::Value::Object(fields))?;
        Ok(Self {
            user_description: wire.user_description.unwrap_or_default(),
            registration_timestamp: wire.registration_timestamp,
            is_dummy,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    pub task: Task,
    pub description: DeviceDescription,
}

impl Device {
    pub fn is_dummy(&self) -> bool {
        self.description.is_dummy
    }
}

/// Canonical string form of a device ID. Relay devices report string IDs,
/// button/LED devices and alexas numeric ones.
pub fn canonical_device_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(match (n.as_u64(), n.as_i64(), n.as_f64()) {
            (Some(id), _, _) => id.to_string(),
            (None, Some(id), _) => id.to_string(),
            // integral floats such as `1.0` print without a fraction
            (None, None, Some(id)) => id.to_string(),
            _ => n.to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_task_round_trips_wire_names() {
        for task in [Task::Led, Task::Button, Task::Both, Task::Shelly, Task::Alexa] {
            assert_eq!(task.as_wire().parse::<Task>(), Ok(task));
        }
        assert!("toaster".parse::<Task>().is_err());
    }

    #[test]
    fn test_task_labels() {
        assert_eq!(Task::Both.label(), "Button and LED");
        assert_eq!(Task::Shelly.label(), "Shelly");
    }

    #[test]
    fn test_user_description_key_order() {
        let description = DeviceDescription::user("Living room", "t1");
        assert_eq!(
            description.to_wire_string().unwrap(),
            r#"{"userDescription":"Living room","registrationTimestamp":"t1"}"#
        );
    }

    #[test]
    fn test_dummy_description_key_order() {
        let description = DeviceDescription::dummy("t1");
        assert_eq!(
            description.to_wire_string().unwrap(),
            r#"{"is_dummy":"","registrationTimestamp":"t1"}"#
        );
    }

    #[test]
    fn test_description_from_string_and_object() {
        let from_string = DeviceDescription::from_wire(&json!(
            "{\"userDescription\":\"Hall\",\"registrationTimestamp\":\"t2\"}"
        ))
        .unwrap();
        assert_eq!(from_string, DeviceDescription::user("Hall", "t2"));

        let from_object =
            DeviceDescription::from_wire(&json!({"is_dummy": "", "registrationTimestamp": "t3"}))
                .unwrap();
        assert!(from_object.is_dummy);
        assert_eq!(from_object.registration_timestamp, "t3");
    }

    #[test]
    fn test_dummy_marker_detected_by_key_presence() {
        let null_marker = DeviceDescription::from_wire(&json!(
            "{\"is_dummy\":null,\"registrationTimestamp\":\"t4\"}"
        ))
        .unwrap();
        assert!(null_marker.is_dummy);

        let object_marker =
            DeviceDescription::from_wire(&json!({"is_dummy": false, "registrationTimestamp": "t5"}))
                .unwrap();
        assert!(object_marker.is_dummy);

        let plain = DeviceDescription::from_wire(&json!({"userDescription": "Hall"})).unwrap();
        assert!(!plain.is_dummy);
    }

    #[test]
    fn test_description_rejects_garbage() {
        assert!(DeviceDescription::from_wire(&json!("not json")).is_err());
        assert!(DeviceDescription::from_wire(&json!(42)).is_err());
    }

    #[test]
    fn test_canonical_device_id() {
        assert_eq!(canonical_device_id(&json!(123456)), Some("123456".to_string()));
        assert_eq!(canonical_device_id(&json!("abc ")), Some("abc".to_string()));
        assert_eq!(canonical_device_id(&json!(4294967303u64)), Some("4294967303".to_string()));
        assert_eq!(canonical_device_id(&json!(1.0)), Some("1".to_string()));
        assert_eq!(canonical_device_id(&json!(2.5)), Some("2.5".to_string()));
        assert_eq!(canonical_device_id(&json!(null)), None);
        assert_eq!(canonical_device_id(&json!([1])), None);
    }

    #[test]
    fn test_display_timestamp_format() {
        let at = Local.with_ymd_and_hms(2021, 8, 1, 18, 44, 0).unwrap();
        assert_eq!(display_timestamp(at), "Sunday, Aug 1, 2021, 06:44 PM");
    }
}
