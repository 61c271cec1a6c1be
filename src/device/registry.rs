//! Device registry reconciliation for `<userID>/listDevices` messages.
//!
//! The broker publishes the full list of a user's devices on every change. A
//! valid message replaces the snapshot as a whole; records with missing or
//! unparsable fields are skipped individually so one bad entry does not hide
//! the rest of the user's devices.

use super::{canonical_device_id, Device, DeviceDescription, Task};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

const REQUIRED_KEYS: [&str; 3] = ["deviceID", "task", "description"];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("listDevices payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("listDevices payload is not a sequence")]
    NotASequence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Message addressed another identity, snapshot untouched
    Ignored,
    /// Snapshot replaced; `skipped` counts rejected records
    Replaced { accepted: usize, skipped: usize },
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a listDevices message received for `message_user_id`.
    ///
    /// Messages for any identity other than `session_user_id` are ignored.
    /// Fails without touching the snapshot if the payload is not a JSON array.
    pub fn reconcile(
        &mut self,
        session_user_id: &str,
        message_user_id: &str,
        payload: &str,
    ) -> Result<ReconcileOutcome, RegistryError> {
        if session_user_id != message_user_id {
            debug!("Ignoring device list for user {}", message_user_id);
            return Ok(ReconcileOutcome::Ignored);
        }

        let records = match serde_json::from_str::<Value>(payload)? {
            Value::Array(records) => records,
            _ => return Err(RegistryError::NotASequence),
        };

        let mut devices = Vec::with_capacity(records.len());
        let mut skipped = 0;
        for (index, record) in records.iter().enumerate() {
            match parse_record(record) {
                Ok(device) => devices.push(device),
                Err(reason) => {
                    warn!("Skipping device record {}: {}", index, reason);
                    skipped += 1;
                }
            }
        }

        let accepted = devices.len();
        self.devices = devices;
        info!(
            "Device registry replaced: {} devices, {} skipped",
            accepted, skipped
        );
        Ok(ReconcileOutcome::Replaced { accepted, skipped })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Devices shown to the user, i.e. everything except the dummy device.
    pub fn visible_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| !d.is_dummy())
    }

    pub fn find(&self, device_id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.find(device_id).is_some()
    }

    /// The device registered on behalf of this client session, if any.
    pub fn dummy_device(&self) -> Option<&Device> {
        self.devices.iter().find(|d| d.is_dummy())
    }
}

fn parse_record(record: &Value) -> Result<Device, String> {
    let fields = record
        .as_object()
        .ok_or_else(|| "record is not an object".to_string())?;

    if let Some(missing) = REQUIRED_KEYS.iter().find(|key| !fields.contains_key(**key)) {
        return Err(format!("missing key {}", missing));
    }

    let device_id = canonical_device_id(&fields["deviceID"])
        .filter(|id| !id.is_empty())
        .ok_or_else(|| format!("invalid deviceID {}", fields["deviceID"]))?;

    let task = fields["task"]
        .as_str()
        .ok_or_else(|| "task is not a string".to_string())?
        .parse::<Task>()
        .map_err(|e| e.to_string())?;

    let description = DeviceDescription::from_wire(&fields["description"])
        .map_err(|e| format!("invalid description: {}", e))?;

    Ok(Device {
        device_id,
        task,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"[{"deviceID":"1","task":"shelly","description":"{\"userDescription\":\"\",\"registrationTimestamp\":\"t1\"}"}]"#;

    #[test]
    fn test_replaces_snapshot() {
        let mut registry = DeviceRegistry::new();
        let outcome = registry.reconcile("7", "7", SINGLE).unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Replaced {
                accepted: 1,
                skipped: 0
            }
        );
        let device = registry.find("1").unwrap();
        assert_eq!(device.task, Task::Shelly);
        assert_eq!(device.description.registration_timestamp, "t1");

        registry.reconcile("7", "7", "[]").unwrap();
        assert!(registry.devices().is_empty());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut registry = DeviceRegistry::new();
        registry.reconcile("7", "7", SINGLE).unwrap();
        let first = registry.devices().to_vec();
        registry.reconcile("7", "7", SINGLE).unwrap();
        assert_eq!(registry.devices(), first.as_slice());
    }

    #[test]
    fn test_other_user_is_ignored() {
        let mut registry = DeviceRegistry::new();
        registry.reconcile("7", "7", SINGLE).unwrap();
        let outcome = registry.reconcile("7", "8", "[]").unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored);
        assert!(registry.contains("1"));
    }

    #[test]
    fn test_invalid_record_skipped_siblings_kept() {
        let payload = r#"[
            {"deviceID": 42, "task": "both", "description": {"userDescription": "desk", "registrationTimestamp": "t"}},
            {"deviceID": "43", "description": "{}"},
            {"deviceID": "44", "task": "vacuum", "description": "{}"},
            {"deviceID": "45", "task": "led", "description": "not json"},
            "garbage",
            {"deviceID": "46", "task": "led", "description": "{\"registrationTimestamp\":\"t\"}"}
        ]"#;
        let mut registry = DeviceRegistry::new();
        let outcome = registry.reconcile("7", "7", payload).unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Replaced {
                accepted: 2,
                skipped: 4
            }
        );
        assert!(registry.contains("42"));
        assert!(registry.contains("46"));
        assert!(!registry.contains("43"));
    }

    #[test]
    fn test_malformed_payload_leaves_snapshot() {
        let mut registry = DeviceRegistry::new();
        registry.reconcile("7", "7", SINGLE).unwrap();

        assert!(matches!(
            registry.reconcile("7", "7", "{not json"),
            Err(RegistryError::InvalidJson(_))
        ));
        assert!(matches!(
            registry.reconcile("7", "7", r#"{"deviceID":"1"}"#),
            Err(RegistryError::NotASequence)
        ));
        assert_eq!(registry.devices().len(), 1);
    }

    #[test]
    fn test_dummy_device_hidden_from_listing() {
        let payload = r#"[
            {"deviceID": 4294967303, "task": "both", "description": "{\"is_dummy\":\"\",\"registrationTimestamp\":\"t\"}"},
            {"deviceID": "abc", "task": "shelly", "description": "{\"userDescription\":\"plug\",\"registrationTimestamp\":\"t\"}"}
        ]"#;
        let mut registry = DeviceRegistry::new();
        registry.reconcile("7", "7", payload).unwrap();

        let visible: Vec<_> = registry.visible_devices().map(|d| d.device_id.as_str()).collect();
        assert_eq!(visible, vec!["abc"]);
        assert_eq!(registry.dummy_device().unwrap().device_id, "4294967303");
    }

    #[test]
    fn test_null_dummy_marker_still_hidden() {
        let payload = r#"[
            {"deviceID": 4294967303.0, "task": "both", "description": {"is_dummy": null, "registrationTimestamp": "t"}},
            {"deviceID": 12, "task": "led", "description": {"userDescription": "desk", "registrationTimestamp": "t"}}
        ]"#;
        let mut registry = DeviceRegistry::new();
        registry.reconcile("7", "7", payload).unwrap();

        let visible: Vec<_> = registry.visible_devices().map(|d| d.device_id.as_str()).collect();
        assert_eq!(visible, vec!["12"]);
        assert_eq!(registry.dummy_device().unwrap().device_id, "4294967303");
    }
}
