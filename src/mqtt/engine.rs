//! Message-driven synchronization engine.
//!
//! Owns the registry, status and telemetry stores of one session and applies
//! inbound messages to them one at a time. Handlers are plain functions
//! stored in the topic routing table, so adding a message kind means adding a
//! row and a handler rather than touching the dispatch code.

use super::config::TopicConfig;
use super::topic::{TopicKind, TopicRouter};
use super::SessionError;
use crate::command::{CommandBuilder, Identity, OutboundMessage, PendingCommand};
use crate::device::{
    Device, DeviceRegistry, PowerReading, ReconcileOutcome, RelayState, StatusEvent,
    StatusOutcome, StatusTracker, TelemetryCache,
};
use chrono::{DateTime, Local, Utc};
use tracing::{debug, warn};

/// Effect of one inbound message on the local state.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    Registry(ReconcileOutcome),
    Status(StatusOutcome),
    Relay { device_id: String, state: RelayState },
    Power { device_id: String, watts: f64 },
}

type Handler = fn(&mut SyncEngine, &str, &str, DateTime<Utc>) -> Option<EngineUpdate>;

fn handler_for(kind: TopicKind) -> Handler {
    match kind {
        TopicKind::ListDevices => SyncEngine::on_list_devices,
        TopicKind::DeviceStatus => SyncEngine::on_device_status,
        TopicKind::RelayState => SyncEngine::on_relay_state,
        TopicKind::RelayPower => SyncEngine::on_relay_power,
    }
}

pub struct SyncEngine {
    user_id: String,
    router: TopicRouter<Handler>,
    registry: DeviceRegistry,
    status: StatusTracker,
    telemetry: TelemetryCache,
}

impl SyncEngine {
    pub fn new(user_id: &str, topics: &TopicConfig) -> Result<Self, SessionError> {
        Ok(Self {
            user_id: user_id.trim().to_string(),
            router: TopicRouter::from_config(topics, handler_for)?,
            registry: DeviceRegistry::new(),
            status: StatusTracker::new(),
            telemetry: TelemetryCache::new(),
        })
    }

    pub fn subscription_filters(&self) -> impl Iterator<Item = &str> {
        self.router.subscription_filters()
    }

    /// Routes and applies one inbound message. Returns `None` when the
    /// message was dropped.
    pub fn handle_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Option<EngineUpdate> {
        let Some(routed) = self.router.dispatch(topic) else {
            debug!("Dropping message on unrouted topic {}", topic);
            return None;
        };

        let payload = match std::str::from_utf8(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping non UTF-8 payload on {}: {}", topic, e);
                return None;
            }
        };

        debug!("Routing {:?} message for {}", routed.kind, routed.id);
        (routed.handler)(self, routed.id, payload, received_at)
    }

    fn on_list_devices(
        &mut self,
        user_id: &str,
        payload: &str,
        _received_at: DateTime<Utc>,
    ) -> Option<EngineUpdate> {
        match self.registry.reconcile(&self.user_id, user_id, payload) {
            Ok(outcome) => Some(EngineUpdate::Registry(outcome)),
            Err(e) => {
                warn!("Dropping device list: {}", e);
                None
            }
        }
    }

    fn on_device_status(
        &mut self,
        device_id: &str,
        payload: &str,
        received_at: DateTime<Utc>,
    ) -> Option<EngineUpdate> {
        let outcome = self.status.apply(
            device_id,
            payload,
            &self.registry,
            received_at.with_timezone(&Local),
        );
        Some(EngineUpdate::Status(outcome))
    }

    fn on_relay_state(
        &mut self,
        device_id: &str,
        payload: &str,
        _received_at: DateTime<Utc>,
    ) -> Option<EngineUpdate> {
        match self.telemetry.record_relay_state(device_id, payload) {
            Ok(state) => Some(EngineUpdate::Relay {
                device_id: device_id.to_string(),
                state,
            }),
            Err(e) => {
                warn!("Dropping relay state for {}: {}", device_id, e);
                None
            }
        }
    }

    fn on_relay_power(
        &mut self,
        device_id: &str,
        payload: &str,
        received_at: DateTime<Utc>,
    ) -> Option<EngineUpdate> {
        match self
            .telemetry
            .record_power(device_id, payload, received_at.timestamp())
        {
            Ok(watts) => Some(EngineUpdate::Power {
                device_id: device_id.to_string(),
                watts,
            }),
            Err(e) => {
                warn!("Dropping power reading for {}: {}", device_id, e);
                None
            }
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn telemetry(&self) -> &TelemetryCache {
        &self.telemetry
    }

    /// Signed unregister command for a device in the current snapshot.
    pub fn unregister_command(
        &self,
        identity: &Identity,
        device_id: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<PendingCommand, SessionError> {
        let device = self
            .registry
            .find(device_id.trim())
            .ok_or_else(|| SessionError::UnknownDevice(device_id.to_string()))?;
        Ok(CommandBuilder::new(identity).unregister_device(device, issued_at)?)
    }

    pub fn status_toggle(&self) -> Result<OutboundMessage, SessionError> {
        let dummy = self
            .registry
            .dummy_device()
            .ok_or(SessionError::NoDummyDevice)?;
        Ok(OutboundMessage::status_toggle(&dummy.device_id))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id.clone(),
            devices: self.registry.visible_devices().cloned().collect(),
            dummy_device_id: self.registry.dummy_device().map(|d| d.device_id.clone()),
            status: self.status.current(),
            history: self.status.history().cloned().collect(),
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Point-in-time copy of a session's state for presentation.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub user_id: String,
    /// Devices shown to the user (dummy device excluded)
    pub devices: Vec<Device>,
    pub dummy_device_id: Option<String>,
    pub status: bool,
    /// Newest first
    pub history: Vec<StatusEvent>,
    telemetry: TelemetryCache,
}

impl SessionSnapshot {
    pub fn power_reading(&self, device_id: &str, now: DateTime<Utc>) -> PowerReading {
        self.telemetry.power_reading(device_id, now.timestamp())
    }

    pub fn relay_state(&self, device_id: &str) -> Option<RelayState> {
        self.telemetry.relay_state(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{OfflineReason, Task};
    use chrono::TimeZone;
    use ed25519_dalek::SigningKey;

    const DEVICES: &str = r#"[
        {"deviceID":"1","task":"shelly","description":"{\"userDescription\":\"\",\"registrationTimestamp\":\"t1\"}"},
        {"deviceID":4294967303,"task":"both","description":"{\"is_dummy\":\"\",\"registrationTimestamp\":\"t1\"}"}
    ]"#;

    fn engine() -> SyncEngine {
        SyncEngine::new("7", &TopicConfig::default()).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_status_scenario_through_topics() {
        let mut engine = engine();
        engine.handle_message("7/listDevices", DEVICES.as_bytes(), at(0));

        assert_eq!(
            engine.handle_message("device/1/status", b"1", at(1)),
            Some(EngineUpdate::Status(StatusOutcome::Changed))
        );
        assert_eq!(
            engine.handle_message("device/1/status", b"1", at(2)),
            Some(EngineUpdate::Status(StatusOutcome::Unchanged))
        );
        engine.handle_message("device/1/status", b"0", at(3));

        let snapshot = engine.snapshot();
        assert!(!snapshot.status);
        let statuses: Vec<bool> = snapshot.history.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![false, true]);
    }

    #[test]
    fn test_status_before_registry_is_ignored() {
        let mut engine = engine();
        assert_eq!(
            engine.handle_message("device/1/status", b"1", at(0)),
            Some(EngineUpdate::Status(StatusOutcome::UnknownDevice))
        );
        assert_eq!(engine.status().history_len(), 0);
    }

    #[test]
    fn test_foreign_device_list_ignored() {
        let mut engine = engine();
        engine.handle_message("7/listDevices", DEVICES.as_bytes(), at(0));
        assert_eq!(
            engine.handle_message("8/listDevices", b"[]", at(1)),
            Some(EngineUpdate::Registry(ReconcileOutcome::Ignored))
        );
        assert_eq!(engine.registry().devices().len(), 2);
    }

    #[test]
    fn test_malformed_messages_dropped() {
        let mut engine = engine();
        engine.handle_message("7/listDevices", DEVICES.as_bytes(), at(0));

        assert_eq!(engine.handle_message("7/listDevices", b"{oops", at(1)), None);
        assert_eq!(engine.handle_message("relay/1/state", b"sideways", at(1)), None);
        assert_eq!(engine.handle_message("relay/1/power", b"many", at(1)), None);
        assert_eq!(engine.handle_message("relay/1/power", &[0xff, 0xfe], at(1)), None);
        assert_eq!(engine.handle_message("somewhere/else", b"1", at(1)), None);
        assert_eq!(engine.registry().devices().len(), 2);
    }

    #[test]
    fn test_telemetry_accepted_for_unowned_devices() {
        let mut engine = engine();
        engine.handle_message("relay/xyz/state", b"on", at(100));
        engine.handle_message("relay/xyz/power", b"42.5", at(100));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.relay_state("xyz"), Some(RelayState::On));
        assert_eq!(snapshot.power_reading("xyz", at(220)), PowerReading::Watts(42.5));
        assert_eq!(
            snapshot.power_reading("xyz", at(221)),
            PowerReading::Offline(OfflineReason::Stale)
        );
    }

    #[test]
    fn test_snapshot_hides_dummy_device() {
        let mut engine = engine();
        engine.handle_message("7/listDevices", DEVICES.as_bytes(), at(0));
        let snapshot = engine.snapshot();

        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].task, Task::Shelly);
        assert_eq!(snapshot.dummy_device_id.as_deref(), Some("4294967303"));
    }

    #[test]
    fn test_status_toggle_needs_dummy_device() {
        let mut engine = engine();
        assert!(matches!(
            engine.status_toggle(),
            Err(SessionError::NoDummyDevice)
        ));

        engine.handle_message("7/listDevices", DEVICES.as_bytes(), at(0));
        let toggle = engine.status_toggle().unwrap();
        assert_eq!(toggle.topic, "device/4294967303/update");
    }

    #[test]
    fn test_unregister_uses_registry_task() {
        let identity = Identity::new("7", SigningKey::from_bytes(&[9u8; 32])).unwrap();
        let mut engine = engine();
        assert!(matches!(
            engine.unregister_command(&identity, "1", at(5)),
            Err(SessionError::UnknownDevice(_))
        ));

        engine.handle_message("7/listDevices", DEVICES.as_bytes(), at(0));
        let command = engine.unregister_command(&identity, "1", at(5)).unwrap();
        assert_eq!(command.envelope.body.task, "shelly");
        assert_eq!(command.envelope.body.device_id.as_deref(), Some("1"));
    }
}
