use serde::{Deserialize, Serialize};
use std::time::Duration;

// rumqttc rejects keep alive intervals below this
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Capacity of the client's request queue
    pub request_capacity: usize,
    /// Pause before the transport retries after a dropped connection
    pub reconnect_delay_ms: u64,
    pub topics: TopicConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            request_capacity: 100,
            reconnect_delay_ms: 2000,
            topics: TopicConfig::default(),
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Inbound topic filters. Each holds exactly one `+` standing for the user or
/// device ID. Relay topics differ between deployments, e.g. legacy shelly
/// firmware publishes `shellies/+/relay/0` and `shellies/+/relay/0/power`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub list_devices: String,
    pub device_status: String,
    pub relay_state: String,
    pub relay_power: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            list_devices: "+/listDevices".to_string(),
            device_status: "device/+/status".to_string(),
            relay_state: "relay/+/state".to_string(),
            relay_power: "relay/+/power".to_string(),
        }
    }
}
