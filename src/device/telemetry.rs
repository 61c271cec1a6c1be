//! Relay telemetry cache.
//!
//! Relay devices publish their switch state and, roughly once a minute, their
//! power draw. Both are cached for every device ID seen on the broker, owned
//! or not, so a freshly registered relay shows its reading immediately.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Seconds after which a power reading no longer counts as current.
pub const STALENESS_WINDOW_SECS: i64 = 120;

#[derive(Debug, Error, PartialEq)]
pub enum TelemetryError {
    #[error("Unknown relay state: {0}")]
    UnknownRelayState(String),

    #[error("Invalid power reading: {0}")]
    InvalidPower(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    On,
    Off,
    Overpower,
}

impl FromStr for RelayState {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "on" => Ok(RelayState::On),
            "off" => Ok(RelayState::Off),
            "overpower" => Ok(RelayState::Overpower),
            other => Err(TelemetryError::UnknownRelayState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub last_power_watts: f64,
    pub received_at_epoch_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    NoReading,
    ExplicitlyOff,
    Stale,
}

impl fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfflineReason::NoReading => write!(f, "no reading"),
            OfflineReason::ExplicitlyOff => write!(f, "explicitly off"),
            OfflineReason::Stale => write!(f, "stale"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerReading {
    Offline(OfflineReason),
    Watts(f64),
}

impl fmt::Display for PowerReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerReading::Offline(reason) => write!(f, "Offline ({})", reason),
            PowerReading::Watts(watts) => write!(f, "{} Watt", watts),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryCache {
    relay_states: HashMap<String, RelayState>,
    power: HashMap<String, TelemetryRecord>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_relay_state(
        &mut self,
        device_id: &str,
        payload: &str,
    ) -> Result<RelayState, TelemetryError> {
        let state = payload.parse::<RelayState>()?;
        debug!("Relay {} is {:?}", device_id, state);
        self.relay_states.insert(device_id.to_string(), state);
        Ok(state)
    }

    pub fn record_power(
        &mut self,
        device_id: &str,
        payload: &str,
        received_at_epoch_secs: i64,
    ) -> Result<f64, TelemetryError> {
        let watts = payload
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|w| w.is_finite())
            .ok_or_else(|| TelemetryError::InvalidPower(payload.to_string()))?;

        self.power.insert(
            device_id.to_string(),
            TelemetryRecord {
                device_id: device_id.to_string(),
                last_power_watts: watts,
                received_at_epoch_secs,
            },
        );
        Ok(watts)
    }

    pub fn relay_state(&self, device_id: &str) -> Option<RelayState> {
        self.relay_states.get(device_id).copied()
    }

    pub fn record(&self, device_id: &str) -> Option<&TelemetryRecord> {
        self.power.get(device_id)
    }

    /// Classifies the latest reading for `device_id` as seen at `now_epoch_secs`.
    pub fn power_reading(&self, device_id: &str, now_epoch_secs: i64) -> PowerReading {
        let Some(record) = self.power.get(device_id) else {
            return PowerReading::Offline(OfflineReason::NoReading);
        };

        if matches!(self.relay_state(device_id), Some(state) if state != RelayState::On) {
            return PowerReading::Offline(OfflineReason::ExplicitlyOff);
        }

        if now_epoch_secs - record.received_at_epoch_secs > STALENESS_WINDOW_SECS {
            return PowerReading::Offline(OfflineReason::Stale);
        }

        PowerReading::Watts(record.last_power_watts)
    }
}
