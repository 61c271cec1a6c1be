//! Do-not-disturb status tracking.
//!
//! Status messages are only accepted for devices in the registry snapshot that
//! is current when the message is handled; the registry is passed in per call
//! rather than captured up front.

use super::{display_timestamp, DeviceRegistry};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: bool,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// Device is not owned by the current identity
    UnknownDevice,
    /// Status confirmed, history unchanged
    Unchanged,
    Changed,
}

#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    current: bool,
    // newest first
    history: VecDeque<StatusEvent>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"1"` means do-not-disturb, anything else clears it.
    pub fn decode(payload: &str) -> bool {
        payload == "1"
    }

    pub fn apply(
        &mut self,
        device_id: &str,
        payload: &str,
        registry: &DeviceRegistry,
        at: DateTime<Local>,
    ) -> StatusOutcome {
        if !registry.contains(device_id) {
            debug!("Ignoring status for unowned device {}", device_id);
            return StatusOutcome::UnknownDevice;
        }

        let status = Self::decode(payload);
        self.current = status;

        let changed = self
            .history
            .front()
            .map_or(true, |latest| latest.status != status);
        if !changed {
            return StatusOutcome::Unchanged;
        }

        self.history.push_front(StatusEvent {
            status,
            timestamp: display_timestamp(at),
        });
        StatusOutcome::Changed
    }

    pub fn current(&self) -> bool {
        self.current
    }

    pub fn history(&self) -> impl Iterator<Item = &StatusEvent> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
