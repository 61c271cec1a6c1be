//! Construction of signed register/unregister commands.
//!
//! Every command carries the user ID, the target device, and an idempotency
//! timestamp (UTC epoch seconds). The signature covers the concatenation of
//! the body's values in a fixed order:
//!
//! ```text
//! register     userID + deviceID + task + description + timestamp
//! alexa        userID + code            + description + timestamp
//! unregister   userID + deviceID + task                + timestamp
//! ```
//!
//! Alexa registrations leave `task` out of the signed string while still
//! sending it in the body. The backend verifies exactly this layout.
//!
//! Older backends signed unregister requests as `userID + deviceID + task`
//! only. The timestamp is always appended here, so those servers reject
//! unregister requests from this client.

use super::{CommandError, Identity};
use crate::device::{display_timestamp, Device, DeviceDescription, Task};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::debug;

pub const REGISTER_TOPIC: &str = "webfrontend/device/register";
pub const ALEXA_REGISTER_TOPIC: &str = "webfrontend/alexa/register";
pub const UNREGISTER_TOPIC: &str = "webfrontend/device/unregister";

const ALEXA_CODE_LEN: usize = 6;

/// Task of the dummy device: receives status updates and may request changes.
pub const SELF_REGISTRATION_TASK: Task = Task::Both;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandBody {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "deviceID", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEnvelope {
    pub body: CommandBody,
    pub signature: String,
}

/// A signed command on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub topic: String,
    pub envelope: CommandEnvelope,
}

impl PendingCommand {
    pub fn idempotency_timestamp(&self) -> &str {
        &self.envelope.body.timestamp
    }

    pub fn into_outbound(self) -> Result<OutboundMessage, CommandError> {
        let payload = serde_json::to_vec(&self.envelope)?;
        Ok(OutboundMessage {
            topic: self.topic,
            payload,
        })
    }
}

/// Raw publish request: topic plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Asks the backend to flip the do-not-disturb status of the dummy device.
    pub fn status_toggle(dummy_device_id: &str) -> Self {
        Self {
            topic: format!("device/{}/update", dummy_device_id),
            payload: Vec::new(),
        }
    }
}

/// User input for registering a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub task: Task,
    /// Device ID, or the six character pairing code for alexas
    pub device_id: String,
    pub user_description: String,
}

impl RegisterRequest {
    pub fn new(
        task: Task,
        device_id: impl Into<String>,
        user_description: impl Into<String>,
    ) -> Result<Self, CommandError> {
        let device_id = device_id.into().trim().to_string();
        if device_id.is_empty() {
            return Err(CommandError::EmptyDeviceId);
        }
        if task == Task::Alexa && device_id.chars().count() != ALEXA_CODE_LEN {
            return Err(CommandError::InvalidAlexaCode(device_id));
        }
        Ok(Self {
            task,
            device_id,
            user_description: user_description.into(),
        })
    }
}

pub struct CommandBuilder<'a> {
    identity: &'a Identity,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(identity: &'a Identity) -> Self {
        Self { identity }
    }

    pub fn register_device(
        &self,
        request: &RegisterRequest,
        issued_at: DateTime<Utc>,
    ) -> Result<PendingCommand, CommandError> {
        let description = DeviceDescription::user(
            request.user_description.clone(),
            registration_timestamp(issued_at),
        );
        self.register(request.task, &request.device_id, &description, issued_at)
    }

    /// Registers the dummy device that represents this client session.
    pub fn register_self(&self, issued_at: DateTime<Utc>) -> Result<PendingCommand, CommandError> {
        let dummy_id = self.identity.dummy_device_id()?.to_string();
        let description = DeviceDescription::dummy(registration_timestamp(issued_at));
        self.register(SELF_REGISTRATION_TASK, &dummy_id, &description, issued_at)
    }

    pub fn unregister_device(
        &self,
        device: &Device,
        issued_at: DateTime<Utc>,
    ) -> Result<PendingCommand, CommandError> {
        let user_id = self.identity.user_id().to_string();
        let device_id = device.device_id.trim().to_string();
        let task = device.task.as_wire().to_string();
        let timestamp = idempotency_timestamp(issued_at);

        let signature = self.sign(&[
            user_id.as_str(),
            device_id.as_str(),
            task.as_str(),
            timestamp.as_str(),
        ]);
        Ok(PendingCommand {
            topic: UNREGISTER_TOPIC.to_string(),
            envelope: CommandEnvelope {
                body: CommandBody {
                    user_id,
                    device_id: Some(device_id),
                    code: None,
                    task,
                    description: None,
                    timestamp,
                },
                signature,
            },
        })
    }

    fn register(
        &self,
        task: Task,
        device_id: &str,
        description: &DeviceDescription,
        issued_at: DateTime<Utc>,
    ) -> Result<PendingCommand, CommandError> {
        let user_id = self.identity.user_id().to_string();
        let device_id = device_id.trim().to_string();
        let task_wire = task.as_wire().to_string();
        let description = description.to_wire_string()?;
        let timestamp = idempotency_timestamp(issued_at);

        let command = if task == Task::Alexa {
            let signature = self.sign(&[
                user_id.as_str(),
                device_id.as_str(),
                description.as_str(),
                timestamp.as_str(),
            ]);
            PendingCommand {
                topic: ALEXA_REGISTER_TOPIC.to_string(),
                envelope: CommandEnvelope {
                    body: CommandBody {
                        user_id,
                        device_id: None,
                        code: Some(device_id),
                        task: task_wire,
                        description: Some(description),
                        timestamp,
                    },
                    signature,
                },
            }
        } else {
            let signature = self.sign(&[
                user_id.as_str(),
                device_id.as_str(),
                task_wire.as_str(),
                description.as_str(),
                timestamp.as_str(),
            ]);
            PendingCommand {
                topic: REGISTER_TOPIC.to_string(),
                envelope: CommandEnvelope {
                    body: CommandBody {
                        user_id,
                        device_id: Some(device_id),
                        code: None,
                        task: task_wire,
                        description: Some(description),
                        timestamp,
                    },
                    signature,
                },
            }
        };
        Ok(command)
    }

    fn sign(&self, parts: &[&str]) -> String {
        let message = parts.concat();
        debug!("Signing command message of {} bytes", message.len());
        self.identity.sign(&message)
    }
}

pub fn idempotency_timestamp(issued_at: DateTime<Utc>) -> String {
    issued_at.timestamp().to_string()
}

fn registration_timestamp(issued_at: DateTime<Utc>) -> String {
    display_timestamp(issued_at.with_timezone(&Local))
}
