use super::topic::TopicError;
use crate::command::CommandError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Command rejected: {0}")]
    Command(#[from] CommandError),

    #[error("Invalid topic configuration: {0}")]
    Topic(#[from] TopicError),

    #[error("Publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),

    #[error("Device {0} is not registered for this user")]
    UnknownDevice(String),

    #[error("No dummy device registered yet, cannot change status")]
    NoDummyDevice,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Session closed")]
    Closed,

    #[error("Session task failed: {0}")]
    Task(String),
}
