use thiserror::Error;

/// Errors raised while preparing a signed command. A command that fails here
/// is never published.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("No private key available for user {0}")]
    MissingKey(String),

    #[error("Private key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("Private key has {0} bytes, expected 32 or 64")]
    KeyLength(usize),

    #[error("Private key rejected: {0}")]
    InvalidKey(#[from] ed25519_dalek::SignatureError),

    #[error("User ID must not be empty")]
    EmptyUserId,

    #[error("User ID {0} is not numeric")]
    NonNumericUserId(String),

    #[error("User ID {0} does not fit below 2^32")]
    UserIdOutOfRange(u64),

    #[error("Device ID must not be empty")]
    EmptyDeviceId,

    #[error("Alexa code must have exactly 6 characters, got {0:?}")]
    InvalidAlexaCode(String),

    #[error("Failed to serialize command: {0}")]
    Serialization(#[from] serde_json::Error),
}
