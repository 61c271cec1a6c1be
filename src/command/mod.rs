//! # Signed Commands
//!
//! Outbound control messages to the backend. Register and unregister requests
//! are signed with the user's Ed25519 key so the backend can tell that only the
//! owner of an account manages its devices; an embedded timestamp keeps two
//! otherwise identical requests from sharing a signature.

pub mod builder;
pub mod error;
pub mod identity;

pub use builder::{
    CommandBody, CommandBuilder, CommandEnvelope, OutboundMessage, PendingCommand,
    RegisterRequest,
};
pub use error::CommandError;
pub use identity::{Identity, IdentityProvider, DUMMY_DEVICE_ID_OFFSET};
