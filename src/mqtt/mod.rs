//! # Broker Synchronization
//!
//! Keeps the local view of a user's devices in sync with the backend over a
//! single MQTT connection and carries the user's signed commands back out.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs   - Broker endpoint, timing and topic filters
//! ├── topic.rs    - Wildcard topic patterns and the routing table
//! ├── engine.rs   - Applies routed messages to registry, status and telemetry
//! ├── session.rs  - Connection lifecycle, runs one engine in its own task
//! ├── manager.rs  - Login/logout, at most one session at a time
//! └── error.rs    - Session level errors
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Broker ──► EventLoop ──► TopicRouter ──► SyncEngine handler ──► stores
//!   ▲                                                               │
//!   └──── AsyncClient ◄──── SessionCommand ◄──── SessionHandle ◄────┘ snapshot
//! ```
//!
//! All messages use QoS 2. Inbound messages and outbound commands are
//! serialized through the session task, so handlers never race each other.

pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod session;
pub mod topic;

pub use config::{MqttConfig, TopicConfig};
pub use engine::{EngineUpdate, SessionSnapshot, SyncEngine};
pub use error::SessionError;
pub use manager::SessionManager;
pub use session::{ConnectionState, SessionHandle};
pub use topic::{TopicError, TopicKind, TopicPattern, TopicRouter};
