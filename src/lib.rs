//! Do-not-disturb client.
//!
//! Mirrors a user's device registry, their do-not-disturb status and relay
//! telemetry from an MQTT backend, and publishes signed register, unregister
//! and status change commands on the user's behalf.

pub mod command;
pub mod config;
pub mod console;
pub mod device;
pub mod mqtt;
