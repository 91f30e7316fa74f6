//! Relay connections: per-socket state, keepalive, pairing registry, and the
//! session loop that drives them.

pub mod connection;
pub mod keepalive;
pub mod registry;
pub mod session;
