//! # tether-server
//!
//! Axum `WebSocket` relay that pairs one tool connection with the device
//! connections of the same account.
//!
//! - `GET /tool`, `GET /device`: `WebSocket` upgrade with the matching role
//! - [`websocket::session`]: per-socket state machine (auth, forwarding, keepalive)
//! - [`websocket::registry`]: account sessions, pairing, and eviction
//! - `GET /health`, `GET /metrics`: liveness and Prometheus text
//! - Graceful shutdown via [`shutdown::ShutdownCoordinator`]

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{ServerHandle, TetherServer};
pub use websocket::registry::{RegistryEvent, RegistryFault, SessionRegistry, SessionSnapshot};
