//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::websocket::registry::SessionRegistry;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open sockets, authenticated or not.
    pub connections: usize,
    /// Sockets slotted into an account session.
    pub authenticated_connections: usize,
    /// Accounts with at least one slotted socket.
    pub sessions: usize,
}

/// Build a health response from live registry counters.
pub fn health_check(start_time: Instant, registry: &SessionRegistry) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: registry.connection_count(),
        authenticated_connections: registry.authenticated_count(),
        sessions: registry.session_count(),
    }
}
