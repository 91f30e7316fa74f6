//! Server configuration.

use std::time::Duration;

use tether_settings::TetherSettings;

/// Runtime configuration for the relay.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Idle time before a keepalive probe is sent.
    pub ping_interval: Duration,
    /// Time allowed after a probe for any activity before closing.
    pub ping_timeout: Duration,
    /// Device connections allowed per account before the oldest is evicted.
    pub max_devices_per_account: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ping_interval: Duration::from_secs(45),
            ping_timeout: Duration::from_secs(120),
            max_devices_per_account: 10,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&TetherSettings> for ServerConfig {
    fn from(settings: &TetherSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            ping_interval: settings.keepalive.interval(),
            ping_timeout: settings.keepalive.timeout(),
            max_devices_per_account: settings.limits.max_devices_per_account,
            max_message_size: settings.server.max_message_size,
            shutdown_timeout: Duration::from_secs(settings.server.shutdown_timeout_secs),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
