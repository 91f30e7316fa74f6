//! Settings structures.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::logging::LogFormat;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Authentication service settings.
    pub auth: AuthSettings,
    /// Keepalive probe timing.
    pub keepalive: KeepaliveSettings,
    /// Per-account resource limits.
    pub limits: LimitSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Check that required values are present and limits are usable.
    pub fn validate(&self) -> Result<()> {
        match self.auth.base_url.as_deref() {
            None | Some("") => return Err(SettingsError::Missing("auth.baseUrl")),
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(SettingsError::InvalidValue(format!(
                    "auth.baseUrl must be an http(s) URL, got {url}"
                )));
            }
            Some(_) => {}
        }
        if self.keepalive.interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "keepalive.intervalSecs must be positive".into(),
            ));
        }
        if self.keepalive.timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "keepalive.timeoutSecs must be positive".into(),
            ));
        }
        if self.limits.max_devices_per_account == 0 {
            return Err(SettingsError::InvalidValue(
                "limits.maxDevicesPerAccount must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
    /// How long graceful shutdown may take before remaining tasks are dropped.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 16 * 1024 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Authentication service settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Base URL of the token-info service. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Upper bound on a single token lookup, in milliseconds.
    pub timeout_ms: u64,
}

impl AuthSettings {
    /// Lookup timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 10_000,
        }
    }
}

/// Keepalive probe timing.
///
/// Load balancers in front of the relay tend to drop idle sockets after
/// about a minute, so the probe interval stays below that.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveSettings {
    /// Idle time before a probe is sent.
    pub interval_secs: u64,
    /// Time to wait for any activity after a probe before closing.
    pub timeout_secs: u64,
}

impl KeepaliveSettings {
    /// Probe interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Probe timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            interval_secs: 45,
            timeout_secs: 120,
        }
    }
}

/// Per-account resource limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Maximum simultaneous device connections for one account.
    pub max_devices_per_account: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_devices_per_account: 10,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
