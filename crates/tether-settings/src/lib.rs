//! # tether-settings
//!
//! Configuration for the relay, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **Settings file**: an optional JSON file, deep-merged over defaults
//! 3. **Environment variables**: `PORT`, `PEBBLE_AUTH_URL`,
//!    `PING_INTERVAL_SECONDS`, ...
//!
//! Call [`TetherSettings::validate`] before handing settings to the server;
//! the auth service URL has no default.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_with};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_deployment_defaults() {
        let settings = TetherSettings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.keepalive.interval_secs, 45);
        assert_eq!(settings.keepalive.timeout_secs, 120);
        assert_eq!(settings.limits.max_devices_per_account, 10);
        assert!(settings.auth.base_url.is_none());
    }

    #[test]
    fn deep_merge_re_exported() {
        let a = serde_json::json!({"x": 1});
        let b = serde_json::json!({"y": 2});
        let merged = deep_merge(a, b);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
