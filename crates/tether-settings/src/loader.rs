//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge it over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tether_core::logging::LogFormat;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::TetherSettings;

/// Load settings from an optional file, with overrides from the process
/// environment.
pub fn load_settings(path: Option<&Path>) -> Result<TetherSettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Load settings from an optional file, reading overrides through `env`.
///
/// A missing file yields defaults. A file with invalid JSON is an error.
pub fn load_settings_with<F>(path: Option<&Path>, env: F) -> Result<TetherSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, env);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides to loaded settings.
///
/// Numbers must parse and fall inside the given range; anything else is
/// logged and ignored so the file/default value stays in effect.
/// `PEBBLE_AUTH_URL` takes precedence over its alias `AUTH_URL`.
pub fn apply_overrides<F>(settings: &mut TetherSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PORT").and_then(|v| ranged("PORT", &v, 1, u64::from(u16::MAX))) {
        #[allow(clippy::cast_possible_truncation)]
        {
            settings.server.port = v as u16;
        }
    }
    if let Some(v) = read("HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PEBBLE_AUTH_URL").or_else(|| read("AUTH_URL")) {
        settings.auth.base_url = Some(v.trim_end_matches('/').to_string());
    }
    if let Some(v) =
        read("AUTH_TIMEOUT_MS").and_then(|v| ranged("AUTH_TIMEOUT_MS", &v, 100, 300_000))
    {
        settings.auth.timeout_ms = v;
    }
    if let Some(v) = read("PING_INTERVAL_SECONDS")
        .and_then(|v| ranged("PING_INTERVAL_SECONDS", &v, 1, 86_400))
    {
        settings.keepalive.interval_secs = v;
    }
    if let Some(v) = read("PING_TIMEOUT_SECONDS")
        .and_then(|v| ranged("PING_TIMEOUT_SECONDS", &v, 1, 86_400))
    {
        settings.keepalive.timeout_secs = v;
    }
    if let Some(v) = read("MAX_DEVICE_CONNECTIONS")
        .and_then(|v| ranged("MAX_DEVICE_CONNECTIONS", &v, 1, 10_000))
    {
        #[allow(clippy::cast_possible_truncation)]
        {
            settings.limits.max_devices_per_account = v as usize;
        }
    }
    if let Some(v) = read("LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("LOG_FORMAT") {
        match LogFormat::parse(&v) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn ranged(name: &str, val: &str, min: u64, max: u64) -> Option<u64> {
    let result = parse_u64_range(val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, min, max, "invalid numeric env var, ignoring");
    }
    result
}
