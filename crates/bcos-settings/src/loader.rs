//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BcosSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `BCOS_*` environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BcosSettings;

/// Resolve the path to the settings file (`~/.bcos/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".bcos").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BcosSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid peer list is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<BcosSettings> {
    let defaults = serde_json::to_value(BcosSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BcosSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` keep the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `BCOS_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut BcosSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are logged and ignored, keeping the file/default value.
pub fn apply_overrides_with<F>(settings: &mut BcosSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let read_ms = |name: &str, min: u64, max: u64| {
        let val = read(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid millisecond env var, ignoring");
        }
        parsed
    };

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = read("BCOS_PEERS") {
        let peers = parse_peer_list(&v);
        if peers.is_empty() {
            tracing::warn!(key = "BCOS_PEERS", value = %v, "empty peer list env var, ignoring");
        } else {
            settings.transport.peers = peers;
        }
    }
    if let Some(v) = read_ms("BCOS_RECONNECT_PERIOD_MS", 10, 3_600_000) {
        settings.transport.reconnect_period_ms = v;
    }
    if let Some(v) = read_ms("BCOS_CONNECT_TIMEOUT_MS", 10, 600_000) {
        settings.transport.connect_timeout_ms = v;
    }
    if let Some(v) = read_ms("BCOS_HANDSHAKE_TIMEOUT_MS", 10, 600_000) {
        settings.transport.handshake_timeout_ms = v;
    }
    if let Some(v) = read_ms("BCOS_REQUEST_TIMEOUT_MS", 0, 3_600_000) {
        settings.transport.request_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("BCOS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("BCOS_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => tracing::warn!(key = "BCOS_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }

    // ── AMOP ────────────────────────────────────────────────────────
    if let Some(v) = read("BCOS_AMOP_TOPICS") {
        settings.amop.topics = parse_peer_list(&v);
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Split a comma-separated list, trimming whitespace and dropping empties.
pub fn parse_peer_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
