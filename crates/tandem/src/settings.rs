//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TandemSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TANDEM_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::logging::parse_level;
use tandem_ws::{BrokerConfig, ClientConfig};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Everything the CLI reads from `settings.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemSettings {
    /// Broker bind address, limits and heartbeat.
    pub broker: BrokerConfig,
    /// Client queue size and reconnect backoff.
    pub client: ClientConfig,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TandemSettings {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            client: ClientConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl TandemSettings {
    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.broker.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "broker.max_connections must be at least 1".into(),
            ));
        }
        if self.broker.outbound_capacity == 0 || self.client.outbound_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "outbound_capacity must be at least 1".into(),
            ));
        }
        if parse_level(&self.log_level).is_none() {
            return Err(SettingsError::InvalidValue(format!(
                "unknown log level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }
}

/// Resolve the path to the settings file (`~/.tandem/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tandem").join("settings.json")
}

/// Load settings from `path` (or the default path) with env var overrides.
pub fn load_settings(path: Option<&Path>) -> Result<TandemSettings> {
    let default_path;
    let path = match path {
        Some(path) => path,
        None => {
            default_path = settings_path();
            &default_path
        }
    };
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// Load settings from `path`, reading overrides through `lookup`.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TandemSettings> {
    let defaults = serde_json::to_value(TandemSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TandemSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
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

/// Apply `TANDEM_*` overrides. Invalid values are ignored with a warning.
pub fn apply_overrides(settings: &mut TandemSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("TANDEM_HOST") {
        settings.broker.host = v;
    }
    if let Some(v) = env.parsed("TANDEM_PORT", |s| parse_range::<u16>(s, 0, u16::MAX)) {
        settings.broker.port = v;
    }
    if let Some(v) = env.parsed("TANDEM_HEARTBEAT_INTERVAL_MS", |s| {
        parse_range::<u64>(s, 10, 3_600_000)
    }) {
        settings.broker.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.parsed("TANDEM_MAX_CONNECTIONS", |s| {
        parse_range::<usize>(s, 1, 1_000_000)
    }) {
        settings.broker.max_connections = v;
    }
    if let Some(v) = env.parsed("TANDEM_RECONNECT_BACKOFF_MS", |s| {
        parse_range::<u64>(s, 0, 3_600_000)
    }) {
        settings.client.reconnect_backoff_ms = v;
    }
    if let Some(v) = env.parsed("TANDEM_LOG_LEVEL", parse_level) {
        settings.log_level = v.to_owned();
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────

/// Parse a string as a number within an inclusive range.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}
