//! Runtime settings.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a JSON settings file is given, deep-merge its values over defaults
//! 3. Apply `MICROPROTO_*` environment overrides (highest priority)
//!
//! Command-line flags are applied by the caller after loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use microproto_engine::EngineConfig;
use microproto_server::ServerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_packet_size: u16,
    pub command_capacity: usize,
    pub echo_to_originator: bool,
    pub reply_errors: bool,
    pub persist_debounce_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            max_packet_size: defaults.max_packet_size,
            command_capacity: defaults.command_capacity,
            echo_to_originator: defaults.echo_to_originator,
            reply_errors: defaults.reply_errors,
            persist_debounce_ms: defaults.persist_debounce_ms,
        }
    }
}

impl EngineSettings {
    pub fn to_config(&self) -> EngineConfig {
        EngineConfig {
            max_packet_size: self.max_packet_size,
            command_capacity: self.command_capacity,
            echo_to_originator: self.echo_to_originator,
            reply_errors: self.reply_errors,
            persist_debounce_ms: self.persist_debounce_ms,
            ..EngineConfig::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Store values of `persistent` properties.
    pub persist: bool,
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            persist: true,
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home)
        .join(".microproto")
        .join("properties.db")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// `target => level`, e.g. `"microproto_engine": "debug"`.
    pub modules: std::collections::BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: Default::default(),
        }
    }
}

/// Load settings, optionally deep-merging a JSON file, then env overrides.
///
/// A missing file is an error when the path was given explicitly.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = match path {
        Some(path) => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file {}", path.display()))?;
            let user: Value = serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            deep_merge(defaults, user)
        }
        None => defaults,
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply `MICROPROTO_*` overrides. Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read(&env, "MICROPROTO_PORT", |s| s.parse::<u16>().ok()) {
        settings.server.port = v;
    }
    if let Some(v) = read(&env, "MICROPROTO_HOST", |s| Some(s.to_string())) {
        settings.server.host = v;
    }
    if let Some(v) = read(&env, "MICROPROTO_IDLE_TIMEOUT_SECS", |s| {
        parse_u64_range(s, 1, 86_400)
    }) {
        settings.server.idle_timeout_secs = v;
    }
    if let Some(v) = read(&env, "MICROPROTO_DB", |s| Some(PathBuf::from(s))) {
        settings.storage.db_path = v;
    }
    if let Some(v) = read(&env, "MICROPROTO_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

fn read<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = env(key).filter(|v| !v.is_empty())?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key, value = %val, "invalid env var, ignoring");
    }
    result
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
