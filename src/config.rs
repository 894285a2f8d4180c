//! JSON config handling: created with defaults on first run, merged over
//! current defaults on load so new fields pick up sane values, then
//! normalized into usable bounds.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const APP_DIR: &str = "inkstone";
pub const CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "usage-history.json";
pub const LOCK_FILE: &str = "tracker.lock";
pub const STOP_FILE: &str = "stop.signal";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Override for the history file location; defaults to
    /// `<data dir>/usage-history.json`.
    pub history_file: Option<String>,
    /// Quiet interval before pending records are flushed to disk.
    pub flush_delay_ms: u64,
    /// Upper bound on a single focused-element introspection call.
    pub introspect_timeout_ms: u64,
    /// Focused text is accepted only while its length is at most this many
    /// times the buffered keystroke count.
    pub introspect_accept_ratio: u32,
    /// Bundle/package id of the utility's own process, so its window is
    /// never captured. Unset means nothing is treated as "own".
    pub own_bundle_id: Option<String>,
    /// Foreground-app poll rate for the fallback focus source.
    pub focus_poll_hz: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            history_file: None,
            flush_delay_ms: 2000,
            introspect_timeout_ms: 500,
            introspect_accept_ratio: 3,
            own_bundle_id: None,
            focus_poll_hz: 2,
        }
    }
}

impl TrackerConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn introspect_timeout(&self) -> Duration {
        Duration::from_millis(self.introspect_timeout_ms)
    }

    pub fn history_path(&self, base_dir: &Path) -> PathBuf {
        match &self.history_file {
            Some(path) => PathBuf::from(path),
            None => base_dir.join(HISTORY_FILE),
        }
    }
}

/// Data directory under the current working directory, created on demand.
pub fn ensure_app_dir() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("failed to read current dir")?;
    let base_dir = cwd.join("data").join(APP_DIR);
    if !base_dir.exists() {
        fs::create_dir_all(&base_dir).context("failed to create inkstone data dir")?;
    }
    Ok(base_dir)
}

/// Loads the config file, creating it with defaults when absent.
pub fn load_or_create_config(path: &Path) -> Result<TrackerConfig> {
    if path.exists() {
        let contents = fs::read_to_string(path).context("failed to read config file")?;
        let config: TrackerConfig =
            serde_json::from_str(&contents).context("failed to parse config file")?;
        let refreshed = refresh_config_defaults(&config)?;
        return Ok(normalize_config(refreshed));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    let config = TrackerConfig::default();
    let payload = serde_json::to_string_pretty(&config).context("failed to serialize config")?;
    fs::write(path, payload).context("failed to write config file")?;
    Ok(config)
}

/// Clamp fields into ranges the pipeline can actually run with.
pub fn normalize_config(mut config: TrackerConfig) -> TrackerConfig {
    config.flush_delay_ms = config.flush_delay_ms.max(250);
    config.introspect_timeout_ms = config.introspect_timeout_ms.clamp(50, 5000);
    config.introspect_accept_ratio = config.introspect_accept_ratio.max(1);
    config.focus_poll_hz = config.focus_poll_hz.clamp(1, 60);
    if let Some(path) = config.history_file.as_ref() {
        if path.trim().is_empty() {
            config.history_file = None;
        }
    }
    config
}

/// Layer the saved config over current defaults so fields added after the
/// file was written keep their default values.
fn refresh_config_defaults(config: &TrackerConfig) -> Result<TrackerConfig> {
    let mut default_value = serde_json::to_value(TrackerConfig::default())
        .context("failed to serialize default config")?;
    let user_value = serde_json::to_value(config).context("failed to serialize user config")?;
    merge_config_value(&mut default_value, &user_value);
    serde_json::from_value(default_value).context("failed to merge config defaults")
}

fn merge_config_value(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) => merge_config_value(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target_value, source_value) => {
            *target_value = source_value.clone();
        }
    }
}
