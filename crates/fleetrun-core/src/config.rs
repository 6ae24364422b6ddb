//! Configuration resolution for fleetrun.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/fleetrun/settings.json`)
//! 3. Project config (`.fleetrun/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Layers are merged key by key, so a project file only needs to name the
//! settings it changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default number of concurrent pool workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Complete fleetrun configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            pool: PoolConfig::default(),
            sessions: SessionConfig::default(),
            agent: AgentConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Directory holding session records and logs.
    pub fn sessions_dir(&self) -> PathBuf {
        self.store
            .sessions_dir
            .clone()
            .or_else(default_sessions_dir)
            .unwrap_or_else(|| PathBuf::from(".fleetrun").join("sessions"))
    }
}

/// Session store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sessions_dir: Option<PathBuf>,
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Session supervision timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds to wait after SIGINT before SIGKILL.
    pub terminate_timeout_secs: u64,
    /// Log polling interval while attached to a session.
    pub attach_poll_ms: u64,
    /// Refresh interval of `session watch`.
    pub watch_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            terminate_timeout_secs: 5,
            attach_poll_ms: 250,
            watch_interval_secs: 2,
        }
    }
}

/// External agent command used by sprint runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global) = global_config_path() {
        layers.push(global);
    }
    if let Some(dir) = project_dir {
        layers.push(project_config_path(dir));
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Merge the given settings files (missing files are skipped) over the defaults.
pub fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths.iter().filter(|p| p.exists()) {
        let overlay = load_config_file(path)?;
        merge_config(&mut merged, overlay);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fleetrun").join("settings.json"))
}

/// Project-level settings file inside `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".fleetrun").join("settings.json")
}

/// Default session store: `~/.fleetrun/sessions`.
pub fn default_sessions_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".fleetrun").join("sessions"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_config(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("FLEETRUN_SESSIONS_DIR") {
        config.store.sessions_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("FLEETRUN_WORKERS") {
        if let Ok(n) = val.parse() {
            config.pool.workers = n;
        }
    }
    if let Some(val) = lookup("FLEETRUN_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = lookup("FLEETRUN_AGENT_COMMAND") {
        config.agent.command = val;
    }
    if let Some(val) = lookup("FLEETRUN_TERMINATE_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.sessions.terminate_timeout_secs = n;
        }
    }
}
