//! Configuration resolution for testcast.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/testcast/settings.json)
//! 3. Project config (.testcast/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete testcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Relay server and client endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface the relay binds to.
    pub host: String,
    pub port: u16,
    /// URL clients connect to.
    pub url: String,
    /// How long a rejected connection may linger before the relay closes it.
    pub reject_grace_secs: u64,
    pub connect_timeout_secs: u64,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            url: "ws://localhost:3001".to_string(),
            reject_grace_secs: 5,
            connect_timeout_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// `host:port` the relay listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Test process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Command template; `{file}` is replaced by the spec file.
    pub command_template: String,
    /// Suffix appended to a test name to form its spec file.
    pub spec_suffix: String,
    pub working_directory: Option<PathBuf>,
    /// Cap on lines kept in a run's result. `None` keeps everything.
    pub max_retained_lines: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command_template: "npx playwright test {file}".to_string(),
            spec_suffix: ".spec.ts".to_string(),
            working_directory: None,
            max_retained_lines: None,
        }
    }
}

/// Test catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub tests_dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            tests_dir: PathBuf::from("src/tests"),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    // Load global config
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            layers.push(global_path);
        }
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".testcast").join("settings.json");
        if project_path.exists() {
            layers.push(project_path);
        }
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Fold config files over the defaults, later files winning.
///
/// Only keys a file actually sets override lower layers.
fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        let layer = load_config_file(path)?;
        merge_config(&mut merged, layer);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".testcast").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/testcast/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("testcast").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
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
    // Catch type errors here so they name the offending file.
    serde_json::from_value::<Config>(value.clone()).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(value)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key,
/// anything else replaces the lower value.
fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_config(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("TESTCAST_RELAY_PORT") {
        if let Ok(n) = val.parse() {
            config.relay.port = n;
        }
    }
    if let Some(val) = var("TESTCAST_RELAY_URL") {
        config.relay.url = val;
    }
    if let Some(val) = var("TESTCAST_LOG_LEVEL") {
        config.relay.log_level = val;
    }
    if let Some(val) = var("TESTCAST_TESTS_DIR") {
        config.catalog.tests_dir = PathBuf::from(val);
    }
    if let Some(val) = var("TESTCAST_COMMAND_TEMPLATE") {
        config.runner.command_template = val;
    }
}
