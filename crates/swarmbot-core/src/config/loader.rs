//! Config loader — reads `~/.swarmbot/config.json` and merges env vars.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.swarmbot/config.json`
//! 3. Environment variables `SWARMBOT_<SECTION>__<FIELD>` (override JSON)

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::Config;

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from the default path + env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be
/// parsed.
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);
    load_config_from_path(&config_path)
}

fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("no config file found at {}, using defaults", path.display());
        return apply_env_overrides(Config::default());
    }

    debug!("loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to read config file {}: {}", path.display(), e);
            return apply_env_overrides(Config::default());
        }
    };

    let config: Config = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to parse config JSON: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    apply_env_overrides(config)
}

/// Save configuration to disk (pretty-printed JSON with camelCase keys).
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    std::fs::write(&config_path, json)?;
    debug!("config saved to {}", config_path.display());
    Ok(())
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `SWARMBOT_<SECTION>__<FIELD>` (double underscore as
/// delimiter).
fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(model) = std::env::var("SWARMBOT_AGENTS__DEFAULTS__MODEL") {
        config.agents.defaults.model = model;
    }
    if let Ok(val) = std::env::var("SWARMBOT_AGENTS__DEFAULTS__MAX_ITERATIONS") {
        match val.parse() {
            Ok(n) => config.agents.defaults.max_iterations = n,
            Err(_) => warn!("ignoring non-numeric SWARMBOT_AGENTS__DEFAULTS__MAX_ITERATIONS"),
        }
    }
    if let Ok(val) = std::env::var("SWARMBOT_INBOUND__MAX_CONCURRENT") {
        match val.parse() {
            Ok(n) => config.inbound.max_concurrent = Some(n),
            Err(_) => warn!("ignoring non-numeric SWARMBOT_INBOUND__MAX_CONCURRENT"),
        }
    }
    if let Ok(val) = std::env::var("SWARMBOT_SUBAGENTS__TIMEOUT_SECONDS") {
        match val.parse() {
            Ok(n) => config.subagents.timeout_seconds = n,
            Err(_) => warn!("ignoring non-numeric SWARMBOT_SUBAGENTS__TIMEOUT_SECONDS"),
        }
    }
    if let Ok(dir) = std::env::var("SWARMBOT_STORAGE__DATA_DIR") {
        config.storage.data_dir = Some(dir);
    }
    config
}
