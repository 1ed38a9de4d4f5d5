//! Build the process-wide `MigrationConfig`.
//!
//! Precedence, lowest to highest: defaults, TOML file, environment, flags.
//! The environment is passed in as a map so nothing below `main` reads it.

use memlift_types::config::{memlift_home, MigrationConfig};
use memlift_types::error::{MemliftError, MemliftResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Values given on the command line.
#[derive(Debug, Default)]
pub struct FlagOverrides {
    pub source_url: Option<String>,
    pub target_url: Option<String>,
}

/// `~/.memlift/config.toml`.
pub fn default_config_path() -> PathBuf {
    memlift_home().join("config.toml")
}

/// Load, override and validate the configuration.
///
/// A missing default config file means defaults; a missing file named with
/// `--config` is an error.
pub fn load_config(
    path: Option<&Path>,
    env: &HashMap<String, String>,
    flags: &FlagOverrides,
) -> MemliftResult<MigrationConfig> {
    let mut config = read_config_file(path)?;
    apply_env(&mut config, env);

    if let Some(url) = &flags.source_url {
        config.source.base_url = url.clone();
    }
    if let Some(url) = &flags.target_url {
        config.target.base_url = url.clone();
    }

    config.validate()?;
    debug!(?config, "effective configuration");
    Ok(config)
}

fn read_config_file(path: Option<&Path>) -> MemliftResult<MigrationConfig> {
    let explicit = path.is_some();
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        if explicit {
            return Err(MemliftError::Config(format!(
                "config file not found: {}",
                config_path.display()
            )));
        }
        debug!(path = %config_path.display(), "no config file, using defaults");
        return Ok(MigrationConfig::default());
    }

    let contents = std::fs::read_to_string(&config_path)?;
    let config = toml::from_str::<MigrationConfig>(&contents)
        .map_err(|e| MemliftError::Config(format!("{}: {e}", config_path.display())))?;
    info!(path = %config_path.display(), "Loaded configuration");
    Ok(config)
}

fn apply_env(config: &mut MigrationConfig, env: &HashMap<String, String>) {
    let get = |key: &str| {
        env.get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if let Some(url) = get("MEMLIFT_SOURCE_URL").or_else(|| get("LETTA_BASE_URL")) {
        config.source.base_url = url;
    }
    if let Some(url) = get("MEMLIFT_TARGET_URL").or_else(|| get("LETTA_BASE_URL")) {
        config.target.base_url = url;
    }
    if let Some(key) = get("MEMLIFT_SOURCE_API_KEY").or_else(|| get("LETTA_API_KEY")) {
        config.source.api_key = Some(key);
    }
    if let Some(key) = get("MEMLIFT_TARGET_API_KEY").or_else(|| get("LETTA_API_KEY")) {
        config.target.api_key = Some(key);
    }
    if let Some(agent) = get("MEMLIFT_AGENT_ID") {
        config.agent_id = Some(agent);
    }
}
