//! Write a default configuration file so the relay settings are visible and editable.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;

/// Create the config file's directory and write the default config as pretty JSON.
/// An existing file is left untouched. Returns true when a file was written.
pub fn init_config(config_path: &Path) -> Result<bool> {
    if config_path.exists() {
        log::debug!("config already exists at {}, skipping", config_path.display());
        return Ok(false);
    }
    if let Some(dir) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
    }
    let body = serde_json::to_string_pretty(&Config::default()).context("serializing default config")?;
    std::fs::write(config_path, body)
        .with_context(|| format!("writing default config to {}", config_path.display()))?;
    log::info!("created default config at {}", config_path.display());
    Ok(true)
}
