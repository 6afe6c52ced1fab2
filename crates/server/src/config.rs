use std::path::Path;

use anyhow::{Context, Result};
use quorum_protocol::config::QuorumConfig;

/// Load configuration from a TOML file at the given path, then overlay
/// recognized environment variables (DATABASE_URL, API_KEY, ...).
/// If the file doesn't exist, starts from defaults.
pub fn load_config(path: &Path) -> Result<QuorumConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: QuorumConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;
        tracing::info!("Loaded config from {}", path.display());
        config
    } else {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        QuorumConfig::default()
    };

    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}
