//! Configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    load_config_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config)?;
    Ok(config)
}

/// Reject configurations that would never satisfy any submission.
fn validate(config: &Config) -> Result<()> {
    if config.environments.is_empty() {
        bail!("configuration must declare at least one [[environments]] entry");
    }
    for env in &config.environments {
        let count = match env {
            schema::EnvironmentConfig::Container(c) => c.count,
            schema::EnvironmentConfig::Vm(c) => c.count,
            schema::EnvironmentConfig::Process(c) => c.count,
            schema::EnvironmentConfig::Physical(_) => 1,
        };
        if count == 0 {
            bail!("environment pool entries must provision at least one environment");
        }
    }
    Ok(())
}
