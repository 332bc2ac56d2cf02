//! Configuration loading and schema definitions for fleetrun.
//!
//! This module provides types and functions for loading fleetrun configuration
//! from TOML files or strings. Everything the scheduler needs from its
//! environment (results location, executor endpoint, credentials) comes in
//! through [`Config`]; nothing is read from process environment variables.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads fleetrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use fleetrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("fleetrun.toml"))?;
/// println!("Machines: {}", config.machines.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads fleetrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use fleetrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [scheduler]
///     results_dir = "/tmp/results"
///
///     [[machines]]
///     hostname = "host1"
///     attributes = ["wifi"]
/// "#)?;
///
/// assert_eq!(config.machines[0].attributes, vec!["wifi"]);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
