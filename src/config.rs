//! Configuration loading and schema definitions for dutsched.
//!
//! # The Configuration File Format is described in the README.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads dutsched configuration from a TOML file.
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
/// use dutsched::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("dutsched.toml"))?;
/// println!("Max in shard: {}", config.suite.max_in_shard);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads dutsched configuration from a TOML string.
///
/// # Example
///
/// ```
/// use dutsched::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [suite]
///     retry_count = 0
///
///     [inventory]
///     type = "declared"
///
///     [execution]
///     type = "command"
///     schedule_command = "lab-cli schedule {request_file}"
///     status_command = "lab-cli status {job_id}"
///     fetch_command = "lab-cli fetch {job_id} {output_file}"
/// "#)?;
///
/// assert_eq!(config.suite.retry_count, 0);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
