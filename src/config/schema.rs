//! Configuration schema definitions for dutsched.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Tagged enums select the inventory and execution
//! back ends.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SuiteConfig            - Pool, shard size, retry budget
//! ├── SchedulerConfig        - Parallelism, polling, run budget
//! ├── InventoryConfig        - Tagged enum selecting the fleet inventory
//! │   ├── Declared           - Devices listed in this file
//! │   └── Command            - External command returning counts
//! ├── ExecutionConfig        - Tagged enum selecting the execution service
//! │   └── Command            - External schedule/status/fetch commands
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hardware::AtomicHardwareConfig;

/// Root configuration structure for dutsched.
///
/// # TOML Structure
///
/// ```toml
/// [suite]
/// pool = "DUT_POOL_QUOTA"
/// max_in_shard = 50
/// retry_count = 1
///
/// [scheduler]
/// max_parallel = 100
///
/// [inventory]
/// type = "command"
/// command = "lab-cli bot-count '{dimensions}'"
///
/// [execution]
/// type = "command"
/// schedule_command = "lab-cli schedule {request_file}"
/// status_command = "lab-cli status {job_id}"
/// fetch_command = "lab-cli fetch {job_id} {output_file}"
/// ```
///
/// # Example
///
/// ```
/// use dutsched::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [inventory]
///     type = "declared"
///
///     [execution]
///     type = "command"
///     schedule_command = "lab-cli schedule {request_file}"
///     status_command = "lab-cli status {job_id}"
///     fetch_command = "lab-cli fetch {job_id} {output_file}"
/// "#).unwrap();
///
/// assert_eq!(config.suite.max_in_shard, 50);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Suite-level scheduling settings.
    #[serde(default)]
    pub suite: SuiteConfig,

    /// Dispatcher settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Where device counts come from.
    pub inventory: InventoryConfig,

    /// Where shards run.
    pub execution: ExecutionConfig,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Suite-level scheduling settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `pool` | `DUT_POOL_QUOTA` |
/// | `max_in_shard` | 50 |
/// | `retry_count` | 1 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Device pool every query and request is scoped to.
    #[serde(default = "default_pool")]
    pub pool: String,

    /// Maximum number of tests in one shard.
    ///
    /// Values below one are treated as one.
    #[serde(default = "default_max_in_shard")]
    pub max_in_shard: usize,

    /// Number of retry attempts per shard lineage. Zero disables retries.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            max_in_shard: default_max_in_shard(),
            retry_count: default_retry_count(),
        }
    }
}

fn default_pool() -> String {
    "DUT_POOL_QUOTA".to_string()
}

fn default_max_in_shard() -> usize {
    50
}

fn default_retry_count() -> u32 {
    1
}

/// Dispatcher settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | 100 |
/// | `poll_interval_secs` | 30 |
/// | `timeout_secs` | 86400 (24 hours) |
/// | `max_status_errors` | 5 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Maximum number of attempts monitored at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Seconds between status polls of a running job.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Budget for the whole run. Attempts still running when it expires
    /// are cancelled.
    #[serde(default = "default_run_timeout")]
    pub timeout_secs: u64,

    /// Consecutive status-poll failures tolerated before an attempt is
    /// given up.
    #[serde(default = "default_max_status_errors")]
    pub max_status_errors: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_run_timeout(),
            max_status_errors: default_max_status_errors(),
        }
    }
}

fn default_max_parallel() -> usize {
    100
}

fn default_poll_interval() -> u64 {
    30
}

fn default_run_timeout() -> u64 {
    86400 // 24 hours
}

fn default_max_status_errors() -> u32 {
    5
}

/// Fleet inventory configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InventoryConfig {
    /// Devices declared in the configuration file.
    Declared(DeclaredInventoryConfig),

    /// Counts returned by an external command.
    Command(CommandInventoryConfig),
}

/// Declared inventory settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeclaredInventoryConfig {
    /// The devices in the lab.
    #[serde(default)]
    pub devices: Vec<DeclaredDevice>,

    /// Use the declared devices as the only candidates for equivalence
    /// classes. Requirements no device satisfies then fail with
    /// `NoHardwareMatch` instead of being dispatched.
    #[serde(default = "default_true")]
    pub catalog: bool,
}

/// One group of identical devices.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeclaredDevice {
    pub board: String,

    #[serde(default)]
    pub model: Option<String>,

    /// Capability labels; `key:value` or bare.
    #[serde(default)]
    pub labels: BTreeSet<String>,

    /// Companion boards attached to each device.
    #[serde(default)]
    pub companions: Vec<String>,

    #[serde(default = "default_pool")]
    pub pool: String,

    /// Devices ready to take work.
    #[serde(default)]
    pub ready: u32,

    /// Devices in the pool regardless of state. Defaults to `ready`.
    #[serde(default)]
    pub total: Option<u32>,
}

impl DeclaredDevice {
    /// The hardware configuration these devices provide.
    pub fn to_config(&self) -> AtomicHardwareConfig {
        AtomicHardwareConfig {
            board: self.board.clone(),
            model: self.model.clone(),
            variant: None,
            labels: self.labels.clone(),
            companions: self
                .companions
                .iter()
                .map(AtomicHardwareConfig::new)
                .collect(),
        }
    }
}

/// Command inventory settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandInventoryConfig {
    /// Command template; `{dimensions}` is replaced by the query as JSON.
    pub command: String,

    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_inventory_timeout")]
    pub timeout_secs: u64,
}

fn default_inventory_timeout() -> u64 {
    60
}

/// Execution service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionConfig {
    /// Shards are scheduled, polled, and fetched with external commands.
    Command(CommandExecutionConfig),
}

/// Command execution service settings.
///
/// # Placeholders
///
/// | Command | Placeholders |
/// |---------|--------------|
/// | `schedule_command` | `{request_file}`, `{key}` |
/// | `status_command` | `{job_id}` |
/// | `fetch_command` | `{job_id}`, `{output_file}` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandExecutionConfig {
    /// Prints the job id of the scheduled request.
    pub schedule_command: String,

    /// Prints the job status: a bare word or `{"status": ..., "reason": ...}`.
    pub status_command: String,

    /// Writes the (gzip) result of a completed job to `{output_file}`.
    pub fetch_command: String,

    pub working_dir: Option<PathBuf>,

    /// Timeout for each command invocation.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,

    /// Execution timeout recorded in every request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    300 // 5 minutes
}

fn default_request_timeout() -> u64 {
    3600 // 1 hour
}

/// Report configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for report files.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Write the JSON results file.
    #[serde(default = "default_true")]
    pub json: bool,

    #[serde(default = "default_json_file")]
    pub json_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            json: default_true(),
            json_file: default_json_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("dutsched-results")
}

fn default_true() -> bool {
    true
}

fn default_json_file() -> String {
    "results.json".to_string()
}
