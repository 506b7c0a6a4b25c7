//! Inventory backed by an external command.
//!
//! The command receives the query dimensions as a JSON object through the
//! `{dimensions}` placeholder and prints the number of matching devices.
//! When counting ready devices the object carries `"dut_state": ["ready"]`.
//!
//! ```toml
//! [inventory]
//! type = "command"
//! command = "lab-cli bot-count --dimensions '{dimensions}'"
//! timeout_secs = 60
//! ```

use async_trait::async_trait;

use super::{Dimensions, FleetInventory, InventoryError, InventoryResult};
use crate::config::CommandInventoryConfig;
use crate::connector::{ConnectorError, ShellConnector};

/// Inventory that shells out for every count.
pub struct CommandInventory {
    connector: ShellConnector,
}

impl CommandInventory {
    pub fn new(config: CommandInventoryConfig) -> Self {
        let connector = ShellConnector::new(config.command)
            .with_working_dir(config.working_dir)
            .with_timeout(config.timeout_secs);
        Self { connector }
    }
}

impl From<ConnectorError> for InventoryError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Timeout(secs) => InventoryError::Timeout(format!("after {}s", secs)),
            other => InventoryError::QueryFailed(other.to_string()),
        }
    }
}

/// Parses the count printed by an inventory command.
fn parse_count(stdout: &str) -> InventoryResult<u32> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| InventoryError::InvalidResponse("empty output".to_string()))?;

    line.parse::<u32>()
        .map_err(|e| InventoryError::InvalidResponse(format!("{:?}: {}", line, e)))
}

#[async_trait]
impl FleetInventory for CommandInventory {
    async fn bot_count(&self, dimensions: &Dimensions) -> InventoryResult<u32> {
        let json = serde_json::to_string(dimensions)
            .map_err(|e| InventoryError::QueryFailed(format!("Failed to encode dimensions: {}", e)))?;

        let output = self.connector.run(&[("dimensions", &json)]).await?;
        if !output.success() {
            return Err(InventoryError::QueryFailed(format!(
                "exit code {}: {}",
                output.exit_code,
                output.stderr_tail()
            )));
        }

        parse_count(&output.stdout)
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
