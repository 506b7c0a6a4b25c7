//! Inventory backed by devices declared in the configuration file.
//!
//! Useful for small labs with a fixed device list, for dry runs, and as a
//! device catalog: every declared device is also a candidate
//! configuration for equivalence classes.
//!
//! # Example
//!
//! ```toml
//! [inventory]
//! type = "declared"
//!
//! [[inventory.devices]]
//! board = "octopus"
//! model = "bobba"
//! labels = ["servo", "servo_state:WORKING"]
//! ready = 3
//! total = 4
//! ```

use async_trait::async_trait;

use super::{Dimensions, FleetInventory, InventoryResult, STATE_KEY};
use crate::config::{DeclaredDevice, DeclaredInventoryConfig};
use crate::hardware::AtomicHardwareConfig;

/// A declared device and its precomputed dimensions.
struct DeclaredEntry {
    config: AtomicHardwareConfig,
    dimensions: Dimensions,
    ready: u32,
    total: u32,
}

/// Inventory answering from a static device list.
pub struct DeclaredInventory {
    entries: Vec<DeclaredEntry>,
    catalog: bool,
}

impl DeclaredInventory {
    /// Creates an inventory from configuration.
    pub fn new(config: DeclaredInventoryConfig) -> Self {
        let entries = config.devices.iter().map(DeclaredEntry::from).collect();
        Self {
            entries,
            catalog: config.catalog,
        }
    }
}

impl From<&DeclaredDevice> for DeclaredEntry {
    fn from(device: &DeclaredDevice) -> Self {
        let config = device.to_config();
        let dimensions = Dimensions::for_config(&config, &device.pool);
        Self {
            config,
            dimensions,
            ready: device.ready,
            total: device.total.unwrap_or(device.ready).max(device.ready),
        }
    }
}

#[async_trait]
impl FleetInventory for DeclaredInventory {
    async fn bot_count(&self, dimensions: &Dimensions) -> InventoryResult<u32> {
        let wants_ready = dimensions.wants_ready();
        let mut query = dimensions.clone();
        query.remove(STATE_KEY);

        let count: u32 = self
            .entries
            .iter()
            .filter(|entry| entry.dimensions.satisfies(&query))
            .map(|entry| if wants_ready { entry.ready } else { entry.total })
            .sum();

        tracing::debug!("Declared inventory: {} devices for {}", count, query);
        Ok(count)
    }

    fn catalog(&self) -> Option<Vec<AtomicHardwareConfig>> {
        if !self.catalog {
            return None;
        }
        Some(self.entries.iter().map(|entry| entry.config.clone()).collect())
    }

    fn name(&self) -> &'static str {
        "declared"
    }
}
