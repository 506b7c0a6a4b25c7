//! Fleet inventory: how many physical devices of a given shape exist and
//! how many are ready right now.
//!
//! # Architecture
//!
//! ```text
//!  EquivalenceTable ──► LabProber ──(one query per signature)──► FleetInventory
//!                           │                                        │
//!                           │◄────────── ready / total counts ───────┘
//!                           ▼
//!                    LabAvailability
//!                    (CounterArena + DeviceInfo per signature)
//! ```
//!
//! # Built-in Inventories
//!
//! | Inventory | Module | Description |
//! |-----------|--------|-------------|
//! | Declared | [`declared`] | Devices listed in the configuration file |
//! | Command | [`command`] | Counts returned by an external command |

pub mod command;
pub mod counter;
pub mod declared;
pub mod prober;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hardware::AtomicHardwareConfig;

pub use counter::{CounterArena, CounterId};
pub use prober::{DeviceInfo, LabAvailability, LabProber};

/// Dimension holding the device pool.
pub const POOL_KEY: &str = "pool";

/// Dimension holding the primary board.
pub const BOARD_KEY: &str = "label-board";

/// Dimension holding the primary model.
pub const MODEL_KEY: &str = "label-model";

/// Dimension holding companion boards.
pub const COMPANION_BOARD_KEY: &str = "label-companion_board";

/// Dimension filtering on device state.
pub const STATE_KEY: &str = "dut_state";

/// Value of [`STATE_KEY`] for devices able to take work.
pub const STATE_READY: &str = "ready";

/// Result type for inventory operations.
pub type InventoryResult<T> = Result<T, InventoryError>;

/// Errors returned by fleet inventory queries.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// The inventory service could not answer the query.
    #[error("Inventory query failed: {0}")]
    QueryFailed(String),

    /// The inventory service answered with something unparseable.
    #[error("Invalid inventory response: {0}")]
    InvalidResponse(String),

    /// The query did not finish in time.
    #[error("Inventory query timed out: {0}")]
    Timeout(String),

    /// I/O error talking to the inventory service.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A set of device dimensions, as used by fleet queries.
///
/// Each key maps to one or more required values. A device satisfies a
/// query when, for every key in the query, it carries all listed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dimensions(BTreeMap<String, BTreeSet<String>>);

impl Dimensions {
    /// Creates an empty dimension set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the hardware dimensions for a configuration in a pool.
    ///
    /// The software variant is deliberately absent: variants of the same
    /// board run on the same physical devices.
    ///
    /// Labels of the form `key:value` become a `key` dimension; bare labels
    /// become `label-<name>` set to `True`.
    pub fn for_config(config: &AtomicHardwareConfig, pool: &str) -> Self {
        let mut dims = Self::new()
            .with(POOL_KEY, pool)
            .with(BOARD_KEY, config.board.to_ascii_lowercase());

        if let Some(model) = &config.model {
            dims.insert(MODEL_KEY, model);
        }

        for label in &config.labels {
            match label.split_once(':') {
                Some((key, value)) => dims.insert(key, value),
                None => dims.insert(format!("label-{}", label), "True"),
            }
        }

        for companion in &config.companions {
            dims.insert(COMPANION_BOARD_KEY, companion.board.to_ascii_lowercase());
        }

        dims
    }

    /// Adds a value, returning the updated set.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds a value to a dimension.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().insert(value.into());
    }

    /// Removes a dimension entirely.
    pub fn remove(&mut self, key: &str) -> Option<BTreeSet<String>> {
        self.0.remove(key)
    }

    /// Returns the values of a dimension.
    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.0.get(key)
    }

    /// Iterates over dimensions in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    /// Returns `true` if a device with dimensions `self` satisfies `query`.
    pub fn satisfies(&self, query: &Dimensions) -> bool {
        query.iter().all(|(key, wanted)| {
            self.0
                .get(key)
                .is_some_and(|have| wanted.is_subset(have))
        })
    }

    /// Returns `true` if the query asks only for ready devices.
    pub fn wants_ready(&self) -> bool {
        self.get(STATE_KEY)
            .is_some_and(|values| values.len() == 1 && values.contains(STATE_READY))
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, values) in &self.0 {
            for value in values {
                if !first {
                    f.write_str(",")?;
                }
                write!(f, "{}:{}", key, value)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A source of live device counts.
///
/// # Thread Safety
///
/// Inventories must be `Send + Sync`; the prober issues many queries
/// concurrently against a shared reference.
#[async_trait]
pub trait FleetInventory: Send + Sync {
    /// Counts devices satisfying `dimensions`.
    ///
    /// When the query carries `dut_state=ready` only ready devices are
    /// counted; otherwise every device regardless of state.
    async fn bot_count(&self, dimensions: &Dimensions) -> InventoryResult<u32>;

    /// Physical device configurations known to this inventory.
    ///
    /// When present, equivalence classes are computed against these
    /// devices only.
    ///
    /// # Default Implementation
    ///
    /// Returns `None`: the inventory can count devices but not list them.
    fn catalog(&self) -> Option<Vec<AtomicHardwareConfig>> {
        None
    }

    /// Inventory name, for logging.
    fn name(&self) -> &'static str;
}
