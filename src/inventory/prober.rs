//! Parallel lab availability probing.

use std::collections::BTreeMap;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CounterArena, CounterId, Dimensions, FleetInventory, STATE_KEY, STATE_READY};
use crate::hardware::{EquivalenceTable, HardwareKey};

/// Live device information for one hardware signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Dimensions the devices were counted with (no state filter).
    pub dimensions: Dimensions,

    /// Devices currently ready to take work.
    pub ready: u32,

    /// Devices in the pool regardless of state.
    pub total: u32,
}

/// Device availability for every configuration in a scheduling run.
///
/// Configurations sharing a signature share a [`CounterId`].
#[derive(Debug, Clone, Default)]
pub struct LabAvailability {
    counters: CounterArena,
    by_signature: BTreeMap<HardwareKey, (CounterId, DeviceInfo)>,
    by_config: BTreeMap<HardwareKey, HardwareKey>,
}

impl LabAvailability {
    /// Creates an empty availability table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records device information for a signature and allocates its
    /// counter at the ready count. Re-inserting a signature keeps the
    /// existing counter.
    pub fn insert_signature(&mut self, signature: HardwareKey, info: DeviceInfo) -> CounterId {
        if let Some((id, _)) = self.by_signature.get(&signature) {
            return *id;
        }
        let id = self.counters.allocate(info.ready);
        self.by_signature.insert(signature, (id, info));
        id
    }

    /// Binds a configuration to the counter of its signature.
    pub fn bind(&mut self, config: HardwareKey, signature: HardwareKey) -> Option<CounterId> {
        let id = self.by_signature.get(&signature).map(|(id, _)| *id)?;
        self.by_config.insert(config, signature);
        Some(id)
    }

    /// Counter shared by every configuration with the same signature.
    pub fn counter_for(&self, config: &HardwareKey) -> Option<CounterId> {
        self.entry(config).map(|(id, _)| *id)
    }

    /// Live device information for a configuration.
    pub fn device_for(&self, config: &HardwareKey) -> Option<&DeviceInfo> {
        self.entry(config).map(|(_, info)| info)
    }

    /// Remaining capacity for a configuration; zero when unknown.
    pub fn remaining(&self, config: &HardwareKey) -> u32 {
        self.counter_for(config)
            .map_or(0, |id| self.counters.remaining(id))
    }

    /// Total devices for a configuration regardless of state; zero when unknown.
    pub fn total(&self, config: &HardwareKey) -> u32 {
        self.device_for(config).map_or(0, |info| info.total)
    }

    /// Consumes one unit of capacity for a configuration.
    pub fn try_consume(&mut self, config: &HardwareKey) -> bool {
        match self.counter_for(config) {
            Some(id) => self.counters.try_consume(id),
            None => false,
        }
    }

    /// The underlying counter arena.
    pub fn counters(&self) -> &CounterArena {
        &self.counters
    }

    /// Device information per signature.
    pub fn signatures(&self) -> impl Iterator<Item = (&HardwareKey, &DeviceInfo)> {
        self.by_signature.iter().map(|(key, (_, info))| (key, info))
    }

    fn entry(&self, config: &HardwareKey) -> Option<&(CounterId, DeviceInfo)> {
        let signature = self.by_config.get(config)?;
        self.by_signature.get(signature)
    }
}

/// Queries a [`FleetInventory`] for every distinct hardware signature.
pub struct LabProber<'a, I: ?Sized> {
    inventory: &'a I,
    pool: String,
}

impl<'a, I: FleetInventory + ?Sized> LabProber<'a, I> {
    /// Creates a prober querying `inventory` within `pool`.
    pub fn new(inventory: &'a I, pool: impl Into<String>) -> Self {
        Self {
            inventory,
            pool: pool.into(),
        }
    }

    /// Probes availability for every configuration in the table.
    ///
    /// One query pair (ready and total) is issued per distinct signature,
    /// all signatures concurrently. A failed query is logged and counted
    /// as zero devices; it never aborts the other probes.
    pub async fn probe(&self, table: &EquivalenceTable) -> LabAvailability {
        let mut signatures: BTreeMap<HardwareKey, (Dimensions, Vec<HardwareKey>)> =
            BTreeMap::new();
        for (key, config) in table.configs() {
            signatures
                .entry(config.signature())
                .or_insert_with(|| (Dimensions::for_config(config, &self.pool), Vec::new()))
                .1
                .push(key.clone());
        }

        info!(
            "Probing {} for {} hardware signatures",
            self.inventory.name(),
            signatures.len()
        );

        let probes = signatures
            .iter()
            .map(|(signature, (dims, _))| self.probe_one(signature, dims));
        let infos = join_all(probes).await;

        let mut lab = LabAvailability::new();
        for ((signature, (_, configs)), info) in signatures.into_iter().zip(infos) {
            lab.insert_signature(signature.clone(), info);
            for config in configs {
                lab.bind(config, signature.clone());
            }
        }
        lab
    }

    async fn probe_one(&self, signature: &HardwareKey, dims: &Dimensions) -> DeviceInfo {
        let ready_dims = dims.clone().with(STATE_KEY, STATE_READY);
        let (ready, total) = futures::join!(
            self.inventory.bot_count(&ready_dims),
            self.inventory.bot_count(dims)
        );

        let ready = ready.unwrap_or_else(|e| {
            warn!("Ready-count probe failed for {} ({}): {}", signature, dims, e);
            0
        });
        let total = total.unwrap_or_else(|e| {
            warn!("Total-count probe failed for {} ({}): {}", signature, dims, e);
            0
        });

        debug!("{} ({}): {} ready of {}", signature, dims, ready, total);

        let mut dimensions = dims.clone();
        dimensions.remove(STATE_KEY);
        DeviceInfo {
            dimensions,
            ready,
            total,
        }
    }
}
