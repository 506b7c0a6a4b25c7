//! Greedy distribution of test cases into device-bound shards.
//!
//! The engine walks hardware buckets from the most constrained (smallest
//! equivalence class) to the least, so scarce devices are claimed by tests
//! that cannot run anywhere else before flexible tests use them up.
//!
//! # Device Choice
//!
//! For every chunk of same-harness tests the engine tries, in order:
//!
//! | Step | Condition | Effect on counters |
//! |------|-----------|--------------------|
//! | expand | a class device owns an open shard of the harness | none |
//! | open | some class device has remaining capacity | one unit consumed |
//! | queue | every class device is exhausted | none |
//!
//! A queued shard goes to the device with the largest fleet, where it waits
//! behind running work. Expanding never charges a counter: the shard was
//! charged when it was opened, so a counter at zero does not block it.
//!
//! # Example
//!
//! ```
//! use dutsched::distribution::DistributionEngine;
//! use dutsched::hardware::{AtomicHardwareConfig, EquivalenceResolver, HardwareRequirement};
//! use dutsched::inventory::{DeviceInfo, LabAvailability};
//! use dutsched::plan::TestCase;
//!
//! let eve = AtomicHardwareConfig::new("eve");
//! let tests = vec![
//!     TestCase::new("tast.a", HardwareRequirement::from(&eve)),
//!     TestCase::new("tast.b", HardwareRequirement::from(&eve)),
//! ];
//! let table = EquivalenceResolver::new().resolve(&tests);
//!
//! let mut lab = LabAvailability::new();
//! lab.insert_signature(eve.signature(), DeviceInfo { ready: 1, total: 1, ..Default::default() });
//! lab.bind(eve.key(), eve.signature());
//!
//! let plan = DistributionEngine::new(50).distribute(&table, &mut lab);
//! assert_eq!(plan.shard_count(), 1);
//! assert_eq!(lab.remaining(&eve.key()), 0);
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ShardError;
use crate::hardware::{AtomicHardwareConfig, EquivalenceTable, HardwareKey};
use crate::inventory::LabAvailability;
use crate::plan::harness_of;

/// A group of same-harness tests bound to one device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shard {
    /// Stable key, `{hardware}-shard-{n}`.
    pub key: String,

    /// Device configuration the shard runs on.
    pub hardware: HardwareKey,

    pub harness: String,

    /// Test names, in placement order.
    pub tests: Vec<String>,
}

/// Tests no known device can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedShard {
    /// Stable key, `{requirement}-unmatched-{n}`.
    pub key: String,

    /// The requirement with an empty equivalence class.
    pub requirement: HardwareKey,

    pub harness: String,

    pub tests: Vec<String>,
}

impl UnmatchedShard {
    /// The error reported for every test in this shard.
    pub fn error(&self) -> ShardError {
        ShardError::NoHardwareMatch {
            requirement: self.requirement.clone(),
        }
    }
}

/// Shards per device configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Assignment(BTreeMap<HardwareKey, Vec<Shard>>);

impl Assignment {
    /// Shards bound to one device configuration.
    pub fn shards_for(&self, hardware: &HardwareKey) -> &[Shard] {
        self.0.get(hardware).map_or(&[], Vec::as_slice)
    }

    /// All shards, ordered by device key and then shard index.
    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.0.values().flatten()
    }

    /// Device configurations with at least one shard.
    pub fn devices(&self) -> impl Iterator<Item = &HardwareKey> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, hardware: &HardwareKey, harness: &str, tests: Vec<String>) -> usize {
        let shards = self.0.entry(hardware.clone()).or_default();
        let index = shards.len();
        shards.push(Shard {
            key: format!("{}-shard-{}", hardware, index),
            hardware: hardware.clone(),
            harness: harness.to_string(),
            tests,
        });
        index
    }

    fn shard_mut(&mut self, hardware: &HardwareKey, index: usize) -> Option<&mut Shard> {
        self.0.get_mut(hardware)?.get_mut(index)
    }
}

/// Output of [`DistributionEngine::distribute`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DistributionPlan {
    pub assignment: Assignment,

    /// Tests that could not be placed on any device.
    pub unmatched: Vec<UnmatchedShard>,

    /// Keys of shards placed without available capacity.
    pub queued: Vec<String>,
}

impl DistributionPlan {
    /// Number of device-bound shards.
    pub fn shard_count(&self) -> usize {
        self.assignment.len()
    }

    /// Number of tests across device-bound shards.
    pub fn placed_tests(&self) -> usize {
        self.assignment.shards().map(|shard| shard.tests.len()).sum()
    }

    /// Number of tests that could not be placed.
    pub fn unmatched_tests(&self) -> usize {
        self.unmatched.iter().map(|shard| shard.tests.len()).sum()
    }
}

/// Places tests onto devices.
pub struct DistributionEngine {
    max_in_shard: usize,
}

/// Mutable state of one distribution pass.
struct Pass<'a> {
    max_in_shard: usize,
    lab: &'a mut LabAvailability,
    plan: DistributionPlan,
    /// Open (non-full) shard per device and harness, as an index into the
    /// device's shard list.
    open: BTreeMap<(HardwareKey, String), usize>,
}

impl DistributionEngine {
    /// Creates an engine producing shards of at most `max_in_shard` tests.
    ///
    /// Values below 1 are clamped to 1.
    pub fn new(max_in_shard: usize) -> Self {
        Self {
            max_in_shard: max_in_shard.max(1),
        }
    }

    /// Distributes every test in `table`, consuming capacity from `lab`.
    ///
    /// Each test is placed exactly once, through the first of its
    /// requirements (in bucket order) that has a non-empty class. Tests
    /// whose requirements all have empty classes, and tests with no
    /// requirement at all, end up in [`DistributionPlan::unmatched`].
    pub fn distribute(&self, table: &EquivalenceTable, lab: &mut LabAvailability) -> DistributionPlan {
        let mut buckets: Vec<&HardwareKey> = table.hw_to_tests().keys().collect();
        buckets.sort_by_key(|key| (table.class(key).len(), *key));

        let mut pass = Pass {
            max_in_shard: self.max_in_shard,
            lab,
            plan: DistributionPlan::default(),
            open: BTreeMap::new(),
        };
        let mut placed: BTreeSet<&str> = BTreeSet::new();

        for bucket in &buckets {
            let class = table.class(bucket);
            if class.is_empty() {
                continue;
            }

            let pending: Vec<&str> = table
                .tests_for(bucket)
                .iter()
                .map(String::as_str)
                .filter(|name| placed.insert(*name))
                .collect();
            if pending.is_empty() {
                continue;
            }

            debug!(
                "Bucket {}: {} tests across {} devices",
                bucket,
                pending.len(),
                class.len()
            );

            for (harness, tests) in group_by_harness(&pending) {
                for chunk in tests.chunks(self.max_in_shard) {
                    pass.place(class, harness, chunk);
                }
            }
        }

        for bucket in buckets.iter().filter(|key| table.class(key).is_empty()) {
            let pending: Vec<&str> = table
                .tests_for(bucket)
                .iter()
                .map(String::as_str)
                .filter(|name| placed.insert(*name))
                .collect();

            pass.unmatched(bucket, &pending);
        }

        // Tests without any requirement are reported against the empty
        // configuration.
        let unconstrained: Vec<&str> = table
            .unconstrained()
            .iter()
            .map(String::as_str)
            .filter(|name| placed.insert(*name))
            .collect();
        pass.unmatched(&AtomicHardwareConfig::default().key(), &unconstrained);

        let plan = pass.plan;
        info!(
            "Distributed {} tests into {} shards on {} devices ({} queued, {} tests unmatched)",
            plan.placed_tests(),
            plan.shard_count(),
            plan.assignment.devices().count(),
            plan.queued.len(),
            plan.unmatched_tests()
        );
        plan
    }
}

impl Pass<'_> {
    /// Records `tests` as unplaceable, chunked per harness.
    fn unmatched(&mut self, requirement: &HardwareKey, tests: &[&str]) {
        for (harness, tests) in group_by_harness(tests) {
            for chunk in tests.chunks(self.max_in_shard) {
                let key = format!("{}-unmatched-{}", requirement, self.plan.unmatched.len());
                warn!("No device can run {} tests of {} ({})", chunk.len(), requirement, key);
                self.plan.unmatched.push(UnmatchedShard {
                    key,
                    requirement: requirement.clone(),
                    harness: harness.to_string(),
                    tests: chunk.iter().map(|name| name.to_string()).collect(),
                });
            }
        }
    }

    /// Places one chunk (at most `max_in_shard` tests) on a class device.
    fn place(&mut self, class: &[HardwareKey], harness: &str, chunk: &[&str]) {
        let mut rest = chunk;

        while !rest.is_empty() {
            if let Some(taken) = self.expand(class, harness, rest) {
                rest = &rest[taken..];
                continue;
            }

            let (device, queued) = match self.open_candidate(class) {
                Some(device) => {
                    self.lab.try_consume(device);
                    (device, false)
                }
                None => match self.queue_candidate(class) {
                    Some(device) => (device, true),
                    None => return,
                },
            };

            let tests: Vec<String> = rest.iter().map(|name| name.to_string()).collect();
            let full = tests.len() >= self.max_in_shard;
            let index = self.plan.assignment.push(device, harness, tests);
            let key = format!("{}-shard-{}", device, index);

            if queued {
                debug!("Queued {} on exhausted device {}", key, device);
                self.plan.queued.push(key);
            } else {
                debug!("Opened {} ({} tests)", key, rest.len());
            }
            if !full {
                self.open.insert((device.clone(), harness.to_string()), index);
            }
            return;
        }
    }

    /// Appends tests to an open shard of the harness on a class device.
    /// Returns the number of tests taken.
    fn expand(&mut self, class: &[HardwareKey], harness: &str, tests: &[&str]) -> Option<usize> {
        let (device, index) = class.iter().find_map(|device| {
            self.open
                .get(&(device.clone(), harness.to_string()))
                .map(|index| (device, *index))
        })?;

        let shard = self.plan.assignment.shard_mut(device, index)?;
        let taken = self.max_in_shard.saturating_sub(shard.tests.len()).min(tests.len());
        if taken == 0 {
            self.open.remove(&(device.clone(), harness.to_string()));
            return None;
        }
        shard
            .tests
            .extend(tests[..taken].iter().map(|name| name.to_string()));

        if shard.tests.len() >= self.max_in_shard {
            self.open.remove(&(device.clone(), harness.to_string()));
        }
        debug!("Expanded {} by {} tests", shard.key, taken);
        Some(taken)
    }

    /// Class device with the most remaining capacity, if any has some.
    fn open_candidate<'c>(&self, class: &'c [HardwareKey]) -> Option<&'c HardwareKey> {
        class
            .iter()
            .filter(|device| self.lab.remaining(device) > 0)
            .max_by(|a, b| prefer(self.lab.remaining(a), self.lab.remaining(b), a, b))
    }

    /// Class device with the largest fleet.
    fn queue_candidate<'c>(&self, class: &'c [HardwareKey]) -> Option<&'c HardwareKey> {
        class
            .iter()
            .max_by(|a, b| prefer(self.lab.total(a), self.lab.total(b), a, b))
    }
}

/// Orders candidates by count, breaking ties toward the smaller key.
fn prefer(count_a: u32, count_b: u32, a: &HardwareKey, b: &HardwareKey) -> Ordering {
    count_a.cmp(&count_b).then_with(|| b.cmp(a))
}

/// Groups test names by harness, harnesses sorted, tests in input order.
fn group_by_harness<'t>(tests: &[&'t str]) -> BTreeMap<&'t str, Vec<&'t str>> {
    let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for &name in tests {
        groups.entry(harness_of(name)).or_default().push(name);
    }
    groups
}
