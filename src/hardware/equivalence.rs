//! Flattening test cases into hardware buckets and computing, for every
//! bucket, the device configurations able to serve it.
//!
//! The resolver scans linearly over every known configuration. The number
//! of distinct configurations is bounded by suite size and is small in
//! practice, so the quadratic scan is not a concern.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use super::{AtomicHardwareConfig, HardwareKey};
use crate::plan::TestCase;

/// Output of [`EquivalenceResolver::resolve`].
///
/// All maps are keyed by [`HardwareKey`] and ordered, so iteration is
/// reproducible run to run.
#[derive(Debug, Clone, Default)]
pub struct EquivalenceTable {
    configs: BTreeMap<HardwareKey, AtomicHardwareConfig>,
    hw_to_tests: BTreeMap<HardwareKey, Vec<String>>,
    classes: BTreeMap<HardwareKey, Vec<HardwareKey>>,
    unconstrained: Vec<String>,
}

impl EquivalenceTable {
    /// Every distinct configuration seen: flattened requirements plus any
    /// catalog devices.
    pub fn configs(&self) -> &BTreeMap<HardwareKey, AtomicHardwareConfig> {
        &self.configs
    }

    /// Looks up a configuration by key.
    pub fn config(&self, key: &HardwareKey) -> Option<&AtomicHardwareConfig> {
        self.configs.get(key)
    }

    /// Test names recorded against each flattened requirement.
    pub fn hw_to_tests(&self) -> &BTreeMap<HardwareKey, Vec<String>> {
        &self.hw_to_tests
    }

    /// Test names recorded against one requirement, in input order.
    pub fn tests_for(&self, key: &HardwareKey) -> &[String] {
        self.hw_to_tests.get(key).map_or(&[], Vec::as_slice)
    }

    /// Configurations able to run the requirement `key`, sorted by key.
    pub fn class(&self, key: &HardwareKey) -> &[HardwareKey] {
        self.classes.get(key).map_or(&[], Vec::as_slice)
    }

    /// All equivalence classes.
    pub fn classes(&self) -> &BTreeMap<HardwareKey, Vec<HardwareKey>> {
        &self.classes
    }

    /// Tests that name no hardware requirement at all, in input order.
    ///
    /// No device can be chosen for them; distribution reports them as
    /// unmatched.
    pub fn unconstrained(&self) -> &[String] {
        &self.unconstrained
    }

    /// Returns `true` if the table holds no tests.
    pub fn is_empty(&self) -> bool {
        self.hw_to_tests.is_empty() && self.unconstrained.is_empty()
    }
}

/// Builds an [`EquivalenceTable`] from test cases.
///
/// Without a catalog, candidate devices are the flattened requirements
/// themselves; every class then contains at least its own key. With a
/// catalog of physical device configurations, only catalog entries are
/// candidates and a requirement no device satisfies gets an empty class.
#[derive(Debug, Clone, Default)]
pub struct EquivalenceResolver {
    catalog: Option<Vec<AtomicHardwareConfig>>,
}

impl EquivalenceResolver {
    /// Creates a resolver that matches requirements against each other.
    pub fn new() -> Self {
        Self { catalog: None }
    }

    /// Creates a resolver that matches requirements against known devices.
    pub fn with_catalog(catalog: Vec<AtomicHardwareConfig>) -> Self {
        Self {
            catalog: Some(catalog),
        }
    }

    /// Flattens every test's requirements and computes equivalence classes.
    ///
    /// A test is recorded against every atomic configuration any of its
    /// alternatives flattens to; choosing one is left to distribution.
    pub fn resolve(&self, tests: &[TestCase]) -> EquivalenceTable {
        let mut table = EquivalenceTable::default();

        for test in tests {
            let mut recorded = BTreeSet::new();
            for requirement in &test.requirements {
                for config in requirement.flatten() {
                    let key = config.key();
                    if recorded.insert(key.clone()) {
                        table
                            .hw_to_tests
                            .entry(key.clone())
                            .or_default()
                            .push(test.name.clone());
                    }
                    table.configs.entry(key).or_insert(config);
                }
            }
            if recorded.is_empty() {
                warn!("Test {} has no hardware requirements", test.name);
                table.unconstrained.push(test.name.clone());
            }
        }

        let candidates: Vec<HardwareKey> = match &self.catalog {
            Some(catalog) => catalog
                .iter()
                .map(|device| {
                    let key = device.key();
                    table.configs.entry(key.clone()).or_insert_with(|| device.clone());
                    key
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            None => table.hw_to_tests.keys().cloned().collect(),
        };

        for key in table.hw_to_tests.keys() {
            let Some(required) = table.configs.get(key) else {
                continue;
            };
            let class: Vec<HardwareKey> = candidates
                .iter()
                .filter(|candidate| {
                    table
                        .configs
                        .get(*candidate)
                        .is_some_and(|device| device.is_parent_of(required))
                })
                .cloned()
                .collect();

            debug!(
                "Requirement {} ({}) has {} capable configurations",
                key,
                required,
                class.len()
            );
            table.classes.insert(key.clone(), class);
        }

        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{DeviceRequirement, HardwareRequirement};

    fn board(name: &str) -> HardwareRequirement {
        HardwareRequirement::new(DeviceRequirement::new(name))
    }

    #[test]
    fn test_fan_out_records_test_under_every_alternative() {
        let tests = vec![TestCase::new("tast.a", board("eve")).or(board("nami"))];
        let table = EquivalenceResolver::new().resolve(&tests);

        assert_eq!(table.hw_to_tests().len(), 2);
        for names in table.hw_to_tests().values() {
            assert_eq!(names, &vec!["tast.a".to_string()]);
        }
    }

    #[test]
    fn test_duplicate_alternatives_record_test_once() {
        let tests = vec![TestCase::new("tast.a", board("eve")).or(board("EVE"))];
        let table = EquivalenceResolver::new().resolve(&tests);

        assert_eq!(table.hw_to_tests().len(), 1);
        let key = table.hw_to_tests().keys().next().unwrap();
        assert_eq!(table.tests_for(key).len(), 1);
    }

    #[test]
    fn test_classes_contain_more_capable_requirements() {
        let plain = AtomicHardwareConfig::new("eve");
        let servo = AtomicHardwareConfig::new("eve").with_label("servo");
        let tests = vec![
            TestCase::new("tast.a", HardwareRequirement::from(&plain)),
            TestCase::new("tast.b", HardwareRequirement::from(&servo)),
        ];
        let table = EquivalenceResolver::new().resolve(&tests);

        // Anything with servo can run the plain requirement, not the reverse.
        let plain_class = table.class(&plain.key());
        assert_eq!(plain_class.len(), 2);
        assert_eq!(table.class(&servo.key()), &[servo.key()]);
    }

    #[test]
    fn test_catalog_restricts_candidates() {
        let device = AtomicHardwareConfig::new("eve")
            .with_model("eve")
            .with_label("servo");
        let tests = vec![
            TestCase::new("tast.a", board("eve")),
            TestCase::new("tast.b", board("grunt")),
        ];
        let table = EquivalenceResolver::with_catalog(vec![device.clone()]).resolve(&tests);

        let eve = AtomicHardwareConfig::new("eve").key();
        let grunt = AtomicHardwareConfig::new("grunt").key();
        assert_eq!(table.class(&eve), &[device.key()]);
        assert!(table.class(&grunt).is_empty());
        assert!(table.config(&device.key()).is_some());
    }

    #[test]
    fn test_requirement_less_test_is_kept() {
        let tests = vec![
            TestCase {
                name: "tast.free".to_string(),
                requirements: Vec::new(),
            },
            TestCase::new("tast.a", board("eve")),
        ];
        let table = EquivalenceResolver::new().resolve(&tests);

        assert_eq!(table.unconstrained(), &["tast.free".to_string()]);
        assert_eq!(table.hw_to_tests().len(), 1);
        assert!(!table.is_empty());
    }
}
