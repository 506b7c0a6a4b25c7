//! Hardware requirements and atomic device configurations.
//!
//! Test cases describe the hardware they need as one or more
//! [`HardwareRequirement`] alternatives. A requirement may itself be
//! disjunctive (a primary board with several acceptable models, for
//! example), so before scheduling every requirement is flattened into
//! [`AtomicHardwareConfig`]s: concrete, non-disjunctive device shapes that
//! can be hashed, compared and counted.
//!
//! # Compatibility
//!
//! The scheduler needs to know which device configurations can run a given
//! requirement. That relation is [`AtomicHardwareConfig::is_parent_of`]:
//!
//! | Field | Rule |
//! |-------|------|
//! | board | equal, ignoring ASCII case |
//! | model | equal, or absent on either side |
//! | variant | equal, or absent on either side |
//! | labels | required labels are a subset of the parent's |
//! | companions | complete 1:1 matching, both empty, or mismatch |
//!
//! # Identity
//!
//! Every atomic config has two hashes:
//!
//! - [`key`](AtomicHardwareConfig::key): full content identity, used for
//!   scheduling.
//! - [`signature`](AtomicHardwareConfig::signature): the same hash with the
//!   primary software variant left out. Variants of one physical board share
//!   a device pool, so inventory is counted per signature.
//!
//! # Example
//!
//! ```
//! use dutsched::hardware::{DeviceRequirement, HardwareRequirement};
//!
//! let requirement = HardwareRequirement::new(
//!     DeviceRequirement::new("octopus").with_models(["bobba", "casta"]),
//! );
//! let atomic = requirement.flatten();
//! assert_eq!(atomic.len(), 2);
//! assert_eq!(atomic[0].model.as_deref(), Some("bobba"));
//! ```

pub mod equivalence;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use equivalence::{EquivalenceResolver, EquivalenceTable};

/// Largest companion list the matcher is expected to see.
///
/// Companion matching is a backtracking search-with-removal, quadratic or
/// worse in the list length. Lab topologies never attach more than a handful
/// of companions to a primary DUT, so this is a precondition, not a limit
/// that is enforced.
pub const MAX_COMPANIONS: usize = 4;

/// Number of digest bytes kept in a [`HardwareKey`].
const KEY_BYTES: usize = 12;

/// Content hash identifying an [`AtomicHardwareConfig`].
///
/// Keys order lexicographically, which gives the scheduler a stable order
/// over otherwise unordered maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareKey(String);

impl HardwareKey {
    /// Returns the key as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HardwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HardwareKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single device need, possibly naming several acceptable models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequirement {
    /// Board name. Compared case-insensitively.
    pub board: String,

    /// Acceptable models. Empty means any model of the board.
    #[serde(default)]
    pub models: Vec<String>,

    /// Required software variant, if any.
    #[serde(default)]
    pub variant: Option<String>,

    /// Capability labels the device must carry.
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl DeviceRequirement {
    /// Creates a requirement for any device of the given board.
    pub fn new(board: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            ..Self::default()
        }
    }

    /// Adds acceptable models.
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models.extend(models.into_iter().map(Into::into));
        self
    }

    /// Sets the required software variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Adds a required capability label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Expands the model disjunction into one atomic config per model.
    fn expand(&self) -> Vec<AtomicHardwareConfig> {
        let base = AtomicHardwareConfig {
            board: self.board.clone(),
            model: None,
            variant: self.variant.clone(),
            labels: self.labels.clone(),
            companions: Vec::new(),
        };

        if self.models.is_empty() {
            return vec![base];
        }

        let mut seen = BTreeSet::new();
        self.models
            .iter()
            .filter(|model| seen.insert(model.as_str()))
            .map(|model| AtomicHardwareConfig {
                model: Some(model.clone()),
                ..base.clone()
            })
            .collect()
    }
}

impl From<&AtomicHardwareConfig> for DeviceRequirement {
    fn from(config: &AtomicHardwareConfig) -> Self {
        Self {
            board: config.board.clone(),
            models: config.model.iter().cloned().collect(),
            variant: config.variant.clone(),
            labels: config.labels.clone(),
        }
    }
}

/// One alternative of a test's hardware needs: a primary device and the
/// companions that must be attached to it for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRequirement {
    /// The device the test is driven from.
    pub primary: DeviceRequirement,

    /// Additional devices for multi-DUT tests. Order is not significant.
    #[serde(default)]
    pub companions: Vec<DeviceRequirement>,
}

impl HardwareRequirement {
    /// Creates a single-DUT requirement.
    pub fn new(primary: DeviceRequirement) -> Self {
        Self {
            primary,
            companions: Vec::new(),
        }
    }

    /// Adds a companion device.
    pub fn with_companion(mut self, companion: DeviceRequirement) -> Self {
        self.companions.push(companion);
        self
    }

    /// Expands this requirement into every atomic configuration it admits.
    ///
    /// The result is the cartesian product of the primary's models with each
    /// companion's models. Flattening an already-atomic requirement returns
    /// exactly that configuration.
    pub fn flatten(&self) -> Vec<AtomicHardwareConfig> {
        let mut companion_sets: Vec<Vec<AtomicHardwareConfig>> = vec![Vec::new()];
        for companion in &self.companions {
            let options = companion.expand();
            let mut next = Vec::with_capacity(companion_sets.len() * options.len());
            for prefix in &companion_sets {
                for option in &options {
                    let mut set = prefix.clone();
                    set.push(option.clone());
                    next.push(set);
                }
            }
            companion_sets = next;
        }

        let mut flattened = Vec::new();
        for primary in self.primary.expand() {
            for companions in &companion_sets {
                flattened.push(AtomicHardwareConfig {
                    companions: companions.clone(),
                    ..primary.clone()
                });
            }
        }
        flattened
    }
}

impl From<&AtomicHardwareConfig> for HardwareRequirement {
    fn from(config: &AtomicHardwareConfig) -> Self {
        Self {
            primary: DeviceRequirement::from(config),
            companions: config.companions.iter().map(DeviceRequirement::from).collect(),
        }
    }
}

/// A concrete, non-disjunctive device configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicHardwareConfig {
    /// Board name.
    pub board: String,

    /// Model, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Software variant, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Capability labels.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,

    /// Companion devices. Empty for single-DUT configurations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub companions: Vec<AtomicHardwareConfig>,
}

impl AtomicHardwareConfig {
    /// Creates a config for the given board with nothing else pinned.
    pub fn new(board: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            ..Self::default()
        }
    }

    /// Pins the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Pins the software variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Adds a capability label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Adds a companion device.
    pub fn with_companion(mut self, companion: AtomicHardwareConfig) -> Self {
        self.companions.push(companion);
        self
    }

    /// Returns `true` for multi-DUT configurations.
    pub fn is_multi_dut(&self) -> bool {
        !self.companions.is_empty()
    }

    /// Content hash of this configuration.
    pub fn key(&self) -> HardwareKey {
        digest_key(&self.canonical(true))
    }

    /// Hash of the physical hardware, ignoring the primary variant.
    pub fn signature(&self) -> HardwareKey {
        digest_key(&self.canonical(false))
    }

    /// Returns `true` if a device with this configuration can run `child`.
    pub fn is_parent_of(&self, child: &AtomicHardwareConfig) -> bool {
        self.device_matches(child) && companions_match(&self.companions, &child.companions)
    }

    fn device_matches(&self, child: &AtomicHardwareConfig) -> bool {
        self.board.eq_ignore_ascii_case(&child.board)
            && wildcard_eq(self.model.as_deref(), child.model.as_deref())
            && wildcard_eq(self.variant.as_deref(), child.variant.as_deref())
            && child.labels.is_subset(&self.labels)
    }

    /// Stable textual encoding hashed into keys.
    ///
    /// Companions are sorted by their own encoding so that two lists naming
    /// the same devices in a different order hash identically.
    fn canonical(&self, include_variant: bool) -> String {
        let mut companions: Vec<String> = self
            .companions
            .iter()
            .map(|companion| companion.canonical(true))
            .collect();
        companions.sort();

        let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        let variant = if include_variant {
            self.variant.as_deref().unwrap_or("")
        } else {
            ""
        };

        format!(
            "board={};model={};variant={};labels=[{}];companions=[{}]",
            self.board.to_ascii_lowercase(),
            self.model.as_deref().unwrap_or(""),
            variant,
            labels.join(","),
            companions.join("|"),
        )
    }
}

impl fmt::Display for AtomicHardwareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.board)?;
        if let Some(model) = &self.model {
            write!(f, "/{}", model)?;
        }
        if let Some(variant) = &self.variant {
            write!(f, "-{}", variant)?;
        }
        if !self.labels.is_empty() {
            let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
            write!(f, "[{}]", labels.join(","))?;
        }
        for companion in &self.companions {
            write!(f, " + {}", companion)?;
        }
        Ok(())
    }
}

fn digest_key(canonical: &str) -> HardwareKey {
    let digest = Sha256::digest(canonical.as_bytes());
    HardwareKey(hex::encode(&digest[..KEY_BYTES]))
}

fn wildcard_eq(parent: Option<&str>, child: Option<&str>) -> bool {
    match (parent, child) {
        (Some(parent), Some(child)) => parent == child,
        _ => true,
    }
}

/// Checks that every required companion can be served by a distinct
/// companion of the parent.
fn companions_match(parent: &[AtomicHardwareConfig], child: &[AtomicHardwareConfig]) -> bool {
    if parent.is_empty() || child.is_empty() {
        return parent.is_empty() && child.is_empty();
    }
    if parent.len() != child.len() {
        return false;
    }
    if child.len() > MAX_COMPANIONS {
        tracing::debug!(
            "Matching {} companions exceeds the expected maximum of {}",
            child.len(),
            MAX_COMPANIONS
        );
    }

    let mut available: Vec<&AtomicHardwareConfig> = parent.iter().collect();
    match_with_removal(child, &mut available)
}

fn match_with_removal(
    required: &[AtomicHardwareConfig],
    available: &mut Vec<&AtomicHardwareConfig>,
) -> bool {
    let Some((first, rest)) = required.split_first() else {
        return true;
    };

    for i in 0..available.len() {
        if available[i].is_parent_of(first) {
            let taken = available.remove(i);
            if match_with_removal(rest, available) {
                return true;
            }
            available.insert(i, taken);
        }
    }
    false
}
