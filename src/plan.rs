//! Test plan input: the test cases to schedule and their hardware needs.
//!
//! A plan is produced upstream (filtering and enumeration are not this
//! crate's concern) and handed over as JSON:
//!
//! ```json
//! {
//!   "suite": "bvt-tast-cq",
//!   "tests": [
//!     {
//!       "name": "tast.audio.Microphone",
//!       "requirements": [
//!         { "primary": { "board": "octopus", "models": ["bobba", "casta"] } },
//!         { "primary": { "board": "eve" } }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hardware::HardwareRequirement;

/// A single test case and the hardware it can run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Qualified name, e.g. `tast.audio.Microphone`.
    pub name: String,

    /// Alternative hardware requirements. Any one of them is sufficient.
    pub requirements: Vec<HardwareRequirement>,
}

impl TestCase {
    /// Creates a test case with a single hardware requirement.
    pub fn new(name: impl Into<String>, requirement: HardwareRequirement) -> Self {
        Self {
            name: name.into(),
            requirements: vec![requirement],
        }
    }

    /// Adds another acceptable hardware requirement.
    pub fn or(mut self, requirement: HardwareRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Returns the harness, the part of the name before the first `.`.
    ///
    /// # Example
    ///
    /// ```
    /// use dutsched::hardware::{DeviceRequirement, HardwareRequirement};
    /// use dutsched::plan::TestCase;
    ///
    /// let test = TestCase::new(
    ///     "tast.audio.Microphone",
    ///     HardwareRequirement::new(DeviceRequirement::new("eve")),
    /// );
    /// assert_eq!(test.harness(), "tast");
    /// ```
    pub fn harness(&self) -> &str {
        harness_of(&self.name)
    }
}

/// Returns the harness of a qualified test name.
pub fn harness_of(name: &str) -> &str {
    name.split_once('.').map_or(name, |(harness, _)| harness)
}

/// The full set of test cases for one suite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    /// Suite name, used for logging and the enumeration sentinel.
    #[serde(default)]
    pub suite: String,

    /// Test cases to schedule.
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

/// Loads a test plan from a JSON file.
pub fn load_plan(path: &Path) -> Result<TestPlan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read test plan: {}", path.display()))?;

    let plan: TestPlan = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test plan: {}", path.display()))?;

    Ok(plan)
}
