//! Turning a shard attempt into an [`ExecutionRequest`].
//!
//! Real deployments plug in a materializer producing whatever their
//! execution service expects. [`JsonMaterializer`] produces the plain
//! request the command service writes to disk.

use std::collections::BTreeMap;

use chrono::Utc;

use super::ExecutionRequest;
use crate::hardware::AtomicHardwareConfig;
use crate::inventory::{DeviceInfo, Dimensions};

/// Errors building an execution request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaterializeError {
    #[error("Invalid request for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Everything known about an attempt at the time it is materialized.
#[derive(Debug, Clone, Copy)]
pub struct MaterializeInput<'a> {
    pub key: &'a str,
    pub attempt: u32,
    pub suite: &'a str,
    pub pool: &'a str,
    pub harness: &'a str,
    pub tests: &'a [String],
    pub hardware: &'a AtomicHardwareConfig,
    /// Live device information of the target, when it was probed.
    pub device: Option<&'a DeviceInfo>,
}

/// Builds execution requests.
pub trait RequestMaterializer: Send + Sync {
    fn materialize(&self, input: &MaterializeInput<'_>) -> Result<ExecutionRequest, MaterializeError>;
}

/// Materializer producing a plain [`ExecutionRequest`].
#[derive(Debug, Clone)]
pub struct JsonMaterializer {
    timeout_secs: u64,
    tags: BTreeMap<String, String>,
}

impl JsonMaterializer {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            tags: BTreeMap::new(),
        }
    }

    /// Adds a tag to every request.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

impl RequestMaterializer for JsonMaterializer {
    fn materialize(&self, input: &MaterializeInput<'_>) -> Result<ExecutionRequest, MaterializeError> {
        if let Some(blank) = input.tests.iter().position(|name| name.trim().is_empty()) {
            return Err(MaterializeError::Invalid {
                key: input.key.to_string(),
                reason: format!("test #{} has an empty name", blank),
            });
        }

        let dimensions = match input.device {
            Some(device) if device.dimensions.iter().next().is_some() => device.dimensions.clone(),
            _ => Dimensions::for_config(input.hardware, input.pool),
        };

        let mut tags = self.tags.clone();
        tags.insert("suite".to_string(), input.suite.to_string());
        tags.insert("harness".to_string(), input.harness.to_string());
        tags.insert("attempt".to_string(), input.attempt.to_string());

        Ok(ExecutionRequest {
            key: input.key.to_string(),
            attempt: input.attempt,
            suite: input.suite.to_string(),
            pool: input.pool.to_string(),
            harness: input.harness.to_string(),
            tests: input.tests.to_vec(),
            hardware: input.hardware.clone(),
            dimensions,
            timeout_secs: self.timeout_secs,
            created_at: Utc::now(),
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{BOARD_KEY, POOL_KEY};

    fn input<'a>(
        tests: &'a [String],
        hardware: &'a AtomicHardwareConfig,
        device: Option<&'a DeviceInfo>,
    ) -> MaterializeInput<'a> {
        MaterializeInput {
            key: "abc-shard-0",
            attempt: 1,
            suite: "bvt",
            pool: "quota",
            harness: "tast",
            tests,
            hardware,
            device,
        }
    }

    #[test]
    fn test_materialize_uses_probed_dimensions() {
        let hardware = AtomicHardwareConfig::new("eve");
        let device = DeviceInfo {
            dimensions: Dimensions::new().with(BOARD_KEY, "eve").with("probed", "yes"),
            ready: 1,
            total: 1,
        };
        let tests = vec!["tast.a".to_string()];

        let request = JsonMaterializer::new(600)
            .with_tag("builder", "cq")
            .materialize(&input(&tests, &hardware, Some(&device)))
            .unwrap();

        assert_eq!(request.key, "abc-shard-0");
        assert_eq!(request.dimensions, device.dimensions);
        assert_eq!(request.timeout_secs, 600);
        assert_eq!(request.tags["builder"], "cq");
        assert_eq!(request.tags["attempt"], "1");
    }

    #[test]
    fn test_materialize_falls_back_to_config_dimensions() {
        let hardware = AtomicHardwareConfig::new("eve");
        let tests = vec!["tast.a".to_string()];

        let request = JsonMaterializer::new(600)
            .materialize(&input(&tests, &hardware, None))
            .unwrap();

        assert!(request.dimensions.get(POOL_KEY).unwrap().contains("quota"));
    }

    #[test]
    fn test_blank_test_name_rejected() {
        let hardware = AtomicHardwareConfig::new("eve");
        let tests = vec!["tast.a".to_string(), " ".to_string()];

        let err = JsonMaterializer::new(600)
            .materialize(&input(&tests, &hardware, None))
            .unwrap_err();
        assert!(err.to_string().contains("test #1"));
    }
}
