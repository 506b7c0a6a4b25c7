//! dutsched: Hardware-aware test sharding and dispatch for device labs.
//!
//! Given a suite of tests, each naming the hardware it can run on, this
//! crate decides which physical device configuration runs which tests,
//! packs them into bounded shards, and drives every shard through a remote
//! execution service with automatic retries.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Hardware**: Requirements, atomic configurations, and equivalence
//!   classes of interchangeable devices
//! - **Inventory**: Live device counts per hardware signature
//! - **Distribution**: Places tests into device-bound shards
//! - **Execution**: Builds requests and talks to the execution service
//! - **Dispatch**: Runs attempts concurrently and retries failed tests
//! - **Report**: Console progress and JSON results
//!
//! ```text
//! TestPlan ──► EquivalenceResolver ──► LabProber ──► DistributionEngine
//!                                                          │
//!                         Reporter ◄── Dispatcher ◄────────┘
//!                                          │
//!                                 ExecutionService (schedule/poll/fetch)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dutsched::config::load_config;
//! use dutsched::plan::load_plan;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("dutsched.toml"))?;
//!     let plan = load_plan(std::path::Path::new("plan.json"))?;
//!     // ... set up inventory, execution service, reporter ...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod distribution;
pub mod error;
pub mod execution;
pub mod hardware;
pub mod inventory;
pub mod orchestrator;
pub mod plan;
pub mod report;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use distribution::{DistributionEngine, DistributionPlan, Shard};
pub use error::{DispatchError, ShardError};
pub use execution::{ExecutionService, RequestMaterializer};
pub use hardware::{AtomicHardwareConfig, HardwareRequirement};
pub use inventory::FleetInventory;
pub use orchestrator::{Orchestrator, RunResult};
pub use plan::{TestCase, TestPlan};
pub use report::Reporter;
