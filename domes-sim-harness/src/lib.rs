//! DOMES simulation harness
//!
//! Runs real pod coordinators against each other in virtual time:
//! - `bus` - simulated radio with latency, loss, partitions and send-failure reports
//! - `cluster` - pods with drifting clocks, stepped from one due event to the next
//! - `game` - scripted touch plans standing in for players
//! - `fault_injection` - radio profiles and timed faults
//! - `scenarios` - named runs with pass/fail checks
//! - `metrics` - per-run numbers and the JSON report

pub mod bus;
pub mod cluster;
pub mod fault_injection;
pub mod game;
pub mod metrics;
pub mod scenarios;

pub use bus::{BusConfig, SimBus};
pub use cluster::{Cluster, PodSpec, SimPod};
pub use fault_injection::{Fault, FaultConfig, FaultInjector};
pub use game::{SimGame, TouchPlan};
pub use metrics::{Report, RunMetrics, ScenarioReport};
pub use scenarios::{get_scenario, list_scenarios, run_scenario, run_suite, ScenarioError};
