//! Run metrics and JSON report export

use crate::bus::BusStats;
use crate::cluster::Cluster;
use chrono::{DateTime, Utc};
use domes_core::session::DropCounters;
use domes_core::{DrillResult, Notice};
use serde::{Deserialize, Serialize};

/// What one scenario run measured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub pods: usize,
    pub seed: u64,
    pub virtual_ms: u64,
    /// Virtual time until the first agreement on a master
    pub election_ms: Option<u64>,
    /// MasterChanged notices across all pods
    pub master_changes: u64,
    pub masters_at_end: usize,
    /// Largest |estimate - master clock| among synced followers at the end
    pub max_clock_error_us: Option<i64>,
    pub drill: Option<DrillResult>,
    pub bus: BusStats,
    /// Summed over all pods
    pub drops: DropCounters,
}

impl RunMetrics {
    /// Gather end-of-run numbers from the cluster
    pub fn collect(cluster: &Cluster, seed: u64) -> Self {
        let mut metrics = RunMetrics {
            pods: cluster.pods.len(),
            seed,
            virtual_ms: cluster.now() / 1_000,
            masters_at_end: cluster.masters().len(),
            bus: cluster.bus.stats().clone(),
            ..Default::default()
        };

        for (idx, pod) in cluster.pods.iter().enumerate() {
            for (_, notice) in &pod.notices {
                match notice {
                    Notice::MasterChanged { .. } => metrics.master_changes += 1,
                    Notice::DrillFinished(result) => metrics.drill = Some(result.clone()),
                }
            }

            if pod.is_live() {
                let drops = cluster.status(idx).drops;
                metrics.drops.malformed += drops.malformed;
                metrics.drops.stale += drops.stale;
                metrics.drops.duplicate_events += drops.duplicate_events;
                metrics.drops.unroutable += drops.unroutable;
            }

            if let Some(error) = cluster.clock_error_us(idx) {
                if pod.coordinator().clock().is_converged() {
                    let worst = metrics.max_clock_error_us.map_or(0, |e| e.abs());
                    if error.abs() >= worst {
                        metrics.max_clock_error_us = Some(error);
                    }
                }
            }
        }
        metrics
    }
}

/// One named check inside a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    pub fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        }
    }
}

/// Outcome of one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub description: String,
    pub passed: bool,
    pub checks: Vec<Check>,
    pub faults: Vec<(u64, String)>,
    pub metrics: RunMetrics,
    pub wall_ms: u64,
}

/// Everything one CLI invocation ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub scenarios: Vec<ScenarioReport>,
}

impl Report {
    pub fn new(scenarios: Vec<ScenarioReport>) -> Self {
        let passed = scenarios.iter().filter(|s| s.passed).count();
        Self {
            generated_at: Utc::now(),
            total: scenarios.len(),
            passed,
            failed: scenarios.len() - passed,
            scenarios,
        }
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, passed: bool) -> ScenarioReport {
        ScenarioReport {
            scenario: name.to_string(),
            description: String::new(),
            passed,
            checks: vec![Check::new("ok", passed, "")],
            faults: vec![],
            metrics: RunMetrics::default(),
            wall_ms: 1,
        }
    }

    #[test]
    fn test_report_counts() {
        let report = Report::new(vec![report("a", true), report("b", false), report("c", true)]);
        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_report_written_as_json() {
        let report = Report::new(vec![report("election", true)]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        std::fs::write(&path, report.export_json().unwrap()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["scenarios"][0]["scenario"], "election");
        assert!(value["generated_at"].is_string());
    }
}
