//! Predefined cluster scenarios
//!
//! Each scenario builds a cluster, drives it through virtual time with
//! scheduled faults and returns a `ScenarioReport` of named checks.

use crate::cluster::{Cluster, PodSpec};
use crate::fault_injection::{Fault, FaultConfig, FaultInjector};
use crate::game::{ArmRecord, TouchPlan};
use crate::metrics::{Check, Report, RunMetrics, ScenarioReport};
use domes_core::{
    DrillProgram, DrillResult, EffectParams, Notice, PodConfig, PodInput, Round, SessionError,
    TargetSelector, TimeUs,
};
use std::time::Instant;
use thiserror::Error;
use tracing::info;

const SECOND: TimeUs = 1_000_000;

/// Errors from scenario execution
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Scenario needs at least {needed} pods, got {got}")]
    TooFewPods { needed: usize, got: usize },

    #[error("Pod refused request: {0}")]
    Session(#[from] SessionError),

    #[error("No master elected")]
    NoMaster,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A named scenario
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenarioConfig {
    pub name: &'static str,
    pub description: &'static str,
    pub default_pods: usize,
    pub min_pods: usize,
    pub fault: FaultConfig,
}

const SCENARIOS: &[&str] = &[
    "election",
    "solo",
    "split-brain",
    "failover",
    "resign",
    "clock",
    "drill",
    "drill-lossy",
];

/// All predefined scenario names
pub fn list_scenarios() -> Vec<&'static str> {
    SCENARIOS.to_vec()
}

/// Get a predefined scenario by name
pub fn get_scenario(name: &str) -> Result<ScenarioConfig, ScenarioError> {
    let config = match name.to_lowercase().as_str() {
        "election" => ScenarioConfig {
            name: "election",
            description: "Simultaneous power-on over a lightly lossy radio",
            default_pods: 5,
            min_pods: 2,
            fault: FaultConfig::light(),
        },
        "solo" => ScenarioConfig {
            name: "solo",
            description: "A single pod with no peers becomes master",
            default_pods: 1,
            min_pods: 1,
            fault: FaultConfig::none(),
        },
        "split-brain" | "split_brain" => ScenarioConfig {
            name: "split-brain",
            description: "Partition elects two masters, healing leaves the higher one",
            default_pods: 5,
            min_pods: 3,
            fault: FaultConfig::none(),
        },
        "failover" => ScenarioConfig {
            name: "failover",
            description: "Master crashes, the followers elect a successor",
            default_pods: 5,
            min_pods: 2,
            fault: FaultConfig::none(),
        },
        "resign" => ScenarioConfig {
            name: "resign",
            description: "Master resigns, the named successor takes over at once",
            default_pods: 4,
            min_pods: 2,
            fault: FaultConfig::none(),
        },
        "clock" => ScenarioConfig {
            name: "clock",
            description: "Followers with skewed, drifting clocks converge on the master",
            default_pods: 4,
            min_pods: 2,
            fault: FaultConfig {
                jitter_us: 200,
                ..FaultConfig::none()
            },
        },
        "drill" => ScenarioConfig {
            name: "drill",
            description: "Sequential drill over every pod, one player never reacts",
            default_pods: 4,
            min_pods: 2,
            fault: FaultConfig::none(),
        },
        "drill-lossy" | "drill_lossy" => ScenarioConfig {
            name: "drill-lossy",
            description: "Drill over a 10% lossy radio stays ordered",
            default_pods: 4,
            min_pods: 2,
            fault: FaultConfig::lossy(),
        },
        _ => return Err(ScenarioError::UnknownScenario(name.to_string())),
    };
    Ok(config)
}

/// Run one scenario
pub fn run_scenario(
    config: ScenarioConfig,
    pods: Option<usize>,
    seed: u64,
) -> Result<ScenarioReport, ScenarioError> {
    let pods = pods.unwrap_or(config.default_pods);
    if pods < config.min_pods {
        return Err(ScenarioError::TooFewPods {
            needed: config.min_pods,
            got: pods,
        });
    }

    let started = Instant::now();
    info!("Scenario: {} with {} pods (seed {})", config.name, pods, seed);

    let mut specs = PodSpec::numbered(pods);
    match config.name {
        "clock" => {
            for (i, spec) in specs.iter_mut().enumerate() {
                spec.clock_offset_us = 3_000_000 + i as u64 * 1_234_567;
                spec.drift_ppm = if i % 2 == 0 { 2 } else { -2 };
            }
        }
        "drill" | "drill-lossy" => {
            for (i, spec) in specs.iter_mut().enumerate() {
                spec.plan = TouchPlan::After {
                    reaction_ms: 150 + 40 * i as u64,
                };
            }
            // the lowest-ranked player never reacts
            specs[0].plan = TouchPlan::Never;
        }
        _ => {}
    }

    let mut cluster = Cluster::new(specs, config.fault.bus_config(seed), PodConfig::default());
    let mut injector = FaultInjector::new();

    let checks = match config.name {
        "election" | "solo" => election(&mut cluster, &mut injector),
        "split-brain" => split_brain(&mut cluster, &mut injector),
        "failover" => failover(&mut cluster, &mut injector),
        "resign" => resign(&mut cluster, &mut injector),
        "clock" => clock(&mut cluster),
        "drill" | "drill-lossy" => drill(&mut cluster, &mut injector),
        other => return Err(ScenarioError::UnknownScenario(other.to_string())),
    }?;

    let passed = checks.iter().all(|c| c.passed);
    info!(
        "Scenario: {} {} ({} checks)",
        config.name,
        if passed { "PASSED" } else { "FAILED" },
        checks.len()
    );

    Ok(ScenarioReport {
        scenario: config.name.to_string(),
        description: config.description.to_string(),
        passed,
        checks,
        faults: injector.applied().to_vec(),
        metrics: RunMetrics {
            election_ms: first_master_at(&cluster).map(|t| t / 1_000),
            ..RunMetrics::collect(&cluster, seed)
        },
        wall_ms: started.elapsed().as_millis() as u64,
    })
}

/// Run every scenario with its default pod count
pub fn run_suite(seed: u64) -> Result<Report, ScenarioError> {
    let mut reports = Vec::new();
    for name in list_scenarios() {
        let config = get_scenario(name)?;
        reports.push(run_scenario(config, None, seed)?);
    }
    Ok(Report::new(reports))
}

fn all(cluster: &Cluster) -> Vec<usize> {
    (0..cluster.pods.len()).collect()
}

/// Global time of the first MasterChanged notice that made a pod master
fn first_master_at(cluster: &Cluster) -> Option<TimeUs> {
    cluster
        .pods
        .iter()
        .flat_map(|p| p.notices.iter())
        .filter(|(_, n)| matches!(n, Notice::MasterChanged { is_master: true, .. }))
        .map(|(t, _)| *t)
        .min()
}

fn master_check(cluster: &Cluster, group: &[usize], label: &str) -> Check {
    let expected = cluster.highest_ranked(group);
    let agreed = cluster.agreed_master(group);
    Check::new(
        label,
        agreed.is_some() && agreed == expected,
        format!("agreed {:?}, highest ranked {:?}", agreed, expected),
    )
}

fn election(cluster: &mut Cluster, injector: &mut FaultInjector) -> Result<Vec<Check>, ScenarioError> {
    let group = all(cluster);
    let agreed_at = cluster.run_until_agreed(&group, 10 * SECOND);

    let mut checks = vec![Check::new(
        "converged",
        agreed_at.is_some(),
        format!("agreement at {:?}us", agreed_at),
    )];
    checks.push(master_check(cluster, &group, "highest ranked wins"));

    injector.run(cluster, cluster.now() + 10 * SECOND);
    checks.push(Check::new(
        "single master",
        cluster.masters().len() == 1,
        format!("masters {:?}", cluster.masters()),
    ));
    checks.push(master_check(cluster, &group, "stable"));
    Ok(checks)
}

fn split_brain(cluster: &mut Cluster, injector: &mut FaultInjector) -> Result<Vec<Check>, ScenarioError> {
    let group = all(cluster);
    cluster
        .run_until_agreed(&group, 10 * SECOND)
        .ok_or(ScenarioError::NoMaster)?;

    let split = group.len() / 2;
    let (side_a, side_b) = group.split_at(split);
    let start = cluster.now();

    let mut pending = std::mem::take(injector)
        .at(
            start + SECOND,
            Fault::Partition {
                group_a: side_a.to_vec(),
                group_b: side_b.to_vec(),
            },
        )
        .at(start + 12 * SECOND, Fault::Heal);

    pending.run(cluster, start + 11 * SECOND);
    let mut checks = vec![
        master_check(cluster, side_a, "minority side elects its own master"),
        master_check(cluster, side_b, "majority side keeps a master"),
        Check::new(
            "two masters while partitioned",
            cluster.masters().len() == 2,
            format!("masters {:?}", cluster.masters()),
        ),
    ];

    pending.run(cluster, start + 20 * SECOND);
    checks.push(master_check(cluster, &group, "one master after heal"));
    *injector = pending;
    Ok(checks)
}

fn failover(cluster: &mut Cluster, injector: &mut FaultInjector) -> Result<Vec<Check>, ScenarioError> {
    let group = all(cluster);
    let first = cluster
        .run_until_agreed(&group, 10 * SECOND)
        .and_then(|_| cluster.converged_master())
        .ok_or(ScenarioError::NoMaster)?;

    let crash_at = cluster.now() + SECOND;
    *injector = std::mem::take(injector).at(crash_at, Fault::CrashMaster);
    injector.run(cluster, crash_at);

    let survivors: Vec<usize> = group.iter().copied().filter(|i| *i != first).collect();
    let recovered = cluster.run_until_agreed(&survivors, crash_at + 10 * SECOND);

    Ok(vec![
        Check::new("old master down", cluster.pods[first].crashed, format!("pod {}", first)),
        Check::new(
            "survivors re-elect",
            recovered.is_some(),
            format!("after {:?}ms", recovered.map(|t| (t - crash_at) / 1_000)),
        ),
        master_check(cluster, &survivors, "successor is highest ranked survivor"),
    ])
}

fn resign(cluster: &mut Cluster, injector: &mut FaultInjector) -> Result<Vec<Check>, ScenarioError> {
    let group = all(cluster);
    let old = cluster
        .run_until_agreed(&group, 10 * SECOND)
        .and_then(|_| cluster.converged_master())
        .ok_or(ScenarioError::NoMaster)?;
    let others: Vec<usize> = group.iter().copied().filter(|i| *i != old).collect();
    let successor = cluster.highest_ranked(&others);

    let resign_at = cluster.now() + SECOND;
    *injector = std::mem::take(injector).at(resign_at, Fault::ResignMaster);
    injector.run(cluster, resign_at);

    // one hop later the successor has taken over, without an election
    cluster.run_until(resign_at + 3 * cluster.bus.config().latency_us);
    let fast = cluster.masters();

    cluster.run_until(resign_at + SECOND);
    Ok(vec![
        Check::new(
            "successor takes over within one hop",
            successor.is_some() && fast == successor.into_iter().collect::<Vec<_>>(),
            format!("masters {:?}, successor {:?}", fast, successor),
        ),
        Check::new(
            "everyone follows the successor",
            cluster.converged_master() == successor,
            format!("converged on {:?}", cluster.converged_master()),
        ),
        Check::new(
            "old master follows",
            !cluster.pods[old].coordinator().is_master(),
            format!("pod {}", old),
        ),
    ])
}

fn clock(cluster: &mut Cluster) -> Result<Vec<Check>, ScenarioError> {
    let group = all(cluster);
    let master = cluster
        .run_until_agreed(&group, 10 * SECOND)
        .and_then(|_| cluster.converged_master())
        .ok_or(ScenarioError::NoMaster)?;

    cluster.run_for(10 * SECOND);

    let mut checks = Vec::new();
    for idx in group.into_iter().filter(|i| *i != master) {
        let converged = cluster.pods[idx].coordinator().clock().is_converged();
        let error = cluster.clock_error_us(idx);
        checks.push(Check::new(
            &format!("pod {} within 200us", idx),
            converged && error.map_or(false, |e| e.abs() < 200),
            format!("converged {}, error {:?}us", converged, error),
        ));
    }
    Ok(checks)
}

/// Sequential drill touching every pod, alternating synchronized rounds
pub fn sequential_program(rounds: usize) -> DrillProgram {
    let rounds = (0..rounds)
        .map(|i| Round {
            effect: EffectParams::solid(0, 40 * (i as u8 % 6), 255),
            synchronized: i % 2 == 1,
            ..Round::new(TargetSelector::Sequential, 1_000)
        })
        .collect();
    DrillProgram::new("sequential", rounds)
}

/// The drill result reported by `master`, if finished
pub fn drill_result(cluster: &Cluster, master: usize) -> Option<DrillResult> {
    cluster.pods[master].notices.iter().find_map(|(_, n)| match n {
        Notice::DrillFinished(result) => Some(result.clone()),
        _ => None,
    })
}

/// Arm cycles of all pods, merged in global time order
pub fn merged_arm_log(cluster: &Cluster) -> Vec<ArmRecord> {
    let mut log: Vec<ArmRecord> = cluster.pods.iter().flat_map(|p| p.game().arm_log()).collect();
    log.sort_by_key(|r| r.armed_at);
    log
}

/// No two arm cycles anywhere in the cluster overlap
pub fn arms_never_overlap(log: &[ArmRecord]) -> bool {
    log.windows(2)
        .all(|w| w[0].ended_at.map_or(false, |end| end <= w[1].armed_at))
}

fn drill(cluster: &mut Cluster, injector: &mut FaultInjector) -> Result<Vec<Check>, ScenarioError> {
    let group = all(cluster);
    let master = cluster
        .run_until_agreed(&group, 10 * SECOND)
        .and_then(|_| cluster.converged_master())
        .ok_or(ScenarioError::NoMaster)?;

    // let clocks settle for the synchronized rounds
    cluster.run_for(2 * SECOND);

    let rounds = 2 * group.len();
    cluster.submit(master, PodInput::StartDrill(sequential_program(rounds)))?;
    let end = cluster.now() + rounds as u64 * 2 * SECOND;
    while cluster.now() < end && drill_result(cluster, master).is_none() {
        let next = (cluster.now() + 100_000).min(end);
        injector.run(cluster, next);
    }

    let Some(result) = drill_result(cluster, master) else {
        return Ok(vec![Check::new("drill finished", false, "no result before deadline")]);
    };

    let indices: Vec<u32> = result.rounds.iter().map(|r| r.round).collect();
    let ordered = indices.windows(2).all(|w| w[1] == w[0] + 1) && indices.first().map_or(true, |i| *i == 0);
    let log = merged_arm_log(cluster);
    let silent = cluster.pods[0].addr;

    let mut checks = vec![
        Check::new("drill finished", !result.aborted, format!("aborted {}", result.aborted)),
        Check::new(
            "one result per round",
            result.rounds.len() == rounds,
            format!("{} of {}", result.rounds.len(), rounds),
        ),
        Check::new("rounds strictly ordered", ordered, format!("{:?}", indices)),
        Check::new(
            "arm cycles never overlap",
            arms_never_overlap(&log),
            format!("{} arm cycles", log.len()),
        ),
        Check::new(
            "silent player always times out",
            result.rounds.iter().filter(|r| r.pod == silent).all(|r| r.timed_out()),
            format!("{} miss(es)", result.misses),
        ),
    ];

    if cluster.bus.config().loss_rate == 0.0 {
        let exact = result.rounds.iter().filter(|r| !r.timed_out()).all(|r| {
            let idx = cluster.index_of(r.pod);
            let plan = idx.map(|i| cluster.pods[i].spec.plan);
            match (plan, r.reaction_us()) {
                (Some(TouchPlan::After { reaction_ms }), Some(us)) => us as u64 == reaction_ms * 1_000,
                _ => false,
            }
        });
        checks.push(Check::new(
            "reaction times measured on the pod",
            exact,
            format!("avg {:?}us", result.avg_reaction_us),
        ));
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_scenario_resolves() {
        for name in list_scenarios() {
            assert_eq!(get_scenario(name).unwrap().name, name);
        }
        assert!(matches!(
            get_scenario("byzantine"),
            Err(ScenarioError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_too_few_pods_refused() {
        let config = get_scenario("split-brain").unwrap();
        assert!(matches!(
            run_scenario(config, Some(2), 1),
            Err(ScenarioError::TooFewPods { needed: 3, got: 2 })
        ));
    }

    #[test]
    fn test_overlap_detection() {
        let record = |armed_at, ended_at| ArmRecord {
            cycle: 1,
            armed_at,
            ended_at,
            outcome: None,
        };
        assert!(arms_never_overlap(&[record(0, Some(10)), record(10, Some(20))]));
        assert!(!arms_never_overlap(&[record(0, Some(15)), record(10, Some(20))]));
        assert!(!arms_never_overlap(&[record(0, None), record(10, Some(20))]));
    }

    #[test]
    fn test_solo_scenario_passes() {
        let report = run_scenario(get_scenario("solo").unwrap(), None, 1).unwrap();
        assert!(report.passed, "{:?}", report.checks);
    }
}
