//! Fault injection for cluster runs
//!
//! Two kinds of fault:
//! - Radio conditions (loss, latency, jitter), fixed for a run via `FaultConfig`
//! - Timed events (partitions, crashes, reboots, resignations), scheduled on
//!   virtual time via `FaultInjector`

use crate::cluster::Cluster;
use crate::bus::BusConfig;
use domes_core::{PodInput, ResignReason, TimeUs};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Radio conditions for a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Probability of losing a frame on one link (0.0-1.0)
    pub loss_rate: f64,
    pub latency_us: u64,
    pub jitter_us: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            latency_us: 2_000,
            jitter_us: 0,
        }
    }
}

impl FaultConfig {
    /// Clean radio
    pub fn none() -> Self {
        Self::default()
    }

    /// 5% loss, a little jitter
    pub fn light() -> Self {
        Self {
            loss_rate: 0.05,
            jitter_us: 500,
            ..Default::default()
        }
    }

    /// 10% loss, more jitter
    pub fn lossy() -> Self {
        Self {
            loss_rate: 0.10,
            jitter_us: 1_500,
            ..Default::default()
        }
    }

    /// Crowded channel: 8-20ms per hop
    pub fn slow_radio() -> Self {
        Self {
            latency_us: 8_000,
            jitter_us: 12_000,
            ..Default::default()
        }
    }

    pub fn bus_config(&self, seed: u64) -> BusConfig {
        BusConfig {
            latency_us: self.latency_us,
            jitter_us: self.jitter_us,
            loss_rate: self.loss_rate,
            seed,
        }
    }
}

impl std::str::FromStr for FaultConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "clean" => Ok(FaultConfig::none()),
            "light" => Ok(FaultConfig::light()),
            "lossy" => Ok(FaultConfig::lossy()),
            "slow" | "slow-radio" | "slow_radio" => Ok(FaultConfig::slow_radio()),
            _ => Err(format!("Unknown fault profile: {}", s)),
        }
    }
}

/// A timed fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Fault {
    Partition { group_a: Vec<usize>, group_b: Vec<usize> },
    Heal,
    Crash(usize),
    /// Crash whichever pod is master at that moment
    CrashMaster,
    Reboot(usize),
    SetLoss(f64),
    /// The current master resigns
    ResignMaster,
    ForceMaster(usize),
}

/// Applies scheduled faults while driving the cluster
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    schedule: Vec<(TimeUs, Fault)>,
    /// (global time, description) of every fault applied
    applied: Vec<(TimeUs, String)>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `fault` at global time `at`
    pub fn at(mut self, at: TimeUs, fault: Fault) -> Self {
        self.schedule.push((at, fault));
        self.schedule.sort_by_key(|(t, _)| *t);
        self
    }

    pub fn applied(&self) -> &[(TimeUs, String)] {
        &self.applied
    }

    /// Drive the cluster to `end`, applying faults as their time comes
    pub fn run(&mut self, cluster: &mut Cluster, end: TimeUs) {
        while let Some((at, _)) = self.schedule.first() {
            if *at > end {
                break;
            }
            let (at, fault) = self.schedule.remove(0);
            cluster.run_until(at);
            let description = Self::apply(cluster, &fault);
            info!("Fault: {} at {}ms", description, at / 1_000);
            self.applied.push((at, description));
        }
        cluster.run_until(end);
    }

    fn apply(cluster: &mut Cluster, fault: &Fault) -> String {
        match fault {
            Fault::Partition { group_a, group_b } => {
                cluster.partition(group_a, group_b);
                format!("partition {:?} | {:?}", group_a, group_b)
            }
            Fault::Heal => {
                cluster.heal();
                "heal".to_string()
            }
            Fault::Crash(idx) => {
                cluster.crash(*idx);
                format!("crash pod {}", idx)
            }
            Fault::CrashMaster => match cluster.masters().first().copied() {
                Some(idx) => {
                    cluster.crash(idx);
                    format!("crash master (pod {})", idx)
                }
                None => {
                    warn!("Fault: No master to crash");
                    "crash master (none)".to_string()
                }
            },
            Fault::Reboot(idx) => {
                cluster.reboot(*idx);
                format!("reboot pod {}", idx)
            }
            Fault::SetLoss(rate) => {
                cluster.bus.set_loss_rate(*rate);
                format!("loss rate {:.2}", rate)
            }
            Fault::ResignMaster => match cluster.masters().first().copied() {
                Some(idx) => {
                    if let Err(e) = cluster.submit(idx, PodInput::Resign(ResignReason::Operator)) {
                        warn!("Fault: Resign refused: {}", e);
                    }
                    format!("resign master (pod {})", idx)
                }
                None => "resign master (none)".to_string(),
            },
            Fault::ForceMaster(idx) => {
                if let Err(e) = cluster.submit(*idx, PodInput::ForceMaster) {
                    warn!("Fault: Force refused: {}", e);
                }
                format!("force master pod {}", idx)
            }
        }
    }
}
