//! Virtual-time pod cluster
//!
//! Every pod is a real `SessionCoordinator` with its own drifting clock and
//! a scripted game, wired to the others through `SimBus`. Time only moves
//! when the cluster jumps to the next thing that is due (a delivery, a pod
//! deadline, a touch), so runs are deterministic for a given bus seed.

use crate::bus::{BusConfig, Delivery, SimBus};
use crate::game::{SimGame, TouchPlan};
use domes_core::election::Rank;
use domes_core::{
    Message, Notice, PodAddr, PodConfig, PodInput, PriorityScore, SessionCoordinator,
    SessionError, SessionStatus, TimeUs,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Upper bound on inputs handled in one batch; a loop feeding itself stops here
const MAX_BATCH: usize = 10_000;

/// How one simulated pod is built
#[derive(Debug, Clone, PartialEq)]
pub struct PodSpec {
    pub name: String,
    pub priority: PriorityScore,
    /// Local clock reading at global time zero
    pub clock_offset_us: u64,
    /// Local clock rate error, parts per million
    pub drift_ppm: i64,
    pub plan: TouchPlan,
    /// Global time at which the pod powers on
    pub start_at: TimeUs,
}

impl PodSpec {
    pub fn new(name: impl Into<String>, priority: PriorityScore) -> Self {
        Self {
            name: name.into(),
            priority,
            clock_offset_us: 0,
            drift_ppm: 0,
            plan: TouchPlan::After { reaction_ms: 300 },
            start_at: 0,
        }
    }

    pub fn addr(&self) -> PodAddr {
        PodAddr::from_name(&self.name)
    }

    /// `count` pods with distinct priorities, pod 0 the lowest
    pub fn numbered(count: usize) -> Vec<PodSpec> {
        (0..count)
            .map(|i| {
                let priority = PriorityScore::with_tiebreak(60 + (i as u8 % 40), 0, 0, i as u32);
                PodSpec {
                    clock_offset_us: 1_000_000 + i as u64 * 37_000,
                    ..PodSpec::new(format!("pod-{}", i), priority)
                }
            })
            .collect()
    }
}

/// One simulated pod
pub struct SimPod {
    pub spec: PodSpec,
    pub addr: PodAddr,
    coordinator: SessionCoordinator,
    inbox_tx: mpsc::UnboundedSender<PodInput>,
    inbox_rx: mpsc::UnboundedReceiver<PodInput>,
    game: SimGame,
    pub crashed: bool,
    started: bool,
    /// (global time, notice)
    pub notices: Vec<(TimeUs, Notice)>,
}

impl SimPod {
    fn boot(spec: PodSpec, config: PodConfig) -> Self {
        let addr = spec.addr();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let game = SimGame::new(spec.plan);
        let coordinator = SessionCoordinator::new(
            addr,
            spec.priority,
            config,
            Box::new(game.clone()),
            inbox_tx.clone(),
        );
        Self {
            spec,
            addr,
            coordinator,
            inbox_tx,
            inbox_rx,
            game,
            crashed: false,
            started: false,
            notices: Vec::new(),
        }
    }

    /// This pod's clock at global time `global`
    pub fn local_time(&self, global: TimeUs) -> TimeUs {
        let g = global as i128;
        let local = self.spec.clock_offset_us as i128 + g + g * self.spec.drift_ppm as i128 / 1_000_000;
        local.max(0) as TimeUs
    }

    /// Earliest global time at which this pod's clock reads `local`
    pub fn global_time(&self, local: TimeUs) -> TimeUs {
        let since_boot = local.saturating_sub(self.spec.clock_offset_us) as i128;
        let mut g = (since_boot * 1_000_000 / (1_000_000 + self.spec.drift_ppm as i128)).max(0) as TimeUs;
        while self.local_time(g) < local {
            g += 1;
        }
        while g > 0 && self.local_time(g - 1) >= local {
            g -= 1;
        }
        g
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    pub fn game(&self) -> &SimGame {
        &self.game
    }

    pub fn is_live(&self) -> bool {
        self.started && !self.crashed
    }
}

/// A group of simulated pods on one bus
pub struct Cluster {
    pub pods: Vec<SimPod>,
    pub bus: SimBus,
    config: PodConfig,
    now: TimeUs,
}

impl Cluster {
    pub fn new(specs: Vec<PodSpec>, bus_config: BusConfig, config: PodConfig) -> Self {
        let addrs = specs.iter().map(|s| s.addr()).collect();
        let pods = specs
            .into_iter()
            .map(|spec| SimPod::boot(spec, config.clone()))
            .collect();
        Self {
            pods,
            bus: SimBus::new(bus_config, addrs),
            config,
            now: 0,
        }
    }

    /// `count` numbered pods with default protocol settings
    pub fn with_pods(count: usize, bus_config: BusConfig) -> Self {
        Self::new(PodSpec::numbered(count), bus_config, PodConfig::default())
    }

    /// Global virtual time
    pub fn now(&self) -> TimeUs {
        self.now
    }

    pub fn index_of(&self, addr: PodAddr) -> Option<usize> {
        self.pods.iter().position(|p| p.addr == addr)
    }

    pub fn status(&self, idx: usize) -> SessionStatus {
        let pod = &self.pods[idx];
        pod.coordinator.status(pod.local_time(self.now))
    }

    /// Advance virtual time to `end`, processing everything due on the way
    pub fn run_until(&mut self, end: TimeUs) {
        self.process();
        while let Some(next) = self.next_event() {
            if next > end {
                break;
            }
            self.now = next.max(self.now + 1);
            self.process();
        }
        if end > self.now {
            self.now = end;
            self.process();
        }
    }

    pub fn run_for(&mut self, duration_us: TimeUs) {
        let end = self.now + duration_us;
        self.run_until(end);
    }

    /// Hand an operator request to pod `idx` now
    pub fn submit(&mut self, idx: usize, input: PodInput) -> Result<(), SessionError> {
        let now = self.now;
        let pod = &mut self.pods[idx];
        if !pod.is_live() {
            return Err(SessionError::Stopped);
        }
        let local = pod.local_time(now);
        pod.game.set_time(local, now);
        let result = pod.coordinator.handle(input, local);
        self.service(idx);
        result
    }

    /// Power a pod off; its radio goes silent at once
    pub fn crash(&mut self, idx: usize) {
        self.pods[idx].crashed = true;
        self.bus.set_down(idx, true);
        info!("Cluster: {} ({}) crashed", self.pods[idx].spec.name, self.pods[idx].addr);
    }

    /// Power a crashed pod back on with fresh state
    pub fn reboot(&mut self, idx: usize) {
        let spec = PodSpec {
            start_at: self.now,
            ..self.pods[idx].spec.clone()
        };
        self.pods[idx] = SimPod::boot(spec, self.config.clone());
        self.bus.set_down(idx, false);
        info!("Cluster: {} rebooted", self.pods[idx].spec.name);
        self.service(idx);
    }

    pub fn partition(&mut self, group_a: &[usize], group_b: &[usize]) {
        self.bus.partition(group_a, group_b);
        info!("Cluster: Partition {:?} | {:?}", group_a, group_b);
    }

    pub fn heal(&mut self) {
        self.bus.heal();
        info!("Cluster: Partitions healed");
    }

    /// Indices of live pods that consider themselves master
    pub fn masters(&self) -> Vec<usize> {
        self.pods
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_live() && p.coordinator.is_master())
            .map(|(i, _)| i)
            .collect()
    }

    /// The single master every live pod in `group` agrees on, if any
    pub fn agreed_master(&self, group: &[usize]) -> Option<usize> {
        let live: Vec<usize> = group.iter().copied().filter(|i| self.pods[*i].is_live()).collect();
        let masters: Vec<usize> = live.iter().copied().filter(|i| self.pods[*i].coordinator.is_master()).collect();
        let [master] = masters.as_slice() else {
            return None;
        };
        let addr = self.pods[*master].addr;
        live.iter()
            .all(|i| self.pods[*i].coordinator.current_master() == Some(addr))
            .then_some(*master)
    }

    /// `agreed_master` over the whole cluster
    pub fn converged_master(&self) -> Option<usize> {
        let all: Vec<usize> = (0..self.pods.len()).collect();
        self.agreed_master(&all)
    }

    /// Highest-ranked live pod in `group`
    pub fn highest_ranked(&self, group: &[usize]) -> Option<usize> {
        group
            .iter()
            .copied()
            .filter(|i| self.pods[*i].is_live())
            .max_by_key(|i| Rank(self.pods[*i].spec.priority, self.pods[*i].addr))
    }

    /// Run until `group` agrees on a master or `deadline` passes; returns the
    /// global time of agreement
    pub fn run_until_agreed(&mut self, group: &[usize], deadline: TimeUs) -> Option<TimeUs> {
        const STEP: TimeUs = 10_000;
        loop {
            if self.agreed_master(group).is_some() {
                return Some(self.now);
            }
            if self.now >= deadline {
                return None;
            }
            let next = (self.now + STEP).min(deadline);
            self.run_until(next);
        }
    }

    /// Follower's estimate of network time minus the master's clock, now
    pub fn clock_error_us(&self, idx: usize) -> Option<i64> {
        let pod = &self.pods[idx];
        let master = self.index_of(pod.coordinator.current_master()?)?;
        if master == idx || !self.pods[master].is_live() {
            return None;
        }
        let ours = pod.coordinator.network_time(pod.local_time(self.now)) as i64;
        let theirs = self.pods[master]
            .coordinator
            .network_time(self.pods[master].local_time(self.now)) as i64;
        Some(ours - theirs)
    }

    fn next_event(&self) -> Option<TimeUs> {
        let mut next = self.bus.next_due();
        let mut consider = |t: TimeUs| next = Some(next.map_or(t, |n: TimeUs| n.min(t)));

        for pod in &self.pods {
            if pod.crashed {
                continue;
            }
            if !pod.started {
                consider(pod.spec.start_at);
                continue;
            }
            if let Some(local) = pod.coordinator.next_deadline() {
                consider(pod.global_time(local));
            }
            if let Some(local) = pod.game.next_due() {
                consider(pod.global_time(local));
            }
        }
        next
    }

    fn process(&mut self) {
        for delivery in self.bus.due(self.now) {
            let pod = &self.pods[delivery.recipient()];
            let input = match delivery {
                Delivery::Frame { bytes, .. } => match Message::decode(&bytes) {
                    Ok(msg) => PodInput::Frame(msg),
                    Err(e) => PodInput::Malformed(e),
                },
                Delivery::SendFailed { seq, .. } => PodInput::DeliveryFailed { seq },
            };
            let _ = pod.inbox_tx.send(input);
        }

        for idx in 0..self.pods.len() {
            self.service(idx);
        }
    }

    /// Let pod `idx` catch up with the current time
    fn service(&mut self, idx: usize) {
        let now = self.now;
        let pod = &mut self.pods[idx];
        if pod.crashed {
            return;
        }
        let local = pod.local_time(now);

        if !pod.started {
            if now < pod.spec.start_at {
                while pod.inbox_rx.try_recv().is_ok() {}
                return;
            }
            pod.started = true;
            pod.game.set_time(local, now);
            pod.coordinator.start(local);
        }

        pod.game.set_time(local, now);
        pod.game.advance();

        let mut handled = 0;
        while let Ok(input) = pod.inbox_rx.try_recv() {
            if let Err(e) = pod.coordinator.handle(input, local) {
                debug!("Cluster: {} refused input: {}", pod.spec.name, e);
            }
            handled += 1;
            if handled >= MAX_BATCH {
                warn!("Cluster: {} input queue not draining", pod.spec.name);
                break;
            }
        }

        if pod.coordinator.next_deadline().map_or(false, |at| at <= local) {
            let _ = pod.coordinator.handle(PodInput::Tick, local);
        }

        for (dest, msg) in pod.coordinator.take_frames(local) {
            match msg.encode() {
                Ok(bytes) => {
                    self.bus
                        .submit(idx, dest, bytes, msg.msg_type().name(), msg.header.sequence, now)
                }
                Err(e) => warn!("Cluster: {} could not encode frame: {}", pod.spec.name, e),
            }
        }

        for notice in pod.coordinator.take_notices() {
            debug!("Cluster: {} notice {:?}", pod.spec.name, notice);
            pod.notices.push((now, notice));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_mapping_round_trips() {
        let mut spec = PodSpec::new("pod-x", PriorityScore::default());
        spec.clock_offset_us = 5_000;
        spec.drift_ppm = -40;
        let pod = SimPod::boot(spec, PodConfig::default());

        for global in [0u64, 1, 999_999, 12_345_678] {
            let local = pod.local_time(global);
            let back = pod.global_time(local);
            assert!(pod.local_time(back) >= local);
            assert!(back <= global);
        }
        assert_eq!(pod.local_time(1_000_000), 5_000 + 1_000_000 - 40);
    }

    #[test]
    fn test_pods_start_when_scheduled() {
        let mut specs = PodSpec::numbered(2);
        specs[1].start_at = 5_000_000;
        let mut cluster = Cluster::new(specs, BusConfig::default(), PodConfig::default());

        cluster.run_until(1_000_000);
        assert!(cluster.pods[0].is_live());
        assert!(!cluster.pods[1].is_live());

        cluster.run_until(6_000_000);
        assert!(cluster.pods[1].is_live());
    }

    #[test]
    fn test_crashed_pod_is_not_serviced() {
        let mut cluster = Cluster::with_pods(2, BusConfig::default());
        cluster.run_until(100_000);
        cluster.crash(1);
        assert!(cluster.submit(1, PodInput::ForceMaster).is_err());
        cluster.run_until(10_000_000);
        assert_eq!(cluster.masters(), vec![0]);
    }
}
