//! Simulated radio bus
//!
//! Frames travel between pods as encoded bytes with a per-link latency,
//! random loss, partitions and crashed endpoints. A unicast that does not
//! arrive is reported back to the sender as a send failure, the way the
//! radio's link-layer ack does; a lost broadcast vanishes silently.

use bytes::Bytes;
use domes_core::outbox::Destination;
use domes_core::{PodAddr, TimeUs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use tracing::debug;

/// Bus parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusConfig {
    /// One-way latency, microseconds
    pub latency_us: u64,
    /// Extra latency drawn uniformly from 0..=jitter_us
    pub jitter_us: u64,
    /// Probability of losing a frame on one link (0.0-1.0)
    pub loss_rate: f64,
    pub seed: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            latency_us: 2_000,
            jitter_us: 0,
            loss_rate: 0.0,
            seed: 1,
        }
    }
}

/// What the bus hands to a pod
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Frame { to: usize, from: usize, bytes: Bytes },
    SendFailed { to: usize, seq: u16 },
}

impl Delivery {
    pub fn recipient(&self) -> usize {
        match self {
            Delivery::Frame { to, .. } | Delivery::SendFailed { to, .. } => *to,
        }
    }
}

#[derive(Debug)]
struct Scheduled {
    due: TimeUs,
    order: u64,
    delivery: Delivery,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and we want the earliest first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.order).cmp(&(self.due, self.order))
    }
}

/// Bus counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub blocked: u64,
    pub send_failures: u64,
    pub by_type: BTreeMap<String, u64>,
}

/// In-memory radio shared by all simulated pods
pub struct SimBus {
    config: BusConfig,
    addrs: Vec<PodAddr>,
    index: HashMap<PodAddr, usize>,
    queue: BinaryHeap<Scheduled>,
    order: u64,
    rng: StdRng,
    /// Directed links that drop everything
    cut: HashSet<(usize, usize)>,
    /// Pods whose radio is off
    down: HashSet<usize>,
    link_latency: HashMap<(usize, usize), u64>,
    stats: BusStats,
}

impl SimBus {
    pub fn new(config: BusConfig, addrs: Vec<PodAddr>) -> Self {
        let index = addrs.iter().enumerate().map(|(i, a)| (*a, i)).collect();
        Self {
            config,
            addrs,
            index,
            queue: BinaryHeap::new(),
            order: 0,
            rng: StdRng::seed_from_u64(config.seed),
            cut: HashSet::new(),
            down: HashSet::new(),
            link_latency: HashMap::new(),
            stats: BusStats::default(),
        }
    }

    pub fn config(&self) -> BusConfig {
        self.config
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn set_loss_rate(&mut self, loss_rate: f64) {
        self.config.loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    /// Fixed latency for the link `from -> to`
    pub fn set_link_latency(&mut self, from: usize, to: usize, latency_us: u64) {
        self.link_latency.insert((from, to), latency_us);
    }

    pub fn can_reach(&self, from: usize, to: usize) -> bool {
        !self.down.contains(&from) && !self.down.contains(&to) && !self.cut.contains(&(from, to))
    }

    /// Cut every link between the two groups, both directions
    pub fn partition(&mut self, group_a: &[usize], group_b: &[usize]) {
        for &a in group_a {
            for &b in group_b {
                self.cut.insert((a, b));
                self.cut.insert((b, a));
            }
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    pub fn set_down(&mut self, pod: usize, down: bool) {
        if down {
            self.down.insert(pod);
        } else {
            self.down.remove(&pod);
        }
    }

    /// Earliest pending delivery
    pub fn next_due(&self) -> Option<TimeUs> {
        self.queue.peek().map(|s| s.due)
    }

    /// Put one encoded frame on the air at time `now`
    pub fn submit(
        &mut self,
        from: usize,
        dest: Destination,
        bytes: Bytes,
        kind: &str,
        seq: u16,
        now: TimeUs,
    ) {
        self.stats.sent += 1;
        *self.stats.by_type.entry(kind.to_string()).or_insert(0) += 1;

        match dest {
            Destination::Broadcast => {
                for to in 0..self.addrs.len() {
                    if to != from && self.link_ok(from, to) {
                        let due = now + self.latency(from, to);
                        self.schedule(due, Delivery::Frame { to, from, bytes: bytes.clone() });
                    }
                }
            }
            Destination::Unicast(addr) => {
                let latency = self.config.latency_us;
                match self.index.get(&addr).copied() {
                    Some(to) if self.link_ok(from, to) => {
                        let due = now + self.latency(from, to);
                        self.schedule(due, Delivery::Frame { to, from, bytes });
                    }
                    _ => {
                        self.stats.send_failures += 1;
                        debug!("Bus: {} seq {} from {} to {} not acknowledged", kind, seq, from, addr);
                        self.schedule(now + 2 * latency, Delivery::SendFailed { to: from, seq });
                    }
                }
            }
        }
    }

    /// Pop every delivery due at or before `now`, in order
    pub fn due(&mut self, now: TimeUs) -> Vec<Delivery> {
        let mut out = Vec::new();
        while self.queue.peek().map_or(false, |s| s.due <= now) {
            if let Some(scheduled) = self.queue.pop() {
                let to = scheduled.delivery.recipient();
                if self.down.contains(&to) {
                    self.stats.blocked += 1;
                    continue;
                }
                self.stats.delivered += 1;
                out.push(scheduled.delivery);
            }
        }
        out
    }

    fn link_ok(&mut self, from: usize, to: usize) -> bool {
        if !self.can_reach(from, to) {
            self.stats.blocked += 1;
            return false;
        }
        if self.config.loss_rate > 0.0 && self.rng.gen_bool(self.config.loss_rate) {
            self.stats.lost += 1;
            return false;
        }
        true
    }

    fn latency(&mut self, from: usize, to: usize) -> u64 {
        let base = self
            .link_latency
            .get(&(from, to))
            .copied()
            .unwrap_or(self.config.latency_us);
        if self.config.jitter_us == 0 {
            base
        } else {
            base + self.rng.gen_range(0..=self.config.jitter_us)
        }
    }

    fn schedule(&mut self, due: TimeUs, delivery: Delivery) {
        self.order += 1;
        self.queue.push(Scheduled {
            due,
            order: self.order,
            delivery,
        });
    }
}
