//! Clock synchronization against the master's clock.
//!
//! Followers run a four-timestamp exchange with the master:
//! - follower sends SYNC_REQUEST stamped `t1` (local)
//! - master stamps receipt `t2` and reply `t3` (master clock)
//! - follower receives the reply at `t4` (local)
//!
//! `rtt = (t4 - t1) - (t3 - t2)`, `offset = ((t2 - t1) + (t3 - t4)) / 2`,
//! where offset is master minus local. Accepted offsets pass a median over the
//! last 8 samples, then an EMA whose weight drops once the estimate has
//! converged. The master also broadcasts TIME_BEACONs, used to seed pods with
//! no estimate and to nudge converged estimates that drift.

use crate::codec::{Message, Payload};
use crate::config::ClockSyncConfig;
use crate::outbox::Outbox;
use crate::types::{ms, PodAddr, TimeUs};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Accepted raw offsets kept for the median
pub const SAMPLE_RING: usize = 8;

/// Snapshot of a pod's clock estimate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClockEstimate {
    /// Master clock minus local clock
    pub offset_us: i64,
    pub rtt_us: u64,
    pub jitter_us: u64,
    /// Accepted exchange samples since the last reset
    pub samples: u32,
    /// Local time of the last accepted sample (0 = never)
    pub last_update: TimeUs,
    /// 0-100
    pub quality: u8,
}

/// Round trip and offset of one exchange, in microseconds
pub fn compute_sample(t1: TimeUs, t2: TimeUs, t3: TimeUs, t4: TimeUs) -> (i64, i64) {
    let (t1, t2, t3, t4) = (t1 as i64, t2 as i64, t3 as i64, t4 as i64);
    let rtt = (t4 - t1) - (t3 - t2);
    let offset = ((t2 - t1) + (t3 - t4)) / 2;
    (rtt, offset)
}

fn median(values: &VecDeque<i64>) -> i64 {
    let mut sorted: Vec<i64> = values.iter().copied().collect();
    sorted.sort_unstable();
    let n = sorted.len();
    if n == 0 {
        0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2
    }
}

/// Per-pod offset estimator
pub struct ClockSyncService {
    config: ClockSyncConfig,
    master: Option<PodAddr>,
    is_master: bool,
    ring: VecDeque<i64>,
    /// Filtered offset, master minus local
    filtered: f64,
    jitter: f64,
    rtt_us: u64,
    accepted: u32,
    /// Estimate came from a beacon, not yet refined
    seeded: bool,
    last_update: TimeUs,
    /// `t1` of the outstanding request and when it expires
    pending: Option<(TimeUs, TimeUs)>,
    next_exchange: TimeUs,
    next_beacon: TimeUs,
    rejected: u64,
    stale: u64,
    drift_corrections: u64,
}

impl ClockSyncService {
    pub fn new(config: ClockSyncConfig) -> Self {
        Self {
            config,
            master: None,
            is_master: false,
            ring: VecDeque::with_capacity(SAMPLE_RING),
            filtered: 0.0,
            jitter: 0.0,
            rtt_us: 0,
            accepted: 0,
            seeded: false,
            last_update: 0,
            pending: None,
            next_exchange: 0,
            next_beacon: 0,
            rejected: 0,
            stale: 0,
            drift_corrections: 0,
        }
    }

    /// Current offset estimate (master minus local), zero on the master
    pub fn offset_us(&self) -> i64 {
        if self.is_master {
            0
        } else {
            self.filtered.round() as i64
        }
    }

    /// Network time at local time `local_now`
    pub fn now(&self, local_now: TimeUs) -> TimeUs {
        self.local_to_network(local_now)
    }

    pub fn local_to_network(&self, local: TimeUs) -> TimeUs {
        (local as i64 + self.offset_us()).max(0) as TimeUs
    }

    pub fn network_to_local(&self, network: TimeUs) -> TimeUs {
        (network as i64 - self.offset_us()).max(0) as TimeUs
    }

    pub fn is_converged(&self) -> bool {
        self.is_master || self.accepted >= self.config.fast_samples
    }

    /// Samples discarded for an out-of-bounds round trip
    pub fn rejected_samples(&self) -> u64 {
        self.rejected
    }

    /// Responses dropped for not matching the outstanding request
    pub fn stale_responses(&self) -> u64 {
        self.stale
    }

    pub fn drift_corrections(&self) -> u64 {
        self.drift_corrections
    }

    /// 0-100, from convergence, jitter and staleness
    pub fn quality(&self, now: TimeUs) -> u8 {
        if self.is_master {
            return 100;
        }
        if self.accepted == 0 {
            return if self.seeded { 20 } else { 0 };
        }

        let base: i64 = if self.accepted >= self.config.fast_samples {
            100
        } else {
            40 + 12 * self.accepted as i64
        };
        let jitter_penalty = (self.jitter / 20.0) as i64;
        let age = now.saturating_sub(self.last_update);
        let stale_after = ms(self.config.stale_after_ms);
        let stale_penalty = if age > stale_after {
            ((age - stale_after) / ms(100)) as i64
        } else {
            0
        };

        (base - jitter_penalty - stale_penalty).clamp(0, 100) as u8
    }

    pub fn estimate(&self, now: TimeUs) -> ClockEstimate {
        ClockEstimate {
            offset_us: self.offset_us(),
            rtt_us: self.rtt_us,
            jitter_us: self.jitter.round() as u64,
            samples: self.accepted,
            last_update: self.last_update,
            quality: self.quality(now),
        }
    }

    /// Forget everything; called on every master change
    pub fn reset(&mut self, master: Option<PodAddr>, is_master: bool, now: TimeUs) {
        info!(
            "ClockSync: Reset (master {:?}, local master: {})",
            master, is_master
        );
        self.master = master;
        self.is_master = is_master;
        self.ring.clear();
        self.filtered = 0.0;
        self.jitter = 0.0;
        self.rtt_us = 0;
        self.accepted = 0;
        self.seeded = false;
        self.last_update = 0;
        self.pending = None;
        self.next_exchange = now;
        self.next_beacon = now;
    }

    /// Earliest local time at which `tick` has work to do
    pub fn next_deadline(&self) -> Option<TimeUs> {
        if self.is_master {
            return Some(self.next_beacon);
        }
        self.master?;
        match self.pending {
            Some((_, expires)) => Some(expires),
            None => Some(self.next_exchange),
        }
    }

    pub fn tick(&mut self, now: TimeUs, out: &mut Outbox) {
        if self.is_master {
            if now >= self.next_beacon {
                out.broadcast(Payload::TimeBeacon {
                    master_time: now,
                    quality: 100,
                });
                self.next_beacon = now + ms(self.config.beacon_interval_ms);
            }
            return;
        }

        let Some(master) = self.master else {
            return;
        };

        if let Some((t1, expires)) = self.pending {
            if now < expires {
                return;
            }
            debug!("ClockSync: Request t1={} timed out", t1);
            self.pending = None;
        }

        if now >= self.next_exchange {
            out.send(master, Payload::SyncRequest { t1: now });
            self.pending = Some((now, now + ms(self.config.request_timeout_ms)));
            let interval = if self.is_converged() {
                self.config.slow_interval_ms
            } else {
                self.config.fast_interval_ms
            };
            self.next_exchange = now + ms(interval);
        }
    }

    /// Handle a clock frame received at local time `now`
    pub fn on_message(&mut self, msg: &Message, now: TimeUs, out: &mut Outbox) {
        let from = msg.sender();
        match msg.payload {
            Payload::SyncRequest { t1 } => {
                if !self.is_master {
                    debug!("ClockSync: Ignoring request from {}, not master", from);
                    return;
                }
                // The master's local clock is network time.
                out.send(from, Payload::SyncResponse { t1, t2: now, t3: now });
            }

            Payload::SyncResponse { t1, t2, t3 } => {
                if self.is_master || self.master != Some(from) {
                    return;
                }
                match self.pending {
                    Some((pending_t1, _)) if pending_t1 == t1 => {
                        self.pending = None;
                        self.add_sample(t1, t2, t3, now);
                    }
                    _ => {
                        self.stale += 1;
                        debug!("ClockSync: Dropping stale response t1={} from {}", t1, from);
                    }
                }
            }

            Payload::TimeBeacon { master_time, quality } => {
                if self.is_master || self.master != Some(from) {
                    return;
                }
                self.on_beacon(master_time, quality, now);
            }

            _ => {}
        }
    }

    /// Feed one exchange; returns false if the sample was discarded
    pub fn add_sample(&mut self, t1: TimeUs, t2: TimeUs, t3: TimeUs, t4: TimeUs) -> bool {
        let (rtt, raw) = compute_sample(t1, t2, t3, t4);
        if rtt < 0 || rtt as u64 > self.config.max_rtt_us {
            self.rejected += 1;
            debug!("ClockSync: Rejected sample, rtt {}us", rtt);
            return false;
        }

        if self.ring.len() == SAMPLE_RING {
            self.ring.pop_front();
        }
        self.ring.push_back(raw);
        let med = median(&self.ring) as f64;

        if self.accepted == 0 && !self.seeded {
            self.filtered = med;
        } else {
            let alpha = if self.accepted < self.config.fast_samples {
                self.config.fast_alpha
            } else {
                self.config.slow_alpha
            };
            self.filtered += alpha * (med - self.filtered);
            self.jitter += alpha * ((raw as f64 - self.filtered).abs() - self.jitter);
        }

        self.accepted += 1;
        self.seeded = false;
        self.rtt_us = rtt as u64;
        self.last_update = t4;

        if self.accepted == self.config.fast_samples {
            info!(
                "ClockSync: Converged, offset {}us rtt {}us jitter {:.0}us",
                self.offset_us(),
                self.rtt_us,
                self.jitter
            );
        }
        true
    }

    fn on_beacon(&mut self, master_time: TimeUs, quality: u8, now: TimeUs) {
        let implied = (master_time + self.config.beacon_one_way_us) as i64 - now as i64;

        if self.accepted == 0 {
            if !self.seeded {
                self.filtered = implied as f64;
                self.seeded = true;
                debug!(
                    "ClockSync: Seeded from beacon, offset {}us (master quality {})",
                    implied, quality
                );
            }
            return;
        }

        if !self.is_converged() {
            return;
        }

        let diff = implied as f64 - self.filtered;
        if diff.abs() > self.config.drift_threshold_us as f64 {
            let nudge = diff / 2.0;
            self.filtered += nudge;
            for sample in self.ring.iter_mut() {
                *sample += nudge as i64;
            }
            self.drift_corrections += 1;
            warn!(
                "ClockSync: Beacon disagrees by {:.0}us, nudged by {:.0}us",
                diff, nudge
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_addr() -> PodAddr {
        PodAddr([0x02, 0, 0, 0, 0, 1])
    }

    fn follower() -> ClockSyncService {
        let mut sync = ClockSyncService::new(ClockSyncConfig::default());
        sync.reset(Some(master_addr()), false, 0);
        sync
    }

    #[test]
    fn test_offset_formula() {
        let (rtt, offset) = compute_sample(1000, 1300, 1310, 1900);
        assert_eq!(rtt, 890);
        assert_eq!(offset, -145);
    }

    #[test]
    fn test_first_sample_taken_directly() {
        let mut sync = follower();
        assert!(sync.add_sample(1000, 1300, 1310, 1900));
        assert_eq!(sync.offset_us(), -145);
        assert_eq!(sync.local_to_network(10_000), 9_855);
        assert_eq!(sync.network_to_local(9_855), 10_000);
    }

    #[test]
    fn test_rejects_large_rtt() {
        let mut sync = follower();
        sync.add_sample(1000, 1300, 1310, 1900);
        let before = sync.estimate(2000);

        assert!(!sync.add_sample(0, 100, 110, 60_010));
        assert_eq!(sync.rejected_samples(), 1);
        assert_eq!(sync.estimate(2000), before);
    }

    #[test]
    fn test_rejects_negative_rtt() {
        let mut sync = follower();
        assert!(!sync.add_sample(1000, 5000, 9000, 1100));
        assert_eq!(sync.estimate(0).samples, 0);
    }

    #[test]
    fn test_median_rejects_single_outlier() {
        let mut sync = follower();
        for i in 0..6u64 {
            let t1 = i * 10_000;
            // true offset +500, one-way 300
            sync.add_sample(t1, t1 + 800, t1 + 810, t1 + 610);
        }
        let settled = sync.offset_us();
        // one sample with a 20ms asymmetric path
        sync.add_sample(100_000, 100_000 + 20_300, 100_000 + 20_310, 100_000 + 20_610);
        assert!((sync.offset_us() - settled).abs() < 100);
    }

    #[test]
    fn test_converges_from_beacon_seed() {
        let mut sync = follower();
        let true_offset: i64 = 7_000;
        let one_way: u64 = 400;
        let mut out = Outbox::new();

        // beacon seeds with an assumed delay that is 600us off
        let beacon = Message::new(
            master_addr(),
            0,
            0,
            Payload::TimeBeacon {
                master_time: (10_000i64 + true_offset) as u64,
                quality: 100,
            },
        );
        sync.on_message(&beacon, 10_000 + one_way, &mut out);
        let seeded_error = (sync.offset_us() - true_offset).abs();
        assert!(seeded_error > 200);

        let mut errors = Vec::new();
        for i in 1..=10u64 {
            let t1 = 20_000 * i;
            let t2 = (t1 as i64 + one_way as i64 + true_offset) as u64;
            let t3 = t2 + 20;
            let t4 = (t3 as i64 - true_offset) as u64 + one_way;
            sync.add_sample(t1, t2, t3, t4);
            errors.push((sync.offset_us() - true_offset).abs());
        }
        assert!(errors.windows(2).all(|w| w[1] <= w[0]));
        assert!(errors[9] < 200);
        assert!(sync.is_converged());
        assert!(sync.quality(220_000) > 80);
    }

    #[test]
    fn test_reset_zeroes_estimate() {
        let mut sync = follower();
        sync.add_sample(1000, 1300, 1310, 1900);
        sync.reset(Some(master_addr()), false, 5_000);
        let est = sync.estimate(5_000);
        assert_eq!(est.offset_us, 0);
        assert_eq!(est.samples, 0);
        assert_eq!(est.quality, 0);
    }

    #[test]
    fn test_master_offset_is_zero() {
        let mut sync = ClockSyncService::new(ClockSyncConfig::default());
        sync.reset(Some(master_addr()), true, 0);
        assert_eq!(sync.offset_us(), 0);
        assert_eq!(sync.quality(1_000_000), 100);
        assert_eq!(sync.now(12_345), 12_345);

        let mut out = Outbox::new();
        sync.tick(0, &mut out);
        assert!(matches!(out.drain()[0].payload, Payload::TimeBeacon { master_time: 0, .. }));
    }

    #[test]
    fn test_exchange_over_messages() {
        let mut sync = follower();
        let mut out = Outbox::new();
        sync.tick(1_000, &mut out);
        let frames = out.drain();
        assert!(matches!(frames[0].payload, Payload::SyncRequest { t1: 1_000 }));

        // stale reply is dropped
        let stale = Message::new(
            master_addr(),
            1,
            0,
            Payload::SyncResponse { t1: 1, t2: 2, t3: 3 },
        );
        sync.on_message(&stale, 1_500, &mut out);
        assert_eq!(sync.stale_responses(), 1);

        let reply = Message::new(
            master_addr(),
            2,
            0,
            Payload::SyncResponse { t1: 1_000, t2: 51_300, t3: 51_310 },
        );
        sync.on_message(&reply, 1_610, &mut out);
        assert_eq!(sync.estimate(1_610).samples, 1);
        assert_eq!(sync.offset_us(), 50_000);
    }

    #[test]
    fn test_unanswered_request_expires() {
        let mut sync = follower();
        let mut out = Outbox::new();
        sync.tick(0, &mut out);
        assert_eq!(sync.next_deadline(), Some(ms(200)));
        sync.tick(ms(200), &mut out);
        // expired and re-sent in the same tick
        assert_eq!(out.drain().len(), 2);
    }

    #[test]
    fn test_beacon_drift_nudge() {
        let mut sync = follower();
        for i in 0..5u64 {
            let t1 = i * 10_000;
            sync.add_sample(t1, t1 + 300, t1 + 300, t1 + 600);
        }
        assert!(sync.is_converged());
        assert_eq!(sync.offset_us(), 0);

        let mut out = Outbox::new();
        // beacon implies +10ms
        let beacon = Message::new(
            master_addr(),
            0,
            0,
            Payload::TimeBeacon { master_time: 110_000, quality: 100 },
        );
        sync.on_message(&beacon, 101_000, &mut out);
        assert_eq!(sync.drift_corrections(), 1);
        assert_eq!(sync.offset_us(), 5_000);
    }
}
