//! Cluster-level election properties
//!
//! - Simultaneous power-on converges on the highest-ranked pod, lossy radio included,
//!   and within the election windows when nothing is lost
//! - A lone pod becomes master within one election cycle
//! - A late joiner follows the existing master instead of preempting it
//! - Partitions elect one master per side; healing leaves the higher one within a heartbeat
//! - Forced master beats rank; crashes and resignations hand over

use domes_core::{ElectionState, PodConfig, PodInput, PriorityScore, ResignReason};
use domes_sim::{BusConfig, Cluster, PodSpec};
use proptest::prelude::*;

const SECOND: u64 = 1_000_000;

fn cluster(count: usize) -> Cluster {
    Cluster::with_pods(count, BusConfig::default())
}

fn converged(cluster: &mut Cluster, within: u64) -> usize {
    let group: Vec<usize> = (0..cluster.pods.len()).collect();
    let deadline = cluster.now() + within;
    cluster
        .run_until_agreed(&group, deadline)
        .and_then(|_| cluster.converged_master())
        .expect("cluster did not agree on a master")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// All pods power on together: exactly one master, the highest ranked
    #[test]
    fn simultaneous_start_elects_highest_ranked(
        batteries in prop::collection::vec(1u8..=100u8, 2..=6),
        seed in any::<u64>(),
        loss in 0.0f64..0.10f64,
    ) {
        let specs: Vec<PodSpec> = batteries
            .iter()
            .enumerate()
            .map(|(i, b)| PodSpec::new(format!("pod-{}", i), PriorityScore::with_tiebreak(*b, 0, 0, 7)))
            .collect();
        let bus = BusConfig { loss_rate: loss, jitter_us: 800, seed, ..Default::default() };
        let mut cluster = Cluster::new(specs, bus, PodConfig::default());
        let group: Vec<usize> = (0..cluster.pods.len()).collect();

        let agreed = cluster.run_until_agreed(&group, 10 * SECOND);
        prop_assert!(agreed.is_some(), "no agreement, masters {:?}", cluster.masters());
        prop_assert_eq!(cluster.masters().len(), 1);
        prop_assert_eq!(cluster.converged_master(), cluster.highest_ranked(&group));
    }
}

#[test]
fn test_solo_pod_becomes_master_within_one_cycle() {
    let mut cluster = cluster(1);
    let config = PodConfig::default().election;
    let bound = (config.discovery_window_ms + config.campaign_window_ms + config.vote_window_ms) * 1_000;

    cluster.run_until(bound - 1);
    assert!(cluster.masters().is_empty());
    cluster.run_until(bound + 1_000);
    assert_eq!(cluster.masters(), vec![0]);
    assert_eq!(cluster.status(0).state, ElectionState::Master);
}

#[test]
fn test_lossless_start_agrees_within_election_windows() {
    let config = PodConfig::default().election;
    let windows = (config.discovery_window_ms + config.campaign_window_ms + config.vote_window_ms) * 1_000;
    let latency = BusConfig::default().latency_us;
    // run_until_agreed samples every 10ms
    let bound = windows + 2 * latency + 10_000;

    for count in 2..=6 {
        let mut cluster = cluster(count);
        let group: Vec<usize> = (0..count).collect();
        let agreed = cluster
            .run_until_agreed(&group, bound)
            .unwrap_or_else(|| panic!("{} pods not agreed by {}us, masters {:?}", count, bound, cluster.masters()));
        assert!(agreed <= bound);
        assert_eq!(cluster.converged_master(), cluster.highest_ranked(&group));
        assert_eq!(cluster.converged_master(), Some(count - 1));
    }
}

#[test]
fn test_late_joiner_follows_existing_master() {
    let mut specs = PodSpec::numbered(4);
    specs[3].start_at = 6 * SECOND;
    let mut cluster = Cluster::new(specs, BusConfig::default(), PodConfig::default());

    cluster.run_until(5 * SECOND);
    let first = cluster.agreed_master(&[0, 1, 2]).expect("no master among early pods");
    assert_eq!(first, 2);

    cluster.run_until(12 * SECOND);
    // pod 3 outranks everyone but does not take over a live session
    assert_eq!(cluster.converged_master(), Some(first));
    assert_eq!(cluster.status(3).state, ElectionState::Follower);
}

#[test]
fn test_partition_then_heal() {
    let mut cluster = cluster(5);
    assert_eq!(converged(&mut cluster, 10 * SECOND), 4);

    cluster.partition(&[0, 1], &[2, 3, 4]);
    cluster.run_for(8 * SECOND);
    assert_eq!(cluster.agreed_master(&[0, 1]), Some(1));
    assert_eq!(cluster.agreed_master(&[2, 3, 4]), Some(4));
    assert_eq!(cluster.masters(), vec![1, 4]);

    cluster.heal();
    cluster.run_for(3 * SECOND);
    assert_eq!(cluster.converged_master(), Some(4));
}

#[test]
fn test_split_brain_resolves_within_one_heartbeat() {
    let mut cluster = cluster(5);
    assert_eq!(converged(&mut cluster, 10 * SECOND), 4);
    cluster.partition(&[0, 1], &[2, 3, 4]);
    cluster.run_for(8 * SECOND);
    assert_eq!(cluster.masters(), vec![1, 4]);

    let heartbeat = PodConfig::default().election.heartbeat_interval_ms * 1_000;
    let latency = BusConfig::default().latency_us;
    let healed_at = cluster.now();
    cluster.heal();

    let group: Vec<usize> = (0..5).collect();
    let bound = healed_at + heartbeat + latency + 10_000;
    let agreed = cluster
        .run_until_agreed(&group, bound)
        .unwrap_or_else(|| panic!("still split at {}us, masters {:?}", bound, cluster.masters()));
    assert!(agreed - healed_at <= heartbeat + latency + 10_000);
    assert_eq!(cluster.converged_master(), Some(4));
    assert_eq!(cluster.status(1).state, ElectionState::Follower);
}

#[test]
fn test_forced_master_outranks_elected_master() {
    let mut cluster = cluster(4);
    assert_eq!(converged(&mut cluster, 10 * SECOND), 3);

    cluster.submit(0, PodInput::ForceMaster).unwrap();
    cluster.run_for(2 * SECOND);

    assert_eq!(cluster.converged_master(), Some(0));
    assert_eq!(cluster.status(0).state, ElectionState::ForcedMaster);
}

#[test]
fn test_master_crash_triggers_reelection() {
    let mut cluster = cluster(4);
    let first = converged(&mut cluster, 10 * SECOND);
    let crash_at = cluster.now();
    cluster.crash(first);

    let survivors: Vec<usize> = (0..4).filter(|i| *i != first).collect();
    let healed = cluster
        .run_until_agreed(&survivors, crash_at + 10 * SECOND)
        .expect("survivors did not re-elect");

    let timeout = PodConfig::default().election.follower_timeout_ms * 1_000;
    assert!(healed - crash_at >= timeout - SECOND);
    assert_eq!(cluster.agreed_master(&survivors), cluster.highest_ranked(&survivors));
}

#[test]
fn test_resign_hands_over_without_election() {
    let mut cluster = cluster(4);
    let old = converged(&mut cluster, 10 * SECOND);
    let candidates_before = cluster.bus.stats().by_type.get("CANDIDATE").copied();

    cluster.submit(old, PodInput::Resign(ResignReason::LowBattery)).unwrap();
    // one hop for the RESIGN frame
    cluster.run_for(BusConfig::default().latency_us + 1);
    assert_eq!(cluster.masters(), vec![2]);

    cluster.run_for(SECOND);
    assert_eq!(cluster.converged_master(), Some(2));
    assert_eq!(cluster.bus.stats().by_type.get("CANDIDATE").copied(), candidates_before);
}

#[test]
fn test_followers_track_peers() {
    let mut cluster = cluster(3);
    let master = converged(&mut cluster, 10 * SECOND);
    cluster.run_for(2 * SECOND);

    let status = cluster.status(master);
    assert_eq!(status.peers.len(), 2);
    assert!(status.is_master());
}
