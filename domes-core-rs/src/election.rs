//! Master election for a pod group.
//!
//! Implements a priority-ranked election over a lossy broadcast medium:
//! - Discovery → Campaign → Vote windows, then Master or Follower
//! - An acknowledgement naming a live master skips straight to Follower
//! - Early yield on a higher-ranked candidate or reject vote
//! - Master heartbeats, follower timeout and re-election
//! - Split-brain resolution by rank, independent of arrival order
//! - Graceful resignation with a fast-tracked successor
//! - Operator-forced master
//!
//! The service is a plain state machine driven with explicit time. It never
//! blocks and never talks to the transport: outgoing frames are queued in the
//! caller's `Outbox`.

use crate::codec::{Message, Payload};
use crate::config::ElectionConfig;
use crate::outbox::Outbox;
use crate::types::{ms, ElectionState, PeerInfo, PodAddr, PriorityScore, ResignReason, TimeUs};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Strict total order over pods: priority first, address on a full tie
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Rank(pub PriorityScore, pub PodAddr);

/// A master claim as seen in a MASTER_ANNOUNCE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Claim {
    rank: Rank,
    forced: bool,
}

impl Claim {
    /// Whether this claim survives against `other`.
    ///
    /// Forced beats unforced. Two forced masters keep the lower tiebreak,
    /// two ordinary masters keep the higher rank.
    fn beats(&self, other: &Claim) -> bool {
        match (self.forced, other.forced) {
            (true, false) => true,
            (false, true) => false,
            (false, false) => self.rank > other.rank,
            (true, true) => {
                (self.rank.0.tiebreak, self.rank.1) < (other.rank.0.tiebreak, other.rank.1)
            }
        }
    }
}

/// Per-pod election state machine
pub struct ElectionService {
    /// Our address
    own: PodAddr,
    config: ElectionConfig,
    priority: PriorityScore,
    state: ElectionState,
    /// Current master, if known (ourselves when master)
    master: Option<PodAddr>,
    /// Last claim heard from the current master
    master_claim: Option<Claim>,
    /// Election round, bumped on every follower timeout
    round: u16,
    peers: HashMap<PodAddr, PeerInfo>,
    /// Votes for the current campaign, last value per voter
    votes: HashMap<PodAddr, bool>,
    /// End of the current discovery/campaign/vote window
    window_deadline: Option<TimeUs>,
    next_heartbeat: TimeUs,
    /// Local time of the last heartbeat from our master
    last_master_heard: TimeUs,
    /// A master was confirmed since the last follower timeout
    master_confirmed: bool,
    /// Consecutive timeouts with no confirmed master
    failed_elections: u8,
    stale_dropped: u64,
}

impl ElectionService {
    /// Create an idle election service
    pub fn new(own: PodAddr, priority: PriorityScore, config: ElectionConfig) -> Self {
        Self {
            own,
            config,
            priority,
            state: ElectionState::Idle,
            master: None,
            master_claim: None,
            round: 0,
            peers: HashMap::new(),
            votes: HashMap::new(),
            window_deadline: None,
            next_heartbeat: 0,
            last_master_heard: 0,
            master_confirmed: false,
            failed_elections: 0,
            stale_dropped: 0,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn current_master(&self) -> Option<PodAddr> {
        self.master
    }

    pub fn is_master(&self) -> bool {
        self.state.is_master()
    }

    pub fn round(&self) -> u16 {
        self.round
    }

    pub fn priority(&self) -> PriorityScore {
        self.priority
    }

    pub fn own_addr(&self) -> PodAddr {
        self.own
    }

    pub fn rank(&self) -> Rank {
        Rank(self.priority, self.own)
    }

    /// Stale-round votes dropped so far
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn failed_elections(&self) -> u8 {
        self.failed_elections
    }

    /// Snapshot of the peer table
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.addr);
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Votes held for the current campaign
    pub fn pending_votes(&self) -> usize {
        self.votes.len()
    }

    /// Refresh battery/link/uptime; the tiebreak is kept
    pub fn update_priority(&mut self, battery: u8, link_quality: u8, uptime_s: u32) {
        self.priority.battery = battery;
        self.priority.link_quality = link_quality;
        self.priority.uptime_s = uptime_s;
    }

    /// Begin discovery
    pub fn start(&mut self, now: TimeUs, out: &mut Outbox) {
        info!("Election: Starting (round {})", self.round);
        self.begin_discovery(now, out);
    }

    /// Operator override: become master unconditionally
    pub fn force_master(&mut self, now: TimeUs, out: &mut Outbox) {
        info!("Election: Forced master (was {})", self.state);
        self.set_master(ElectionState::ForcedMaster, now, out);
    }

    /// Step down, naming the highest-ranked live peer as successor
    pub fn resign(&mut self, reason: ResignReason, now: TimeUs, out: &mut Outbox) {
        if !self.state.is_master() {
            debug!("Election: Ignoring resign, not master ({})", self.state);
            return;
        }

        let successor = self
            .peers
            .values()
            .max_by_key(|p| Rank(p.priority, p.addr))
            .map(|p| p.addr);

        out.broadcast(Payload::Resign { reason, successor });
        self.window_deadline = None;
        self.votes.clear();

        match successor {
            Some(next) => {
                info!("Election: Resigned ({:?}), successor {}", reason, next);
                self.state = ElectionState::Follower;
                self.master = Some(next);
                self.master_claim = self
                    .peers
                    .get(&next)
                    .map(|p| Claim { rank: Rank(p.priority, next), forced: false });
                self.last_master_heard = now;
                self.master_confirmed = false;
            }
            None => {
                info!("Election: Resigned ({:?}) with no peers, going idle", reason);
                self.state = ElectionState::Idle;
                self.master = None;
                self.master_claim = None;
            }
        }
    }

    /// Earliest local time at which `tick` has work to do
    pub fn next_deadline(&self) -> Option<TimeUs> {
        match self.state {
            ElectionState::Idle => None,
            ElectionState::Discovering
            | ElectionState::Campaigning
            | ElectionState::WaitingForVotes => self.window_deadline,
            ElectionState::Master | ElectionState::ForcedMaster => Some(self.next_heartbeat),
            ElectionState::Follower => {
                Some(self.last_master_heard + ms(self.config.follower_timeout_ms))
            }
        }
    }

    /// Advance timers
    pub fn tick(&mut self, now: TimeUs, out: &mut Outbox) {
        self.evict_silent_peers(now);

        match self.state {
            ElectionState::Idle => {}

            ElectionState::Discovering => {
                if self.window_elapsed(now) {
                    self.begin_campaign(now, out);
                }
            }

            ElectionState::Campaigning => {
                if self.window_elapsed(now) {
                    debug!(
                        "Election: Campaign window closed with {} vote(s)",
                        self.votes.len()
                    );
                    self.state = ElectionState::WaitingForVotes;
                    self.window_deadline = Some(now + ms(self.config.vote_window_ms));
                }
            }

            ElectionState::WaitingForVotes => {
                if self.window_elapsed(now) {
                    // Nobody out-ranked us, otherwise we would have yielded already.
                    let accepts = self.votes.values().filter(|v| **v).count();
                    info!(
                        "Election: Won round {} ({} accept(s), {} peer(s))",
                        self.round,
                        accepts,
                        self.peers.len()
                    );
                    self.set_master(ElectionState::Master, now, out);
                }
            }

            ElectionState::Master | ElectionState::ForcedMaster => {
                if now >= self.next_heartbeat {
                    self.announce(out);
                    self.next_heartbeat = now + ms(self.config.heartbeat_interval_ms);
                }
            }

            ElectionState::Follower => {
                let silence = now.saturating_sub(self.last_master_heard);
                if silence >= ms(self.config.follower_timeout_ms) {
                    self.on_follower_timeout(now, out);
                }
            }
        }
    }

    /// Note that a peer is alive (any frame from it counts)
    pub fn touch(&mut self, from: PodAddr, now: TimeUs) {
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.last_seen = now;
        }
    }

    /// Handle an election frame
    pub fn on_message(&mut self, msg: &Message, now: TimeUs, out: &mut Outbox) {
        let from = msg.sender();
        if from == self.own {
            return;
        }
        self.touch(from, now);

        if self.state == ElectionState::Idle {
            // Only a resigned or unstarted pod is idle; it answers nothing.
            return;
        }

        match msg.payload {
            Payload::Discover { priority } => {
                // A pod joining a running session sends nothing else we rank by.
                self.upsert_peer(from, priority, now);
                let current_master = if self.master_confirmed || self.state.is_master() {
                    self.master
                } else {
                    None
                };
                out.send(
                    from,
                    Payload::DiscoverAck {
                        priority: self.priority,
                        current_master,
                    },
                );
            }

            Payload::DiscoverAck {
                priority,
                current_master,
            } => {
                self.upsert_peer(from, priority, now);
                if let Some(master) = current_master {
                    if self.state == ElectionState::Discovering && master != self.own {
                        info!("Election: {} reports live master {}, following", from, master);
                        let claim = if master == from {
                            Some(Claim { rank: Rank(priority, from), forced: false })
                        } else {
                            None
                        };
                        self.follow(master, claim, now);
                    }
                }
            }

            Payload::Candidate { priority, round } => {
                self.upsert_peer(from, priority, now);
                let theirs = Rank(priority, from);
                let accept = theirs > self.rank();
                out.send(
                    from,
                    Payload::Vote {
                        accept,
                        voter_priority: self.priority,
                        round,
                    },
                );

                if self.state.is_master() {
                    // Let the candidate learn about us without waiting a heartbeat.
                    self.announce(out);
                } else if accept && self.state.is_electing() {
                    info!("Election: Yielding to higher-ranked candidate {}", from);
                    self.yield_now(now);
                }
            }

            Payload::Vote {
                accept,
                voter_priority,
                round,
            } => {
                self.upsert_peer(from, voter_priority, now);
                let campaigning = matches!(
                    self.state,
                    ElectionState::Campaigning | ElectionState::WaitingForVotes
                );
                if !campaigning || round != self.round {
                    self.stale_dropped += 1;
                    debug!(
                        "Election: Dropping stale vote from {} (round {}, ours {}, {})",
                        from, round, self.round, self.state
                    );
                    return;
                }

                self.votes.insert(from, accept);
                if !accept && Rank(voter_priority, from) > self.rank() {
                    info!("Election: Rejected by higher-ranked {}, yielding", from);
                    self.yield_now(now);
                }
            }

            Payload::MasterAnnounce {
                priority,
                peer_count,
                forced,
            } => {
                self.upsert_peer(from, priority, now);
                let claim = Claim {
                    rank: Rank(priority, from),
                    forced,
                };
                self.on_announce(from, claim, peer_count, now, out);
            }

            Payload::Resign { reason, successor } => {
                info!(
                    "Election: {} resigned ({:?}), successor {:?}",
                    from, reason, successor
                );
                let was_ours = self.master == Some(from);
                if was_ours {
                    self.master = None;
                    self.master_claim = None;
                }
                if successor == Some(self.own) {
                    info!("Election: Named successor, taking over");
                    self.set_master(ElectionState::Master, now, out);
                } else if was_ours && !self.state.is_master() {
                    self.begin_discovery(now, out);
                } else {
                    debug!("Election: Resign from {} does not affect us", from);
                }
            }

            _ => {}
        }
    }

    fn on_announce(&mut self, from: PodAddr, claim: Claim, peer_count: u8, now: TimeUs, out: &mut Outbox) {
        match self.state {
            ElectionState::Master | ElectionState::ForcedMaster => {
                let ours = self.own_claim();
                if claim.beats(&ours) {
                    warn!(
                        "Election: Split brain with {} ({} peers), yielding",
                        from, peer_count
                    );
                    self.follow(from, Some(claim), now);
                    self.master_confirmed = true;
                } else {
                    debug!("Election: Competing master {} out-ranked, re-announcing", from);
                    self.announce(out);
                }
            }

            ElectionState::Follower => {
                if self.master == Some(from) {
                    self.last_master_heard = now;
                    self.master_claim = Some(claim);
                    if !self.master_confirmed {
                        debug!("Election: Master {} confirmed", from);
                    }
                    self.master_confirmed = true;
                    self.failed_elections = 0;
                    return;
                }

                let adopt = match (self.master, self.master_claim) {
                    (None, _) => true,
                    (Some(_), None) => true,
                    (Some(_), Some(current)) => claim.beats(&current),
                };
                if adopt {
                    info!("Election: Following {} (round {})", from, self.round);
                    self.follow(from, Some(claim), now);
                    self.master_confirmed = true;
                    self.failed_elections = 0;
                }
            }

            ElectionState::Discovering
            | ElectionState::Campaigning
            | ElectionState::WaitingForVotes => {
                let ours = Claim {
                    rank: self.rank(),
                    forced: false,
                };
                if claim.beats(&ours) {
                    info!("Election: Live master {} found while {}, following", from, self.state);
                    self.follow(from, Some(claim), now);
                    self.master_confirmed = true;
                    self.failed_elections = 0;
                }
            }

            ElectionState::Idle => {}
        }
    }

    fn on_follower_timeout(&mut self, now: TimeUs, out: &mut Outbox) {
        self.round = self.round.wrapping_add(1);
        if !self.master_confirmed {
            self.failed_elections = self.failed_elections.saturating_add(1);
        }
        warn!(
            "Election: Master {:?} silent, round {} (unresolved {}/{})",
            self.master, self.round, self.failed_elections, self.config.max_retries
        );

        self.master = None;
        self.master_claim = None;
        self.master_confirmed = false;

        if self.failed_elections >= self.config.max_retries {
            warn!("Election: Retry cap reached, falling back to standalone master");
            self.set_master(ElectionState::Master, now, out);
        } else {
            self.begin_discovery(now, out);
        }
    }

    fn begin_discovery(&mut self, now: TimeUs, out: &mut Outbox) {
        self.state = ElectionState::Discovering;
        self.votes.clear();
        self.window_deadline = Some(now + ms(self.config.discovery_window_ms));
        out.broadcast(Payload::Discover {
            priority: self.priority,
        });
        debug!("Election: Discovering (round {})", self.round);
    }

    fn begin_campaign(&mut self, now: TimeUs, out: &mut Outbox) {
        self.state = ElectionState::Campaigning;
        self.votes.clear();
        self.window_deadline = Some(now + ms(self.config.campaign_window_ms));
        out.broadcast(Payload::Candidate {
            priority: self.priority,
            round: self.round,
        });
        info!(
            "Election: Campaigning in round {} with {} known peer(s)",
            self.round,
            self.peers.len()
        );
    }

    /// Drop to Follower with the master still unknown; the winner's
    /// announce (or the follower timeout) resolves it.
    fn yield_now(&mut self, now: TimeUs) {
        self.state = ElectionState::Follower;
        self.master = None;
        self.master_claim = None;
        self.window_deadline = None;
        self.votes.clear();
        self.last_master_heard = now;
    }

    fn follow(&mut self, master: PodAddr, claim: Option<Claim>, now: TimeUs) {
        self.state = ElectionState::Follower;
        self.master = Some(master);
        self.master_claim = claim;
        self.window_deadline = None;
        self.votes.clear();
        self.last_master_heard = now;
    }

    fn set_master(&mut self, state: ElectionState, now: TimeUs, out: &mut Outbox) {
        self.state = state;
        self.master = Some(self.own);
        self.master_claim = None;
        self.master_confirmed = true;
        self.failed_elections = 0;
        self.window_deadline = None;
        self.votes.clear();
        self.announce(out);
        self.next_heartbeat = now + ms(self.config.heartbeat_interval_ms);
    }

    fn announce(&self, out: &mut Outbox) {
        out.broadcast(Payload::MasterAnnounce {
            priority: self.priority,
            peer_count: self.peers.len().min(u8::MAX as usize) as u8,
            forced: self.state == ElectionState::ForcedMaster,
        });
    }

    fn own_claim(&self) -> Claim {
        Claim {
            rank: self.rank(),
            forced: self.state == ElectionState::ForcedMaster,
        }
    }

    fn upsert_peer(&mut self, addr: PodAddr, priority: PriorityScore, now: TimeUs) {
        let peer = self.peers.entry(addr).or_insert_with(|| {
            debug!("Election: Discovered peer {}", addr);
            PeerInfo {
                addr,
                priority,
                last_seen: now,
            }
        });
        peer.priority = priority;
        peer.last_seen = now;
    }

    fn evict_silent_peers(&mut self, now: TimeUs) {
        let timeout = ms(self.config.peer_timeout_ms);
        self.peers.retain(|addr, peer| {
            let alive = now.saturating_sub(peer.last_seen) < timeout;
            if !alive {
                debug!("Election: Evicting silent peer {}", addr);
            }
            alive
        });
    }

    fn window_elapsed(&self, now: TimeUs) -> bool {
        self.window_deadline.map_or(true, |deadline| now >= deadline)
    }
}
