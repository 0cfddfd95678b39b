//! Session coordinator
//!
//! Owns every per-pod service and is the only thing that mutates them. All
//! inputs (frames, game events, operator requests, timer ticks) arrive as
//! `PodInput` values through one queue; after each input the coordinator
//! checks for a master change, resets clock sync, starts or stops the drill
//! interpreter and stamps the queued frames.

use crate::clock_sync::{ClockEstimate, ClockSyncService};
use crate::codec::{Message, MessageType, Payload};
use crate::command::{CommandContext, EventDedup, PodCommandHandler};
use crate::config::PodConfig;
use crate::drill::{DrillContext, DrillInterpreter, DrillProgram, DrillProgress, DrillResult};
use crate::election::ElectionService;
use crate::error::{CodecError, SessionError};
use crate::game::{ArmCycles, GameCapability, GameEvent};
use crate::outbox::{Destination, Outbox};
use crate::types::{ElectionState, PeerInfo, PodAddr, PriorityScore, ResignReason, TimeUs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the coordination task reacts to
#[derive(Debug)]
pub enum PodInput {
    /// A decoded frame from another pod
    Frame(Message),
    /// A frame that failed to decode
    Malformed(CodecError),
    /// Outcome of a local arm cycle
    Game { cycle: u32, event: GameEvent },
    /// The transport could not deliver frame `seq`
    DeliveryFailed { seq: u16 },
    StartDrill(DrillProgram),
    AbortDrill,
    ForceMaster,
    Resign(ResignReason),
    UpdateVitals { battery: u8, link_quality: u8 },
    /// A deadline passed
    Tick,
    Shutdown,
}

/// Outward notifications for the session/mode layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    MasterChanged {
        master: Option<PodAddr>,
        is_master: bool,
    },
    DrillFinished(DrillResult),
}

/// Frames dropped without effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DropCounters {
    pub malformed: u64,
    pub stale: u64,
    pub duplicate_events: u64,
    /// Primitives or events from a pod with no business sending them
    pub unroutable: u64,
}

/// Latest STATUS_REPORT from a pod (master only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodReport {
    pub pod: PodAddr,
    pub battery: u8,
    pub link_quality: u8,
    /// Local time of receipt
    pub received_at: TimeUs,
}

/// Snapshot published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub own: PodAddr,
    pub state: ElectionState,
    pub master: Option<PodAddr>,
    pub round: u16,
    pub peers: Vec<PeerInfo>,
    pub clock: ClockEstimate,
    pub drill: Option<DrillProgress>,
    pub last_result: Option<DrillResult>,
    pub reports: Vec<PodReport>,
    pub drops: DropCounters,
}

impl SessionStatus {
    pub fn empty(own: PodAddr) -> Self {
        Self {
            own,
            state: ElectionState::Idle,
            master: None,
            round: 0,
            peers: Vec::new(),
            clock: ClockEstimate::default(),
            drill: None,
            last_result: None,
            reports: Vec::new(),
            drops: DropCounters::default(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.state.is_master()
    }
}

/// Per-pod coordination state
pub struct SessionCoordinator {
    own: PodAddr,
    election: ElectionService,
    clock: ClockSyncService,
    command: PodCommandHandler,
    drill: DrillInterpreter,
    game: Box<dyn GameCapability>,
    cycles: ArmCycles,
    outbox: Outbox,
    notices: Vec<Notice>,
    drops: DropCounters,
    dedup: EventDedup,
    reports: BTreeMap<PodAddr, PodReport>,
    last_result: Option<DrillResult>,
    /// (master, is_master) as of the last check
    roles: (Option<PodAddr>, bool),
    stopped: bool,
}

impl SessionCoordinator {
    /// `inbox` is the sending half of this pod's input queue; game events are
    /// reported through it.
    pub fn new(
        own: PodAddr,
        priority: PriorityScore,
        config: PodConfig,
        game: Box<dyn GameCapability>,
        inbox: mpsc::UnboundedSender<PodInput>,
    ) -> Self {
        Self {
            own,
            election: ElectionService::new(own, priority, config.election),
            clock: ClockSyncService::new(config.clock),
            command: PodCommandHandler::new(config.command),
            drill: DrillInterpreter::new(config.drill),
            game,
            cycles: ArmCycles::new(inbox),
            outbox: Outbox::new(),
            notices: Vec::new(),
            drops: DropCounters::default(),
            dedup: EventDedup::default(),
            reports: BTreeMap::new(),
            last_result: None,
            roles: (None, false),
            stopped: false,
        }
    }

    pub fn own_addr(&self) -> PodAddr {
        self.own
    }

    pub fn current_master(&self) -> Option<PodAddr> {
        self.election.current_master()
    }

    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    pub fn election(&self) -> &ElectionService {
        &self.election
    }

    pub fn clock(&self) -> &ClockSyncService {
        &self.clock
    }

    pub fn drill(&self) -> &DrillInterpreter {
        &self.drill
    }

    pub fn drops(&self) -> DropCounters {
        self.drops
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Network time at local time `now`
    pub fn network_time(&self, now: TimeUs) -> TimeUs {
        self.clock.now(now)
    }

    /// Join the group
    pub fn start(&mut self, now: TimeUs) {
        info!("Session: Pod {} starting", self.own);
        self.election.start(now, &mut self.outbox);
        self.poll(now);
    }

    /// Process one input at local time `now`
    pub fn handle(&mut self, input: PodInput, now: TimeUs) -> Result<(), SessionError> {
        if self.stopped {
            return Err(SessionError::Stopped);
        }

        let result = match input {
            PodInput::Frame(msg) => {
                self.on_frame(msg, now);
                Ok(())
            }
            PodInput::Malformed(error) => {
                self.drops.malformed += 1;
                debug!("Session: Dropping malformed frame: {}", error);
                Ok(())
            }
            PodInput::Game { cycle, event } => {
                self.on_game_event(cycle, event, now);
                Ok(())
            }
            PodInput::DeliveryFailed { seq } => {
                if !self.command.on_delivery_failed(seq, now) {
                    debug!("Session: Send of seq {} failed", seq);
                }
                Ok(())
            }
            PodInput::StartDrill(program) => self.start_drill(program, now),
            PodInput::AbortDrill => self.abort_drill(now),
            PodInput::ForceMaster => {
                self.election.force_master(now, &mut self.outbox);
                Ok(())
            }
            PodInput::Resign(reason) => {
                self.election.resign(reason, now, &mut self.outbox);
                Ok(())
            }
            PodInput::UpdateVitals {
                battery,
                link_quality,
            } => {
                let uptime_s = (now / 1_000_000).min(u32::MAX as u64) as u32;
                self.election.update_priority(battery, link_quality, uptime_s);
                self.command.set_vitals(battery, link_quality);
                Ok(())
            }
            PodInput::Tick => Ok(()),
            PodInput::Shutdown => {
                info!("Session: Pod {} shutting down", self.own);
                if self.drill.is_running() {
                    let _ = self.abort_drill(now);
                }
                self.stopped = true;
                Ok(())
            }
        };

        if !self.stopped {
            self.poll(now);
        }
        result
    }

    /// Earliest local time at which something is due
    pub fn next_deadline(&self) -> Option<TimeUs> {
        let is_master = self.election.is_master();
        let has_master = self.election.current_master().is_some();
        [
            self.election.next_deadline(),
            self.clock.next_deadline(),
            self.command.next_deadline(is_master, has_master),
            if is_master { self.drill.next_deadline() } else { None },
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Queued frames, header stamped at local time `now`
    pub fn take_frames(&mut self, now: TimeUs) -> Vec<(Destination, Message)> {
        self.outbox
            .drain()
            .into_iter()
            .map(|o| (o.dest, Message::new(self.own, o.seq, now, o.payload)))
            .collect()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn status(&self, now: TimeUs) -> SessionStatus {
        SessionStatus {
            own: self.own,
            state: self.election.state(),
            master: self.election.current_master(),
            round: self.election.round(),
            peers: self.election.peers(),
            clock: self.clock.estimate(now),
            drill: self.drill.progress(),
            last_result: self.last_result.clone(),
            reports: self.reports.values().copied().collect(),
            drops: DropCounters {
                stale: self.drops.stale
                    + self.election.stale_dropped()
                    + self.clock.stale_responses()
                    + self.drill.late_events(),
                ..self.drops
            },
        }
    }

    fn on_frame(&mut self, msg: Message, now: TimeUs) {
        let from = msg.sender();
        if from == self.own {
            return;
        }
        self.election.touch(from, now);

        let msg_type = msg.msg_type();
        if msg_type.is_election() {
            self.election.on_message(&msg, now, &mut self.outbox);
            self.check_roles(now);
        } else if msg_type.is_clock() {
            self.clock.on_message(&msg, now, &mut self.outbox);
        } else if msg_type.is_primitive() {
            if self.election.is_master() || self.election.current_master() != Some(from) {
                self.drops.unroutable += 1;
                debug!("Session: Ignoring {} from non-master {}", msg_type.name(), from);
                return;
            }
            let mut ctx = CommandContext {
                own: self.own,
                master: self.election.current_master(),
                is_master: false,
                clock: &self.clock,
                game: self.game.as_mut(),
                cycles: &mut self.cycles,
                out: &mut self.outbox,
                now,
            };
            self.command.on_primitive(&msg.payload, &mut ctx);
        } else if msg_type.is_pod_event() {
            self.on_pod_event(msg, now);
        }
    }

    fn on_pod_event(&mut self, msg: Message, now: TimeUs) {
        let from = msg.sender();
        if !self.election.is_master() {
            self.drops.unroutable += 1;
            return;
        }

        if msg.msg_type() == MessageType::StatusReport {
            if let Payload::StatusReport {
                battery,
                link_quality,
            } = msg.payload
            {
                self.reports.insert(
                    from,
                    PodReport {
                        pod: from,
                        battery,
                        link_quality,
                        received_at: now,
                    },
                );
            }
            return;
        }

        if !self.dedup.accept(from, msg.header.sequence) {
            self.drops.duplicate_events += 1;
            debug!("Session: Duplicate event seq {} from {}", msg.header.sequence, from);
            return;
        }

        let roster = self.roster();
        let network_now = self.clock.now(now);
        let mut ctx = DrillContext {
            own: self.own,
            roster: &roster,
            game: self.game.as_mut(),
            cycles: &mut self.cycles,
            out: &mut self.outbox,
            now,
            network_now,
        };
        if let Some(result) = self.drill.on_remote_event(from, &msg.payload, &mut ctx) {
            self.finish_drill(result);
        }
    }

    fn on_game_event(&mut self, cycle: u32, event: GameEvent, now: TimeUs) {
        if self.drill.owns_cycle(cycle) {
            let roster = self.roster();
            let network_now = self.clock.now(now);
            let mut ctx = DrillContext {
                own: self.own,
                roster: &roster,
                game: self.game.as_mut(),
                cycles: &mut self.cycles,
                out: &mut self.outbox,
                now,
                network_now,
            };
            if let Some(result) = self.drill.on_local_event(cycle, event, &mut ctx) {
                self.finish_drill(result);
            }
            return;
        }

        let mut ctx = CommandContext {
            own: self.own,
            master: self.election.current_master(),
            is_master: self.election.is_master(),
            clock: &self.clock,
            game: self.game.as_mut(),
            cycles: &mut self.cycles,
            out: &mut self.outbox,
            now,
        };
        if let Some(payload) = self.command.on_game_event(cycle, event, &mut ctx) {
            debug!("Session: Local event {:?} outside any drill round", payload.msg_type());
        }
    }

    fn start_drill(&mut self, program: DrillProgram, now: TimeUs) -> Result<(), SessionError> {
        if !self.election.is_master() {
            return Err(SessionError::NotMaster);
        }
        let roster = self.roster();
        let network_now = self.clock.now(now);
        let mut ctx = DrillContext {
            own: self.own,
            roster: &roster,
            game: self.game.as_mut(),
            cycles: &mut self.cycles,
            out: &mut self.outbox,
            now,
            network_now,
        };
        self.dedup.clear();
        self.drill.start(program, &mut ctx)
    }

    fn abort_drill(&mut self, now: TimeUs) -> Result<(), SessionError> {
        let roster = self.roster();
        let network_now = self.clock.now(now);
        let mut ctx = DrillContext {
            own: self.own,
            roster: &roster,
            game: self.game.as_mut(),
            cycles: &mut self.cycles,
            out: &mut self.outbox,
            now,
            network_now,
        };
        match self.drill.abort(&mut ctx) {
            Some(result) => {
                self.finish_drill(result);
                Ok(())
            }
            None => Err(SessionError::NoDrillRunning),
        }
    }

    fn finish_drill(&mut self, result: DrillResult) {
        self.last_result = Some(result.clone());
        self.notices.push(Notice::DrillFinished(result));
    }

    /// Master plus live peers, sorted
    fn roster(&self) -> Vec<PodAddr> {
        let mut roster: Vec<PodAddr> = self.election.peers().iter().map(|p| p.addr).collect();
        roster.push(self.own);
        roster.sort();
        roster
    }

    /// Run every service's timers, then reconcile roles
    fn poll(&mut self, now: TimeUs) {
        self.check_roles(now);
        self.election.tick(now, &mut self.outbox);
        self.check_roles(now);

        self.clock.tick(now, &mut self.outbox);

        let is_master = self.election.is_master();
        let mut ctx = CommandContext {
            own: self.own,
            master: self.election.current_master(),
            is_master,
            clock: &self.clock,
            game: self.game.as_mut(),
            cycles: &mut self.cycles,
            out: &mut self.outbox,
            now,
        };
        self.command.tick(&mut ctx);

        if is_master && self.drill.is_running() {
            let roster = self.roster();
            let network_now = self.clock.now(now);
            let mut ctx = DrillContext {
                own: self.own,
                roster: &roster,
                game: self.game.as_mut(),
                cycles: &mut self.cycles,
                out: &mut self.outbox,
                now,
                network_now,
            };
            if let Some(result) = self.drill.tick(&mut ctx) {
                self.finish_drill(result);
            }
        }
    }

    /// React to a change of master or of our own mastership
    fn check_roles(&mut self, now: TimeUs) {
        let roles = (self.election.current_master(), self.election.is_master());
        if roles == self.roles {
            return;
        }
        let (master, is_master) = roles;
        let lost_mastership = self.roles.1 && !is_master;
        self.roles = roles;

        info!(
            "Session: Master now {:?} (local master: {}, state {})",
            master,
            is_master,
            self.election.state()
        );

        self.clock.reset(master, is_master, now);
        self.command.on_master_changed(now);
        if !is_master {
            self.reports.clear();
        }

        if lost_mastership && self.drill.is_running() {
            warn!("Session: Lost mastership, aborting drill");
            let _ = self.abort_drill(now);
        }

        self.notices.push(Notice::MasterChanged { master, is_master });
    }
}
