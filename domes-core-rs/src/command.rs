//! Pod command handler
//!
//! Runs on every pod. Inbound primitives from the current master drive the
//! local game capability; the outcome of each arm cycle goes back to the
//! master as a HIT_EVENT or TIMEOUT_EVENT. Primitives are fire-and-forget.
//! Events carry scoring data, so a send the transport reports as failed is
//! retried under the same sequence number.

use crate::clock_sync::ClockSyncService;
use crate::codec::Payload;
use crate::config::CommandConfig;
use crate::game::{ArmCycles, GameCapability, GameEvent};
use crate::outbox::Outbox;
use crate::types::{ms, EffectParams, PodAddr, TimeUs};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Recent event sequence numbers remembered per sender
const DEDUP_WINDOW: usize = 32;

/// Everything the handler borrows from the coordinator for one call
pub struct CommandContext<'a> {
    pub own: PodAddr,
    pub master: Option<PodAddr>,
    pub is_master: bool,
    pub clock: &'a ClockSyncService,
    pub game: &'a mut dyn GameCapability,
    pub cycles: &'a mut ArmCycles,
    pub out: &'a mut Outbox,
    /// Local time
    pub now: TimeUs,
}

#[derive(Debug, Clone)]
struct PendingEvent {
    to: PodAddr,
    seq: u16,
    payload: Payload,
    retries: u8,
    sent_at: TimeUs,
    /// Set when the last send failed
    retry_at: Option<TimeUs>,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledEffect {
    at: TimeUs,
    params: EffectParams,
    duration_ms: u32,
}

/// The arm cycle currently open on the local game
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedCycle {
    cycle: u32,
    /// Master's tag from ARM_DETECT, echoed in the event
    arm_id: u16,
}

/// Per-pod primitive dispatcher and event forwarder
pub struct PodCommandHandler {
    config: CommandConfig,
    armed: Option<ArmedCycle>,
    pending: Vec<PendingEvent>,
    scheduled: Vec<ScheduledEffect>,
    next_status: TimeUs,
    battery: u8,
    link_quality: u8,
    dropped_events: u64,
}

impl PodCommandHandler {
    pub fn new(config: CommandConfig) -> Self {
        Self {
            config,
            armed: None,
            pending: Vec::new(),
            scheduled: Vec::new(),
            next_status: 0,
            battery: 100,
            link_quality: 0,
            dropped_events: 0,
        }
    }

    pub fn set_vitals(&mut self, battery: u8, link_quality: u8) {
        self.battery = battery;
        self.link_quality = link_quality;
    }

    pub fn armed_cycle(&self) -> Option<u32> {
        self.armed.map(|a| a.cycle)
    }

    /// Events awaiting delivery confirmation
    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Events given up on after the retry budget
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Dispatch a primitive already checked to come from the current master
    pub fn on_primitive(&mut self, payload: &Payload, ctx: &mut CommandContext<'_>) {
        match *payload {
            Payload::SetEffect {
                params,
                duration_ms,
            } => self.set_effect(params, duration_ms, ctx),

            Payload::ArmDetect {
                timeout_ms,
                feedback_mode,
                arm_id,
            } => {
                if !self.pending.is_empty() {
                    debug!(
                        "Cmd: New arm cycle, abandoning {} pending event(s)",
                        self.pending.len()
                    );
                    self.pending.clear();
                }
                if self.armed.is_some() {
                    ctx.game.disarm();
                }
                let sink = ctx.cycles.next_sink();
                self.armed = Some(ArmedCycle {
                    cycle: sink.cycle(),
                    arm_id,
                });
                debug!(
                    "Cmd: Armed for {}ms (cycle {}, arm {})",
                    timeout_ms,
                    sink.cycle(),
                    arm_id
                );
                ctx.game.arm(timeout_ms, feedback_mode, sink);
            }

            Payload::PlaySound { sound_id, volume } => ctx.game.play_sound(sound_id, volume),

            Payload::FireHaptic {
                effect_id,
                intensity,
            } => ctx.game.fire_haptic(effect_id, intensity),

            Payload::StopAll => {
                debug!("Cmd: Stop all");
                ctx.game.stop_all();
                self.armed = None;
                self.scheduled.clear();
                self.pending.clear();
            }

            Payload::JoinSession => {
                info!("Cmd: Joined session");
                ctx.game.join_session();
            }

            _ => {}
        }
    }

    fn set_effect(&mut self, params: EffectParams, duration_ms: u32, ctx: &mut CommandContext<'_>) {
        let immediate = EffectParams {
            start_at: 0,
            ..params
        };

        if !params.is_scheduled() {
            ctx.game.set_effect(immediate, duration_ms);
            return;
        }

        let quality = ctx.clock.quality(ctx.now);
        if quality < self.config.min_sync_quality {
            debug!(
                "Cmd: Clock quality {} below {}, applying synchronized effect now",
                quality, self.config.min_sync_quality
            );
            ctx.game.set_effect(immediate, duration_ms);
            return;
        }

        let at = ctx.clock.network_to_local(params.start_at);
        if at <= ctx.now {
            ctx.game.set_effect(immediate, duration_ms);
        } else {
            self.scheduled.push(ScheduledEffect {
                at,
                params: immediate,
                duration_ms,
            });
        }
    }

    /// Handle the outcome of a local arm cycle.
    ///
    /// Returns the event when this pod is itself the master, for local
    /// delivery to the drill interpreter.
    pub fn on_game_event(
        &mut self,
        cycle: u32,
        event: GameEvent,
        ctx: &mut CommandContext<'_>,
    ) -> Option<Payload> {
        let arm_id = match self.armed {
            Some(armed) if armed.cycle == cycle => armed.arm_id,
            _ => {
                debug!("Cmd: Ignoring event from stale cycle {}", cycle);
                return None;
            }
        };
        self.armed = None;

        let pod_id = ctx.own.short_id();
        let payload = match event {
            GameEvent::Hit {
                reaction_us,
                strength,
            } => Payload::HitEvent {
                pod_id,
                reaction_us,
                strength,
                arm_id,
            },
            GameEvent::Timeout => Payload::TimeoutEvent { pod_id, arm_id },
        };

        match ctx.master {
            Some(master) if master == ctx.own => Some(payload),
            Some(master) => {
                let seq = ctx.out.send(master, payload);
                self.pending.push(PendingEvent {
                    to: master,
                    seq,
                    payload,
                    retries: 0,
                    sent_at: ctx.now,
                    retry_at: None,
                });
                None
            }
            None => {
                warn!("Cmd: No master, dropping {:?}", event);
                self.dropped_events += 1;
                None
            }
        }
    }

    /// The transport could not deliver frame `seq`. Returns true if it was
    /// one of our pending events.
    pub fn on_delivery_failed(&mut self, seq: u16, now: TimeUs) -> bool {
        let Some(index) = self.pending.iter().position(|p| p.seq == seq) else {
            return false;
        };

        if self.pending[index].retries >= self.config.event_retries {
            let event = self.pending.remove(index);
            self.dropped_events += 1;
            warn!(
                "Cmd: Giving up on event seq {} to {} after {} retries",
                event.seq, event.to, event.retries
            );
        } else {
            let event = &mut self.pending[index];
            event.retry_at = Some(now + ms(self.config.retry_backoff_ms));
            debug!("Cmd: Send of seq {} failed, retry {} scheduled", seq, event.retries + 1);
        }
        true
    }

    /// Master changed: pending events were addressed to the old one
    pub fn on_master_changed(&mut self, now: TimeUs) {
        if !self.pending.is_empty() {
            debug!("Cmd: Master changed, abandoning {} pending event(s)", self.pending.len());
            self.pending.clear();
        }
        self.next_status = now;
    }

    pub fn next_deadline(&self, is_master: bool, has_master: bool) -> Option<TimeUs> {
        let effects = self.scheduled.iter().map(|s| s.at);
        let delivery = ms(self.config.delivery_window_ms);
        let events = self
            .pending
            .iter()
            .map(|p| p.retry_at.unwrap_or(p.sent_at + delivery));
        let status = (!is_master && has_master).then_some(self.next_status);
        effects.chain(events).chain(status).min()
    }

    pub fn tick(&mut self, ctx: &mut CommandContext<'_>) {
        let now = ctx.now;

        let (due, later): (Vec<ScheduledEffect>, Vec<ScheduledEffect>) =
            self.scheduled.iter().partition(|s| s.at <= now);
        self.scheduled = later;
        for effect in due {
            ctx.game.set_effect(effect.params, effect.duration_ms);
        }

        let delivery = ms(self.config.delivery_window_ms);
        self.pending.retain_mut(|event| match event.retry_at {
            Some(at) if at <= now => {
                event.retries += 1;
                event.retry_at = None;
                event.sent_at = now;
                ctx.out.resend(event.to, event.seq, event.payload);
                true
            }
            Some(_) => true,
            None => now.saturating_sub(event.sent_at) < delivery,
        });

        if !ctx.is_master {
            if let Some(master) = ctx.master {
                if now >= self.next_status {
                    ctx.out.send(
                        master,
                        Payload::StatusReport {
                            battery: self.battery,
                            link_quality: self.link_quality,
                        },
                    );
                    self.next_status = now + ms(self.config.status_interval_ms);
                }
            }
        }
    }
}

/// Master-side duplicate suppression for retried events
#[derive(Debug, Default)]
pub struct EventDedup {
    seen: HashMap<PodAddr, VecDeque<u16>>,
}

impl EventDedup {
    /// True the first time `(from, seq)` is seen
    pub fn accept(&mut self, from: PodAddr, seq: u16) -> bool {
        let recent = self.seen.entry(from).or_default();
        if recent.contains(&seq) {
            return false;
        }
        if recent.len() == DEDUP_WINDOW {
            recent.pop_front();
        }
        recent.push_back(seq);
        true
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClockSyncConfig;
    use crate::game::testing::RecordingGame;
    use crate::session::PodInput;
    use tokio::sync::mpsc;

    struct Fixture {
        handler: PodCommandHandler,
        clock: ClockSyncService,
        game: RecordingGame,
        cycles: ArmCycles,
        out: Outbox,
        rx: mpsc::UnboundedReceiver<PodInput>,
    }

    fn own() -> PodAddr {
        PodAddr([0x02, 0, 0, 0, 0x12, 0x34])
    }

    fn master() -> PodAddr {
        PodAddr([0x02, 0, 0, 0, 0, 1])
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut clock = ClockSyncService::new(ClockSyncConfig::default());
            clock.reset(Some(master()), false, 0);
            Self {
                handler: PodCommandHandler::new(CommandConfig::default()),
                clock,
                game: RecordingGame::default(),
                cycles: ArmCycles::new(tx),
                out: Outbox::new(),
                rx,
            }
        }

        fn primitive(&mut self, payload: Payload, now: TimeUs) {
            let mut ctx = CommandContext {
                own: own(),
                master: Some(master()),
                is_master: false,
                clock: &self.clock,
                game: &mut self.game,
                cycles: &mut self.cycles,
                out: &mut self.out,
                now,
            };
            self.handler.on_primitive(&payload, &mut ctx);
        }

        fn event(&mut self, cycle: u32, event: GameEvent, now: TimeUs) -> Option<Payload> {
            let mut ctx = CommandContext {
                own: own(),
                master: Some(master()),
                is_master: false,
                clock: &self.clock,
                game: &mut self.game,
                cycles: &mut self.cycles,
                out: &mut self.out,
                now,
            };
            self.handler.on_game_event(cycle, event, &mut ctx)
        }

        fn tick(&mut self, now: TimeUs) {
            let mut ctx = CommandContext {
                own: own(),
                master: Some(master()),
                is_master: false,
                clock: &self.clock,
                game: &mut self.game,
                cycles: &mut self.cycles,
                out: &mut self.out,
                now,
            };
            self.handler.tick(&mut ctx);
        }

        fn arm_and_hit(&mut self, reaction_us: u32) -> u16 {
            self.primitive(
                Payload::ArmDetect {
                    timeout_ms: 1_000,
                    feedback_mode: 1,
                    arm_id: 3,
                },
                0,
            );
            let cycle = self.game.hit(reaction_us).unwrap();
            match self.rx.try_recv().unwrap() {
                PodInput::Game { cycle: c, event } => {
                    assert_eq!(c, cycle);
                    assert!(self.event(c, event, ms(10)).is_none());
                }
                other => panic!("Unexpected input {:?}", other),
            }
            self.out.drain()[0].seq
        }
    }

    #[test]
    fn test_hit_forwarded_to_master() {
        let mut f = Fixture::new();
        f.arm_and_hit(250_000);
        assert_eq!(f.handler.pending_events(), 1);

        // delivery window passes without a failure report
        f.tick(ms(10) + ms(100));
        assert_eq!(f.handler.pending_events(), 0);
    }

    #[test]
    fn test_event_carries_short_id_and_arm_id() {
        let mut f = Fixture::new();
        f.primitive(Payload::ArmDetect { timeout_ms: 500, feedback_mode: 0, arm_id: 7 }, 0);
        let cycle = f.handler.armed_cycle().unwrap();
        f.event(cycle, GameEvent::Timeout, ms(500));
        let frames = f.out.drain();
        assert_eq!(frames[0].payload, Payload::TimeoutEvent { pod_id: 0x1234, arm_id: 7 });
        assert_eq!(frames[0].dest, crate::outbox::Destination::Unicast(master()));
    }

    #[test]
    fn test_failed_event_retried_with_same_seq() {
        let mut f = Fixture::new();
        let seq = f.arm_and_hit(100_000);

        for attempt in 1..=3u64 {
            let now = ms(100) * attempt;
            assert!(f.handler.on_delivery_failed(seq, now));
            f.tick(now + ms(50));
            let resent: Vec<_> = f
                .out
                .drain()
                .into_iter()
                .filter(|o| matches!(o.payload, Payload::HitEvent { .. }))
                .collect();
            assert_eq!(resent.len(), 1);
            assert_eq!(resent[0].seq, seq);
        }

        // budget spent
        assert!(f.handler.on_delivery_failed(seq, ms(400)));
        assert_eq!(f.handler.pending_events(), 0);
        assert_eq!(f.handler.dropped_events(), 1);
        assert!(!f.handler.on_delivery_failed(seq, ms(401)));
    }

    #[test]
    fn test_stale_cycle_ignored() {
        let mut f = Fixture::new();
        f.primitive(Payload::ArmDetect { timeout_ms: 500, feedback_mode: 0, arm_id: 7 }, 0);
        let first = f.handler.armed_cycle().unwrap();
        f.primitive(Payload::StopAll, ms(10));
        assert_eq!(f.handler.armed_cycle(), None);

        assert!(f.event(first, GameEvent::Timeout, ms(500)).is_none());
        assert!(f.out.is_empty());
        assert!(f.game.calls.contains(&"stop".to_string()));
    }

    #[test]
    fn test_new_arm_abandons_retries() {
        let mut f = Fixture::new();
        let seq = f.arm_and_hit(1_000);
        assert_eq!(f.handler.pending_events(), 1);
        f.primitive(Payload::ArmDetect { timeout_ms: 500, feedback_mode: 0, arm_id: 7 }, ms(20));
        assert_eq!(f.handler.pending_events(), 0);
        assert!(!f.handler.on_delivery_failed(seq, ms(30)));
    }

    #[test]
    fn test_synchronized_effect_needs_quality() {
        let mut f = Fixture::new();
        let params = EffectParams {
            start_at: ms(900),
            ..EffectParams::solid(255, 0, 0)
        };

        // no estimate yet: applied immediately
        f.primitive(Payload::SetEffect { params, duration_ms: 200 }, ms(100));
        assert_eq!(f.game.effects.len(), 1);
        assert_eq!(f.game.effects[0].start_at, 0);

        // converged at offset +100ms
        for i in 0..5u64 {
            let t1 = i * 10_000;
            f.clock.add_sample(t1, t1 + ms(100) + 300, t1 + ms(100) + 300, t1 + 600);
        }
        f.primitive(Payload::SetEffect { params, duration_ms: 200 }, ms(200));
        assert_eq!(f.game.effects.len(), 1);
        assert_eq!(f.handler.next_deadline(false, false), Some(ms(800)));

        f.tick(ms(799));
        assert_eq!(f.game.effects.len(), 1);
        f.tick(ms(800));
        assert_eq!(f.game.effects.len(), 2);
    }

    #[test]
    fn test_status_report_cadence() {
        let mut f = Fixture::new();
        f.handler.set_vitals(77, 30);
        f.tick(0);
        let frames = f.out.drain();
        assert_eq!(
            frames[0].payload,
            Payload::StatusReport { battery: 77, link_quality: 30 }
        );
        f.tick(ms(4_999));
        assert!(f.out.is_empty());
        f.tick(ms(5_000));
        assert_eq!(f.out.len(), 1);
    }

    #[test]
    fn test_dedup_window() {
        let mut dedup = EventDedup::default();
        let pod = master();
        assert!(dedup.accept(pod, 7));
        assert!(!dedup.accept(pod, 7));
        assert!(dedup.accept(own(), 7));
        for seq in 8..(8 + DEDUP_WINDOW as u16) {
            assert!(dedup.accept(pod, seq));
        }
        // 7 has aged out
        assert!(dedup.accept(pod, 7));
    }
}
