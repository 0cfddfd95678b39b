//! Drill programs and the master-side interpreter.
//!
//! A drill is an ordered list of rounds. Rounds run strictly one after the
//! other: the next round's primitives are never sent before the current round
//! resolves, by event or by deadline, so results need no drill-level sequence
//! number.

use crate::codec::Payload;
use crate::config::DrillConfig;
use crate::error::SessionError;
use crate::game::{ArmCycles, GameCapability, GameEvent, FEEDBACK_LED};
use crate::outbox::Outbox;
use crate::types::{ms, EffectParams, PodAddr, TimeUs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How a round picks its target pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelector {
    Pod(PodAddr),
    Random,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundCue {
    pub sound_id: u16,
    #[serde(default = "default_volume")]
    pub volume: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HapticCue {
    pub effect_id: u8,
    #[serde(default = "default_volume")]
    pub intensity: u8,
}

fn default_volume() -> u8 {
    80
}

fn default_feedback() -> u8 {
    FEEDBACK_LED
}

/// One round of a drill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub target: TargetSelector,
    #[serde(default)]
    pub effect: EffectParams,
    #[serde(default)]
    pub sound: Option<SoundCue>,
    #[serde(default)]
    pub haptic: Option<HapticCue>,
    /// Arm timeout on the target pod
    pub timeout_ms: u32,
    /// Pause before this round starts
    #[serde(default)]
    pub delay_before_ms: u32,
    #[serde(default = "default_feedback")]
    pub feedback_mode: u8,
    /// Light every pod at the same network instant when the round starts
    #[serde(default)]
    pub synchronized: bool,
}

impl Round {
    pub fn new(target: TargetSelector, timeout_ms: u32) -> Self {
        Self {
            target,
            effect: EffectParams::solid(0, 255, 0),
            sound: None,
            haptic: None,
            timeout_ms,
            delay_before_ms: 0,
            feedback_mode: FEEDBACK_LED,
            synchronized: false,
        }
    }
}

/// An immutable, validated list of rounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillProgram {
    #[serde(default)]
    pub name: String,
    pub rounds: Vec<Round>,
}

impl DrillProgram {
    pub fn new(name: impl Into<String>, rounds: Vec<Round>) -> Self {
        Self {
            name: name.into(),
            rounds,
        }
    }

    /// Parse and validate a JSON program
    pub fn from_json(text: &str) -> Result<Self, SessionError> {
        let program: DrillProgram =
            serde_json::from_str(text).map_err(|e| SessionError::InvalidProgram(e.to_string()))?;
        program.validate()?;
        Ok(program)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.rounds.is_empty() {
            return Err(SessionError::InvalidProgram("no rounds".into()));
        }
        if let Some(index) = self.rounds.iter().position(|r| r.timeout_ms == 0) {
            return Err(SessionError::InvalidProgram(format!(
                "round {} has a zero timeout",
                index
            )));
        }
        Ok(())
    }
}

/// What happened in a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Hit { reaction_us: u32, strength: u8 },
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round: u32,
    pub pod: PodAddr,
    pub outcome: RoundOutcome,
}

impl RoundResult {
    pub fn timed_out(&self) -> bool {
        self.outcome == RoundOutcome::Timeout
    }

    pub fn reaction_us(&self) -> Option<u32> {
        match self.outcome {
            RoundOutcome::Hit { reaction_us, .. } => Some(reaction_us),
            RoundOutcome::Timeout => None,
        }
    }
}

/// Results of a finished or aborted drill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillResult {
    pub program: String,
    pub rounds: Vec<RoundResult>,
    pub hits: u32,
    pub misses: u32,
    pub avg_reaction_us: Option<u32>,
    pub min_reaction_us: Option<u32>,
    pub max_reaction_us: Option<u32>,
    pub total_time_us: u64,
    pub aborted: bool,
}

impl DrillResult {
    fn summarize(program: String, rounds: Vec<RoundResult>, total_time_us: u64, aborted: bool) -> Self {
        let reactions: Vec<u32> = rounds.iter().filter_map(|r| r.reaction_us()).collect();
        let hits = reactions.len() as u32;
        let misses = rounds.len() as u32 - hits;
        let avg_reaction_us = if reactions.is_empty() {
            None
        } else {
            Some((reactions.iter().map(|r| *r as u64).sum::<u64>() / reactions.len() as u64) as u32)
        };

        Self {
            program,
            hits,
            misses,
            avg_reaction_us,
            min_reaction_us: reactions.iter().copied().min(),
            max_reaction_us: reactions.iter().copied().max(),
            rounds,
            total_time_us,
            aborted,
        }
    }
}

/// Progress of the running drill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillProgress {
    pub program: String,
    pub round: u32,
    pub total: u32,
    pub armed_target: Option<PodAddr>,
}

/// Everything the interpreter borrows from the coordinator for one call
pub struct DrillContext<'a> {
    pub own: PodAddr,
    /// Master plus live peers, sorted
    pub roster: &'a [PodAddr],
    pub game: &'a mut dyn GameCapability,
    pub cycles: &'a mut ArmCycles,
    pub out: &'a mut Outbox,
    /// Local time
    pub now: TimeUs,
    /// Network time at `now`
    pub network_now: TimeUs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Between rounds
    Waiting { until: TimeUs },
    Armed {
        target: PodAddr,
        deadline: TimeUs,
        /// Arm cycle when the master armed its own game
        local_cycle: Option<u32>,
        /// Tag sent in ARM_DETECT when the target is remote
        arm_id: Option<u16>,
    },
}

/// Master-only drill interpreter
pub struct DrillInterpreter {
    config: DrillConfig,
    program: Option<DrillProgram>,
    index: usize,
    phase: Phase,
    results: Vec<RoundResult>,
    started_at: TimeUs,
    rng: StdRng,
    sequential_cursor: usize,
    /// Master's own share of a synchronized effect, local time
    local_effect: Option<(TimeUs, EffectParams, u32)>,
    late_events: u64,
    next_arm_id: u16,
}

impl DrillInterpreter {
    pub fn new(config: DrillConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let next_arm_id = rng.gen();
        Self {
            config,
            program: None,
            index: 0,
            phase: Phase::Idle,
            results: Vec::new(),
            started_at: 0,
            rng,
            sequential_cursor: 0,
            local_effect: None,
            late_events: 0,
            next_arm_id,
        }
    }

    pub fn is_running(&self) -> bool {
        self.program.is_some()
    }

    /// Events that matched no armed round
    pub fn late_events(&self) -> u64 {
        self.late_events
    }

    pub fn results(&self) -> &[RoundResult] {
        &self.results
    }

    pub fn progress(&self) -> Option<DrillProgress> {
        let program = self.program.as_ref()?;
        Some(DrillProgress {
            program: program.name.clone(),
            round: self.index as u32,
            total: program.rounds.len() as u32,
            armed_target: match self.phase {
                Phase::Armed { target, .. } => Some(target),
                _ => None,
            },
        })
    }

    /// Whether a local arm cycle belongs to the current round
    pub fn owns_cycle(&self, cycle: u32) -> bool {
        matches!(self.phase, Phase::Armed { local_cycle: Some(c), .. } if c == cycle)
    }

    pub fn start(&mut self, program: DrillProgram, ctx: &mut DrillContext<'_>) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::DrillAlreadyRunning);
        }
        program.validate()?;

        info!(
            "Drill: Starting '{}' ({} rounds, {} pods)",
            program.name,
            program.rounds.len(),
            ctx.roster.len()
        );
        ctx.out.broadcast(Payload::JoinSession);
        ctx.game.join_session();

        let first_delay = program.rounds[0].delay_before_ms as u64;
        self.program = Some(program);
        self.index = 0;
        self.results.clear();
        self.started_at = ctx.now;
        self.sequential_cursor = 0;
        self.phase = Phase::Waiting {
            until: ctx.now + ms(first_delay),
        };
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<TimeUs> {
        let phase = match self.phase {
            Phase::Idle => None,
            Phase::Waiting { until } => Some(until),
            Phase::Armed { deadline, .. } => Some(deadline),
        };
        let effect = self.local_effect.map(|(at, _, _)| at);
        phase.into_iter().chain(effect).min()
    }

    /// Advance timers; returns the result when the drill finishes
    pub fn tick(&mut self, ctx: &mut DrillContext<'_>) -> Option<DrillResult> {
        if let Some((at, params, duration)) = self.local_effect {
            if ctx.now >= at {
                ctx.game.set_effect(params, duration);
                self.local_effect = None;
            }
        }

        match self.phase {
            Phase::Idle => None,
            Phase::Waiting { until } => {
                if ctx.now >= until {
                    self.begin_round(ctx);
                }
                None
            }
            Phase::Armed {
                target,
                deadline,
                local_cycle,
                ..
            } => {
                if ctx.now < deadline {
                    return None;
                }
                info!("Drill: Round {} deadline passed for {}", self.index, target);
                if local_cycle.is_some() {
                    ctx.game.disarm();
                }
                self.resolve(target, RoundOutcome::Timeout, ctx)
            }
        }
    }

    fn begin_round(&mut self, ctx: &mut DrillContext<'_>) {
        let Some(round) = self.program.as_ref().and_then(|p| p.rounds.get(self.index)).cloned() else {
            return;
        };
        let target = self.select_target(&round.target, ctx);

        if round.synchronized {
            let start_at = ctx.network_now + ms(self.config.sync_lead_ms);
            let params = EffectParams {
                start_at,
                ..round.effect
            };
            ctx.out.broadcast(Payload::SetEffect {
                params,
                duration_ms: round.timeout_ms,
            });
            let local_at = ctx.now + ms(self.config.sync_lead_ms);
            self.local_effect = Some((local_at, EffectParams { start_at: 0, ..round.effect }, round.timeout_ms));
        }

        let mut arm_id = None;
        let local_cycle = if target == ctx.own {
            if !round.synchronized {
                ctx.game.set_effect(round.effect, round.timeout_ms);
            }
            if let Some(sound) = round.sound {
                ctx.game.play_sound(sound.sound_id, sound.volume);
            }
            if let Some(haptic) = round.haptic {
                ctx.game.fire_haptic(haptic.effect_id, haptic.intensity);
            }
            let sink = ctx.cycles.next_sink();
            let cycle = sink.cycle();
            ctx.game.arm(round.timeout_ms, round.feedback_mode, sink);
            Some(cycle)
        } else {
            if !round.synchronized {
                ctx.out.send(
                    target,
                    Payload::SetEffect {
                        params: round.effect,
                        duration_ms: round.timeout_ms,
                    },
                );
            }
            if let Some(sound) = round.sound {
                ctx.out.send(
                    target,
                    Payload::PlaySound {
                        sound_id: sound.sound_id,
                        volume: sound.volume,
                    },
                );
            }
            if let Some(haptic) = round.haptic {
                ctx.out.send(
                    target,
                    Payload::FireHaptic {
                        effect_id: haptic.effect_id,
                        intensity: haptic.intensity,
                    },
                );
            }
            let id = self.next_arm_id;
            self.next_arm_id = id.wrapping_add(1);
            ctx.out.send(
                target,
                Payload::ArmDetect {
                    timeout_ms: round.timeout_ms,
                    feedback_mode: round.feedback_mode,
                    arm_id: id,
                },
            );
            arm_id = Some(id);
            None
        };

        let deadline = ctx.now + ms(round.timeout_ms as u64 + self.config.deadline_grace_ms);
        debug!(
            "Drill: Round {} armed {} (timeout {}ms)",
            self.index, target, round.timeout_ms
        );
        self.phase = Phase::Armed {
            target,
            deadline,
            local_cycle,
            arm_id,
        };
    }

    fn select_target(&mut self, selector: &TargetSelector, ctx: &DrillContext<'_>) -> PodAddr {
        match *selector {
            TargetSelector::Pod(addr) => addr,
            TargetSelector::Random => {
                if ctx.roster.is_empty() {
                    ctx.own
                } else {
                    ctx.roster[self.rng.gen_range(0..ctx.roster.len())]
                }
            }
            TargetSelector::Sequential => {
                if ctx.roster.is_empty() {
                    return ctx.own;
                }
                let target = ctx.roster[self.sequential_cursor % ctx.roster.len()];
                self.sequential_cursor += 1;
                target
            }
        }
    }

    /// An event frame from a remote pod, already deduplicated
    pub fn on_remote_event(
        &mut self,
        from: PodAddr,
        payload: &Payload,
        ctx: &mut DrillContext<'_>,
    ) -> Option<DrillResult> {
        let (outcome, event_arm) = match *payload {
            Payload::HitEvent {
                reaction_us,
                strength,
                arm_id,
                ..
            } => (
                RoundOutcome::Hit {
                    reaction_us,
                    strength,
                },
                arm_id,
            ),
            Payload::TimeoutEvent { arm_id, .. } => (RoundOutcome::Timeout, arm_id),
            _ => return None,
        };

        match self.phase {
            Phase::Armed {
                target,
                local_cycle: None,
                arm_id: Some(expected),
                ..
            } if target == from && expected == event_arm => self.resolve(target, outcome, ctx),
            _ => {
                self.late_events += 1;
                debug!(
                    "Drill: Ignoring late or unmatched event from {} (arm {})",
                    from, event_arm
                );
                None
            }
        }
    }

    /// The master's own game reported on a cycle this interpreter armed
    pub fn on_local_event(
        &mut self,
        cycle: u32,
        event: GameEvent,
        ctx: &mut DrillContext<'_>,
    ) -> Option<DrillResult> {
        if !self.owns_cycle(cycle) {
            self.late_events += 1;
            return None;
        }
        let outcome = match event {
            GameEvent::Hit {
                reaction_us,
                strength,
            } => RoundOutcome::Hit {
                reaction_us,
                strength,
            },
            GameEvent::Timeout => RoundOutcome::Timeout,
        };
        self.resolve(ctx.own, outcome, ctx)
    }

    fn resolve(&mut self, pod: PodAddr, outcome: RoundOutcome, ctx: &mut DrillContext<'_>) -> Option<DrillResult> {
        let result = RoundResult {
            round: self.index as u32,
            pod,
            outcome,
        };
        match outcome {
            RoundOutcome::Hit { reaction_us, .. } => {
                info!("Drill: Round {} hit on {} in {}us", self.index, pod, reaction_us)
            }
            RoundOutcome::Timeout => info!("Drill: Round {} timed out on {}", self.index, pod),
        }
        self.results.push(result);
        self.index += 1;

        let total = self.program.as_ref().map_or(0, |p| p.rounds.len());
        if self.index >= total {
            return Some(self.finalize(false, ctx));
        }

        let delay = self
            .program
            .as_ref()
            .and_then(|p| p.rounds.get(self.index))
            .map_or(0, |r| r.delay_before_ms as u64);
        self.phase = Phase::Waiting {
            until: ctx.now + ms(self.config.inter_round_gap_ms + delay),
        };
        None
    }

    /// Stop the running drill; returns the partial result
    pub fn abort(&mut self, ctx: &mut DrillContext<'_>) -> Option<DrillResult> {
        if !self.is_running() {
            return None;
        }
        warn!("Drill: Aborted at round {}", self.index);
        if matches!(self.phase, Phase::Armed { local_cycle: Some(_), .. }) {
            ctx.game.disarm();
        }
        Some(self.finalize(true, ctx))
    }

    fn finalize(&mut self, aborted: bool, ctx: &mut DrillContext<'_>) -> DrillResult {
        ctx.out.broadcast(Payload::StopAll);
        ctx.game.stop_all();

        let name = self.program.take().map(|p| p.name).unwrap_or_default();
        let rounds = std::mem::take(&mut self.results);
        let result = DrillResult::summarize(name, rounds, ctx.now.saturating_sub(self.started_at), aborted);
        self.phase = Phase::Idle;
        self.index = 0;
        self.local_effect = None;

        info!(
            "Drill: Finished '{}': {} hit(s), {} miss(es), avg {:?}us{}",
            result.program,
            result.hits,
            result.misses,
            result.avg_reaction_us,
            if aborted { " (aborted)" } else { "" }
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::RecordingGame;
    use crate::outbox::Destination;
    use crate::session::PodInput;
    use tokio::sync::mpsc;

    fn addr(last: u8) -> PodAddr {
        PodAddr([0x02, 0, 0, 0, 0, last])
    }

    struct Fixture {
        drill: DrillInterpreter,
        game: RecordingGame,
        cycles: ArmCycles,
        out: Outbox,
        roster: Vec<PodAddr>,
        last_arm: Option<u16>,
        _rx: mpsc::UnboundedReceiver<PodInput>,
    }

    macro_rules! ctx {
        ($f:expr, $now:expr) => {
            &mut DrillContext {
                own: addr(1),
                roster: &$f.roster,
                game: &mut $f.game,
                cycles: &mut $f.cycles,
                out: &mut $f.out,
                now: $now,
                network_now: $now,
            }
        };
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                drill: DrillInterpreter::new(DrillConfig {
                    seed: Some(7),
                    ..DrillConfig::default()
                }),
                game: RecordingGame::default(),
                cycles: ArmCycles::new(tx),
                out: Outbox::new(),
                roster: vec![addr(1), addr(2), addr(3)],
                last_arm: None,
                _rx: rx,
            }
        }

        fn arms(&mut self) -> Vec<PodAddr> {
            let mut targets = Vec::new();
            for o in self.out.drain() {
                if let (Destination::Unicast(to), Payload::ArmDetect { arm_id, .. }) = (o.dest, o.payload) {
                    self.last_arm = Some(arm_id);
                    targets.push(to);
                }
            }
            targets
        }

        /// Tag of the most recent remote arm
        fn arm_id(&mut self) -> u16 {
            self.arms();
            self.last_arm.expect("no remote arm sent")
        }
    }

    fn program(rounds: Vec<Round>) -> DrillProgram {
        DrillProgram::new("test", rounds)
    }

    fn hit(arm_id: u16, reaction_us: u32) -> Payload {
        Payload::HitEvent {
            pod_id: 0,
            reaction_us,
            strength: 100,
            arm_id,
        }
    }

    #[test]
    fn test_program_validation() {
        assert!(program(vec![]).validate().is_err());
        assert!(program(vec![Round::new(TargetSelector::Random, 0)]).validate().is_err());

        let json = r#"{
            "name": "warmup",
            "rounds": [
                { "target": "random", "timeout_ms": 1000 },
                { "target": { "pod": "02:00:00:00:00:02" }, "timeout_ms": 800,
                  "delay_before_ms": 300, "sound": { "sound_id": 4 } }
            ]
        }"#;
        let parsed = DrillProgram::from_json(json).unwrap();
        assert_eq!(parsed.rounds.len(), 2);
        assert_eq!(parsed.rounds[1].target, TargetSelector::Pod(addr(2)));
        assert_eq!(parsed.rounds[1].sound.unwrap().volume, 80);
        assert_eq!(parsed.rounds[0].feedback_mode, FEEDBACK_LED);

        assert!(matches!(
            DrillProgram::from_json(r#"{ "rounds": [] }"#),
            Err(SessionError::InvalidProgram(_))
        ));
    }

    #[test]
    fn test_remote_round_sequence() {
        let mut f = Fixture::new();
        let prog = program(vec![
            Round::new(TargetSelector::Pod(addr(2)), 1_000),
            Round::new(TargetSelector::Pod(addr(3)), 1_000),
        ]);
        f.drill.start(prog, ctx!(f, 0)).unwrap();
        assert!(f.game.calls.contains(&"join".to_string()));

        f.drill.tick(ctx!(f, 0));
        assert_eq!(f.arms(), vec![addr(2)]);
        let first = f.last_arm.unwrap();

        // round 2 not sent before round 1 resolves
        f.drill.tick(ctx!(f, ms(500)));
        assert!(f.arms().is_empty());

        assert!(f.drill.on_remote_event(addr(2), &hit(first, 300_000), ctx!(f, ms(600))).is_none());
        f.drill.tick(ctx!(f, ms(700)));
        assert!(f.arms().is_empty());
        f.drill.tick(ctx!(f, ms(800)));
        assert_eq!(f.arms(), vec![addr(3)]);
        let second = f.last_arm.unwrap();
        assert_ne!(first, second);

        let result = f
            .drill
            .on_remote_event(addr(3), &hit(second, 200_000), ctx!(f, ms(1_000)))
            .unwrap();
        assert_eq!(result.hits, 2);
        assert_eq!(result.avg_reaction_us, Some(250_000));
        assert_eq!(result.min_reaction_us, Some(200_000));
        assert_eq!(result.total_time_us, ms(1_000));
        assert!(!result.aborted);
        assert!(f
            .out
            .frames()
            .iter()
            .any(|o| o.dest == Destination::Broadcast && o.payload == Payload::StopAll));
        assert!(!f.drill.is_running());
    }

    #[test]
    fn test_timeout_resolves_once() {
        let mut f = Fixture::new();
        let prog = program(vec![
            Round::new(TargetSelector::Pod(addr(2)), 500),
            Round::new(TargetSelector::Pod(addr(2)), 500),
        ]);
        f.drill.start(prog, ctx!(f, 0)).unwrap();
        f.drill.tick(ctx!(f, 0));
        let first = f.arm_id();

        // deadline = timeout + grace
        f.drill.tick(ctx!(f, ms(649)));
        assert!(f.drill.results().is_empty());
        f.drill.tick(ctx!(f, ms(650)));
        assert_eq!(f.drill.results().len(), 1);
        assert!(f.drill.results()[0].timed_out());

        // the late event for round 0 is ignored
        f.drill.on_remote_event(addr(2), &hit(first, 480_000), ctx!(f, ms(700)));
        assert_eq!(f.drill.results().len(), 1);
        assert_eq!(f.drill.late_events(), 1);
        assert_eq!(f.drill.progress().unwrap().round, 1);
    }

    #[test]
    fn test_stale_event_from_same_pod_does_not_resolve_next_arm() {
        let mut f = Fixture::new();
        let prog = program(vec![
            Round::new(TargetSelector::Pod(addr(2)), 300),
            Round::new(TargetSelector::Pod(addr(2)), 300),
        ]);
        f.drill.start(prog, ctx!(f, 0)).unwrap();
        f.drill.tick(ctx!(f, 0));
        let first = f.arm_id();

        // round 0 times out at 450ms, round 1 arms the same pod at 650ms
        f.drill.tick(ctx!(f, ms(450)));
        f.drill.tick(ctx!(f, ms(650)));
        assert_eq!(f.arms(), vec![addr(2)]);
        let second = f.last_arm.unwrap();
        assert_ne!(first, second);
        assert_eq!(f.drill.progress().unwrap().armed_target, Some(addr(2)));

        // round 0's hit arrives while round 1 is armed
        assert!(f
            .drill
            .on_remote_event(addr(2), &hit(first, 200_000), ctx!(f, ms(700)))
            .is_none());
        assert_eq!(f.drill.results().len(), 1);
        assert_eq!(f.drill.late_events(), 1);
        assert_eq!(f.drill.progress().unwrap().armed_target, Some(addr(2)));

        let timeout = Payload::TimeoutEvent { pod_id: 0, arm_id: second };
        let result = f.drill.on_remote_event(addr(2), &timeout, ctx!(f, ms(960))).unwrap();
        assert_eq!(result.rounds.len(), 2);
        assert!(result.rounds.iter().all(|r| r.timed_out()));
        assert_eq!(result.hits, 0);
    }

    #[test]
    fn test_event_from_wrong_pod_ignored() {
        let mut f = Fixture::new();
        f.drill
            .start(program(vec![Round::new(TargetSelector::Pod(addr(2)), 500)]), ctx!(f, 0))
            .unwrap();
        f.drill.tick(ctx!(f, 0));
        let arm_id = f.arm_id();
        assert!(f.drill.on_remote_event(addr(3), &hit(arm_id, 1), ctx!(f, ms(10))).is_none());
        assert!(f.drill.results().is_empty());
    }

    #[test]
    fn test_local_target_arms_game_directly() {
        let mut f = Fixture::new();
        f.drill
            .start(program(vec![Round::new(TargetSelector::Pod(addr(1)), 500)]), ctx!(f, 0))
            .unwrap();
        f.out.drain();
        f.drill.tick(ctx!(f, 0));
        assert!(f.arms().is_empty());
        assert!(f.game.is_armed());

        let cycle = f.game.hit(123_000).unwrap();
        assert!(f.drill.owns_cycle(cycle));
        let result = f
            .drill
            .on_local_event(cycle, GameEvent::Hit { reaction_us: 123_000, strength: 200 }, ctx!(f, ms(130)))
            .unwrap();
        assert_eq!(result.rounds[0].pod, addr(1));
        assert_eq!(result.rounds[0].reaction_us(), Some(123_000));
    }

    #[test]
    fn test_sequential_walks_roster() {
        let mut f = Fixture::new();
        let rounds = (0..4).map(|_| Round::new(TargetSelector::Sequential, 100)).collect();
        f.drill.start(program(rounds), ctx!(f, 0)).unwrap();

        let mut now = 0;
        let mut targets = Vec::new();
        for _ in 0..4 {
            f.drill.tick(ctx!(f, now));
            let target = f.drill.progress().unwrap().armed_target.unwrap();
            targets.push(target);
            if target == addr(1) {
                let cycle = f.game.hit(10).unwrap();
                f.drill.on_local_event(cycle, GameEvent::Hit { reaction_us: 10, strength: 1 }, ctx!(f, now));
            } else {
                let arm_id = f.arm_id();
                f.drill.on_remote_event(target, &hit(arm_id, 10), ctx!(f, now));
            }
            now += ms(200);
        }
        assert_eq!(targets, vec![addr(1), addr(2), addr(3), addr(1)]);
    }

    #[test]
    fn test_abort_returns_partial_result() {
        let mut f = Fixture::new();
        f.drill
            .start(
                program(vec![
                    Round::new(TargetSelector::Pod(addr(2)), 500),
                    Round::new(TargetSelector::Pod(addr(2)), 500),
                ]),
                ctx!(f, 0),
            )
            .unwrap();
        assert_eq!(
            f.drill.start(program(vec![Round::new(TargetSelector::Random, 5)]), ctx!(f, 0)),
            Err(SessionError::DrillAlreadyRunning)
        );
        f.drill.tick(ctx!(f, 0));
        let arm_id = f.arm_id();
        f.drill.on_remote_event(addr(2), &hit(arm_id, 100), ctx!(f, ms(100)));

        let result = f.drill.abort(ctx!(f, ms(150))).unwrap();
        assert!(result.aborted);
        assert_eq!(result.rounds.len(), 1);
        assert!(f.drill.abort(ctx!(f, ms(160))).is_none());
    }

    #[test]
    fn test_synchronized_round_broadcasts_start_time() {
        let mut f = Fixture::new();
        let mut round = Round::new(TargetSelector::Pod(addr(3)), 500);
        round.synchronized = true;
        f.drill.start(program(vec![round]), ctx!(f, 0)).unwrap();
        f.out.drain();

        f.drill.tick(ctx!(f, ms(1)));
        let frames = f.out.drain();
        assert!(frames.iter().any(|o| matches!(
            (o.dest, o.payload),
            (Destination::Broadcast, Payload::SetEffect { params, .. }) if params.start_at == ms(51)
        )));
        assert_eq!(f.drill.next_deadline(), Some(ms(51)));
        f.drill.tick(ctx!(f, ms(51)));
        assert_eq!(f.game.effects.len(), 1);
    }
}
