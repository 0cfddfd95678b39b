//! Scripted pod hardware
//!
//! `SimGame` answers every arm cycle according to a touch plan. The cluster
//! moves its clock before each batch of inputs and polls it for due events,
//! so hits and timeouts happen at exact virtual times.

use domes_core::{EffectParams, EventSink, GameCapability, GameEvent, TimeUs};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// How the player at this pod reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TouchPlan {
    /// Never touches; every cycle times out
    Never,
    /// Touches this long after arming (times out if longer than the timeout)
    After { reaction_ms: u64 },
}

/// One arm cycle as seen by the pod, in global virtual time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmRecord {
    pub cycle: u32,
    pub armed_at: TimeUs,
    pub ended_at: Option<TimeUs>,
    pub outcome: Option<GameEvent>,
}

struct Armed {
    sink: EventSink,
    timeout_us: TimeUs,
    local_at: TimeUs,
    record: usize,
}

struct GameState {
    plan: TouchPlan,
    battery: u8,
    local_now: TimeUs,
    global_now: TimeUs,
    armed: Option<Armed>,
    arms: Vec<ArmRecord>,
    effects: Vec<EffectParams>,
    sounds: u32,
    haptics: u32,
    stops: u32,
    joined: bool,
}

/// Shared handle: the coordinator owns one clone, the cluster another
#[derive(Clone)]
pub struct SimGame {
    state: Arc<Mutex<GameState>>,
}

impl SimGame {
    pub fn new(plan: TouchPlan) -> Self {
        Self {
            state: Arc::new(Mutex::new(GameState {
                plan,
                battery: 100,
                local_now: 0,
                global_now: 0,
                armed: None,
                arms: Vec::new(),
                effects: Vec::new(),
                sounds: 0,
                haptics: 0,
                stops: 0,
                joined: false,
            })),
        }
    }

    pub fn set_plan(&self, plan: TouchPlan) {
        self.state.lock().plan = plan;
    }

    pub fn set_battery(&self, battery: u8) {
        self.state.lock().battery = battery;
    }

    /// Move the game's clock; `local` is the pod's own clock
    pub fn set_time(&self, local: TimeUs, global: TimeUs) {
        let mut state = self.state.lock();
        state.local_now = local;
        state.global_now = global;
    }

    /// Local time of the next hit or timeout, if armed
    pub fn next_due(&self) -> Option<TimeUs> {
        let state = self.state.lock();
        let armed = state.armed.as_ref()?;
        let timeout_at = armed.local_at + armed.timeout_us;
        match state.plan {
            TouchPlan::After { reaction_ms } if reaction_ms * 1_000 < armed.timeout_us => {
                Some(armed.local_at + reaction_ms * 1_000)
            }
            _ => Some(timeout_at),
        }
    }

    /// Report whatever is due at the current clock
    pub fn advance(&self) {
        let mut state = self.state.lock();
        let now = state.local_now;
        let global = state.global_now;
        let Some(armed) = state.armed.as_ref() else {
            return;
        };

        let elapsed = now.saturating_sub(armed.local_at);
        let event = match state.plan {
            TouchPlan::After { reaction_ms }
                if reaction_ms * 1_000 < armed.timeout_us && elapsed >= reaction_ms * 1_000 =>
            {
                GameEvent::Hit {
                    reaction_us: elapsed.min(u32::MAX as u64) as u32,
                    strength: 200,
                }
            }
            _ if elapsed >= armed.timeout_us => GameEvent::Timeout,
            _ => return,
        };

        if let Some(armed) = state.armed.take() {
            armed.sink.emit(event);
            let record = &mut state.arms[armed.record];
            record.ended_at = Some(global);
            record.outcome = Some(event);
            debug!("Game: cycle {} -> {:?}", armed.sink.cycle(), event);
        }
    }

    pub fn arm_log(&self) -> Vec<ArmRecord> {
        self.state.lock().arms.clone()
    }

    pub fn effects(&self) -> Vec<EffectParams> {
        self.state.lock().effects.clone()
    }

    pub fn stop_count(&self) -> u32 {
        self.state.lock().stops
    }

    pub fn is_joined(&self) -> bool {
        self.state.lock().joined
    }

    pub fn cue_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.sounds, state.haptics)
    }
}

impl GameCapability for SimGame {
    fn arm(&mut self, timeout_ms: u32, _feedback_mode: u8, sink: EventSink) {
        let mut state = self.state.lock();
        let global = state.global_now;
        if let Some(previous) = state.armed.take() {
            state.arms[previous.record].ended_at = Some(global);
        }
        let record = state.arms.len();
        state.arms.push(ArmRecord {
            cycle: sink.cycle(),
            armed_at: global,
            ended_at: None,
            outcome: None,
        });
        state.armed = Some(Armed {
            sink,
            timeout_us: timeout_ms as TimeUs * 1_000,
            local_at: state.local_now,
            record,
        });
    }

    fn disarm(&mut self) {
        let mut state = self.state.lock();
        let global = state.global_now;
        if let Some(armed) = state.armed.take() {
            state.arms[armed.record].ended_at = Some(global);
        }
    }

    fn is_armed(&self) -> bool {
        self.state.lock().armed.is_some()
    }

    fn set_effect(&mut self, params: EffectParams, _duration_ms: u32) {
        self.state.lock().effects.push(params);
    }

    fn play_sound(&mut self, _sound_id: u16, _volume: u8) {
        self.state.lock().sounds += 1;
    }

    fn fire_haptic(&mut self, _effect_id: u8, _intensity: u8) {
        self.state.lock().haptics += 1;
    }

    fn stop_all(&mut self) {
        self.disarm();
        self.state.lock().stops += 1;
    }

    fn join_session(&mut self) {
        self.state.lock().joined = true;
    }

    fn battery_level(&self) -> u8 {
        self.state.lock().battery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domes_core::PodInput;
    use tokio::sync::mpsc;

    #[test]
    fn test_hit_after_reaction_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut game = SimGame::new(TouchPlan::After { reaction_ms: 250 });
        game.set_time(10_000, 10_000);
        game.arm(1000, 1, EventSink::new(tx, 3));
        assert_eq!(game.next_due(), Some(260_000));

        game.set_time(200_000, 200_000);
        game.advance();
        assert!(rx.try_recv().is_err());

        game.set_time(260_000, 260_000);
        game.advance();
        match rx.try_recv() {
            Ok(PodInput::Game { cycle: 3, event: GameEvent::Hit { reaction_us, .. } }) => {
                assert_eq!(reaction_us, 250_000)
            }
            other => panic!("Unexpected input {:?}", other),
        }
        assert!(!game.is_armed());
        assert_eq!(game.arm_log()[0].ended_at, Some(260_000));
    }

    #[test]
    fn test_slow_player_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut game = SimGame::new(TouchPlan::After { reaction_ms: 900 });
        game.arm(500, 1, EventSink::new(tx, 1));
        assert_eq!(game.next_due(), Some(500_000));

        game.set_time(500_000, 500_000);
        game.advance();
        assert!(matches!(
            rx.try_recv(),
            Ok(PodInput::Game { event: GameEvent::Timeout, .. })
        ));
        // nothing more for that cycle
        game.set_time(2_000_000, 2_000_000);
        game.advance();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disarm_closes_the_record() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut game = SimGame::new(TouchPlan::Never);
        game.arm(500, 1, EventSink::new(tx, 1));
        game.set_time(100_000, 100_000);
        game.stop_all();

        assert_eq!(game.next_due(), None);
        assert_eq!(game.stop_count(), 1);
        assert_eq!(game.arm_log()[0].ended_at, Some(100_000));
        assert_eq!(game.arm_log()[0].outcome, None);
        assert!(rx.try_recv().is_err());
    }
}
