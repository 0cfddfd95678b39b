//! Local game capability
//!
//! The interface between the coordination core and a pod's own hardware
//! (light ring, audio, haptics, touch sensing). Implementations live outside
//! the core: a console stand-in in the node binary, a scripted pod in the
//! simulation harness.

use crate::session::PodInput;
use crate::types::EffectParams;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Feedback-mode bits for ARM_DETECT
pub const FEEDBACK_LED: u8 = 0x01;
pub const FEEDBACK_AUDIO: u8 = 0x02;

/// Outcome of one arm cycle, measured on the pod's own clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameEvent {
    Hit { reaction_us: u32, strength: u8 },
    Timeout,
}

/// Where a game reports the outcome of one arm cycle.
///
/// Each sink is tagged with the cycle it was issued for, so an event from a
/// cycle that has since been disarmed can be recognised and ignored.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PodInput>,
    cycle: u32,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<PodInput>, cycle: u32) -> Self {
        Self { tx, cycle }
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Report the outcome. Returns false if the coordinator is gone.
    pub fn emit(&self, event: GameEvent) -> bool {
        self.tx
            .send(PodInput::Game {
                cycle: self.cycle,
                event,
            })
            .is_ok()
    }
}

/// Issues a fresh sink per arm cycle
#[derive(Debug, Clone)]
pub struct ArmCycles {
    tx: mpsc::UnboundedSender<PodInput>,
    next: u32,
}

impl ArmCycles {
    pub fn new(tx: mpsc::UnboundedSender<PodInput>) -> Self {
        Self { tx, next: 1 }
    }

    pub fn next_sink(&mut self) -> EventSink {
        let cycle = self.next;
        self.next = self.next.wrapping_add(1);
        EventSink::new(self.tx.clone(), cycle)
    }
}

/// Per-pod game capability
pub trait GameCapability: Send {
    /// Arm detection. The game must report exactly one `GameEvent` through
    /// `sink`: a hit, or a timeout after `timeout_ms`.
    fn arm(&mut self, timeout_ms: u32, feedback_mode: u8, sink: EventSink);

    /// Cancel detection; no event is reported for the cancelled cycle
    fn disarm(&mut self);

    fn is_armed(&self) -> bool;

    /// Apply a visual effect now
    fn set_effect(&mut self, params: EffectParams, duration_ms: u32);

    fn play_sound(&mut self, _sound_id: u16, _volume: u8) {}

    fn fire_haptic(&mut self, _effect_id: u8, _intensity: u8) {}

    /// Disarm and clear all outputs
    fn stop_all(&mut self) {
        self.disarm();
    }

    /// Enter session mode
    fn join_session(&mut self) {}

    /// Battery level, percent
    fn battery_level(&self) -> u8 {
        100
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A game that records calls and lets tests fire events by hand
    #[derive(Default)]
    pub struct RecordingGame {
        pub calls: Vec<String>,
        pub armed: Option<EventSink>,
        pub effects: Vec<EffectParams>,
    }

    impl RecordingGame {
        pub fn hit(&mut self, reaction_us: u32) -> Option<u32> {
            let sink = self.armed.take()?;
            sink.emit(GameEvent::Hit {
                reaction_us,
                strength: 200,
            });
            Some(sink.cycle())
        }
    }

    impl GameCapability for RecordingGame {
        fn arm(&mut self, timeout_ms: u32, feedback_mode: u8, sink: EventSink) {
            self.calls.push(format!("arm {} {}", timeout_ms, feedback_mode));
            self.armed = Some(sink);
        }

        fn disarm(&mut self) {
            self.calls.push("disarm".into());
            self.armed = None;
        }

        fn is_armed(&self) -> bool {
            self.armed.is_some()
        }

        fn set_effect(&mut self, params: EffectParams, duration_ms: u32) {
            self.calls.push(format!("effect {}", duration_ms));
            self.effects.push(params);
        }

        fn play_sound(&mut self, sound_id: u16, _volume: u8) {
            self.calls.push(format!("sound {}", sound_id));
        }

        fn stop_all(&mut self) {
            self.calls.push("stop".into());
            self.armed = None;
        }

        fn join_session(&mut self) {
            self.calls.push("join".into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_are_distinct() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cycles = ArmCycles::new(tx);
        let a = cycles.next_sink();
        let b = cycles.next_sink();
        assert_ne!(a.cycle(), b.cycle());

        assert!(b.emit(GameEvent::Timeout));
        match rx.try_recv().unwrap() {
            PodInput::Game { cycle, event } => {
                assert_eq!(cycle, b.cycle());
                assert_eq!(event, GameEvent::Timeout);
            }
            other => panic!("Unexpected input: {:?}", other),
        }
    }
}
