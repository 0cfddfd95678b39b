//! Console stand-in for the pod hardware
//!
//! Effects, sounds and haptics are printed. A touch is typed on the console
//! (`hit`); arming starts a timer that reports a timeout if nobody does.

use domes_core::{EffectParams, EventSink, GameCapability, GameEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct Armed {
    sink: EventSink,
    armed_at: Instant,
}

/// Shared handle: the pod runtime owns one clone, the console another
#[derive(Clone)]
pub struct ConsoleGame {
    armed: Arc<Mutex<Option<Armed>>>,
    battery: Arc<Mutex<u8>>,
}

impl ConsoleGame {
    pub fn new(battery: u8) -> Self {
        Self {
            armed: Arc::new(Mutex::new(None)),
            battery: Arc::new(Mutex::new(battery)),
        }
    }

    /// Register a touch. Returns the reaction time if the pod was armed.
    pub fn hit(&self) -> Option<u32> {
        let armed = self.armed.lock().take()?;
        let reaction_us = armed.armed_at.elapsed().as_micros().min(u32::MAX as u128) as u32;
        armed.sink.emit(GameEvent::Hit {
            reaction_us,
            strength: 255,
        });
        Some(reaction_us)
    }

    pub fn set_battery(&self, level: u8) {
        *self.battery.lock() = level.min(100);
    }
}

impl GameCapability for ConsoleGame {
    fn arm(&mut self, timeout_ms: u32, feedback_mode: u8, sink: EventSink) {
        let cycle = sink.cycle();
        *self.armed.lock() = Some(Armed {
            sink,
            armed_at: Instant::now(),
        });
        info!("Game: ARMED for {}ms (feedback 0x{:02x}), type 'hit'", timeout_ms, feedback_mode);

        let armed = self.armed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
            let mut slot = armed.lock();
            if slot.as_ref().map(|a| a.sink.cycle()) == Some(cycle) {
                if let Some(expired) = slot.take() {
                    info!("Game: Timed out");
                    expired.sink.emit(GameEvent::Timeout);
                }
            }
        });
    }

    fn disarm(&mut self) {
        if self.armed.lock().take().is_some() {
            debug!("Game: Disarmed");
        }
    }

    fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    fn set_effect(&mut self, params: EffectParams, duration_ms: u32) {
        info!(
            "Game: LED #{:02x}{:02x}{:02x} pattern {} for {}ms",
            params.r, params.g, params.b, params.pattern, duration_ms
        );
    }

    fn play_sound(&mut self, sound_id: u16, volume: u8) {
        info!("Game: Sound {} at {}%", sound_id, volume);
    }

    fn fire_haptic(&mut self, effect_id: u8, intensity: u8) {
        info!("Game: Haptic {} at {}", effect_id, intensity);
    }

    fn stop_all(&mut self) {
        self.disarm();
        info!("Game: All outputs off");
    }

    fn join_session(&mut self) {
        info!("Game: Joined session");
    }

    fn battery_level(&self) -> u8 {
        *self.battery.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domes_core::PodInput;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut game = ConsoleGame::new(90);
        game.arm(500, 1, EventSink::new(tx, 4));
        assert!(game.is_armed());

        tokio::time::sleep(Duration::from_millis(600)).await;
        match rx.recv().await {
            Some(PodInput::Game { cycle: 4, event: GameEvent::Timeout }) => {}
            other => panic!("Unexpected input {:?}", other),
        }
        assert!(!game.is_armed());
        assert!(game.hit().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_cancels_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut game = ConsoleGame::new(90);
        game.arm(500, 1, EventSink::new(tx, 1));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let reaction = game.hit().unwrap();
        assert!(reaction >= 120_000);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            rx.recv().await,
            Some(PodInput::Game { event: GameEvent::Hit { .. }, .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_battery_clamped() {
        let game = ConsoleGame::new(50);
        game.set_battery(140);
        assert_eq!(game.battery_level(), 100);
    }
}
