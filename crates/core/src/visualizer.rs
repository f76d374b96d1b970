//! Microphone level feedback for the active card.
//!
//! While a session is active and the agent is not speaking, the visualizer
//! samples the microphone level once per display frame and renders it as the
//! card's intensity. While the agent speaks the card's speaking flag drives
//! the visuals instead, so sampling is skipped.

use crate::{
    card::{CardId, CardRegistry},
    voice::MicTap,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

/// One display frame.
pub const VISUALIZER_INTERVAL: Duration = Duration::from_millis(16);

/// Smoothing and gain applied to raw microphone levels.
///
/// The meter outlives individual sessions; the controller keeps one and lends
/// it to every visualizer it starts.
#[derive(Debug)]
pub struct LevelMeter {
    smoothing: f32,
    gain: f32,
    last: Mutex<f32>,
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(0.6, 4.0)
    }
}

impl LevelMeter {
    pub fn new(smoothing: f32, gain: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 0.99),
            gain,
            last: Mutex::new(0.0),
        }
    }

    /// Folds a raw RMS level into the smoothed intensity, in `0.0..=1.0`.
    pub fn sample(&self, raw: f32) -> f32 {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let target = (raw * self.gain).clamp(0.0, 1.0);
        *last = *last * self.smoothing + target * (1.0 - self.smoothing);
        *last
    }

    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = 0.0;
    }
}

/// A running feedback loop bound to one card. Dropping it stops the loop and
/// releases its hold on the microphone tap.
pub struct AudioVisualizer {
    card: CardId,
    handle: JoinHandle<()>,
}

impl AudioVisualizer {
    pub fn start(
        card: CardId,
        tap: Arc<dyn MicTap>,
        registry: Arc<dyn CardRegistry>,
        meter: Arc<LevelMeter>,
    ) -> Self {
        meter.reset();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(VISUALIZER_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match registry.card(card) {
                    Some(state) if state.active => {
                        if !state.speaking {
                            registry.set_intensity(card, meter.sample(tap.level()));
                        }
                    }
                    _ => break,
                }
            }
            registry.set_intensity(card, 0.0);
            debug!(%card, "Visualizer stopped: card is no longer active");
        });
        Self { card, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the loop without waiting for it to notice the card went idle.
    pub fn stop(self) {
        self.handle.abort();
        debug!(card = %self.card, "Visualizer stopped");
    }
}

impl Drop for AudioVisualizer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{card::InMemoryCardRegistry, models::Character};
    use tokio::sync::broadcast;

    struct FixedTap {
        level: f32,
        tx: broadcast::Sender<Arc<[i16]>>,
    }

    impl FixedTap {
        fn new(level: f32) -> Arc<Self> {
            let (tx, _) = broadcast::channel(4);
            Arc::new(Self { level, tx })
        }
    }

    impl MicTap for FixedTap {
        fn level(&self) -> f32 {
            self.level
        }
        fn subscribe(&self) -> broadcast::Receiver<Arc<[i16]>> {
            self.tx.subscribe()
        }
    }

    fn active_registry() -> (Arc<InMemoryCardRegistry>, CardId) {
        let registry = Arc::new(InMemoryCardRegistry::new());
        let card = registry.mount(Character {
            name: "Elizabeth Bennet".into(),
            description: String::new(),
            assigned_voice_id: "v".into(),
            system_prompt: String::new(),
        });
        registry.set_active(card, true);
        (registry, card)
    }

    #[test]
    fn test_level_meter_smooths_towards_target() {
        let meter = LevelMeter::new(0.5, 1.0);
        assert_eq!(meter.sample(1.0), 0.5);
        assert_eq!(meter.sample(1.0), 0.75);
        meter.reset();
        assert_eq!(meter.sample(0.0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renders_level_while_listening() {
        let (registry, card) = active_registry();
        let tap = FixedTap::new(0.2);
        let visualizer = AudioVisualizer::start(
            card,
            tap.clone(),
            registry.clone(),
            Arc::new(LevelMeter::default()),
        );

        tokio::time::sleep(VISUALIZER_INTERVAL * 20).await;
        assert!(registry.card(card).unwrap().intensity > 0.5);
        assert!(!visualizer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_defers_while_speaking() {
        let (registry, card) = active_registry();
        registry.set_speaking(card, true);
        let _visualizer = AudioVisualizer::start(
            card,
            FixedTap::new(0.9),
            registry.clone(),
            Arc::new(LevelMeter::default()),
        );

        tokio::time::sleep(VISUALIZER_INTERVAL * 10).await;
        assert_eq!(registry.card(card).unwrap().intensity, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminates_when_card_deactivates() {
        let (registry, card) = active_registry();
        let tap = FixedTap::new(0.5);
        let visualizer = AudioVisualizer::start(
            card,
            tap.clone(),
            registry.clone(),
            Arc::new(LevelMeter::default()),
        );

        tokio::time::sleep(VISUALIZER_INTERVAL * 3).await;
        registry.set_active(card, false);
        tokio::time::sleep(VISUALIZER_INTERVAL * 3).await;

        assert!(visualizer.is_finished());
        assert_eq!(Arc::strong_count(&tap), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_tap() {
        let (registry, card) = active_registry();
        let tap = FixedTap::new(0.5);
        let visualizer = AudioVisualizer::start(
            card,
            tap.clone(),
            registry,
            Arc::new(LevelMeter::default()),
        );
        visualizer.stop();
        tokio::time::sleep(VISUALIZER_INTERVAL).await;
        assert_eq!(Arc::strong_count(&tap), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_sampling_on_active_card() {
        let (registry, card) = active_registry();
        let visualizer = AudioVisualizer::start(
            card,
            FixedTap::new(0.5),
            registry.clone(),
            Arc::new(LevelMeter::default()),
        );
        tokio::time::sleep(VISUALIZER_INTERVAL * 4).await;
        assert!(registry.card(card).unwrap().intensity > 0.0);

        visualizer.stop();
        registry.set_intensity(card, 0.0);
        tokio::time::sleep(VISUALIZER_INTERVAL * 4).await;
        assert!(registry.card(card).unwrap().active);
        assert_eq!(registry.card(card).unwrap().intensity, 0.0);
    }
}
