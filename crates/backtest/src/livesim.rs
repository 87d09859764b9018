//! Livesim pacing: replay at a human pace with pause/resume.

use crate::control::RunControl;
use barsim_core::config::LivesimConfig;
use barsim_core::Gate;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Throttles quote delivery and holds it while paused.
#[derive(Debug)]
pub struct LivesimPacer {
    config: LivesimConfig,
    unpaused: Gate,
    rng: Mutex<StdRng>,
}

impl LivesimPacer {
    pub fn new(config: LivesimConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests and reproducible replays.
    pub fn with_seed(config: LivesimConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: LivesimConfig, rng: StdRng) -> Self {
        Self {
            config,
            unpaused: Gate::new(true),
            rng: Mutex::new(rng),
        }
    }

    pub fn pause(&self) {
        tracing::info!("livesim paused");
        self.unpaused.close();
    }

    pub fn resume(&self) {
        tracing::info!("livesim resumed");
        self.unpaused.open();
    }

    pub fn is_paused(&self) -> bool {
        !self.unpaused.is_open()
    }

    /// Block while paused. Returns false if an abort was requested meanwhile.
    pub fn wait_if_paused(&self, control: &RunControl) -> bool {
        let poll = Duration::from_millis(self.config.pause_poll_ms.max(1));
        while !self.unpaused.wait_until_open(poll) {
            if control.abort_requested.is_open() {
                return false;
            }
        }
        !control.abort_requested.is_open()
    }

    /// Pause to apply after one quote: base delay plus optional jitter.
    pub fn delay_after_quote(&self) -> Duration {
        let mut ms = self.config.base_delay_ms;
        if self.config.delay_between_quotes_enabled {
            let min = self.config.delay_min_ms;
            let max = self.config.delay_max_ms.max(min);
            ms += if max > min {
                self.rng.lock().gen_range(min..=max)
            } else {
                min
            };
        }
        Duration::from_millis(ms)
    }

    /// Sleep the post-quote delay.
    pub fn pace(&self) {
        let delay = self.delay_after_quote();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsim_core::CollectingReporter;
    use std::sync::Arc;
    use std::thread;

    fn make_config(enabled: bool, min: u64, max: u64) -> LivesimConfig {
        LivesimConfig {
            delay_between_quotes_enabled: enabled,
            delay_min_ms: min,
            delay_max_ms: max,
            base_delay_ms: 5,
            pause_poll_ms: 5,
        }
    }

    #[test]
    fn test_delay_within_bounds() {
        let pacer = LivesimPacer::with_seed(make_config(true, 10, 20), 7);
        for _ in 0..100 {
            let ms = pacer.delay_after_quote().as_millis() as u64;
            assert!((15..=25).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn test_fixed_delay_when_max_is_zero() {
        let pacer = LivesimPacer::with_seed(make_config(true, 10, 0), 7);
        assert_eq!(pacer.delay_after_quote(), Duration::from_millis(15));

        let disabled = LivesimPacer::with_seed(make_config(false, 10, 20), 7);
        assert_eq!(disabled.delay_after_quote(), Duration::from_millis(5));
    }

    #[test]
    fn test_pause_blocks_until_resume() {
        let pacer = Arc::new(LivesimPacer::with_seed(make_config(false, 0, 0), 1));
        let control = RunControl::new(10, false, Arc::new(CollectingReporter::new()));
        control.begin();
        pacer.pause();
        assert!(pacer.is_paused());

        let resumer = {
            let pacer = pacer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pacer.resume();
            })
        };
        assert!(pacer.wait_if_paused(&control));
        resumer.join().unwrap();
    }

    #[test]
    fn test_abort_gets_through_pause() {
        let pacer = LivesimPacer::with_seed(make_config(false, 0, 0), 1);
        let control = Arc::new(RunControl::new(10, false, Arc::new(CollectingReporter::new())));
        control.begin();
        pacer.pause();

        let aborter = {
            let control = control.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                control.request_abort("user");
            })
        };
        assert!(!pacer.wait_if_paused(&control));
        aborter.join().unwrap();
    }
}
