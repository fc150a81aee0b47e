//! `HeartbeatRunner`: an adaptive tick interval that speeds up under
//! pressure (many unread events) and slows back down to a ceiling once
//! things go quiet for long enough.

use std::sync::Mutex;

use crate::config::HeartbeatConfig;

pub struct HeartbeatRunner {
    min_ms: u64,
    max_ms: u64,
    inactive_collapse_ticks: u32,
    state: Mutex<State>,
}

struct State {
    current_interval_ms: u64,
    consecutive_inactive_ticks: u32,
}

impl HeartbeatRunner {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            min_ms: config.min_ms,
            max_ms: config.max_ms,
            inactive_collapse_ticks: config.inactive_collapse_ticks,
            state: Mutex::new(State {
                current_interval_ms: config.initial_ms.clamp(config.min_ms, config.max_ms),
                consecutive_inactive_ticks: 0,
            }),
        }
    }

    pub fn current_interval_ms(&self) -> u64 {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).current_interval_ms
    }

    /// Fold `unread_events` pressure into the interval: heavy pressure
    /// (>20) halves it, moderate pressure (>8) shaves a quarter off,
    /// none at all eases it back up by 20%. After
    /// `inactive_collapse_ticks` consecutive empty ticks the interval
    /// collapses straight to `max_ms` rather than easing there tick by
    /// tick.
    pub fn update(&self, unread_events: u64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if unread_events > 20 {
            state.current_interval_ms = (state.current_interval_ms / 2).max(self.min_ms);
            state.consecutive_inactive_ticks = 0;
        } else if unread_events > 8 {
            state.current_interval_ms = ((state.current_interval_ms * 3) / 4).max(self.min_ms);
            state.consecutive_inactive_ticks = 0;
        } else if unread_events == 0 {
            state.consecutive_inactive_ticks += 1;
            if state.consecutive_inactive_ticks >= self.inactive_collapse_ticks {
                state.current_interval_ms = self.max_ms;
            } else {
                state.current_interval_ms = ((state.current_interval_ms * 6) / 5).min(self.max_ms);
            }
        }

        state.current_interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            min_ms: 1_000,
            max_ms: 60_000,
            initial_ms: 10_000,
            inactive_collapse_ticks: 3,
        }
    }

    #[test]
    fn heavy_pressure_halves_the_interval_down_to_the_floor() {
        let runner = HeartbeatRunner::new(&config());
        assert_eq!(runner.update(25), 5_000);
        assert_eq!(runner.update(25), 2_500);
        assert_eq!(runner.update(25), 1_250);
        assert_eq!(runner.update(25), 1_000);
    }

    #[test]
    fn moderate_pressure_eases_off_by_a_quarter() {
        let runner = HeartbeatRunner::new(&config());
        assert_eq!(runner.update(10), 7_500);
    }

    #[test]
    fn idle_ticks_ease_up_gradually_then_collapse_to_max() {
        let runner = HeartbeatRunner::new(&config());
        assert_eq!(runner.update(0), 12_000);
        assert_eq!(runner.update(0), 14_400);
        assert_eq!(runner.update(0), 60_000);
    }
}
