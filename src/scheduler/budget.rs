//! `AutonomyBudget`: per-channel hourly/daily sliding-window rate limits
//! plus a quiet-hours window that denies unconditionally regardless of
//! remaining budget.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};

use crate::config::AutonomyBudgetConfig;

#[derive(Default)]
struct ChannelWindows {
    hourly: Vec<DateTime<Utc>>,
    daily: Vec<DateTime<Utc>>,
}

pub struct AutonomyBudget {
    max_per_hour: usize,
    max_per_day: usize,
    quiet_hours_start_utc: Option<u8>,
    quiet_hours_end_utc: Option<u8>,
    windows: Mutex<HashMap<String, ChannelWindows>>,
}

impl AutonomyBudget {
    pub fn new(config: &AutonomyBudgetConfig) -> Self {
        Self {
            max_per_hour: config.max_per_hour,
            max_per_day: config.max_per_day,
            quiet_hours_start_utc: config.quiet_hours_start_utc,
            quiet_hours_end_utc: config.quiet_hours_end_utc,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (self.quiet_hours_start_utc, self.quiet_hours_end_utc) else {
            return false;
        };
        let hour = now.hour() as u8;
        if start <= end {
            hour >= start && hour < end
        } else {
            // wraps past midnight, e.g. 22 -> 6
            hour >= start || hour < end
        }
    }

    /// Returns `true` and records `now` in both windows if the action is
    /// allowed for `channel`; returns `false` without recording anything
    /// otherwise. Quiet hours deny unconditionally, before either window
    /// is even consulted.
    pub fn try_consume(&self, channel: &str, now: DateTime<Utc>) -> bool {
        if self.in_quiet_hours(now) {
            return false;
        }

        let mut guard = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = guard.entry(channel.to_string()).or_default();

        entry.hourly.retain(|t| now - *t < chrono::Duration::hours(1));
        entry.daily.retain(|t| now - *t < chrono::Duration::days(1));

        if entry.hourly.len() >= self.max_per_hour || entry.daily.len() >= self.max_per_day {
            return false;
        }

        entry.hourly.push(now);
        entry.daily.push(now);
        true
    }

    /// Best-effort snapshot of every channel's recorded timestamps, for
    /// persistence across restarts.
    pub fn export_state(&self) -> HashMap<String, (Vec<DateTime<Utc>>, Vec<DateTime<Utc>>)> {
        let guard = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.iter().map(|(k, v)| (k.clone(), (v.hourly.clone(), v.daily.clone()))).collect()
    }

    pub fn import_state(&self, snapshot: HashMap<String, (Vec<DateTime<Utc>>, Vec<DateTime<Utc>>)>) {
        let mut guard = self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (channel, (hourly, daily)) in snapshot {
            guard.insert(channel, ChannelWindows { hourly, daily });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutonomyBudgetConfig {
        AutonomyBudgetConfig {
            max_per_hour: 2,
            max_per_day: 3,
            quiet_hours_start_utc: None,
            quiet_hours_end_utc: None,
        }
    }

    #[test]
    fn denies_once_hourly_window_is_at_capacity() {
        let budget = AutonomyBudget::new(&config());
        let now = Utc::now();
        assert!(budget.try_consume("chan", now));
        assert!(budget.try_consume("chan", now));
        assert!(!budget.try_consume("chan", now));
    }

    #[test]
    fn daily_cap_binds_even_if_hourly_has_room() {
        let mut cfg = config();
        cfg.max_per_hour = 100;
        cfg.max_per_day = 1;
        let budget = AutonomyBudget::new(&cfg);
        let now = Utc::now();
        assert!(budget.try_consume("chan", now));
        assert!(!budget.try_consume("chan", now));
    }

    #[test]
    fn quiet_hours_deny_unconditionally_with_wraparound() {
        let mut cfg = config();
        cfg.quiet_hours_start_utc = Some(22);
        cfg.quiet_hours_end_utc = Some(6);
        let budget = AutonomyBudget::new(&cfg);
        let midnight = Utc::now().date_naive().and_hms_opt(23, 0, 0).unwrap().and_utc();
        assert!(!budget.try_consume("chan", midnight));
        let daytime = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        assert!(budget.try_consume("chan", daytime));
    }

    #[test]
    fn channels_are_tracked_independently() {
        let budget = AutonomyBudget::new(&config());
        let now = Utc::now();
        assert!(budget.try_consume("a", now));
        assert!(budget.try_consume("a", now));
        assert!(budget.try_consume("b", now));
    }
}
