//! Wall-clock source. Everything time-based reads local time through a
//! `Clock` so schedules can be driven deterministically in tests.

use chrono::{Local, NaiveDate, NaiveDateTime, TimeDelta};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    /// Current local time, naive (no zone attached).
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// The real local clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.lock() = at;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NaiveDateTime> {
        // A poisoned clock still holds a valid timestamp.
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(at("2024-03-04 10:00:00"));
        assert_eq!(clock.now(), at("2024-03-04 10:00:00"));
        clock.advance(TimeDelta::seconds(90));
        assert_eq!(clock.now(), at("2024-03-04 10:01:30"));
        clock.set(at("2024-03-05 00:00:00"));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
    }

    #[test]
    fn system_clock_is_close_to_local_now() {
        let diff = Local::now().naive_local() - SystemClock.now();
        assert!(diff.num_seconds().abs() < 2);
    }
}
