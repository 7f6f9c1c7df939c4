//! Guard for recurring automation: an action only runs when no priority
//! playlist holds the device, no block is active, and it is a weekday.

use crate::clock::Clock;
use crate::enforcement::BlockEnforcer;
use crate::priority::AuthorityView;
use chrono::{Datelike, NaiveDate};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PriorityPlaying,
    Blocked,
    Weekend,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::PriorityPlaying => write!(f, "priority playlist is playing"),
            SkipReason::Blocked => write!(f, "playback is blocked"),
            SkipReason::Weekend => write!(f, "weekend"),
        }
    }
}

pub fn is_weekday(date: NaiveDate) -> bool {
    date.weekday().number_from_monday() <= 5
}

#[derive(Clone)]
pub struct Guard {
    authority: AuthorityView,
    enforcer: Arc<BlockEnforcer>,
    clock: Arc<dyn Clock>,
}

impl Guard {
    pub fn new(authority: AuthorityView, enforcer: Arc<BlockEnforcer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            authority,
            enforcer,
            clock,
        }
    }

    /// First failing condition, checked in priority, block, weekday order.
    pub fn check(&self) -> Result<(), SkipReason> {
        if self.authority.is_priority_playing() {
            return Err(SkipReason::PriorityPlaying);
        }
        if self.enforcer.is_blocked() {
            return Err(SkipReason::Blocked);
        }
        if !is_weekday(self.clock.today()) {
            return Err(SkipReason::Weekend);
        }
        Ok(())
    }

    /// Run `action` if every condition holds; otherwise log the skip and
    /// return `None`.
    pub fn run<T>(&self, name: &str, action: impl FnOnce() -> T) -> Option<T> {
        match self.check() {
            Ok(()) => {
                debug!(action = name, "Guard passed");
                Some(action())
            }
            Err(reason) => {
                info!(action = name, %reason, "Skipping scheduled action");
                None
            }
        }
    }
}
