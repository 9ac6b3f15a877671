//! Deadline-ordered timer index.
//!
//! Every deadline a session tracks (publication send cycles, subscription
//! supervision, MD reply and confirm timeouts, idle TCP reaping) lives in
//! one ordered index keyed by absolute monotonic time. Finding the next
//! wake-up is a first-element read and collecting due work is a range
//! drain, instead of walking every telegram queue per cycle.
//!
//! Rescheduling is remove-then-insert through a reverse map, so a timer
//! key has at most one armed deadline at any moment.

use std::collections::{BTreeSet, HashMap};

use crate::time::TimeVal;

/// What a deadline means when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKey {
    /// A publication is due to be sent. Carries the publication id.
    PdSend(u32),
    /// A subscription's supervision interval expires. Carries the
    /// subscription id.
    PdTimeout(u32),
    /// A caller session's reply deadline expires. Carries the MD
    /// session id.
    MdReply(u32),
    /// A replier session's confirm deadline expires. Carries the MD
    /// session id.
    MdConfirm(u32),
    /// An idle TCP connection may be closed. Carries the socket pool
    /// index.
    SockIdle(u32),
}

/// The deadline index.
#[derive(Debug, Default)]
pub struct DeadlineIndex {
    ordered: BTreeSet<(TimeVal, TimerKey)>,
    armed: HashMap<TimerKey, TimeVal>,
}

impl DeadlineIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` at `deadline`, replacing any earlier arming.
    pub fn schedule(&mut self, key: TimerKey, deadline: TimeVal) {
        if let Some(old) = self.armed.insert(key, deadline) {
            self.ordered.remove(&(old, key));
        }
        self.ordered.insert((deadline, key));
    }

    /// Disarm `key`. Unknown keys are ignored.
    pub fn cancel(&mut self, key: TimerKey) {
        if let Some(old) = self.armed.remove(&key) {
            self.ordered.remove(&(old, key));
        }
    }

    /// The earliest armed deadline.
    pub fn next_deadline(&self) -> Option<TimeVal> {
        self.ordered.first().map(|&(t, _)| t)
    }

    /// Remove and return every deadline at or before `now`, earliest
    /// first.
    pub fn pop_due(&mut self, now: TimeVal) -> Vec<(TimeVal, TimerKey)> {
        let mut due = Vec::new();
        while let Some(&(t, key)) = self.ordered.first() {
            if t > now {
                break;
            }
            self.ordered.pop_first();
            self.armed.remove(&key);
            due.push((t, key));
        }
        due
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Check for an empty index.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
