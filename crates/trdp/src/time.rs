//! Monotonic time values for deadline bookkeeping.
//!
//! TRDP schedules everything (send cycles, receive supervision, reply and
//! confirm timeouts, idle connection reaping) against absolute monotonic
//! deadlines. [`TimeVal`] is the `(seconds, microseconds)` pair those
//! deadlines are expressed in; [`TimeVal::now`] reads a process-local
//! monotonic clock, so values are comparable within a process but carry no
//! wall-clock meaning.

use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const USEC_PER_SEC: u32 = 1_000_000;

/// A `(seconds, microseconds)` time value.
///
/// The microsecond part is always normalized below one million. The
/// all-zero value doubles as "unset", matching the on-wire convention of
/// zero meaning "don't care".
///
/// Field order makes the derived ordering compare seconds first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeVal {
    sec: u32,
    usec: u32,
}

impl TimeVal {
    /// The zero value, used as "unset".
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    /// Create a time value from seconds and microseconds, normalizing
    /// the microsecond part.
    pub const fn new(sec: u32, usec: u32) -> Self {
        TimeVal {
            sec: sec + usec / USEC_PER_SEC,
            usec: usec % USEC_PER_SEC,
        }
    }

    /// Create a time value from a microsecond count.
    pub const fn from_micros(usecs: u64) -> Self {
        TimeVal {
            sec: (usecs / USEC_PER_SEC as u64) as u32,
            usec: (usecs % USEC_PER_SEC as u64) as u32,
        }
    }

    /// Create a time value from a millisecond count.
    pub const fn from_millis(msecs: u64) -> Self {
        Self::from_micros(msecs * 1000)
    }

    /// The current monotonic time, anchored at first use within the
    /// process.
    pub fn now() -> Self {
        static ANCHOR: OnceLock<Instant> = OnceLock::new();
        let anchor = *ANCHOR.get_or_init(Instant::now);
        Self::from(anchor.elapsed())
    }

    /// The seconds part.
    pub const fn sec(self) -> u32 {
        self.sec
    }

    /// The microseconds part (always `< 1_000_000`).
    pub const fn usec(self) -> u32 {
        self.usec
    }

    /// Total microseconds.
    pub const fn as_micros(self) -> u64 {
        self.sec as u64 * USEC_PER_SEC as u64 + self.usec as u64
    }

    /// Check for the "unset" value.
    pub const fn is_zero(self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Saturating difference `self - other`, zero if `other` is later.
    pub fn saturating_sub(self, other: TimeVal) -> TimeVal {
        if self <= other {
            TimeVal::ZERO
        } else {
            TimeVal::from_micros(self.as_micros() - other.as_micros())
        }
    }

    /// Divide by a scalar.
    pub fn div(self, divisor: u32) -> TimeVal {
        assert!(divisor != 0, "division of TimeVal by zero");
        TimeVal::from_micros(self.as_micros() / divisor as u64)
    }

    /// Multiply by a scalar.
    pub fn mul(self, factor: u32) -> TimeVal {
        TimeVal::from_micros(self.as_micros() * factor as u64)
    }

    /// The earlier of two values, treating zero as "unset".
    pub fn min_set(self, other: TimeVal) -> TimeVal {
        match (self.is_zero(), other.is_zero()) {
            (true, _) => other,
            (_, true) => self,
            _ => self.min(other),
        }
    }
}

impl Add for TimeVal {
    type Output = TimeVal;

    fn add(self, rhs: TimeVal) -> TimeVal {
        let mut sec = self.sec + rhs.sec;
        let mut usec = self.usec + rhs.usec;
        if usec >= USEC_PER_SEC {
            sec += 1;
            usec -= USEC_PER_SEC;
        }
        TimeVal { sec, usec }
    }
}

impl AddAssign for TimeVal {
    fn add_assign(&mut self, rhs: TimeVal) {
        *self = *self + rhs;
    }
}

impl Sub for TimeVal {
    type Output = TimeVal;

    /// Saturating subtraction; deadlines never go negative.
    fn sub(self, rhs: TimeVal) -> TimeVal {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for TimeVal {
    fn from(d: Duration) -> Self {
        TimeVal {
            sec: d.as_secs() as u32,
            usec: d.subsec_micros(),
        }
    }
}

impl From<TimeVal> for Duration {
    fn from(tv: TimeVal) -> Self {
        Duration::new(tv.sec as u64, tv.usec * 1000)
    }
}
