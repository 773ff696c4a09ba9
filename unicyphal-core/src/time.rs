//! Monotonic time primitives
//!
//! The stack never reads a wall clock. Time originates from an executor (or a
//! test driving virtual time) and flows into the transports through `run` and
//! frame timestamps. Microsecond resolution matches both wire protocols.

use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A signed span of time with microsecond resolution.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);
    pub const MAX: Duration = Duration(i64::MAX);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn saturating_add(self, other: Duration) -> Duration {
        Duration(self.0.saturating_add(other.0))
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

/// A point on the monotonic time line of an executor.
///
/// The epoch is arbitrary; only differences are meaningful. Arithmetic
/// saturates instead of wrapping so that "infinitely far" deadlines stay
/// infinitely far.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimePoint(i64);

impl TimePoint {
    pub const MIN: TimePoint = TimePoint(i64::MIN);
    pub const MAX: TimePoint = TimePoint(i64::MAX);

    /// The conventional origin used by executors started from scratch.
    pub const EPOCH: TimePoint = TimePoint(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn saturating_add(self, d: Duration) -> TimePoint {
        TimePoint(self.0.saturating_add(d.as_micros()))
    }

    pub const fn saturating_sub(self, d: Duration) -> TimePoint {
        TimePoint(self.0.saturating_sub(d.as_micros()))
    }

    pub const fn duration_since(self, earlier: TimePoint) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;
    fn add(self, rhs: Duration) -> TimePoint {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, rhs: Duration) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;
    fn sub(self, rhs: Duration) -> TimePoint {
        self.saturating_sub(rhs)
    }
}

impl SubAssign<Duration> for TimePoint {
    fn sub_assign(&mut self, rhs: Duration) {
        *self = self.saturating_sub(rhs);
    }
}

impl Sub for TimePoint {
    type Output = Duration;
    fn sub(self, rhs: TimePoint) -> Duration {
        self.duration_since(rhs)
    }
}
