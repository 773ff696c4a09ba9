//! Time sources for the executor

use core::cell::Cell;

use crate::core::TimePoint;

/// A monotonic time source.
///
/// Real clocks (a hardware timer, `std::time::Instant` behind a shim) only
/// implement `now`; virtual clocks additionally honor advancement requests
/// from `spin_for`, which is what makes test time deterministic.
pub trait Clock {
    fn now(&self) -> TimePoint;

    /// Requests the clock to move forward to `time_point`.
    ///
    /// Free-running clocks ignore this; it exists so that `spin_for` can
    /// drive virtual time. Must never move the clock backwards.
    fn advance_to(&self, time_point: TimePoint) {
        let _ = time_point;
    }
}

/// A clock that moves only when told to.
#[derive(Debug)]
pub struct ManualClock(Cell<TimePoint>);

impl ManualClock {
    pub fn new(start: TimePoint) -> Self {
        Self(Cell::new(start))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimePoint {
        self.0.get()
    }

    fn advance_to(&self, time_point: TimePoint) {
        if time_point > self.0.get() {
            self.0.set(time_point);
        }
    }
}
