//! Cooperative single-threaded executor
//!
//! The executor owns monotonic time and a set of registered callbacks. A
//! callback is registered once and then scheduled (and re-scheduled) for
//! execution at absolute time points; `spin_once`/`spin_for` dispatch the
//! due ones in (scheduled time, registration order) order. Callbacks run to
//! completion; there is no preemption and no suspension.
//!
//! The time source is a parameter of the executor so that tests can drive
//! time explicitly: [`VirtualExecutor`] advances its [`ManualClock`] only
//! from within `spin_for`, which makes every transport and application test
//! in this repository deterministic.
//!
//! Re-entrancy rules: a callback may register, schedule, or drop callbacks
//! (including its own handle); newly due callbacks run within the same
//! spin. A callback must not call `spin_once`/`spin_for`.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use core::cell::{Cell, RefCell};
use core::mem::size_of;

use crate::core::{Duration, TimePoint};
use crate::mem::{Memory, Payload};

mod clock;

pub use clock::{Clock, ManualClock};

/// The stored form of a callback.
///
/// The executor passes the current time point (aka now) at dispatch; under
/// load this can be later than the scheduled time.
pub type CallbackFn = Box<dyn FnMut(TimePoint)>;

/// A registry of schedulable callbacks with a pluggable time source.
pub trait Executor {
    /// The current time point of the executor. Monotonically non-decreasing.
    fn now(&self) -> TimePoint;

    /// Stores `function` for later scheduling.
    ///
    /// With `auto_remove` the callback is unregistered after firing once.
    /// Returns `None` when the executor's memory resource denies the
    /// callback slot.
    #[must_use]
    fn register_callback(&self, function: CallbackFn, auto_remove: bool) -> Option<Callback>;
}

/// Unique identifier of a registered callback.
pub type CallbackId = u64;

/// Move-only handle of a registered callback.
///
/// Dropping the handle unregisters the callback; a scheduled but not yet
/// executed callback will not run.
pub struct Callback {
    id: CallbackId,
    slots: Weak<RefCell<Slots>>,
}

impl Callback {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Makes the callback eligible to run at `time_point`.
    ///
    /// Re-arming an unexecuted callback replaces the previous time point.
    /// Returns false when the callback is gone (executor dropped, or an
    /// `auto_remove` callback already fired).
    pub fn schedule_at(&self, time_point: TimePoint) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let armed = slots.borrow_mut().arm(self.id, time_point);
        armed
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.borrow_mut().remove(self.id);
        }
    }
}

struct Slot {
    /// Taken out for the duration of a dispatch.
    function: Option<CallbackFn>,
    auto_remove: bool,
    armed: Option<TimePoint>,
    /// Keeps the callback slot charged against the memory resource.
    _charge: Payload,
}

#[derive(Default)]
struct Slots {
    entries: BTreeMap<CallbackId, Slot>,
    next_id: CallbackId,
}

impl Slots {
    fn insert(&mut self, function: CallbackFn, auto_remove: bool, charge: Payload) -> CallbackId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Slot {
                function: Some(function),
                auto_remove,
                armed: None,
                _charge: charge,
            },
        );
        id
    }

    fn arm(&mut self, id: CallbackId, time_point: TimePoint) -> bool {
        let Some(slot) = self.entries.get_mut(&id) else {
            return false;
        };
        slot.armed = Some(time_point);
        true
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// The armed callback with the least (due time, registration order),
    /// if any is due not later than `limit`.
    fn next_due(&self, limit: TimePoint) -> Option<(CallbackId, TimePoint)> {
        self.entries
            .iter()
            .filter_map(|(&id, slot)| {
                let due = slot.armed?;
                slot.function.as_ref()?;
                (due <= limit).then_some((due, id))
            })
            .min()
            .map(|(due, id)| (id, due))
    }

    fn begin_dispatch(&mut self, id: CallbackId) -> Option<(CallbackFn, bool)> {
        let slot = self.entries.get_mut(&id)?;
        slot.armed = None;
        let function = slot.function.take()?;
        Some((function, slot.auto_remove))
    }

    fn finish_dispatch(&mut self, id: CallbackId, function: CallbackFn, auto_remove: bool) {
        if auto_remove {
            self.entries.remove(&id);
        } else if let Some(slot) = self.entries.get_mut(&id) {
            // The handle may have been dropped from within the callback;
            // then the closure is simply discarded here.
            slot.function = Some(function);
        }
    }
}

/// The reference executor: one thread, one clock, a callback registry.
pub struct SingleThreadedExecutor<C: Clock> {
    clock: C,
    memory: Memory,
    slots: Rc<RefCell<Slots>>,
    last_now: Cell<TimePoint>,
}

/// The test-oriented executor over manually driven time.
pub type VirtualExecutor = SingleThreadedExecutor<ManualClock>;

impl VirtualExecutor {
    /// Starts virtual time at [`TimePoint::EPOCH`].
    pub fn new(memory: Memory) -> Self {
        Self::with_clock(ManualClock::new(TimePoint::EPOCH), memory)
    }
}

impl<C: Clock> SingleThreadedExecutor<C> {
    pub fn with_clock(clock: C, memory: Memory) -> Self {
        Self {
            clock,
            memory,
            slots: Rc::new(RefCell::new(Slots::default())),
            last_now: Cell::new(TimePoint::MIN),
        }
    }

    /// Executes every callback whose scheduled time is not later than the
    /// current time, in (scheduled time, registration order) order.
    pub fn spin_once(&self) {
        let now = self.now();
        while let Some((id, _due)) = {
            let slots = self.slots.borrow();
            slots.next_due(now)
        } {
            self.dispatch(id, now);
        }
    }

    /// Spins until `duration` has elapsed on the executor's clock.
    ///
    /// With a [`ManualClock`] the clock is advanced here: first to each due
    /// callback's scheduled time, finally to the horizon. With a free
    /// running clock the advancement requests are no-ops and this method
    /// polls until the horizon passes.
    pub fn spin_for(&self, duration: Duration) {
        let deadline = self.now() + duration;
        loop {
            let next = {
                let slots = self.slots.borrow();
                slots.next_due(deadline)
            };
            match next {
                Some((id, due)) => {
                    if due > self.now() {
                        self.clock.advance_to(due);
                    }
                    self.dispatch(id, self.now());
                }
                None => {
                    self.clock.advance_to(deadline);
                    if self.now() >= deadline {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, id: CallbackId, now: TimePoint) {
        let taken = self.slots.borrow_mut().begin_dispatch(id);
        let Some((mut function, auto_remove)) = taken else {
            return;
        };
        // No registry borrow is held here: the callback is free to register,
        // schedule, or drop callbacks, including its own handle.
        function(now);
        self.slots
            .borrow_mut()
            .finish_dispatch(id, function, auto_remove);
    }
}

impl<C: Clock> Executor for SingleThreadedExecutor<C> {
    fn now(&self) -> TimePoint {
        let now = self.clock.now().max(self.last_now.get());
        self.last_now.set(now);
        now
    }

    fn register_callback(&self, function: CallbackFn, auto_remove: bool) -> Option<Callback> {
        let charge = self.memory.allocate(size_of::<Slot>())?;
        let id = self.slots.borrow_mut().insert(function, auto_remove, charge);
        Some(Callback {
            id,
            slots: Rc::downgrade(&self.slots),
        })
    }
}
