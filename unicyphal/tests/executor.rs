//! Executor scheduling semantics, end to end.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use unicyphal::core::{Duration, TimePoint};
use unicyphal::executor::{Executor, VirtualExecutor};

use common::tracking_memory;

fn at(ms: i64) -> TimePoint {
    TimePoint::EPOCH + Duration::from_millis(ms)
}

#[test]
fn test_due_callbacks_run_in_time_then_insertion_order() {
    let (_resource, memory) = tracking_memory();
    let executor = VirtualExecutor::new(memory);
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    // Insertion order: a@5ms, b@2ms, c@5ms.
    let mut handles = Vec::new();
    for (tag, due_ms) in [("a@5", 5), ("b@2", 2), ("c@5", 5)] {
        let log = log.clone();
        let callback = executor
            .register_callback(Box::new(move |_| log.borrow_mut().push(tag)), false)
            .expect("callback slot");
        assert!(callback.schedule_at(at(due_ms)));
        handles.push(callback);
    }

    executor.spin_for(Duration::from_millis(10));
    assert_eq!(*log.borrow(), ["b@2", "a@5", "c@5"]);
    assert_eq!(executor.now(), at(10));
}

#[test]
fn test_callback_slots_release_memory() {
    let (resource, memory) = tracking_memory();
    {
        let executor = VirtualExecutor::new(memory);
        let kept = executor
            .register_callback(Box::new(|_| ()), false)
            .expect("callback slot");
        let auto = executor
            .register_callback(Box::new(|_| ()), true)
            .expect("callback slot");
        auto.schedule_at(at(1));
        kept.schedule_at(at(2));
        executor.spin_for(Duration::from_millis(5));
        drop(auto);
        drop(kept);
    }
    assert!(resource.balanced());
}

#[test]
fn test_registration_denied_without_memory() {
    let (resource, memory) = tracking_memory();
    let executor = VirtualExecutor::new(memory);
    resource.deny_next(1);
    assert!(executor.register_callback(Box::new(|_| ()), false).is_none());
    assert!(resource.balanced());
}
