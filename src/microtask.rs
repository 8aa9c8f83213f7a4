//! Deferred-callback queue: the "run this after the current synchronous
//! region" substrate.
//!
//! The job scheduler and deferred computeds both need a microtask boundary.
//! Without a language runtime to provide one, callbacks are parked in a
//! per-thread FIFO and the host drains it at its yield points (end of an
//! event-handler turn, between frames, after a test's synchronous section):
//!
//! ```ignore
//! trigger(target, TargetKind::Plain, TriggerOp::Set, Some(key), None);
//! flush_microtasks(); // scheduler drain + deferred notifications run here
//! ```
//!
//! Callbacks enqueued while the drain is running execute in the same drain,
//! after the already-queued ones, which is exactly how chained promise
//! continuations behave.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

thread_local! {
    static MICROTASKS: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Park a callback for the next drain.
pub(crate) fn defer<F>(f: F)
where
    F: FnOnce() + 'static,
{
    MICROTASKS.with(|q| q.borrow_mut().push_back(Box::new(f)));
}

/// Whether any deferred callbacks are waiting.
pub fn has_pending_microtasks() -> bool {
    MICROTASKS.with(|q| !q.borrow().is_empty())
}

/// Run every deferred callback, including ones enqueued while draining.
///
/// A nested call from inside a callback is a no-op; the outer drain picks
/// up whatever the callback enqueued. If a callback panics, the flag is
/// reset and the remaining callbacks stay queued for the next drain.
pub fn flush_microtasks() {
    if DRAINING.with(Cell::get) {
        return;
    }
    DRAINING.with(|d| d.set(true));

    struct DrainGuard;
    impl Drop for DrainGuard {
        fn drop(&mut self) {
            DRAINING.with(|d| d.set(false));
        }
    }
    let _guard = DrainGuard;

    loop {
        let task = MICROTASKS.with(|q| q.borrow_mut().pop_front());
        match task {
            Some(task) => task(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn drains_in_fifo_order() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        defer(move || o.borrow_mut().push(1));
        let o = order.clone();
        defer(move || o.borrow_mut().push(2));

        assert!(has_pending_microtasks());
        flush_microtasks();

        assert_eq!(*order.borrow(), vec![1, 2]);
        assert!(!has_pending_microtasks());
    }

    #[test]
    fn callbacks_enqueued_mid_drain_run_in_the_same_drain() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        defer(move || {
            o.borrow_mut().push("first");
            let o2 = o.clone();
            defer(move || o2.borrow_mut().push("chained"));
        });

        flush_microtasks();
        assert_eq!(*order.borrow(), vec!["first", "chained"]);
    }

    #[test]
    fn nested_drain_is_a_noop() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        defer(move || {
            o.borrow_mut().push("outer");
            // Attempting to drain from inside must not re-enter
            flush_microtasks();
            o.borrow_mut().push("still outer");
        });
        let o = order.clone();
        defer(move || o.borrow_mut().push("second"));

        flush_microtasks();
        assert_eq!(*order.borrow(), vec!["outer", "still outer", "second"]);
    }
}
