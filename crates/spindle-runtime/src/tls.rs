//! Thread-local runtime state
//!
//! Each worker thread tracks the fiber it is currently executing, its root
//! fiber, the scheduler it belongs to and (when the scheduler is driven by
//! a reactor) the owning io manager.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::scheduler::Scheduler;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
    static CURRENT_IO: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
    static WORKER_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|f| f.borrow().clone())
}

pub(crate) fn set_current_fiber(fiber: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|f| *f.borrow_mut() = fiber);
}

/// The calling thread's root fiber, created on first use.
///
/// The root fiber represents the thread's original execution context; it
/// owns no mapped stack and is what scheduled fibers switch back to.
pub(crate) fn root_fiber() -> Arc<Fiber> {
    ROOT_FIBER.with(|f| {
        let mut slot = f.borrow_mut();
        match &*slot {
            Some(root) => root.clone(),
            None => {
                let root = Fiber::new_root();
                *slot = Some(root.clone());
                root
            }
        }
    })
}

pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|s| s.borrow().clone())
}

pub(crate) fn set_current_scheduler(sched: Option<Arc<Scheduler>>) {
    CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = sched);
}

pub fn current_io() -> Option<Arc<IoManager>> {
    CURRENT_IO.with(|io| io.borrow().upgrade())
}

pub(crate) fn set_current_io(io: Weak<IoManager>) {
    CURRENT_IO.with(|slot| *slot.borrow_mut() = io);
}

/// Index of the worker running on this thread, `usize::MAX` off-worker.
pub fn worker_index() -> usize {
    WORKER_INDEX.with(|w| w.get())
}

pub(crate) fn set_worker_index(idx: usize) {
    WORKER_INDEX.with(|w| w.set(idx));
}
