//! Stackful fibers
//!
//! A fiber is a cooperatively scheduled execution context: a closure, an
//! owned guard-paged stack and a saved register block. Fibers follow the
//! state machine in `spindle_core::state`: INIT -> (EXEC <-> HOLD/READY)*
//! -> TERM or EXCEPT, with `reset` returning a terminal fiber to INIT so
//! its stack can be reused for a new closure.
//!
//! Each thread has a root fiber standing in for its original context.
//! `resume` switches from the calling context into the fiber; the yield
//! functions switch back to whoever resumed it. Control always returns to
//! the immediate resumer, so nested resumes unwind like a call stack.

use std::cell::UnsafeCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use spindle_core::{config, id, log_debug, log_error, FiberId, FiberState};

use crate::arch;
use crate::stack::Stack;
use crate::tls;

/// Closure type a fiber executes.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// `None` for root fibers, which run on the thread's own stack.
    stack: Option<Stack>,
    ctx: UnsafeCell<arch::Context>,
    /// Saved context of whoever last resumed this fiber.
    ret_ctx: UnsafeCell<arch::Context>,
    closure: UnsafeCell<Option<FiberFn>>,
}

// The UnsafeCell fields are only touched by the single thread that is
// resuming, executing or resetting the fiber; the state machine (one EXEC
// at a time, reset only from terminal states) serializes those accesses.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber ready to run `cb`. A `stack_size` of zero picks up
    /// the `fiber.stack.size` tunable.
    pub fn new(cb: FiberFn, stack_size: usize) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::fiber_stack_size().get()
        } else {
            stack_size
        };
        let stack = Stack::alloc(size).expect("fiber stack allocation failed");

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            stack: Some(stack),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            ret_ctx: UnsafeCell::new(arch::Context::zeroed()),
            closure: UnsafeCell::new(Some(cb)),
        });
        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().map(|s| s.top()).unwrap_or(std::ptr::null_mut()),
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        id::fiber_created();
        log_debug!("fiber {} created", fiber.id);
        fiber
    }

    /// The root fiber for a thread: no stack, no closure, born executing.
    pub(crate) fn new_root() -> Arc<Fiber> {
        id::fiber_created();
        Arc::new(Fiber {
            id: FiberId::ROOT,
            state: AtomicU8::new(FiberState::Exec as u8),
            stack: None,
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            ret_ctx: UnsafeCell::new(arch::Context::zeroed()),
            closure: UnsafeCell::new(None),
        })
    }

    /// The fiber executing on this thread, lazily creating the root fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(cur) = tls::current_fiber() {
            return cur;
        }
        let root = tls::root_fiber();
        tls::set_current_fiber(Some(root.clone()));
        root
    }

    /// Id of the fiber executing on this thread, `0` outside any fiber.
    pub fn current_id() -> u64 {
        tls::current_fiber().map(|f| f.id.0).unwrap_or(0)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Re-arm a terminal (or never-started) fiber with a new closure,
    /// reusing its stack. The fiber returns to INIT.
    pub fn reset(&self, cb: FiberFn) {
        assert!(!self.is_root(), "cannot reset a root fiber");
        let state = self.state();
        assert!(
            state.can_reset(),
            "reset of fiber {} in state {}",
            self.id,
            state
        );
        unsafe {
            *self.closure.get() = Some(cb);
            arch::init_context(
                self.ctx.get(),
                self.stack.as_ref().map(|s| s.top()).unwrap_or(std::ptr::null_mut()),
                fiber_entry as usize,
                self as *const Fiber as usize,
            );
        }
        self.set_state(FiberState::Init);
    }

    /// Switch from the calling context into this fiber.
    ///
    /// Returns when the fiber yields or terminates. Control transfers are
    /// strictly paired: the fiber's next yield comes back here.
    pub fn resume(self: &Arc<Fiber>) {
        let state = self.state();
        assert!(state != FiberState::Exec, "fiber {} is already executing", self.id);
        assert!(
            state.is_runnable(),
            "resume of fiber {} in state {}",
            self.id,
            state
        );

        let prev = Fiber::current();
        assert!(
            !Arc::ptr_eq(&prev, self),
            "fiber {} cannot resume itself",
            self.id
        );
        tls::set_current_fiber(Some(self.clone()));
        self.set_state(FiberState::Exec);
        unsafe {
            arch::context_switch(self.ret_ctx.get(), self.ctx.get());
        }
        tls::set_current_fiber(Some(prev));
    }

    /// Suspend the current fiber in HOLD; it stays parked until something
    /// re-schedules it.
    pub fn yield_to_hold() {
        Self::yield_with(FiberState::Hold);
    }

    /// Suspend the current fiber in READY; the dispatch loop re-enqueues it.
    pub fn yield_to_ready() {
        Self::yield_with(FiberState::Ready);
    }

    fn yield_with(state: FiberState) {
        let cur = tls::current_fiber().expect("yield outside of any fiber");
        assert!(!cur.is_root(), "root fiber cannot yield");
        cur.set_state(state);
        unsafe {
            arch::context_switch(cur.ctx.get(), cur.ret_ctx.get());
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.stack.is_some() {
            let state = self.state();
            debug_assert!(
                matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
                "fiber {} dropped in state {}",
                self.id,
                state
            );
        }
        id::fiber_destroyed();
        log_debug!("fiber {} destroyed", self.id);
    }
}

fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else if let Some(s) = err.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Runs on the fiber's own stack. Executes the closure, records the
/// terminal state and switches back to the resumer.
extern "C" fn fiber_entry(arg: usize) {
    let cur = tls::current_fiber().expect("fiber entry without a current fiber");
    debug_assert_eq!(Arc::as_ptr(&cur) as usize, arg);

    let cb = unsafe { (*cur.closure.get()).take() }.expect("fiber entry without a closure");
    match std::panic::catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => cur.set_state(FiberState::Term),
        Err(err) => {
            log_error!("fiber {} panicked: {}", cur.id, panic_message(err.as_ref()));
            cur.set_state(FiberState::Except);
        }
    }

    // This frame never resumes, so drop the local Arc before the final
    // switch; the resumer still holds its own reference and keeps the
    // fiber alive until `resume` returns.
    let raw: *const Fiber = Arc::as_ptr(&cur);
    drop(cur);
    unsafe {
        let fiber = &*raw;
        arch::context_switch(fiber.ctx.get(), fiber.ret_ctx.get());
    }
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_state_sequence() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_hold();
                steps2.fetch_add(1, Ordering::SeqCst);
            }),
            128 * 1024,
        );

        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Hold);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_yield_to_ready() {
        let fiber = Fiber::new(
            Box::new(|| {
                Fiber::yield_to_ready();
            }),
            128 * 1024,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            128 * 1024,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(Box::new(move || {
            h.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panic_becomes_except() {
        let fiber = Fiber::new(Box::new(|| panic!("boom")), 128 * 1024);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        // An EXCEPT fiber can be reset and run again.
        fiber.reset(Box::new(|| {}));
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_nested_resume_returns_to_resumer() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let inner = Fiber::new(
            Box::new(move || {
                o2.lock().unwrap().push("inner");
            }),
            128 * 1024,
        );
        let outer = Fiber::new(
            Box::new(move || {
                o1.lock().unwrap().push("outer-before");
                inner.resume();
                o1.lock().unwrap().push("outer-after");
            }),
            128 * 1024,
        );
        outer.resume();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-before", "inner", "outer-after"]
        );
    }

    #[test]
    fn test_current_outside_fiber_is_root() {
        let cur = Fiber::current();
        assert!(cur.is_root());
        assert_eq!(cur.state(), FiberState::Exec);
    }
}
