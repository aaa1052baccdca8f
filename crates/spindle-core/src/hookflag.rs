//! Per-thread switch for blocking-call interposition
//!
//! The flag lives here rather than in the hook crate because the
//! scheduler flips it on for its worker threads, and the hook crate sits
//! above the runtime in the dependency graph. Off by default, so threads
//! outside the runtime always pass straight through to libc.

use std::cell::Cell;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Is blocking-call interposition active on this thread?
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|f| f.get())
}

/// Toggle interposition for the calling thread.
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|f| f.set(on));
}
