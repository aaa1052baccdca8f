//! Fiber identifier type and live-fiber accounting

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic fiber identifier.
///
/// Id 0 is reserved for per-thread root fibers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

impl FiberId {
    /// Id used by per-thread root fibers.
    pub const ROOT: FiberId = FiberId(0);

    /// Allocate the next fiber id.
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bump the global live-fiber counter. Called from fiber construction.
#[inline]
pub fn fiber_created() {
    LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
}

/// Decrement the global live-fiber counter. Called from fiber drop.
#[inline]
pub fn fiber_destroyed() {
    LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
}

/// Number of fibers currently alive in the process, root fibers included.
#[inline]
pub fn live_fibers() -> u64 {
    LIVE_FIBERS.load(Ordering::Relaxed)
}
