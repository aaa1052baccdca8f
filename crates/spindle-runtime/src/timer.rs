//! Timer management
//!
//! Timers are kept in a `BTreeMap` ordered by `(absolute deadline ms,
//! creation sequence)`, so the earliest deadline is always the first
//! entry and equal deadlines fire in creation order. The map owner (the
//! reactor) calls `next_timer_ms` to bound its poll and `take_expired`
//! to collect due callbacks.
//!
//! Deadlines come from the wall clock, so a large backward clock jump
//! would otherwise stall every pending timer; `take_expired` detects
//! jumps beyond one hour and treats everything as due.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use spindle_core::constants::ROLLOVER_MS;
use spindle_core::log_warn;

/// Timer callbacks may fire repeatedly (cyclic timers), so they are
/// shared `Fn` closures.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Wall-clock milliseconds since the epoch.
pub fn current_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}

struct TimerNode {
    seq: u64,
    state: Mutex<TimerState>,
}

struct TimerState {
    /// Absolute deadline in wall-clock ms. Key in the map while armed.
    deadline_ms: u64,
    interval_ms: u64,
    cyclic: bool,
    /// Cleared on cancel and after a one-shot fires.
    cb: Option<TimerCallback>,
}

/// Handle to an armed timer; cancel, re-arm or refresh it.
///
/// Dropping the handle does not cancel the timer.
pub struct Timer {
    node: Arc<TimerNode>,
    mgr: Weak<TimerManager>,
}

pub struct TimerManager {
    inner: RwLock<TimerMap>,
    /// Fired when an insert becomes the new earliest deadline, so the
    /// reactor can shorten its poll.
    front_notifier: OnceLock<Box<dyn Fn() + Send + Sync>>,
    seq: AtomicU64,
    /// Wall clock observed by the previous expiry scan.
    previous_ms: AtomicU64,
}

struct TimerMap {
    timers: BTreeMap<(u64, u64), Arc<TimerNode>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            inner: RwLock::new(TimerMap {
                timers: BTreeMap::new(),
            }),
            front_notifier: OnceLock::new(),
            seq: AtomicU64::new(1),
            previous_ms: AtomicU64::new(current_ms()),
        })
    }

    /// Install the earliest-deadline-changed hook. Later calls are ignored.
    pub fn set_front_notifier(&self, f: impl Fn() + Send + Sync + 'static) {
        let _ = self.front_notifier.set(Box::new(f));
    }

    /// Arm a timer firing in `ms` milliseconds; cyclic timers re-arm
    /// themselves after each expiry.
    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cyclic: bool,
    ) -> Timer {
        let node = Arc::new(TimerNode {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                deadline_ms: current_ms().saturating_add(ms),
                interval_ms: ms,
                cyclic,
                cb: Some(Arc::new(cb)),
            }),
        });
        self.insert(&node);
        Timer {
            node,
            mgr: Arc::downgrade(self),
        }
    }

    /// Arm a timer whose callback only runs while `cond` is still alive.
    /// If every strong reference to the condition is gone at expiry, the
    /// timer silently does nothing.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        cyclic: bool,
    ) -> Timer {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            cyclic,
        )
    }

    fn insert(&self, node: &Arc<TimerNode>) {
        let at_front = {
            let mut map = self.inner.write().unwrap();
            let key = (node.state.lock().unwrap().deadline_ms, node.seq);
            let at_front = map
                .timers
                .first_key_value()
                .map(|(front, _)| key < *front)
                .unwrap_or(true);
            map.timers.insert(key, node.clone());
            at_front
        };
        if at_front {
            if let Some(notify) = self.front_notifier.get() {
                notify();
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }

    /// Milliseconds until the earliest deadline: `None` when no timer is
    /// armed, `Some(0)` when one is already due.
    pub fn next_timer_ms(&self) -> Option<u64> {
        let map = self.inner.read().unwrap();
        let (&(deadline, _), _) = map.timers.first_key_value()?;
        Some(deadline.saturating_sub(current_ms()))
    }

    /// Pop every due timer's callback into `out`, re-arming cyclic ones.
    pub fn take_expired(&self, out: &mut Vec<TimerCallback>) {
        if self.inner.read().unwrap().timers.is_empty() {
            return;
        }
        let now = current_ms();
        let rolled_over = detect_rollover(self.previous_ms.swap(now, Ordering::SeqCst), now);
        if rolled_over {
            log_warn!("clock rollback detected, expiring all pending timers");
        }

        let mut map = self.inner.write().unwrap();
        let mut requeue = Vec::new();
        while let Some((&(deadline, seq), _)) = map.timers.first_key_value() {
            if !rolled_over && deadline > now {
                break;
            }
            let node = match map.timers.remove(&(deadline, seq)) {
                Some(n) => n,
                None => break,
            };
            let mut state = node.state.lock().unwrap();
            if let Some(cb) = state.cb.clone() {
                out.push(cb);
            }
            if state.cyclic {
                state.deadline_ms = now.saturating_add(state.interval_ms);
                let key = (state.deadline_ms, node.seq);
                drop(state);
                requeue.push((key, node));
            } else {
                state.cb = None;
            }
        }
        for (key, node) in requeue {
            map.timers.insert(key, node);
        }
    }
}

/// A backward wall-clock jump larger than the rollover window.
fn detect_rollover(previous_ms: u64, now_ms: u64) -> bool {
    now_ms < previous_ms && previous_ms - now_ms > ROLLOVER_MS
}

impl Timer {
    /// Disarm the timer. Returns false when it already fired or was
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut map = mgr.inner.write().unwrap();
        let mut state = self.node.state.lock().unwrap();
        if state.cb.is_none() {
            return false;
        }
        state.cb = None;
        map.timers.remove(&(state.deadline_ms, self.node.seq));
        true
    }

    /// Push the deadline out to now + interval without changing the
    /// interval.
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut map = mgr.inner.write().unwrap();
        let mut state = self.node.state.lock().unwrap();
        if state.cb.is_none() {
            return false;
        }
        map.timers.remove(&(state.deadline_ms, self.node.seq));
        state.deadline_ms = current_ms().saturating_add(state.interval_ms);
        map.timers.insert((state.deadline_ms, self.node.seq), self.node.clone());
        true
    }

    /// Change the interval. With `from_now` the new deadline is measured
    /// from the present; otherwise from the timer's original start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if !from_now {
            let same = {
                let state = self.node.state.lock().unwrap();
                state.interval_ms == ms
            };
            if same {
                return true;
            }
        }
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        {
            let mut map = mgr.inner.write().unwrap();
            let mut state = self.node.state.lock().unwrap();
            if state.cb.is_none() {
                return false;
            }
            map.timers.remove(&(state.deadline_ms, self.node.seq));
            let start = if from_now {
                current_ms()
            } else {
                state.deadline_ms.saturating_sub(state.interval_ms)
            };
            state.interval_ms = ms;
            state.deadline_ms = start.saturating_add(ms);
        }
        // Re-insert through the front check so the reactor re-clamps its
        // poll when the deadline moved earlier.
        mgr.insert(&self.node);
        true
    }
}

/// Shared cancellation flag for hook timeouts: holds the errno a timed-out
/// wait should report.
pub struct CancelFlag {
    pub errno: AtomicI32,
}

impl CancelFlag {
    pub fn new() -> Arc<CancelFlag> {
        Arc::new(CancelFlag {
            errno: AtomicI32::new(0),
        })
    }
}
