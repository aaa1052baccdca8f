//! N:M fiber scheduler
//!
//! A `Scheduler` dispatches fibers and plain callbacks onto a pool of
//! worker threads. There is no work stealing: one shared FIFO queue feeds
//! every worker, and a task may carry an affinity pinning it to a single
//! worker index.
//!
//! Each worker runs the dispatch loop: pop a runnable task, resume it,
//! apply the post-resume state policy, and when the queue yields nothing
//! switch into a per-worker idle fiber. What the idle fiber does is the
//! `Driver`'s business: the default driver parks on a condvar, the reactor
//! driver runs an epoll loop. Producers `tickle` the driver when work
//! arrives at an empty queue so parked workers wake up.
//!
//! With `use_caller`, the constructing thread itself becomes worker 0:
//! `stop` runs the dispatch loop inside a root-level fiber on the caller
//! until the scheduler drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use spindle_core::{log_debug, log_error, FiberState};

use crate::fiber::{Fiber, FiberFn};
use crate::tls;

/// What a scheduler executes: an existing fiber or a bare callback that
/// gets wrapped in a (reused) fiber by the dispatch loop.
pub enum Work {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

pub struct Task {
    pub work: Work,
    /// Pin to a specific worker index; `None` runs anywhere.
    pub affinity: Option<usize>,
}

/// Idle-time behavior plugged into a scheduler.
///
/// `idle` runs inside each worker's idle fiber and must yield back with
/// `Fiber::yield_to_hold` between waits so the dispatch loop can drain the
/// queue. `tickle` wakes idle workers after a task lands in an empty queue.
pub trait Driver: Send + Sync + 'static {
    /// Called once on each worker thread before its dispatch loop starts.
    fn on_thread_start(&self) {}

    /// Wake idle workers.
    fn tickle(&self);

    /// Body of the idle fiber; returns when `sched.should_stop()`.
    fn idle(&self, sched: &Arc<Scheduler>);

    /// Outstanding driver-owned work (pending events, timers) that must
    /// block shutdown.
    fn has_pending(&self) -> bool {
        false
    }
}

pub struct Scheduler {
    name: String,
    thread_count: usize,
    use_caller: bool,
    queue: Mutex<VecDeque<Task>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
    driver: OnceLock<Arc<dyn Driver>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Caller-thread dispatch fiber, present only with `use_caller`.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers. With `use_caller` the
    /// constructing thread counts as worker 0 and only `threads - 1` OS
    /// threads are spawned by `start`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one worker");
        Arc::new(Scheduler {
            name: name.to_string(),
            thread_count: threads,
            use_caller,
            queue: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            driver: OnceLock::new(),
            threads: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.thread_count
    }

    /// Install the idle driver. Must happen before `start`; later calls
    /// are ignored.
    pub fn set_driver(&self, driver: Arc<dyn Driver>) {
        let _ = self.driver.set(driver);
    }

    fn driver(&self) -> &Arc<dyn Driver> {
        self.driver.get().expect("scheduler started without a driver")
    }

    /// Launch the worker threads. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.driver.get_or_init(|| Arc::new(ParkDriver::default()));
        log_debug!("scheduler {} starting {} workers", self.name, self.thread_count);

        if self.use_caller {
            tls::set_current_scheduler(Some(self.clone()));
            let me = self.clone();
            let root = Fiber::new(Box::new(move || me.run(0)), 0);
            *self.root_fiber.lock().unwrap() = Some(root);
        }

        let spawn_from = if self.use_caller { 1 } else { 0 };
        let mut handles = self.threads.lock().unwrap();
        for idx in spawn_from..self.thread_count {
            let me = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, idx))
                .spawn(move || me.run(idx))
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
    }

    /// Enqueue a callback.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.submit(Task {
            work: Work::Call(Box::new(f)),
            affinity: None,
        });
    }

    /// Enqueue a callback pinned to one worker.
    pub fn spawn_on(&self, f: impl FnOnce() + Send + 'static, worker: usize) {
        assert!(worker < self.thread_count, "no such worker: {}", worker);
        self.submit(Task {
            work: Work::Call(Box::new(f)),
            affinity: Some(worker),
        });
    }

    /// Enqueue an existing fiber (typically one parked in HOLD).
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, affinity: Option<usize>) {
        self.submit(Task {
            work: Work::Fiber(fiber),
            affinity,
        });
    }

    /// Enqueue several tasks with a single queue lock and at most one tickle.
    pub fn schedule_batch(&self, work: impl IntoIterator<Item = Work>) {
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            for w in work {
                q.push_back(Task {
                    work: w,
                    affinity: None,
                });
            }
            was_empty && !q.is_empty()
        };
        if was_empty {
            self.tickle();
        }
    }

    fn submit(&self, task: Task) {
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        // Only the empty->non-empty transition needs a wakeup; a non-empty
        // queue means some worker is already awake and will drain it.
        if was_empty {
            self.tickle();
        }
    }

    fn tickle(&self) {
        if let Some(driver) = self.driver.get() {
            driver.tickle();
        }
    }

    /// Request shutdown and wait for the workers to drain the queue.
    ///
    /// With `use_caller` the calling thread runs its own dispatch loop to
    /// completion before joining the spawned workers.
    pub fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }

        if let Some(root) = self.root_fiber.lock().unwrap().take() {
            root.resume();
        }

        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                log_error!("scheduler {} worker panicked", self.name);
            }
        }
        log_debug!("scheduler {} stopped", self.name);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Everything drained and nothing pending: safe for idle fibers to exit.
    pub fn should_stop(&self) -> bool {
        self.is_stopping()
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().unwrap().is_empty()
            && !self.driver().has_pending()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn has_idle_workers(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    /// Dispatch loop, one per worker thread.
    fn run(self: &Arc<Self>, worker: usize) {
        log_debug!("scheduler {} worker {} running", self.name, worker);
        tls::set_worker_index(worker);
        tls::set_current_scheduler(Some(self.clone()));
        // Fibers on this worker get blocking-call interposition by default.
        spindle_core::hookflag::set_hook_enabled(true);
        let driver = self.driver().clone();
        driver.on_thread_start();

        let me = self.clone();
        let idle_fiber = Fiber::new(Box::new(move || driver.idle(&me)), 0);
        // Reusable fiber for bare callbacks; replaced when one parks.
        let mut scratch: Option<Arc<Fiber>> = None;

        loop {
            let mut picked: Option<Task> = None;
            let mut tickle_other = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    if let Some(pin) = q[i].affinity {
                        if pin != worker {
                            tickle_other = true;
                            i += 1;
                            continue;
                        }
                    }
                    if let Work::Fiber(f) = &q[i].work {
                        // Scheduled before it finished switching out; leave
                        // it queued and make sure someone comes back for it.
                        if f.state() == FiberState::Exec {
                            tickle_other = true;
                            i += 1;
                            continue;
                        }
                    }
                    picked = q.remove(i);
                    break;
                }
            }
            if tickle_other {
                self.tickle();
            }

            match picked {
                Some(Task {
                    work: Work::Fiber(fiber),
                    affinity,
                }) => {
                    if fiber.state().is_terminated() {
                        continue;
                    }
                    self.active.fetch_add(1, Ordering::SeqCst);
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber, affinity),
                        FiberState::Term | FiberState::Except => {}
                        // HOLD: parked until an event handler or timer
                        // re-schedules it. No state write here; the fiber
                        // may already be resumed on another worker.
                        _ => {}
                    }
                }
                Some(Task {
                    work: Work::Call(cb),
                    affinity,
                }) => {
                    let fiber = match scratch.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb, 0),
                    };
                    self.active.fetch_add(1, Ordering::SeqCst);
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber, affinity),
                        FiberState::Term | FiberState::Except => scratch = Some(fiber),
                        // Parked in an event handler or timer; it owns its
                        // own reference now, get a fresh scratch next time.
                        _ => {}
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        log_debug!("scheduler {} worker {} exiting", self.name, worker);
    }
}

/// Default driver: parks idle workers on a condvar until tickled.
#[derive(Default)]
pub struct ParkDriver {
    signal: Mutex<bool>,
    cond: Condvar,
}

impl Driver for ParkDriver {
    fn tickle(&self) {
        let mut flag = self.signal.lock().unwrap();
        *flag = true;
        self.cond.notify_all();
    }

    fn idle(&self, sched: &Arc<Scheduler>) {
        loop {
            if sched.should_stop() {
                break;
            }
            {
                let mut flag = self.signal.lock().unwrap();
                if !*flag {
                    // Bounded wait so a lost tickle cannot park us forever.
                    let (guard, _) = self
                        .cond
                        .wait_timeout(flag, Duration::from_millis(50))
                        .unwrap();
                    flag = guard;
                }
                *flag = false;
            }
            Fiber::yield_to_hold();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_callbacks_across_workers() {
        let sched = Scheduler::new(3, false, "test-many");
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = count.clone();
            let m = max_active.clone();
            let s = sched.clone();
            sched.spawn(move || {
                m.fetch_max(s.active_count(), Ordering::SeqCst);
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 100);
        // At most one task per worker is ever mid-resume.
        let peak = max_active.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 3, "active count peaked at {}", peak);
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(2, true, "test-caller");
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = count.clone();
            sched.spawn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_affinity_pins_to_worker() {
        let sched = Scheduler::new(4, false, "test-pin");
        sched.start();
        let indices = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..20 {
            let seen = indices.clone();
            sched.spawn_on(
                move || {
                    seen.lock().unwrap().push(tls::worker_index());
                },
                2,
            );
        }
        sched.stop();
        let seen = indices.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|&w| w == 2));
    }

    #[test]
    fn test_yielding_fiber_is_requeued() {
        let sched = Scheduler::new(2, false, "test-ready");
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sched.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            c.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_scheduled_fiber_runs() {
        let sched = Scheduler::new(1, false, "test-fiber");
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        sched.schedule_fiber(fiber, None);
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new(1, false, "test-panic");
        sched.start();
        let count = Arc::new(AtomicUsize::new(0));
        sched.spawn(|| panic!("task failure"));
        let c = count.clone();
        sched.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
