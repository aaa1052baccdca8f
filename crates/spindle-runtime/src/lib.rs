//! # spindle-runtime
//!
//! User-space M:N cooperative fiber runtime with integrated async I/O.
//!
//! Building blocks, bottom up:
//!
//! - [`arch`] - register-level context switching (x86_64, aarch64)
//! - [`stack`] - mmap'd, guard-paged fiber stacks
//! - [`fiber`] - stackful fibers with a small explicit state machine
//! - [`scheduler`] - thread-pool dispatch loop with pluggable idle driver
//! - [`timer`] - deadline-ordered timers with clock-rollback defense
//! - [`iomanager`] - epoll reactor installed as the scheduler's driver
//!
//! The typical entry point is [`IoManager::new`], which yields a running
//! reactor-backed scheduler:
//!
//! ```ignore
//! let iom = IoManager::new(4, false, "app");
//! iom.spawn(|| {
//!     // runs inside a fiber; blocking-style I/O parks the fiber,
//!     // not the worker thread
//! });
//! iom.stop();
//! ```

#![cfg(target_os = "linux")]

pub mod arch;
pub mod fiber;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

pub use fiber::{Fiber, FiberFn};
pub use iomanager::{Event, IoManager};
pub use scheduler::{Driver, Scheduler, Task, Work};
pub use timer::{CancelFlag, Timer, TimerManager};

pub use spindle_core::{FiberId, FiberState, RtError, RtResult};
