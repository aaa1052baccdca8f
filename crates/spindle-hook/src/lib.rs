//! # spindle-hook
//!
//! libc interposition layer for the spindle runtime: linking this crate
//! into a binary replaces the blocking I/O surface (`read`, `write`,
//! `connect`, `accept`, the `recv`/`send` families, `sleep` and friends)
//! with fiber-suspending versions. Code written against plain blocking
//! sockets then runs unmodified on a fiber scheduler.
//!
//! Interposition is opt-in per thread via [`set_hook_enabled`]; with it
//! off, every hook is a direct passthrough. Enable it at the top of a
//! fiber's closure:
//!
//! ```ignore
//! let iom = IoManager::new(4, false, "svc");
//! iom.spawn(|| {
//!     spindle_hook::set_hook_enabled(true);
//!     // std::net / libc blocking calls now park the fiber
//! });
//! ```

#![cfg(target_os = "linux")]

pub mod fd;
pub mod hook;
pub mod origins;

pub use fd::{fd_manager, FdCtx, FdManager, TimeoutKind};
pub use hook::{connect_with_timeout, hook_enabled, set_hook_enabled};
