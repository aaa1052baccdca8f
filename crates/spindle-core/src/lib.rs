//! # spindle-core
//!
//! Core types for the spindle fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The scheduler, reactor and syscall hooks live in `spindle-runtime`
//! and `spindle-hook`.
//!
//! ## Modules
//!
//! - `id` - fiber identifier type and live-fiber accounting
//! - `state` - fiber state machine
//! - `error` - error types
//! - `rlog` - leveled stderr logging macros
//! - `env` - environment variable utilities
//! - `config` - named, hot-settable tunables with change listeners
//! - `hookflag` - per-thread switch for syscall interposition

pub mod config;
pub mod env;
pub mod error;
pub mod hookflag;
pub mod id;
pub mod rlog;
pub mod state;

// Re-exports for convenience
pub use config::ConfigVar;
pub use env::{env_get, env_get_bool};
pub use error::{RtError, RtResult};
pub use id::FiberId;
pub use state::FiberState;

/// Runtime-wide constants.
pub mod constants {
    /// Default fiber stack size when the `fiber.stack.size` tunable is unset.
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

    /// Guard page size below each fiber stack.
    pub const GUARD_SIZE: usize = 4096;

    /// Default TCP connect timeout in milliseconds.
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Upper bound on a single reactor poll, in milliseconds.
    pub const MAX_POLL_MS: u64 = 1000;

    /// Backward clock jump beyond which all pending timers are treated as due.
    pub const ROLLOVER_MS: u64 = 60 * 60 * 1000;

    /// "No timeout configured" sentinel for per-fd timeouts.
    pub const TIMEOUT_NONE: u64 = u64::MAX;
}
