//! Error types for the spindle runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur in runtime operations.
///
/// Programmer contract violations (double event registration, resuming an
/// already-executing fiber, resetting a live fiber) are not represented
/// here; they are asserted and abort the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// Operation timed out
    Timeout,

    /// Scheduler already started
    AlreadyStarted,

    /// No scheduler / io manager on this thread
    NotInitialized,

    /// Event already registered for this fd and direction
    EventExists,

    /// No such event registered
    EventNotFound,

    /// epoll_ctl failed with the given errno
    EpollCtl(i32),

    /// Other OS-level failure with the given errno
    Os(i32),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::Timeout => write!(f, "operation timed out"),
            RtError::AlreadyStarted => write!(f, "scheduler already started"),
            RtError::NotInitialized => write!(f, "runtime not initialized on this thread"),
            RtError::EventExists => write!(f, "event already registered"),
            RtError::EventNotFound => write!(f, "event not registered"),
            RtError::EpollCtl(e) => write!(f, "epoll_ctl failed: errno {}", e),
            RtError::Os(e) => write!(f, "os error: errno {}", e),
        }
    }
}

impl std::error::Error for RtError {}
