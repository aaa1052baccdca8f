//! Fiber state machine

use core::fmt;

/// State of a fiber.
///
/// Legal transitions:
///
/// ```text
/// Init -> Exec -> {Hold, Ready, Term, Except}
/// Hold/Ready -> Exec
/// Term/Except -> Init   (via reset with a new closure)
/// ```
///
/// At most one fiber per OS thread is `Exec` at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created (or reset), not yet started
    Init = 0,

    /// Runnable, waiting in a scheduler queue
    Ready = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Suspended; will not run until explicitly rescheduled
    Hold = 3,

    /// Closure returned normally
    Term = 4,

    /// Closure panicked; captured at the trampoline boundary
    Except = 5,
}

impl FiberState {
    /// True for states a scheduler may swap into.
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }

    /// True once the closure has finished, normally or not.
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// True for states from which `reset` is legal.
    #[inline]
    pub const fn can_reset(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => FiberState::Init,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Term => "TERM",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(FiberState::Init.is_runnable());
        assert!(FiberState::Ready.is_runnable());
        assert!(FiberState::Hold.is_runnable());
        assert!(!FiberState::Exec.is_runnable());

        assert!(FiberState::Term.is_terminated());
        assert!(FiberState::Except.is_terminated());
        assert!(!FiberState::Hold.is_terminated());

        assert!(FiberState::Init.can_reset());
        assert!(FiberState::Term.can_reset());
        assert!(FiberState::Except.can_reset());
        assert!(!FiberState::Exec.can_reset());
        assert!(!FiberState::Ready.can_reset());
    }

    #[test]
    fn test_u8_round_trip() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Exec,
            FiberState::Hold,
            FiberState::Term,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
        assert_eq!(FiberState::from(200u8), FiberState::Init);
    }
}
