//! Coroutine state machine

use core::fmt;

/// State of a coroutine.
///
/// Transitions are one-way except `Term -> Init` via `reset`:
///
/// ```text
/// Init ──resume──► Exec ──yield──► Hold
///                   ▲                │
///                   └────resume──────┘
///                  Exec ──return──► Term ──reset──► Init
/// ```
///
/// `Ready` marks a coroutine that has been woken (by readiness, a timer,
/// or a task enqueue) and is sitting in its Processor's runnable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoState {
    /// Created or reset, stack primed, never resumed since
    Init = 0,

    /// Woken and queued, waiting for dispatch
    Ready = 1,

    /// Currently executing
    Exec = 2,

    /// Suspended by a voluntary yield (I/O wait, timer wait, yield_now)
    Hold = 3,

    /// Callable returned; eligible for reset or release
    Term = 4,
}

impl CoState {
    /// Check whether `resume` is legal from this state.
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, CoState::Init | CoState::Ready | CoState::Hold)
    }

    /// Check whether the coroutine has finished.
    #[inline]
    pub const fn is_term(&self) -> bool {
        matches!(self, CoState::Term)
    }
}

impl From<u8> for CoState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoState::Init,
            1 => CoState::Ready,
            2 => CoState::Exec,
            3 => CoState::Hold,
            4 => CoState::Term,
            _ => CoState::Init, // Default for invalid values
        }
    }
}

impl From<CoState> for u8 {
    fn from(s: CoState) -> u8 {
        s as u8
    }
}

impl fmt::Display for CoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoState::Init => write!(f, "INIT"),
            CoState::Ready => write!(f, "READY"),
            CoState::Exec => write!(f, "EXEC"),
            CoState::Hold => write!(f, "HOLD"),
            CoState::Term => write!(f, "TERM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable() {
        assert!(CoState::Init.is_resumable());
        assert!(CoState::Ready.is_resumable());
        assert!(CoState::Hold.is_resumable());
        assert!(!CoState::Exec.is_resumable());
        assert!(!CoState::Term.is_resumable());
    }

    #[test]
    fn test_round_trip_u8() {
        for s in [
            CoState::Init,
            CoState::Ready,
            CoState::Exec,
            CoState::Hold,
            CoState::Term,
        ] {
            assert_eq!(CoState::from(u8::from(s)), s);
        }
    }
}
