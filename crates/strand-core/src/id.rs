//! Coroutine identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a coroutine.
///
/// Ids are process-unique and never reused, even when the coroutine
/// object itself is recycled through a Processor's idle freelist.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoId(u64);

impl CoId {
    /// Allocate the next id.
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        CoId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value (for logging).
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({})", self.0)
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_uniqueness() {
        let ids: Vec<_> = (0..1000).map(|_| CoId::next()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[test]
    fn test_id_monotonic() {
        let a = CoId::next();
        let b = CoId::next();
        assert!(b.raw() > a.raw());
    }
}
