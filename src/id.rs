//! Task identity
//!
//! Process-unique task ids, assigned monotonically at construction and
//! never reused. The default allocator is a crate-level [`IdGen`];
//! embedders and tests that need isolated, deterministic numbering can
//! allocate from their own generator instead.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Build an id from a raw value.
    ///
    /// Intended for tests and for embedders that manage their own
    /// numbering; ids handed out by [`IdGen`] never collide with each
    /// other but nothing guards against collisions with raw ids.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Monotonic id generator
///
/// Ids increase strictly and are never handed out twice for the lifetime
/// of the generator. The crate keeps one process-wide instance for
/// ordinary construction; separate instances give isolated sequences.
#[derive(Debug)]
pub struct IdGen(AtomicU64);

impl IdGen {
    /// Create a generator starting at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_IDS: IdGen = IdGen::new();

/// Allocate an id from the process-wide generator.
pub(crate) fn next_task_id() -> TaskId {
    GLOBAL_IDS.next_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let ids = IdGen::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_global_ids_are_unique() {
        let a = next_task_id();
        let b = next_task_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        assert_eq!(TaskId::from_raw(12).to_string(), "task-12");
    }
}
