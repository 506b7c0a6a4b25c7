//! Loading counters: remaining device capacity per hardware signature.
//!
//! Counters live in an arena and are referenced by [`CounterId`]. Several
//! configurations that share a physical signature (variants of one board)
//! hold the same id, so consuming capacity through one of them is visible
//! through all of them.

use serde::Serialize;

/// Handle to a counter in a [`CounterArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CounterId(usize);

/// Owns every loading counter of a scheduling run.
///
/// Counters only ever decrease, and only during distribution.
#[derive(Debug, Clone, Default)]
pub struct CounterArena {
    initial: Vec<u32>,
    remaining: Vec<u32>,
}

impl CounterArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new counter starting at `count`.
    pub fn allocate(&mut self, count: u32) -> CounterId {
        self.initial.push(count);
        self.remaining.push(count);
        CounterId(self.remaining.len() - 1)
    }

    /// Remaining capacity of a counter.
    pub fn remaining(&self, id: CounterId) -> u32 {
        self.remaining.get(id.0).copied().unwrap_or(0)
    }

    /// Capacity the counter was allocated with.
    pub fn initial(&self, id: CounterId) -> u32 {
        self.initial.get(id.0).copied().unwrap_or(0)
    }

    /// Takes one unit of capacity. Returns `false` if none was left.
    pub fn try_consume(&mut self, id: CounterId) -> bool {
        match self.remaining.get_mut(id.0) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Total capacity consumed across every counter.
    pub fn consumed(&self) -> u32 {
        self.initial
            .iter()
            .zip(&self.remaining)
            .map(|(initial, remaining)| initial - remaining)
            .sum()
    }

    /// Number of counters.
    pub fn len(&self) -> usize {
        self.remaining.len()
    }

    /// Returns true if no counter was allocated.
    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_stops_at_zero() {
        let mut arena = CounterArena::new();
        let id = arena.allocate(2);

        assert!(arena.try_consume(id));
        assert!(arena.try_consume(id));
        assert!(!arena.try_consume(id));
        assert_eq!(arena.remaining(id), 0);
        assert_eq!(arena.initial(id), 2);
        assert_eq!(arena.consumed(), 2);
    }

    #[test]
    fn test_unknown_id_has_no_capacity() {
        let mut arena = CounterArena::new();
        let id = arena.allocate(1);
        let mut other = CounterArena::new();

        assert_eq!(other.remaining(id), 0);
        assert!(!other.try_consume(id));
        assert_eq!(arena.len(), 1);
    }
}
