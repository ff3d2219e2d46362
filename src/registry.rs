//! Counted listener registry.

use std::hash::Hash;

use indexmap::IndexMap;

/// A multiset of listeners.
///
/// The same listener may be added several times and stays registered until it
/// has been removed as many times. Iteration yields each distinct listener
/// once, in the order it was first added.
#[derive(Debug, Clone)]
pub struct ListenerRegistry<L> {
    // Invariant: every stored count is at least 1.
    counts: IndexMap<L, usize, ahash::RandomState>,
}

impl<L> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            counts: IndexMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

impl<L: Copy + Eq + Hash> ListenerRegistry<L> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one subscription of `listener` and return its new count.
    pub fn add(&mut self, listener: L) -> usize {
        let count = self.counts.entry(listener).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove one subscription of `listener`.
    ///
    /// Returns whether the listener had a live count before the call. `false`
    /// means the caller removed something it never added, or removed it once
    /// too often.
    pub fn remove(&mut self, listener: L) -> bool {
        let Some(count) = self.counts.get_mut(&listener) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.shift_remove(&listener);
        }
        true
    }

    /// Remove every subscription of `listener` and return how many there were.
    pub fn purge(&mut self, listener: L) -> usize {
        self.counts.shift_remove(&listener).unwrap_or(0)
    }

    /// Number of live subscriptions of `listener`.
    pub fn count(&self, listener: L) -> usize {
        self.counts.get(&listener).copied().unwrap_or(0)
    }

    /// Returns true if `listener` has at least one live subscription.
    pub fn contains(&self, listener: L) -> bool {
        self.counts.contains_key(&listener)
    }

    /// Iterate over distinct listeners.
    pub fn iter(&self) -> impl Iterator<Item = L> + '_ {
        self.counts.keys().copied()
    }

    /// Number of distinct listeners.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
