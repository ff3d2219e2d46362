//! Observable set.

use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexSet;

use crate::collection::{node_handle, Contents, Core, Outcome, Tracker};
use crate::{
    AffectedKey, Change, ChangeHandler, ChangeSystem, CollectionError, Delta, Element, NodeId,
    SetDelta,
};

/// Backing store of an [`ObservableSet`]. Iteration follows insertion order.
pub type SetStore<T> = IndexSet<T, ahash::RandomState>;

impl<T: Element> Contents for SetStore<T> {
    fn len(&self) -> usize {
        IndexSet::len(self)
    }

    fn retrack(&self, tracker: &mut Tracker<'_>) {
        tracker.retrack_all(self.iter());
    }
}

/// A set that notifies its listeners of every mutation.
///
/// Inserting and removing fire deltas naming the element. A change of a
/// contained node fires an entire alteration: same size, any element may have
/// changed. Cloning the handle shares the set.
pub struct ObservableSet<T> {
    inner: Arc<Core<SetStore<T>>>,
}

node_handle!("ObservableSet", ObservableSet<T>);

impl<T> ObservableSet<T>
where
    T: Element + Hash + Eq + Clone + Send + Sync + 'static,
{
    /// Create an empty set.
    pub fn new(system: &ChangeSystem) -> Self {
        Self::from_store(system, SetStore::default())
    }

    /// Create a set holding `elements`. Duplicates collapse to the first one.
    pub fn from_elements(system: &ChangeSystem, elements: impl IntoIterator<Item = T>) -> Self {
        Self::from_store(system, elements.into_iter().collect())
    }

    fn from_store(system: &ChangeSystem, items: SetStore<T>) -> Self {
        Self {
            inner: Core::new_cyclic(system, "set", items),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.read(IndexSet::len)
    }

    /// Returns true if the set holds no elements.
    pub fn is_empty(&self) -> bool {
        self.inner.read(IndexSet::is_empty)
    }

    /// Returns true if `element` is present.
    pub fn contains(&self, element: &T) -> bool {
        self.inner.read(|items| items.contains(element))
    }

    /// A snapshot of the contents in insertion order.
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.read(|items| items.iter().cloned().collect())
    }

    /// Run `f` over an unmodifiable view of the contents.
    pub fn read<R>(&self, f: impl FnOnce(&SetStore<T>) -> R) -> R {
        self.inner.read(f)
    }

    /// Number of live occurrences of `node` in this set (0 or 1).
    pub fn live_count(&self, node: NodeId) -> usize {
        self.inner.live_count(node)
    }

    /// The element nodes this set listens to.
    pub fn tracked_nodes(&self) -> Vec<NodeId> {
        self.inner.tracked_nodes()
    }

    /// Insert `element`. Returns false, and fires nothing, if it was present.
    pub fn insert(&self, element: T) -> bool {
        let inserted = self.inner.precise(|items, tracker| {
            if items.contains(&element) {
                return Ok(Outcome::unchanged(false));
            }
            let len = items.len();
            tracker.start(&element);
            let delta = SetDelta::insertion(AffectedKey::new(element.clone()), len);
            items.insert(element);
            Ok(Outcome::changed(true, Delta::Set(delta)))
        });
        matches!(inserted, Ok(true))
    }

    /// Remove `element`, returning the stored instance. Fires nothing if it
    /// was absent.
    pub fn remove(&self, element: &T) -> Result<Option<T>, CollectionError> {
        self.inner.precise(|items, tracker| {
            let len = items.len();
            let Some(removed) = items.shift_take(element) else {
                return Ok(Outcome::unchanged(None));
            };
            let fault = tracker.stop(&removed);
            let delta = SetDelta::deletion(AffectedKey::new(removed.clone()), len);
            Ok(Outcome::changed(Some(removed), Delta::Set(delta)).with_fault(fault))
        })
    }

    fn bulk<R>(
        &self,
        action: impl FnOnce(&mut SetStore<T>) -> anyhow::Result<R>,
    ) -> Result<R, CollectionError> {
        self.inner.bulk(
            |old_len, new_len| Delta::Set(SetDelta::complete(Some(old_len), Some(new_len))),
            action,
        )
    }

    /// Insert every element of `elements`.
    pub fn extend(&self, elements: impl IntoIterator<Item = T>) -> Result<(), CollectionError> {
        self.bulk(|items| {
            items.extend(elements);
            Ok(())
        })
    }

    /// Insert elements until the first error. Elements inserted before it stay.
    pub fn try_extend(
        &self,
        elements: impl IntoIterator<Item = anyhow::Result<T>>,
    ) -> Result<(), CollectionError> {
        self.bulk(|items| {
            for element in elements {
                items.insert(element?);
            }
            Ok(())
        })
    }

    /// Keep only the elements for which `keep` returns true. Returns the
    /// number of removed elements.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> Result<usize, CollectionError> {
        self.bulk(|items| {
            let before = items.len();
            items.retain(|element| keep(element));
            Ok(before - items.len())
        })
    }

    /// Remove every element of `elements`.
    pub fn remove_all(&self, elements: &[T]) -> Result<usize, CollectionError> {
        self.bulk(|items| {
            let before = items.len();
            for element in elements {
                items.shift_remove(element);
            }
            Ok(before - items.len())
        })
    }

    /// Remove every element not in `elements`.
    pub fn retain_all(&self, elements: &[T]) -> Result<usize, CollectionError> {
        self.retain(|element| elements.contains(element))
    }

    /// Remove every element.
    pub fn clear(&self) -> Result<(), CollectionError> {
        self.inner.bulk(
            |old_len, _| Delta::Set(SetDelta::clear(old_len)),
            |items| {
                items.clear();
                Ok(())
            },
        )
    }

    /// Replace the contents with `elements`, returning the previous contents.
    pub fn replace(
        &self,
        elements: impl IntoIterator<Item = T>,
    ) -> Result<SetStore<T>, CollectionError> {
        self.bulk(|items| {
            let previous = std::mem::take(items);
            items.extend(elements);
            Ok(previous)
        })
    }

    /// Run an arbitrary mutation over the backing set.
    pub fn modify<R>(
        &self,
        action: impl FnOnce(&mut SetStore<T>) -> anyhow::Result<R>,
    ) -> Result<R, CollectionError> {
        self.bulk(action)
    }
}

impl<T: Element + Send + 'static> ChangeHandler for Core<SetStore<T>> {
    fn on_internal_change(&self, source: NodeId, _change: &Change) -> Option<Change> {
        let len = self.state.try_lock().map(|state| state.items.len());
        tracing::trace!(node = %self.node, %source, ?len, "set element changed");
        Some(Change::derived(Delta::Set(SetDelta::entire_alteration(len))))
    }
}
