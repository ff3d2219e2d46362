//! Observable list.

use std::sync::Arc;

use crate::collection::{node_handle, Core, Outcome};
use crate::{Change, ChangeHandler, ChangeSystem, CollectionError, Delta, Element, ListDelta, NodeId};

/// A list that notifies its listeners of every mutation.
///
/// Elements that are themselves nodes are tracked: a change of a contained
/// node is seen by the list's listeners as an alteration of the range that
/// holds it. Cloning the handle shares the list.
///
/// Single-element operations fire precise deltas. Bulk operations rebuild
/// tracking and always fire [`DeltaKind::Complete`](crate::DeltaKind::Complete)
/// (`clear` fires `Clear`).
///
/// User closures passed to [`read`](Self::read) and the bulk operations run
/// under the list's lock and must not touch this list.
pub struct ObservableList<T> {
    inner: Arc<Core<Vec<T>>>,
}

node_handle!("ObservableList", ObservableList<T>);

impl<T: Element + Send + 'static> ObservableList<T> {
    /// Create an empty list.
    pub fn new(system: &ChangeSystem) -> Self {
        Self::from_vec(system, Vec::new())
    }

    /// Create a list holding `items`.
    pub fn from_vec(system: &ChangeSystem, items: Vec<T>) -> Self {
        Self {
            inner: Core::new_cyclic(system, "list", items),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.read(Vec::len)
    }

    /// Returns true if the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.inner.read(Vec::is_empty)
    }

    /// The element at `index`.
    pub fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        self.inner.read(|items| items.get(index).cloned())
    }

    /// Returns true if an element equal to `element` is present.
    pub fn contains(&self, element: &T) -> bool
    where
        T: PartialEq,
    {
        self.inner.read(|items| items.contains(element))
    }

    /// A snapshot of the contents.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.read(|items| items.clone())
    }

    /// Run `f` over an unmodifiable view of the contents.
    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        self.inner.read(|items| f(items))
    }

    /// Number of live occurrences of `node` in this list.
    pub fn live_count(&self, node: NodeId) -> usize {
        self.inner.live_count(node)
    }

    /// The element nodes this list listens to.
    pub fn tracked_nodes(&self) -> Vec<NodeId> {
        self.inner.tracked_nodes()
    }

    // ========================================================================
    // Single-element mutations
    // ========================================================================

    /// Append `element`.
    pub fn push(&self, element: T) {
        let pushed = self.inner.precise(|items, tracker| {
            tracker.start(&element);
            let index = items.len();
            items.push(element);
            Ok(Outcome::changed((), Delta::List(ListDelta::insertion(index, index))))
        });
        // Appending only starts tracking, so there is no fault to surface.
        if let Err(err) = pushed {
            tracing::error!(node = %self.inner.node, %err, "push failed");
        }
    }

    /// Insert `element` at `index`, shifting later elements.
    pub fn insert(&self, index: usize, element: T) -> Result<(), CollectionError> {
        self.inner.precise(|items, tracker| {
            let len = items.len();
            if index > len {
                return Err(CollectionError::IndexOutOfBounds { index, len });
            }
            tracker.start(&element);
            items.insert(index, element);
            Ok(Outcome::changed((), Delta::List(ListDelta::insertion(index, len))))
        })
    }

    /// Remove and return the element at `index`.
    pub fn remove(&self, index: usize) -> Result<T, CollectionError> {
        self.inner.precise(|items, tracker| {
            let len = items.len();
            if index >= len {
                return Err(CollectionError::IndexOutOfBounds { index, len });
            }
            let removed = items.remove(index);
            let fault = tracker.stop(&removed);
            Ok(Outcome::changed(removed, Delta::List(ListDelta::deletion(index, len))).with_fault(fault))
        })
    }

    /// Replace the element at `index`, returning the previous one.
    pub fn set(&self, index: usize, element: T) -> Result<T, CollectionError> {
        self.inner.precise(|items, tracker| {
            let len = items.len();
            let Some(slot) = items.get_mut(index) else {
                return Err(CollectionError::IndexOutOfBounds { index, len });
            };
            // Start before stop, so replacing an element with itself keeps the subscription.
            tracker.start(&element);
            let previous = std::mem::replace(slot, element);
            let fault = tracker.stop(&previous);
            let delta = ListDelta::alteration(Some(index..index + 1), Some(len));
            Ok(Outcome::changed(previous, Delta::List(delta)).with_fault(fault))
        })
    }

    /// Remove and return the last element. Nothing fires on an empty list.
    pub fn pop(&self) -> Result<Option<T>, CollectionError> {
        self.inner.precise(|items, tracker| {
            let len = items.len();
            let Some(removed) = items.pop() else {
                return Ok(Outcome::unchanged(None));
            };
            let fault = tracker.stop(&removed);
            let delta = Delta::List(ListDelta::deletion(len - 1, len));
            Ok(Outcome::changed(Some(removed), delta).with_fault(fault))
        })
    }

    // ========================================================================
    // Bulk mutations
    // ========================================================================

    fn bulk<R>(
        &self,
        action: impl FnOnce(&mut Vec<T>) -> anyhow::Result<R>,
    ) -> Result<R, CollectionError> {
        self.inner.bulk(
            |old_len, new_len| Delta::List(ListDelta::complete(Some(old_len), Some(new_len))),
            action,
        )
    }

    /// Append every element of `elements`.
    pub fn extend(&self, elements: impl IntoIterator<Item = T>) -> Result<(), CollectionError> {
        self.bulk(|items| {
            items.extend(elements);
            Ok(())
        })
    }

    /// Append elements until the first error, which is returned as
    /// [`CollectionError::ActionFailed`]. Elements appended before it stay.
    pub fn try_extend(
        &self,
        elements: impl IntoIterator<Item = anyhow::Result<T>>,
    ) -> Result<(), CollectionError> {
        self.bulk(|items| {
            for element in elements {
                items.push(element?);
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

    /// Remove every element equal to one of `elements`.
    pub fn remove_all(&self, elements: &[T]) -> Result<usize, CollectionError>
    where
        T: PartialEq,
    {
        self.retain(|element| !elements.contains(element))
    }

    /// Remove every element not equal to one of `elements`.
    pub fn retain_all(&self, elements: &[T]) -> Result<usize, CollectionError>
    where
        T: PartialEq,
    {
        self.retain(|element| elements.contains(element))
    }

    /// Remove every element.
    pub fn clear(&self) -> Result<(), CollectionError> {
        self.inner.bulk(
            |old_len, _| Delta::List(ListDelta::clear(old_len)),
            |items| {
                items.clear();
                Ok(())
            },
        )
    }

    /// Replace the contents with `elements`, returning the previous contents.
    pub fn replace(&self, elements: impl IntoIterator<Item = T>) -> Result<Vec<T>, CollectionError> {
        self.bulk(|items| {
            let previous = std::mem::take(items);
            items.extend(elements);
            Ok(previous)
        })
    }

    /// Run an arbitrary mutation over the backing vector.
    ///
    /// Tracking is rebuilt afterwards and a complete change fires, also when
    /// `action` fails or panics part-way.
    pub fn modify<R>(
        &self,
        action: impl FnOnce(&mut Vec<T>) -> anyhow::Result<R>,
    ) -> Result<R, CollectionError> {
        self.bulk(action)
    }
}

impl<T: Element + Send + 'static> ChangeHandler for Core<Vec<T>> {
    fn on_internal_change(&self, source: NodeId, _change: &Change) -> Option<Change> {
        let Some(state) = self.state.try_lock() else {
            tracing::trace!(node = %self.node, %source, "list busy, unknown range");
            return Some(Change::derived(Delta::List(ListDelta::alteration(None, None))));
        };
        let mut occurrences = state
            .items
            .iter()
            .enumerate()
            .filter(|(_, element)| element.node_id() == Some(source))
            .map(|(index, _)| index);
        let first = occurrences.next()?;
        let last = occurrences.last().unwrap_or(first);
        let delta = ListDelta::alteration(Some(first..last + 1), Some(state.items.len()));
        Some(Change::derived(Delta::List(delta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeEvent, Changeable, DeltaKind, Listener};
    use parking_lot::Mutex;

    fn record(list: &impl Changeable) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = list
            .system()
            .register_external(move |event| sink.lock().push(event.clone()));
        list.add_listener(listener);
        events
    }

    fn last_delta(events: &Mutex<Vec<ChangeEvent>>, node: NodeId) -> ListDelta {
        let events = events.lock();
        let event = events.last().unwrap();
        event.change(node).unwrap().delta.as_list().unwrap().clone()
    }

    #[test]
    fn test_push_fires_insertion() {
        let system = ChangeSystem::new();
        let list = ObservableList::from_vec(&system, vec![1, 2, 3]);
        let events = record(&list);

        list.push(4);

        assert_eq!(events.lock().len(), 1);
        let delta = last_delta(&events, list.node());
        assert_eq!(delta, ListDelta::insertion(3, 3));
        assert_eq!(list.to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_precise_deltas() {
        let system = ChangeSystem::new();
        let list = ObservableList::from_vec(&system, vec!['a', 'b', 'c']);
        let events = record(&list);

        list.insert(1, 'x').unwrap();
        assert_eq!(last_delta(&events, list.node()), ListDelta::insertion(1, 3));

        assert_eq!(list.set(0, 'y').unwrap(), 'a');
        let delta = last_delta(&events, list.node());
        assert_eq!(delta.kind, DeltaKind::Alteration);
        assert_eq!(delta.range, Some(0..1));
        assert_eq!(delta.change_size(), Some(0));

        assert_eq!(list.remove(2).unwrap(), 'b');
        assert_eq!(last_delta(&events, list.node()), ListDelta::deletion(2, 4));

        assert_eq!(list.pop().unwrap(), Some('c'));
        assert_eq!(list.to_vec(), vec!['y', 'x']);
        assert_eq!(events.lock().len(), 4);
    }

    #[test]
    fn test_out_of_bounds_fires_nothing() {
        let system = ChangeSystem::new();
        let list = ObservableList::from_vec(&system, vec![1]);
        let events = record(&list);

        let err = list.insert(3, 9).unwrap_err();
        assert!(matches!(err, CollectionError::IndexOutOfBounds { index: 3, len: 1 }));
        assert!(list.remove(1).is_err());
        assert!(list.set(5, 0).is_err());
        assert!(events.lock().is_empty());
        assert!(!system.in_transaction());
    }

    #[test]
    fn test_pop_empty_fires_nothing() {
        let system = ChangeSystem::new();
        let list: ObservableList<i32> = ObservableList::new(&system);
        let events = record(&list);

        assert_eq!(list.pop().unwrap(), None);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_bulk_fires_complete() {
        let system = ChangeSystem::new();
        let list = ObservableList::from_vec(&system, vec![1, 2, 3, 4]);
        let events = record(&list);

        assert_eq!(list.retain(|n| n % 2 == 0).unwrap(), 2);
        assert_eq!(last_delta(&events, list.node()), ListDelta::complete(Some(4), Some(2)));

        list.extend([6, 8]).unwrap();
        assert_eq!(last_delta(&events, list.node()), ListDelta::complete(Some(2), Some(4)));

        assert_eq!(list.remove_all(&[2, 8]).unwrap(), 2);
        assert_eq!(list.retain_all(&[6]).unwrap(), 1);
        assert_eq!(list.to_vec(), vec![6]);

        assert_eq!(list.replace([7, 7]).unwrap(), vec![6]);
        list.clear().unwrap();
        let delta = last_delta(&events, list.node());
        assert_eq!(delta.kind, DeltaKind::Clear);
        assert_eq!(delta.old_size, Some(2));
        assert!(list.is_empty());
    }

    #[test]
    fn test_nested_list_tracking() {
        let system = ChangeSystem::new();
        let inner = ObservableList::from_vec(&system, vec![1]);
        let outer = ObservableList::new(&system);
        outer.push(inner.clone());
        outer.push(inner.clone());

        assert_eq!(outer.live_count(inner.node()), 2);
        assert_eq!(system.listener_count(inner.node(), Listener::Node(outer.node())), 1);

        outer.remove(0).unwrap();
        assert_eq!(outer.live_count(inner.node()), 1);
        assert!(system.listeners(inner.node()).contains(&Listener::Node(outer.node())));

        outer.clear().unwrap();
        assert_eq!(outer.live_count(inner.node()), 0);
        assert!(system.listeners(inner.node()).is_empty());
    }

    #[test]
    fn test_element_change_alters_its_range() {
        let system = ChangeSystem::new();
        let a = ObservableList::from_vec(&system, vec![0]);
        let b = ObservableList::from_vec(&system, vec![0]);
        let outer = ObservableList::from_vec(&system, vec![a.clone(), b.clone(), a.clone(), b.clone()]);
        let events = record(&outer);

        b.push(1);

        let delta = last_delta(&events, outer.node());
        assert_eq!(delta.kind, DeltaKind::Alteration);
        assert_eq!(delta.range, Some(1..4));
        assert_eq!(delta.old_size, Some(4));
        let events = events.lock();
        assert_eq!(events[0].initial_nodes(), &[b.node()]);
        assert!(!events[0].change(outer.node()).unwrap().is_initial);
    }

    #[test]
    fn test_set_same_element_keeps_subscription() {
        let system = ChangeSystem::new();
        let inner: ObservableList<i32> = ObservableList::new(&system);
        let outer = ObservableList::from_vec(&system, vec![inner.clone()]);

        outer.set(0, inner.clone()).unwrap();
        assert_eq!(outer.live_count(inner.node()), 1);
        assert_eq!(system.listener_count(inner.node(), outer.node()), 1);
    }

    #[test]
    fn test_failed_action_still_fires_and_retracks() {
        let system = ChangeSystem::new();
        let inner: ObservableList<i32> = ObservableList::new(&system);
        let outer = ObservableList::new(&system);
        let events = record(&outer);

        let err = outer
            .modify::<()>(|items| {
                items.push(inner.clone());
                anyhow::bail!("stopped half-way")
            })
            .unwrap_err();

        assert!(matches!(err, CollectionError::ActionFailed(_)));
        assert_eq!(outer.live_count(inner.node()), 1);
        assert_eq!(last_delta(&events, outer.node()), ListDelta::complete(Some(0), Some(1)));
    }

    #[test]
    fn test_panicking_predicate_is_wrapped() {
        let system = ChangeSystem::new();
        let list = ObservableList::from_vec(&system, vec![1, 2, 3]);

        let err = list
            .retain(|n| if *n == 2 { panic!("bad element") } else { true })
            .unwrap_err();
        assert!(matches!(err, CollectionError::ActionPanicked { .. }));
        assert!(!system.in_transaction());
        assert!(!list.is_empty());
    }

    #[test]
    fn test_drop_unsubscribes_from_elements() {
        let system = ChangeSystem::new();
        let inner: ObservableList<i32> = ObservableList::new(&system);
        let outer = ObservableList::from_vec(&system, vec![inner.clone()]);
        let outer_node = outer.node();

        drop(outer);
        assert!(!system.contains_node(outer_node));
        assert!(system.listeners(inner.node()).is_empty());
        inner.push(1);
    }

    #[test]
    fn test_identity_equality() {
        let system = ChangeSystem::new();
        let a = ObservableList::from_vec(&system, vec![1]);
        let b = ObservableList::from_vec(&system, vec![1]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
