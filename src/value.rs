//! Observable scalar value.

use std::sync::Arc;

use crate::collection::{node_handle, Contents, Core, Outcome, Tracker};
use crate::{
    Change, ChangeHandler, ChangeSystem, CollectionError, Delta, Element, NodeId, ValueDelta,
};

pub(crate) struct Slot<T> {
    value: T,
}

impl<T: Element> Contents for Slot<T> {
    fn len(&self) -> usize {
        1
    }

    fn retrack(&self, tracker: &mut Tracker<'_>) {
        tracker.retrack_all([&self.value]);
    }
}

/// A single value that notifies its listeners when it is set.
///
/// If the value is itself a node, its changes are forwarded as alterations of
/// this value. Cloning the handle shares the value.
pub struct ObservableValue<T> {
    inner: Arc<Core<Slot<T>>>,
}

node_handle!("ObservableValue", ObservableValue<T>);

impl<T: Element + Send + 'static> ObservableValue<T> {
    /// Create a value.
    pub fn new(system: &ChangeSystem, value: T) -> Self {
        Self {
            inner: Core::new_cyclic(system, "value", Slot { value }),
        }
    }

    /// A copy of the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.read(|slot| slot.value.clone())
    }

    /// Run `f` over the current value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.read(|slot| f(&slot.value))
    }

    /// Replace the value, returning the previous one. Always fires.
    pub fn set(&self, value: T) -> Result<T, CollectionError> {
        self.inner.precise(|slot, tracker| {
            tracker.start(&value);
            let previous = std::mem::replace(&mut slot.value, value);
            let fault = tracker.stop(&previous);
            Ok(Outcome::changed(previous, Delta::Value(ValueDelta::alteration())).with_fault(fault))
        })
    }

    /// Change the value in place.
    ///
    /// Tracking is rebuilt afterwards and an alteration fires, also when `f`
    /// panics.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, CollectionError> {
        self.inner.bulk(
            |_, _| Delta::Value(ValueDelta::alteration()),
            |slot| Ok(f(&mut slot.value)),
        )
    }
}

impl<T: Element + Send + 'static> ChangeHandler for Core<Slot<T>> {
    fn on_internal_change(&self, source: NodeId, _change: &Change) -> Option<Change> {
        tracing::trace!(node = %self.node, %source, "held node changed");
        Some(Change::derived(Delta::Value(ValueDelta::alteration())))
    }
}
