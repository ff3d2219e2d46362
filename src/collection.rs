//! Machinery shared by the observable containers: a node, a backing store and
//! its contents tracking behind one lock, and the two mutation paths.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::run_guarded;
use crate::{
    Change, ChangeHandler, ChangeSystem, CollectionError, ContentsTracking, Delta, Element, NodeId,
};

/// A backing store whose element nodes can be retracked from scratch.
pub(crate) trait Contents {
    fn len(&self) -> usize;

    fn retrack(&self, tracker: &mut Tracker<'_>);
}

impl<T: Element> Contents for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn retrack(&self, tracker: &mut Tracker<'_>) {
        tracker.retrack_all(self.iter());
    }
}

/// Contents tracking bound to its owner, handed to single-element mutations.
pub(crate) struct Tracker<'a> {
    tracking: &'a mut ContentsTracking,
    system: &'a ChangeSystem,
    owner: NodeId,
}

impl Tracker<'_> {
    pub(crate) fn start<E: Element + ?Sized>(&mut self, element: &E) {
        self.tracking.start_tracking(self.system, self.owner, element);
    }

    pub(crate) fn stop<E: Element + ?Sized>(&mut self, element: &E) -> Result<(), CollectionError> {
        self.tracking.stop_tracking(self.system, self.owner, element)
    }

    pub(crate) fn retrack_all<'e, E, I>(&mut self, elements: I)
    where
        E: Element + ?Sized + 'e,
        I: IntoIterator<Item = &'e E>,
    {
        self.tracking.retrack_all(self.system, self.owner, elements);
    }
}

/// What a single-element mutation did.
pub(crate) struct Outcome<R> {
    value: R,
    delta: Option<Delta>,
    fault: Result<(), CollectionError>,
}

impl<R> Outcome<R> {
    pub(crate) fn changed(value: R, delta: Delta) -> Self {
        Self {
            value,
            delta: Some(delta),
            fault: Ok(()),
        }
    }

    pub(crate) fn unchanged(value: R) -> Self {
        Self {
            value,
            delta: None,
            fault: Ok(()),
        }
    }

    /// Attach a tracking fault. The mutation still took effect and is still
    /// propagated; the fault is returned afterwards.
    pub(crate) fn with_fault(mut self, fault: Result<(), CollectionError>) -> Self {
        if self.fault.is_ok() {
            self.fault = fault;
        }
        self
    }
}

pub(crate) struct Tracked<S> {
    pub(crate) items: S,
    pub(crate) tracking: ContentsTracking,
}

/// The shared part of an observable container.
pub(crate) struct Core<S> {
    pub(crate) system: ChangeSystem,
    pub(crate) node: NodeId,
    pub(crate) state: Mutex<Tracked<S>>,
}

impl<S: Contents> Core<S> {
    /// Register a node whose handler is the container itself and track the
    /// initial contents.
    pub(crate) fn new_cyclic(system: &ChangeSystem, label: &'static str, items: S) -> Arc<Self>
    where
        Self: ChangeHandler + 'static,
    {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let handler: Weak<dyn ChangeHandler> = weak.clone();
            let node = system.register_node(label, Some(handler));
            let mut tracking = ContentsTracking::new();
            items.retrack(&mut Tracker {
                tracking: &mut tracking,
                system,
                owner: node,
            });
            Core {
                system: system.clone(),
                node,
                state: Mutex::new(Tracked { items, tracking }),
            }
        })
    }

    /// Run `f` over the store inside a read region.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let _scope = self.system.prepare_read(self.node);
        let state = self.state.lock();
        f(&state.items)
    }

    pub(crate) fn live_count(&self, node: NodeId) -> usize {
        let _scope = self.system.prepare_read(self.node);
        let count = self.state.lock().tracking.live_count(node);
        count
    }

    pub(crate) fn tracked_nodes(&self) -> Vec<NodeId> {
        let _scope = self.system.prepare_read(self.node);
        let nodes = self.state.lock().tracking.tracked().collect();
        nodes
    }

    /// Single-element mutation with precise tracking and delta.
    ///
    /// An `Err` from `op` means nothing was mutated and nothing is propagated.
    pub(crate) fn precise<R>(
        &self,
        op: impl FnOnce(&mut S, &mut Tracker<'_>) -> Result<Outcome<R>, CollectionError>,
    ) -> Result<R, CollectionError> {
        let scope = self.system.prepare_change(self.node);
        let outcome = {
            let mut state = self.state.lock();
            let Tracked { items, tracking } = &mut *state;
            let mut tracker = Tracker {
                tracking,
                system: &self.system,
                owner: self.node,
            };
            op(items, &mut tracker)?
        };
        let Outcome {
            value,
            delta,
            fault,
        } = outcome;
        if let Some(delta) = delta {
            scope.propagate(Change::initial(delta));
        }
        scope.conclude();
        fault.map(|()| value)
    }

    /// Bulk mutation: tracking is rebuilt from scratch around `action` and a
    /// delta built by `delta(old_len, new_len)` is always propagated, also
    /// when `action` fails or panics.
    pub(crate) fn bulk<R>(
        &self,
        delta: impl FnOnce(usize, usize) -> Delta,
        action: impl FnOnce(&mut S) -> anyhow::Result<R>,
    ) -> Result<R, CollectionError> {
        let scope = self.system.prepare_change(self.node);
        let (result, old_len, new_len) = {
            let mut state = self.state.lock();
            let Tracked { items, tracking } = &mut *state;
            let old_len = items.len();
            tracking.clear_all(&self.system, self.node);
            let result = run_guarded(|| action(items));
            items.retrack(&mut Tracker {
                tracking,
                system: &self.system,
                owner: self.node,
            });
            (result, old_len, items.len())
        };
        tracing::debug!(node = %self.node, old_len, new_len, failed = result.is_err(), "bulk mutation");
        scope.propagate(Change::initial(delta(old_len, new_len)));
        scope.conclude();
        result
    }
}

impl<S> Drop for Core<S> {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .tracking
            .clear_all(&self.system, self.node);
        self.system.remove_node(self.node);
    }
}

/// Identity, `Element`, `Changeable` and `Debug` for a handle type holding
/// `inner: Arc<Core<_>>`.
macro_rules! node_handle {
    ($name:literal, $ty:ident < $($param:ident),+ >) => {
        impl<$($param),+> PartialEq for $ty<$($param),+> {
            fn eq(&self, other: &Self) -> bool {
                self.inner.node == other.inner.node
            }
        }

        impl<$($param),+> Eq for $ty<$($param),+> {}

        impl<$($param),+> std::hash::Hash for $ty<$($param),+> {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                std::hash::Hash::hash(&self.inner.node, state);
            }
        }

        impl<$($param),+> Clone for $ty<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    inner: self.inner.clone(),
                }
            }
        }

        impl<$($param),+> $crate::Element for $ty<$($param),+> {
            fn node_id(&self) -> Option<$crate::NodeId> {
                Some(self.inner.node)
            }
        }

        impl<$($param),+> $crate::Changeable for $ty<$($param),+> {
            fn node(&self) -> $crate::NodeId {
                self.inner.node
            }

            fn system(&self) -> &$crate::ChangeSystem {
                &self.inner.system
            }
        }

        impl<$($param),+> std::fmt::Debug for $ty<$($param),+> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct($name)
                    .field("node", &self.inner.node)
                    .finish_non_exhaustive()
            }
        }
    };
}

pub(crate) use node_handle;
