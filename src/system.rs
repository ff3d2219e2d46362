//! The change system: node arena, listener registries and the transaction protocol.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use slab::Slab;

use crate::tracer::{NoopTracer, Tracer};
use crate::{Change, ChangeEvent, Listener, ListenerId, ListenerRegistry, NodeId};

/// Capability of a node to react to changes of the nodes it listens to.
///
/// The system calls [`on_internal_change`](Self::on_internal_change) while a
/// change propagates. The returned change is recorded for this node and
/// propagated to its own listeners; `None` stops propagation here.
///
/// Handlers must not mutate nodes and must not read the node that is being
/// mutated.
pub trait ChangeHandler: Send + Sync {
    /// React to `change` of `source`.
    fn on_internal_change(&self, source: NodeId, change: &Change) -> Option<Change>;
}

type ExternalCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct NodeSlot {
    serial: u64,
    label: &'static str,
    listeners: ListenerRegistry<Listener>,
    handler: Option<Weak<dyn ChangeHandler>>,
}

struct ExternalSlot {
    serial: u64,
    callback: ExternalCallback,
}

/// Serials are process-wide, so a handle never resolves in a system other
/// than the one that issued it.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
struct Arena {
    nodes: Slab<NodeSlot>,
    externals: Slab<ExternalSlot>,
}

impl Arena {
    fn node(&self, id: NodeId) -> Option<&NodeSlot> {
        self.nodes.get(id.slot).filter(|slot| slot.serial == id.serial)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeSlot> {
        self.nodes
            .get_mut(id.slot)
            .filter(|slot| slot.serial == id.serial)
    }

    fn external(&self, id: ListenerId) -> Option<&ExternalSlot> {
        self.externals
            .get(id.slot)
            .filter(|slot| slot.serial == id.serial)
    }
}

/// State of the current region, only touched by the thread holding the region lock.
#[derive(Default)]
struct RegionState {
    /// Open transactions plus open change scopes.
    depth: usize,
    reads: usize,
    /// Propagation walks since the last flush.
    walks: usize,
    /// Nodes with an open change scope, with nesting counts.
    changing: AHashMap<NodeId, usize>,
    initial_nodes: Vec<NodeId>,
    changes: indexmap::IndexMap<NodeId, Change, ahash::RandomState>,
}

struct Shared {
    arena: Mutex<Arena>,
    region: ReentrantMutex<RefCell<RegionState>>,
    tracer: Arc<dyn Tracer>,
    track_map_keys: bool,
}

/// The change system manages nodes, their listeners, and the regions in which
/// nodes are mutated and read.
///
/// This is cheap to clone - all data is behind `Arc`. Independent systems do
/// not share any state.
///
/// # Example
///
/// ```ignore
/// let system = ChangeSystem::new();
/// let list = ObservableList::from_vec(&system, vec![1, 2, 3]);
/// let listener = system.register_external(|event| println!("{} nodes changed", event.len()));
/// list.add_listener(listener);
/// list.push(4);
/// ```
#[derive(Clone)]
pub struct ChangeSystem {
    shared: Arc<Shared>,
}

impl Default for ChangeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSystem")
            .field("nodes", &self.node_count())
            .field("track_map_keys", &self.shared.track_map_keys)
            .finish_non_exhaustive()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<ChangeSystem>();
    assert_sync::<ChangeSystem>();
}

impl ChangeSystem {
    /// Create a new system with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the system.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let system = ChangeSystem::builder()
    ///     .tracer(MyTracer::default())
    ///     .track_map_keys(true)
    ///     .build();
    /// ```
    pub fn builder() -> ChangeSystemBuilder {
        ChangeSystemBuilder::new()
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        &*self.shared.tracer
    }

    /// Whether new maps track their keys by default.
    pub fn track_map_keys(&self) -> bool {
        self.shared.track_map_keys
    }

    // ========================================================================
    // Nodes and listeners
    // ========================================================================

    /// Create a node. `handler` is called when a node this node listens to
    /// changes; only a weak reference is kept.
    pub fn register_node(
        &self,
        label: &'static str,
        handler: Option<Weak<dyn ChangeHandler>>,
    ) -> NodeId {
        let mut arena = self.shared.arena.lock();
        let serial = next_serial();
        let slot = arena.nodes.insert(NodeSlot {
            serial,
            label,
            listeners: ListenerRegistry::new(),
            handler,
        });
        let id = NodeId { slot, serial };
        tracing::trace!(node = %id, label, "register node");
        id
    }

    /// Remove a node and its listener registry. Returns false if it was already gone.
    pub fn remove_node(&self, node: NodeId) -> bool {
        let removed = {
            let mut arena = self.shared.arena.lock();
            if arena.node(node).is_some() {
                Some(arena.nodes.remove(node.slot))
            } else {
                None
            }
        };
        if let Some(slot) = &removed {
            tracing::trace!(%node, label = slot.label, "remove node");
        }
        removed.is_some()
    }

    /// Returns true if `node` is alive in this system.
    pub fn contains_node(&self, node: NodeId) -> bool {
        self.shared.arena.lock().node(node).is_some()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.shared.arena.lock().nodes.len()
    }

    /// Subscribe `listener` to `node`. Returns false if `node` is gone.
    pub fn add_listener(&self, node: NodeId, listener: impl Into<Listener>) -> bool {
        let listener = listener.into();
        let mut arena = self.shared.arena.lock();
        let Some(slot) = arena.node_mut(node) else {
            tracing::warn!(%node, ?listener, "add listener to a removed node");
            return false;
        };
        let count = slot.listeners.add(listener);
        tracing::trace!(%node, ?listener, count, "add listener");
        true
    }

    /// Withdraw one subscription of `listener` from `node`.
    ///
    /// Returns whether the listener had a live subscription. A `false` result
    /// points at a caller bug and is logged, not raised.
    pub fn remove_listener(&self, node: NodeId, listener: impl Into<Listener>) -> bool {
        let listener = listener.into();
        let mut arena = self.shared.arena.lock();
        let Some(slot) = arena.node_mut(node) else {
            tracing::trace!(%node, ?listener, "remove listener from a removed node");
            return false;
        };
        let removed = slot.listeners.remove(listener);
        if !removed {
            tracing::warn!(%node, ?listener, "remove listener that is not registered");
        }
        removed
    }

    /// Distinct listeners of `node`.
    pub fn listeners(&self, node: NodeId) -> Vec<Listener> {
        let arena = self.shared.arena.lock();
        arena
            .node(node)
            .map(|slot| slot.listeners.iter().collect())
            .unwrap_or_default()
    }

    /// Number of live subscriptions of `listener` on `node`.
    pub fn listener_count(&self, node: NodeId, listener: impl Into<Listener>) -> usize {
        let listener = listener.into();
        let arena = self.shared.arena.lock();
        arena
            .node(node)
            .map(|slot| slot.listeners.count(listener))
            .unwrap_or(0)
    }

    /// Register a consumer callback. Subscribe it to nodes with
    /// [`add_listener`](Self::add_listener).
    ///
    /// The callback receives one [`ChangeEvent`] per top-level transaction
    /// that affected any node it is subscribed to. It may read nodes and may
    /// start new transactions.
    pub fn register_external(
        &self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut arena = self.shared.arena.lock();
        let serial = next_serial();
        let slot = arena.externals.insert(ExternalSlot {
            serial,
            callback: Arc::new(callback),
        });
        ListenerId { slot, serial }
    }

    /// Remove a consumer callback and all of its subscriptions.
    pub fn unregister_external(&self, id: ListenerId) -> bool {
        let removed = {
            let mut arena = self.shared.arena.lock();
            if arena.external(id).is_none() {
                return false;
            }
            for (_, slot) in arena.nodes.iter_mut() {
                slot.listeners.purge(Listener::External(id));
            }
            arena.externals.remove(id.slot)
        };
        // The callback may own nodes; drop it outside the arena lock.
        drop(removed);
        true
    }

    /// Node listeners of `node` with their handlers.
    fn node_listeners(&self, node: NodeId) -> Vec<(NodeId, Weak<dyn ChangeHandler>)> {
        let arena = self.shared.arena.lock();
        let Some(slot) = arena.node(node) else {
            return Vec::new();
        };
        slot.listeners
            .iter()
            .filter_map(|listener| match listener {
                Listener::Node(target) => arena
                    .node(target)
                    .and_then(|target_slot| target_slot.handler.clone())
                    .map(|handler| (target, handler)),
                Listener::External(_) => None,
            })
            .collect()
    }

    /// Distinct external callbacks subscribed to any of `nodes`.
    fn external_callbacks(&self, nodes: impl Iterator<Item = NodeId>) -> Vec<ExternalCallback> {
        let arena = self.shared.arena.lock();
        let mut seen = AHashSet::new();
        let mut callbacks = Vec::new();
        for node in nodes {
            let Some(slot) = arena.node(node) else {
                continue;
            };
            for listener in slot.listeners.iter() {
                let Listener::External(id) = listener else {
                    continue;
                };
                if !seen.insert(id) {
                    continue;
                }
                if let Some(external) = arena.external(id) {
                    callbacks.push(external.callback.clone());
                }
            }
        }
        callbacks
    }

    // ========================================================================
    // Regions
    // ========================================================================

    /// Open a transaction: several mutations that consumers observe as one.
    ///
    /// Transactions nest; only the outermost [`Transaction::release`] delivers
    /// the batched notification. Other threads block until it is released.
    pub fn acquire(&self) -> Transaction<'_> {
        let guard = self.shared.region.lock();
        let depth = {
            let mut state = guard.borrow_mut();
            state.depth += 1;
            state.depth
        };
        tracing::trace!(depth, "acquire");
        Transaction {
            system: self,
            guard,
        }
    }

    /// Open a change region for a mutation of `node`.
    ///
    /// The region stays open until the returned scope is concluded or
    /// dropped, so it is closed even when the mutation unwinds.
    pub fn prepare_change(&self, node: NodeId) -> ChangeScope<'_> {
        let guard = self.shared.region.lock();
        {
            let mut state = guard.borrow_mut();
            state.depth += 1;
            *state.changing.entry(node).or_insert(0) += 1;
        }
        tracing::trace!(%node, "prepare change");
        ChangeScope {
            system: self,
            node,
            guard,
        }
    }

    /// Open a read region on `node`. Reads nest to any depth.
    ///
    /// Reading a node inside its own open change region is forbidden; it is
    /// reported and the read proceeds.
    pub fn prepare_read(&self, node: NodeId) -> ReadScope<'_> {
        let guard = self.shared.region.lock();
        let (reads, mid_mutation) = {
            let mut state = guard.borrow_mut();
            state.reads += 1;
            (state.reads, state.changing.contains_key(&node))
        };
        tracing::trace!(%node, reads, "prepare read");
        if mid_mutation {
            tracing::warn!(%node, "read of a node inside its own change region");
            self.tracer().on_invalid_read(node);
        }
        ReadScope { node, guard }
    }

    /// Returns true if `node` has an open change region.
    pub fn is_changing(&self, node: NodeId) -> bool {
        let guard = self.shared.region.lock();
        let changing = guard.borrow().changing.contains_key(&node);
        changing
    }

    /// Returns true if a transaction or change region is open on this thread.
    ///
    /// Blocks while another thread holds a region.
    pub fn in_transaction(&self) -> bool {
        let guard = self.shared.region.lock();
        let depth = guard.borrow().depth;
        depth > 0
    }

    fn record(&self, state: &RefCell<RegionState>, node: NodeId, change: Change) {
        self.tracer().on_change_recorded(node, &change);
        let mut state = state.borrow_mut();
        if change.is_initial && !state.initial_nodes.contains(&node) {
            state.initial_nodes.push(node);
        }
        let change = match state.changes.shift_remove(&node) {
            Some(earlier) => earlier.merge(change),
            None => change,
        };
        state.changes.insert(node, change);
        if state.walks < 2 {
            return;
        }
        // Dependents recorded by an earlier walk move behind their source.
        for dependent in self.recorded_dependents(&state.changes, node) {
            if let Some(change) = state.changes.shift_remove(&dependent) {
                state.changes.insert(dependent, change);
            }
        }
    }

    /// Transitive node listeners of `node` that already have a recorded
    /// change, breadth first.
    fn recorded_dependents(
        &self,
        changes: &indexmap::IndexMap<NodeId, Change, ahash::RandomState>,
        node: NodeId,
    ) -> Vec<NodeId> {
        let arena = self.shared.arena.lock();
        let mut visited = AHashSet::new();
        visited.insert(node);
        let mut queue = VecDeque::from([node]);
        let mut dependents = Vec::new();
        while let Some(source) = queue.pop_front() {
            let Some(slot) = arena.node(source) else {
                continue;
            };
            for listener in slot.listeners.iter() {
                let Listener::Node(target) = listener else {
                    continue;
                };
                if visited.insert(target) {
                    queue.push_back(target);
                    if changes.contains_key(&target) {
                        dependents.push(target);
                    }
                }
            }
        }
        dependents
    }

    /// Breadth-first walk from `origin`. Every node is handled at most once per
    /// walk, which also terminates cyclic listener graphs.
    fn propagate(&self, state: &RefCell<RegionState>, origin: NodeId, change: Change) {
        state.borrow_mut().walks += 1;
        self.record(state, origin, change.clone());
        let mut visited = AHashSet::new();
        visited.insert(origin);
        let mut queue = VecDeque::from([(origin, change)]);

        while let Some((source, change)) = queue.pop_front() {
            for (target, handler) in self.node_listeners(source) {
                if !visited.insert(target) {
                    continue;
                }
                if state.borrow().changing.contains_key(&target) {
                    tracing::trace!(%source, %target, "skip handler of a node mid-mutation");
                    continue;
                }
                let Some(handler) = handler.upgrade() else {
                    continue;
                };
                self.tracer().on_handler_invoked(source, target);
                let derived = handler.on_internal_change(source, &change);
                drop(handler);
                if let Some(derived) = derived {
                    tracing::trace!(%source, %target, kind = ?derived.delta.kind(), "derived change");
                    self.record(state, target, derived.clone());
                    queue.push_back((target, derived));
                }
            }
        }
    }

    /// Close one level of region. The outermost level delivers the batched event.
    fn leave(&self, state: &RefCell<RegionState>, node: Option<NodeId>) {
        let outermost = {
            let mut state = state.borrow_mut();
            if let Some(node) = node {
                if let Some(count) = state.changing.get_mut(&node) {
                    *count -= 1;
                    if *count == 0 {
                        state.changing.remove(&node);
                    }
                }
            }
            state.depth -= 1;
            state.depth == 0
        };
        if outermost {
            self.flush(state);
        }
    }

    fn flush(&self, state: &RefCell<RegionState>) {
        let event = {
            let mut state = state.borrow_mut();
            state.walks = 0;
            ChangeEvent {
                initial_nodes: std::mem::take(&mut state.initial_nodes),
                changes: std::mem::take(&mut state.changes),
            }
        };
        if event.is_empty() {
            return;
        }
        if std::thread::panicking() {
            tracing::warn!(affected = event.len(), "discard notification while unwinding");
            return;
        }
        let callbacks = self.external_callbacks(event.changes.keys().copied());
        tracing::debug!(
            initial = event.initial_nodes.len(),
            affected = event.len(),
            deliveries = callbacks.len(),
            "flush transaction"
        );
        for callback in &callbacks {
            callback(&event);
        }
        self.tracer().on_transaction_flushed(&event, callbacks.len());
    }
}

/// An open transaction. See [`ChangeSystem::acquire`].
#[must_use = "the transaction is released when dropped"]
pub struct Transaction<'a> {
    system: &'a ChangeSystem,
    guard: ReentrantMutexGuard<'a, RefCell<RegionState>>,
}

impl Transaction<'_> {
    /// End this level of the transaction.
    pub fn release(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        tracing::trace!("release");
        self.system.leave(&self.guard, None);
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

/// An open change region for one node. See [`ChangeSystem::prepare_change`].
#[must_use = "the change region is concluded when dropped"]
pub struct ChangeScope<'a> {
    system: &'a ChangeSystem,
    node: NodeId,
    guard: ReentrantMutexGuard<'a, RefCell<RegionState>>,
}

impl ChangeScope<'_> {
    /// The node being mutated.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Deliver `change` of this node to its listeners, transitively.
    pub fn propagate(&self, change: Change) {
        self.system.propagate(&self.guard, self.node, change);
    }

    /// End the change region.
    pub fn conclude(self) {}
}

impl Drop for ChangeScope<'_> {
    fn drop(&mut self) {
        tracing::trace!(node = %self.node, "conclude change");
        self.system.leave(&self.guard, Some(self.node));
    }
}

impl fmt::Debug for ChangeScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeScope")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// An open read region. See [`ChangeSystem::prepare_read`].
#[must_use = "the read region is concluded when dropped"]
pub struct ReadScope<'a> {
    node: NodeId,
    guard: ReentrantMutexGuard<'a, RefCell<RegionState>>,
}

impl ReadScope<'_> {
    /// The node being read.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// End the read region.
    pub fn conclude(self) {}
}

impl Drop for ReadScope<'_> {
    fn drop(&mut self) {
        self.guard.borrow_mut().reads -= 1;
    }
}

impl fmt::Debug for ReadScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadScope")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ChangeSystem`].
pub struct ChangeSystemBuilder {
    tracer: Arc<dyn Tracer>,
    track_map_keys: bool,
}

impl Default for ChangeSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeSystemBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSystemBuilder")
            .field("track_map_keys", &self.track_map_keys)
            .finish_non_exhaustive()
    }
}

impl ChangeSystemBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            tracer: Arc::new(NoopTracer),
            track_map_keys: false,
        }
    }

    /// Install an observer of propagation, flushes and recomputations.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Whether new maps also track their keys. Values are always tracked.
    ///
    /// The default is `false`. Individual maps can override it with
    /// [`ObservableMap::with_key_tracking`](crate::ObservableMap::with_key_tracking).
    pub fn track_map_keys(mut self, track: bool) -> Self {
        self.track_map_keys = track;
        self
    }

    /// Build the system with the configured settings.
    pub fn build(self) -> ChangeSystem {
        ChangeSystem {
            shared: Arc::new(Shared {
                arena: Mutex::new(Arena::default()),
                region: ReentrantMutex::new(RefCell::new(RegionState::default())),
                tracer: self.tracer,
                track_map_keys: self.track_map_keys,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Delta, DeltaKind, ValueDelta};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that forwards every change as a derived alteration.
    struct Forward {
        calls: AtomicUsize,
    }

    impl ChangeHandler for Forward {
        fn on_internal_change(&self, _source: NodeId, _change: &Change) -> Option<Change> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Some(Change::derived(Delta::Value(ValueDelta::alteration())))
        }
    }

    fn forward_node(system: &ChangeSystem, label: &'static str) -> (NodeId, Arc<Forward>) {
        let handler = Arc::new(Forward {
            calls: AtomicUsize::new(0),
        });
        let weak: Weak<dyn ChangeHandler> = Arc::downgrade(&handler) as Weak<dyn ChangeHandler>;
        (system.register_node(label, Some(weak)), handler)
    }

    fn mutate(system: &ChangeSystem, node: NodeId) {
        let scope = system.prepare_change(node);
        scope.propagate(Change::initial(Delta::Value(ValueDelta::alteration())));
        scope.conclude();
    }

    fn collect_events(system: &ChangeSystem, node: NodeId) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = system.register_external(move |event| sink.lock().push(event.clone()));
        system.add_listener(node, listener);
        events
    }

    #[test]
    fn test_register_and_remove_node() {
        let system = ChangeSystem::new();
        let a = system.register_node("a", None);
        assert!(system.contains_node(a));
        assert_eq!(system.node_count(), 1);

        assert!(system.remove_node(a));
        assert!(!system.remove_node(a));
        assert!(!system.contains_node(a));

        // The recycled slot does not resolve the old handle.
        let b = system.register_node("b", None);
        assert_eq!(a.slot, b.slot);
        assert_ne!(a, b);
        assert!(!system.contains_node(a));
    }

    #[test]
    fn test_listener_multiplicity() {
        let system = ChangeSystem::new();
        let source = system.register_node("source", None);
        let listener = system.register_external(|_| {});

        system.add_listener(source, listener);
        system.add_listener(source, listener);
        assert_eq!(system.listeners(source), vec![Listener::External(listener)]);
        assert_eq!(system.listener_count(source, listener), 2);

        assert!(system.remove_listener(source, listener));
        assert!(system.remove_listener(source, listener));
        assert!(!system.remove_listener(source, listener));
    }

    #[test]
    fn test_single_delivery_per_mutation() {
        let system = ChangeSystem::new();
        let node = system.register_node("node", None);
        let events = collect_events(&system, node);

        mutate(&system, node);

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].initial_nodes(), &[node]);
        assert!(events[0].change(node).unwrap().is_initial);
    }

    #[test]
    fn test_transaction_batches_notifications() {
        let system = ChangeSystem::new();
        let a = system.register_node("a", None);
        let b = system.register_node("b", None);
        let events = collect_events(&system, a);
        let listener_b = system.register_external(|_| {});
        system.add_listener(b, listener_b);

        let outer = system.acquire();
        {
            let inner = system.acquire();
            mutate(&system, a);
            mutate(&system, b);
            mutate(&system, a);
            inner.release();
        }
        assert!(system.in_transaction());
        assert!(events.lock().is_empty());
        outer.release();
        assert!(!system.in_transaction());

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].initial_nodes(), &[a, b]);
        assert_eq!(events[0].len(), 2);
    }

    #[test]
    fn test_propagation_reaches_dependents_in_order() {
        let system = ChangeSystem::new();
        let root = system.register_node("root", None);
        let (middle, middle_handler) = forward_node(&system, "middle");
        let (leaf, leaf_handler) = forward_node(&system, "leaf");
        system.add_listener(root, middle);
        system.add_listener(middle, leaf);
        let events = collect_events(&system, root);

        mutate(&system, root);

        assert_eq!(middle_handler.calls.load(Ordering::Relaxed), 1);
        assert_eq!(leaf_handler.calls.load(Ordering::Relaxed), 1);
        let events = events.lock();
        let order: Vec<_> = events[0].changes().map(|(node, _)| node).collect();
        assert_eq!(order, vec![root, middle, leaf]);
        assert!(!events[0].change(leaf).unwrap().is_initial);
    }

    #[test]
    fn test_later_walk_keeps_sources_before_dependents() {
        let system = ChangeSystem::new();
        let leaf = system.register_node("leaf", None);
        let (middle, _) = forward_node(&system, "middle");
        let (top, _) = forward_node(&system, "top");
        system.add_listener(leaf, middle);
        system.add_listener(middle, top);
        let events = collect_events(&system, top);

        let transaction = system.acquire();
        mutate(&system, middle);
        mutate(&system, leaf);
        transaction.release();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        let order: Vec<_> = events[0].changes().map(|(node, _)| node).collect();
        assert_eq!(order, vec![leaf, middle, top]);
        assert_eq!(events[0].initial_nodes(), &[middle, leaf]);
    }

    #[test]
    fn test_handles_do_not_resolve_across_systems() {
        let a = ChangeSystem::new();
        let b = ChangeSystem::new();
        let in_a = a.register_node("a", None);
        let in_b = b.register_node("b", None);

        assert_eq!(in_a.slot, in_b.slot);
        assert_ne!(in_a, in_b);
        assert!(!b.contains_node(in_a));
        assert!(!b.add_listener(in_a, in_b));
        assert!(b.listeners(in_b).is_empty());
    }

    #[test]
    fn test_diamond_handles_each_node_once() {
        let system = ChangeSystem::new();
        let a = system.register_node("a", None);
        let (b, _) = forward_node(&system, "b");
        let (c, _) = forward_node(&system, "c");
        let (d, d_handler) = forward_node(&system, "d");
        system.add_listener(a, b);
        system.add_listener(a, c);
        system.add_listener(b, d);
        system.add_listener(c, d);

        mutate(&system, a);
        assert_eq!(d_handler.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cycle_terminates() {
        let system = ChangeSystem::new();
        let (a, a_handler) = forward_node(&system, "a");
        let (b, b_handler) = forward_node(&system, "b");
        system.add_listener(a, b);
        system.add_listener(b, a);

        mutate(&system, a);
        assert_eq!(a_handler.calls.load(Ordering::Relaxed), 0);
        assert_eq!(b_handler.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_mid_mutation_node_is_not_handled() {
        let system = ChangeSystem::new();
        let source = system.register_node("source", None);
        let (container, handler) = forward_node(&system, "container");
        system.add_listener(source, container);

        let outer = system.prepare_change(container);
        assert!(system.is_changing(container));
        mutate(&system, source);
        outer.conclude();

        assert_eq!(handler.calls.load(Ordering::Relaxed), 0);
        assert!(!system.is_changing(container));
    }

    #[test]
    fn test_dropped_handler_is_skipped() {
        let system = ChangeSystem::new();
        let source = system.register_node("source", None);
        let (target, handler) = forward_node(&system, "target");
        system.add_listener(source, target);
        drop(handler);

        let events = collect_events(&system, source);
        mutate(&system, source);
        assert_eq!(events.lock()[0].len(), 1);
    }

    #[test]
    fn test_repeated_changes_merge() {
        let system = ChangeSystem::new();
        let node = system.register_node("node", None);
        let events = collect_events(&system, node);

        let txn = system.acquire();
        let scope = system.prepare_change(node);
        scope.propagate(Change::initial(Delta::Value(ValueDelta::alteration())));
        scope.propagate(Change::initial(Delta::Value(ValueDelta::complete())));
        scope.conclude();
        txn.release();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change(node).unwrap().delta.kind(), DeltaKind::Complete);
    }

    #[test]
    fn test_scope_concludes_on_unwind() {
        let system = ChangeSystem::new();
        let node = system.register_node("node", None);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = system.prepare_change(node);
            panic!("mutation failed");
        }));
        assert!(result.is_err());
        assert!(!system.is_changing(node));
        assert!(!system.in_transaction());
    }

    #[test]
    fn test_unregister_external_purges_subscriptions() {
        let system = ChangeSystem::new();
        let node = system.register_node("node", None);
        let listener = system.register_external(|_| {});
        system.add_listener(node, listener);
        system.add_listener(node, listener);

        assert!(system.unregister_external(listener));
        assert!(!system.unregister_external(listener));
        assert!(system.listeners(node).is_empty());
    }

    #[test]
    fn test_listener_may_start_new_transaction() {
        let system = ChangeSystem::new();
        let first = system.register_node("first", None);
        let second = system.register_node("second", None);
        let events = collect_events(&system, second);

        let inner = system.clone();
        let reactor = system.register_external(move |event| {
            if event.affects(first) {
                mutate(&inner, second);
            }
        });
        system.add_listener(first, reactor);

        mutate(&system, first);
        assert_eq!(events.lock().len(), 1);
    }
}
