//! Reference-counted tracking of the changeable elements a container holds.

use ahash::AHashMap;

use crate::{ChangeSystem, CollectionError, Element, NodeId};

/// Identity-keyed reference counts of the element nodes a container holds.
///
/// The container is subscribed to an element node exactly while its count is
/// positive: an element held three times needs three
/// [`stop_tracking`](Self::stop_tracking) calls before the subscription is
/// withdrawn.
#[derive(Debug, Default)]
pub struct ContentsTracking {
    counts: AHashMap<NodeId, usize>,
}

impl ContentsTracking {
    /// Create an empty tracking table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more occurrence of `element` in `owner`.
    ///
    /// On the first occurrence `owner` subscribes to the element. Elements
    /// whose node is not alive in `system` are never tracked.
    pub fn start_tracking<E: Element + ?Sized>(
        &mut self,
        system: &ChangeSystem,
        owner: NodeId,
        element: &E,
    ) {
        let Some(node) = element.node_id() else {
            return;
        };
        if let Some(count) = self.counts.get_mut(&node) {
            *count += 1;
            return;
        }
        if !system.add_listener(node, owner) {
            tracing::warn!(%owner, %node, "element node does not belong to the container's system");
            return;
        }
        self.counts.insert(node, 1);
    }

    /// Count one occurrence of `element` fewer.
    ///
    /// On the last occurrence `owner` unsubscribes from the element.
    pub fn stop_tracking<E: Element + ?Sized>(
        &mut self,
        system: &ChangeSystem,
        owner: NodeId,
        element: &E,
    ) -> Result<(), CollectionError> {
        let Some(node) = element.node_id() else {
            return Ok(());
        };
        let Some(count) = self.counts.get_mut(&node) else {
            if !system.contains_node(node) {
                return Ok(());
            }
            tracing::warn!(%owner, %node, "stop tracking an untracked element");
            return Err(CollectionError::TrackingUnderflow { node });
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&node);
            system.remove_listener(node, owner);
        }
        Ok(())
    }

    /// Withdraw every subscription and forget all counts.
    pub fn clear_all(&mut self, system: &ChangeSystem, owner: NodeId) {
        if !self.counts.is_empty() {
            tracing::debug!(%owner, tracked = self.counts.len(), "clear all tracking");
        }
        for (node, _) in self.counts.drain() {
            system.remove_listener(node, owner);
        }
    }

    /// Track every element of `elements`, as after [`clear_all`](Self::clear_all).
    pub fn retrack_all<'a, E, I>(&mut self, system: &ChangeSystem, owner: NodeId, elements: I)
    where
        E: Element + ?Sized + 'a,
        I: IntoIterator<Item = &'a E>,
    {
        for element in elements {
            self.start_tracking(system, owner, element);
        }
    }

    /// Number of live occurrences of `node`.
    pub fn live_count(&self, node: NodeId) -> usize {
        self.counts.get(&node).copied().unwrap_or(0)
    }

    /// Iterate over tracked nodes, in no particular order.
    pub fn tracked(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.counts.keys().copied()
    }

    /// Number of distinct tracked nodes.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
