//! The change envelope of one node and the event of one transaction.

use indexmap::IndexMap;

use crate::{Delta, NodeId};

/// A change of one node, as delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// True if the change originates at this node (a direct mutation), false
    /// if it is a consequence of a change to something the node observes.
    pub is_initial: bool,
    /// False if object identities previously obtained from the node may no
    /// longer be valid, which invalidates caches keyed by identity.
    pub same_instances: bool,
    /// What changed.
    pub delta: Delta,
}

impl Change {
    /// A direct mutation of the node.
    pub fn initial(delta: Delta) -> Self {
        Self {
            is_initial: true,
            same_instances: true,
            delta,
        }
    }

    /// A change derived from a change of something the node observes.
    pub fn derived(delta: Delta) -> Self {
        Self {
            is_initial: false,
            same_instances: true,
            delta,
        }
    }

    /// Mark that held instances may no longer be valid.
    #[must_use]
    pub fn with_new_instances(mut self) -> Self {
        self.same_instances = false;
        self
    }

    /// Combine `self` with a later change of the same node in the same
    /// transaction.
    #[must_use]
    pub fn merge(self, later: Change) -> Change {
        Change {
            is_initial: self.is_initial || later.is_initial,
            same_instances: self.same_instances && later.same_instances,
            delta: self.delta.merge(later.delta),
        }
    }
}

/// Everything that changed in one top-level transaction.
///
/// External listeners receive one event per transaction, however many nodes
/// changed and however many paths reached them.
#[derive(Debug, Clone, Default)]
pub struct ChangeEvent {
    pub(crate) initial_nodes: Vec<NodeId>,
    pub(crate) changes: IndexMap<NodeId, Change, ahash::RandomState>,
}

impl ChangeEvent {
    /// Nodes that were mutated directly, in mutation order.
    pub fn initial_nodes(&self) -> &[NodeId] {
        &self.initial_nodes
    }

    /// The change recorded for `node`, if it was affected.
    pub fn change(&self, node: NodeId) -> Option<&Change> {
        self.changes.get(&node)
    }

    /// Returns true if `node` was affected directly or transitively.
    pub fn affects(&self, node: NodeId) -> bool {
        self.changes.contains_key(&node)
    }

    /// Iterate over affected nodes and their changes, parents before
    /// dependents across the whole transaction. Members of a listener cycle
    /// come in no particular order.
    pub fn changes(&self) -> impl Iterator<Item = (NodeId, &Change)> + '_ {
        self.changes.iter().map(|(node, change)| (*node, change))
    }

    /// Number of affected nodes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
