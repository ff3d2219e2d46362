//! Node and listener handles, and the traits of changeable elements.

use std::fmt;
use std::sync::Arc;

use crate::ChangeSystem;

/// Handle to a changeable node that lives in a [`ChangeSystem`].
///
/// A handle is an arena slot plus a serial number. Slots are recycled when a
/// node is dropped, serials never are, so a handle to a dropped node never
/// resolves to a node created later in the same slot, nor to a node of
/// another system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId {
    pub(crate) slot: usize,
    pub(crate) serial: u64,
}

impl NodeId {
    /// The serial number of this node, unique across all systems.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.serial)
    }
}

/// Handle to an external listener registered with [`ChangeSystem::register_external`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ListenerId {
    pub(crate) slot: usize,
    pub(crate) serial: u64,
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.serial)
    }
}

/// Something that can be registered in a node's listener registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    /// Another node. Its change handler runs while a change propagates, and
    /// the change it derives is propagated further.
    Node(NodeId),
    /// A consumer callback. It receives one [`ChangeEvent`](crate::ChangeEvent)
    /// per top-level transaction.
    External(ListenerId),
}

impl From<NodeId> for Listener {
    fn from(node: NodeId) -> Self {
        Listener::Node(node)
    }
}

impl From<ListenerId> for Listener {
    fn from(id: ListenerId) -> Self {
        Listener::External(id)
    }
}

/// A value that can be stored in an observable collection.
///
/// Containers track elements by node identity. Elements that are not nodes
/// return `None` and are never listened to.
pub trait Element {
    /// The node behind this element, if it is changeable.
    fn node_id(&self) -> Option<NodeId>;
}

macro_rules! plain_elements {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Element for $ty {
                #[inline]
                fn node_id(&self) -> Option<NodeId> {
                    None
                }
            }
        )*
    };
}

plain_elements!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

impl<T: Element> Element for Option<T> {
    fn node_id(&self) -> Option<NodeId> {
        self.as_ref().and_then(Element::node_id)
    }
}

impl<T: Element + ?Sized> Element for Box<T> {
    fn node_id(&self) -> Option<NodeId> {
        (**self).node_id()
    }
}

impl<T: Element + ?Sized> Element for Arc<T> {
    fn node_id(&self) -> Option<NodeId> {
        (**self).node_id()
    }
}

/// A node of the change graph: it owns a listener registry in its system and
/// notifies its listeners when it changes.
pub trait Changeable {
    /// The node handle.
    fn node(&self) -> NodeId;

    /// The system this node belongs to.
    fn system(&self) -> &ChangeSystem;

    /// Subscribe `listener` to this node. Subscriptions are counted.
    fn add_listener(&self, listener: impl Into<Listener>) -> bool
    where
        Self: Sized,
    {
        self.system().add_listener(self.node(), listener)
    }

    /// Withdraw one subscription of `listener`. Returns false if it had none.
    fn remove_listener(&self, listener: impl Into<Listener>) -> bool
    where
        Self: Sized,
    {
        self.system().remove_listener(self.node(), listener)
    }
}
