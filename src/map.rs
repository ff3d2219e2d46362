//! Observable map.

use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::collection::{node_handle, Contents, Core, Outcome, Tracker};
use crate::{
    AffectedKey, Change, ChangeHandler, ChangeSystem, CollectionError, Delta, Element, MapDelta,
    NodeId,
};

/// Backing store of an [`ObservableMap`]. Iteration follows insertion order.
pub type MapStore<K, V> = IndexMap<K, V, ahash::RandomState>;

pub(crate) struct Entries<K, V> {
    map: MapStore<K, V>,
    track_keys: bool,
}

impl<K: Element, V: Element> Contents for Entries<K, V> {
    fn len(&self) -> usize {
        self.map.len()
    }

    fn retrack(&self, tracker: &mut Tracker<'_>) {
        tracker.retrack_all(self.map.values());
        if self.track_keys {
            tracker.retrack_all(self.map.keys());
        }
    }
}

/// A map that notifies its listeners of every mutation.
///
/// Values that are nodes are always tracked; keys only when key tracking is
/// on (see [`ChangeSystemBuilder::track_map_keys`](crate::ChangeSystemBuilder::track_map_keys)).
/// Cloning the handle shares the map.
pub struct ObservableMap<K, V> {
    inner: Arc<Core<Entries<K, V>>>,
}

node_handle!("ObservableMap", ObservableMap<K, V>);

impl<K, V> ObservableMap<K, V>
where
    K: Element + Hash + Eq + Clone + Send + Sync + 'static,
    V: Element + Send + 'static,
{
    /// Create an empty map with the system's default key tracking.
    pub fn new(system: &ChangeSystem) -> Self {
        Self::with_key_tracking(system, system.track_map_keys())
    }

    /// Create an empty map, choosing whether keys are tracked.
    pub fn with_key_tracking(system: &ChangeSystem, track_keys: bool) -> Self {
        Self::from_entries(system, track_keys, std::iter::empty())
    }

    /// Create a map holding `entries`. Later duplicates overwrite earlier ones.
    pub fn from_entries(
        system: &ChangeSystem,
        track_keys: bool,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let items = Entries {
            map: entries.into_iter().collect(),
            track_keys,
        };
        Self {
            inner: Core::new_cyclic(system, "map", items),
        }
    }

    /// Returns true if this map tracks its keys.
    pub fn tracks_keys(&self) -> bool {
        self.inner.read(|entries| entries.track_keys)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read(|entries| entries.map.len())
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.read(|entries| entries.map.is_empty())
    }

    /// The value at `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.read(|entries| entries.map.get(key).cloned())
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.read(|entries| entries.map.contains_key(key))
    }

    /// A snapshot of the keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.read(|entries| entries.map.keys().cloned().collect())
    }

    /// A snapshot of the entries in insertion order.
    pub fn to_vec(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.inner.read(|entries| {
            entries
                .map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    /// Run `f` over an unmodifiable view of the contents.
    pub fn read<R>(&self, f: impl FnOnce(&MapStore<K, V>) -> R) -> R {
        self.inner.read(|entries| f(&entries.map))
    }

    /// Number of live occurrences of `node` among tracked keys and values.
    pub fn live_count(&self, node: NodeId) -> usize {
        self.inner.live_count(node)
    }

    /// The key and value nodes this map listens to.
    pub fn tracked_nodes(&self) -> Vec<NodeId> {
        self.inner.tracked_nodes()
    }

    /// Insert `value` at `key`, returning the previous value.
    ///
    /// Re-assigning an existing key keeps the stored key instance and fires an
    /// alteration; a new key fires an insertion.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, CollectionError> {
        self.inner.precise(|entries, tracker| {
            let Entries { map, track_keys } = entries;
            let len = map.len();
            if let Some((_, stored_key, slot)) = map.get_full_mut(&key) {
                tracker.start(&value);
                let previous = std::mem::replace(slot, value);
                let fault = tracker.stop(&previous);
                let delta = MapDelta::alteration(AffectedKey::new(stored_key.clone()), len);
                return Ok(Outcome::changed(Some(previous), Delta::Map(delta)).with_fault(fault));
            }
            if *track_keys {
                tracker.start(&key);
            }
            tracker.start(&value);
            let delta = MapDelta::insertion(AffectedKey::new(key.clone()), len);
            map.insert(key, value);
            Ok(Outcome::changed(None, Delta::Map(delta)))
        })
    }

    /// Remove the entry at `key`, returning the stored key and value. Fires
    /// nothing if the key was absent.
    pub fn remove(&self, key: &K) -> Result<Option<(K, V)>, CollectionError> {
        self.inner.precise(|entries, tracker| {
            let Entries { map, track_keys } = entries;
            let len = map.len();
            let Some((stored_key, value)) = map.shift_remove_entry(key) else {
                return Ok(Outcome::unchanged(None));
            };
            let mut fault = tracker.stop(&value);
            if *track_keys {
                fault = fault.and(tracker.stop(&stored_key));
            }
            let delta = MapDelta::deletion(AffectedKey::new(stored_key.clone()), len);
            Ok(Outcome::changed(Some((stored_key, value)), Delta::Map(delta)).with_fault(fault))
        })
    }

    fn bulk<R>(
        &self,
        action: impl FnOnce(&mut MapStore<K, V>) -> anyhow::Result<R>,
    ) -> Result<R, CollectionError> {
        self.inner.bulk(
            |old_len, new_len| Delta::Map(MapDelta::complete(Some(old_len), Some(new_len))),
            |entries| action(&mut entries.map),
        )
    }

    /// Insert every entry of `entries`.
    pub fn extend(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<(), CollectionError> {
        self.bulk(|map| {
            map.extend(entries);
            Ok(())
        })
    }

    /// Insert entries until the first error. Entries inserted before it stay.
    pub fn try_extend(
        &self,
        entries: impl IntoIterator<Item = anyhow::Result<(K, V)>>,
    ) -> Result<(), CollectionError> {
        self.bulk(|map| {
            for entry in entries {
                let (key, value) = entry?;
                map.insert(key, value);
            }
            Ok(())
        })
    }

    /// Keep only the entries for which `keep` returns true. Returns the number
    /// of removed entries.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> Result<usize, CollectionError> {
        self.bulk(|map| {
            let before = map.len();
            map.retain(|key, value| keep(key, value));
            Ok(before - map.len())
        })
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<(), CollectionError> {
        self.inner.bulk(
            |old_len, _| Delta::Map(MapDelta::clear(old_len)),
            |entries| {
                entries.map.clear();
                Ok(())
            },
        )
    }

    /// Replace the contents with `entries`, returning the previous contents.
    pub fn replace(
        &self,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Result<MapStore<K, V>, CollectionError> {
        self.bulk(|map| {
            let previous = std::mem::take(map);
            map.extend(entries);
            Ok(previous)
        })
    }

    /// Run an arbitrary mutation over the backing map.
    pub fn modify<R>(
        &self,
        action: impl FnOnce(&mut MapStore<K, V>) -> anyhow::Result<R>,
    ) -> Result<R, CollectionError> {
        self.bulk(action)
    }
}

impl<K, V> ChangeHandler for Core<Entries<K, V>>
where
    K: Element + Send + 'static,
    V: Element + Send + 'static,
{
    fn on_internal_change(&self, source: NodeId, _change: &Change) -> Option<Change> {
        let len = self.state.try_lock().map(|state| state.items.map.len());
        tracing::trace!(node = %self.node, %source, ?len, "map entry changed");
        Some(Change::derived(Delta::Map(MapDelta::entire_alteration(len))))
    }
}
