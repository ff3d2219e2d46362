//! Structured descriptions of a single mutation.
//!
//! A delta tells a consumer *what* changed so it can choose between an
//! incremental refresh and a full one. Sizes are `Option<usize>`: `None` is
//! the "unknown" sentinel and survives summarization.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// The kind of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeltaKind {
    /// Elements were added.
    Insertion,
    /// Elements were removed.
    Deletion,
    /// Elements were replaced or changed in place; the size did not change.
    Alteration,
    /// Every element was removed.
    Clear,
    /// Anything may have changed, including the size.
    Complete,
}

impl DeltaKind {
    /// Kind of the delta that summarizes `self` followed by `later`.
    fn then(self, later: DeltaKind) -> DeltaKind {
        match (self, later) {
            (_, DeltaKind::Clear) => DeltaKind::Clear,
            (a, b) if a == b => a,
            _ => DeltaKind::Complete,
        }
    }
}

fn size_difference(old_size: Option<usize>, new_size: Option<usize>) -> Option<isize> {
    Some(new_size? as isize - old_size? as isize)
}

/// A type-erased element or key carried by set and map deltas.
///
/// Equality is identity of the carried allocation.
#[derive(Clone)]
pub struct AffectedKey {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl AffectedKey {
    /// Wrap a key.
    pub fn new<K: Any + Send + Sync>(key: K) -> Self {
        Self {
            value: Arc::new(key),
            type_name: std::any::type_name::<K>(),
        }
    }

    /// Downcast to the concrete key type.
    pub fn downcast_ref<K: Any>(&self) -> Option<&K> {
        self.value.downcast_ref::<K>()
    }

    /// The type name of the carried key.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for AffectedKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for AffectedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AffectedKey").field(&self.type_name).finish()
    }
}

/// A mutation of an observable list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDelta {
    /// What happened.
    pub kind: DeltaKind,
    /// Size before the mutation.
    pub old_size: Option<usize>,
    /// Size after the mutation.
    pub new_size: Option<usize>,
    /// Affected indices. Insertions are in post-mutation indices, deletions
    /// in pre-mutation indices. `None` means unknown or everything.
    pub range: Option<Range<usize>>,
}

impl ListDelta {
    /// One element inserted at `index` into a list of `old_size` elements.
    pub fn insertion(index: usize, old_size: usize) -> Self {
        Self {
            kind: DeltaKind::Insertion,
            old_size: Some(old_size),
            new_size: Some(old_size + 1),
            range: Some(index..index + 1),
        }
    }

    /// One element removed at `index` from a list of `old_size` elements.
    pub fn deletion(index: usize, old_size: usize) -> Self {
        Self {
            kind: DeltaKind::Deletion,
            old_size: Some(old_size),
            new_size: Some(old_size.saturating_sub(1)),
            range: Some(index..index + 1),
        }
    }

    /// Elements in `range` replaced or changed in place.
    pub fn alteration(range: Option<Range<usize>>, size: Option<usize>) -> Self {
        Self {
            kind: DeltaKind::Alteration,
            old_size: size,
            new_size: size,
            range,
        }
    }

    /// Every element removed.
    pub fn clear(old_size: usize) -> Self {
        Self {
            kind: DeltaKind::Clear,
            old_size: Some(old_size),
            new_size: Some(0),
            range: None,
        }
    }

    /// Anything may have changed.
    pub fn complete(old_size: Option<usize>, new_size: Option<usize>) -> Self {
        Self {
            kind: DeltaKind::Complete,
            old_size,
            new_size,
            range: None,
        }
    }

    /// `new_size - old_size`, when both are known.
    pub fn change_size(&self) -> Option<isize> {
        size_difference(self.old_size, self.new_size)
    }

    /// Summarize `self` followed by `later`.
    ///
    /// Only alterations keep a range (the covering range of both); shifted
    /// insertions and deletions lose theirs.
    pub fn merge(self, later: ListDelta) -> ListDelta {
        let kind = self.kind.then(later.kind);
        let range = match (kind, self.range, later.range) {
            (DeltaKind::Alteration, Some(a), Some(b)) => Some(a.start.min(b.start)..a.end.max(b.end)),
            _ => None,
        };
        ListDelta {
            kind,
            old_size: self.old_size,
            new_size: later.new_size,
            range,
        }
    }

    /// Summarize a sequence of deltas into one conservative delta.
    pub fn summarize(deltas: impl IntoIterator<Item = ListDelta>) -> Option<ListDelta> {
        let mut deltas = deltas.into_iter();
        let first = deltas.next()?;
        Some(deltas.fold(first, ListDelta::merge))
    }
}

/// A mutation of an observable set.
#[derive(Debug, Clone, PartialEq)]
pub struct SetDelta {
    /// What happened.
    pub kind: DeltaKind,
    /// Size before the mutation.
    pub old_size: Option<usize>,
    /// Size after the mutation.
    pub new_size: Option<usize>,
    /// The inserted or removed element, if a single one is known.
    pub element: Option<AffectedKey>,
}

/// A mutation of an observable map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapDelta {
    /// What happened.
    pub kind: DeltaKind,
    /// Size before the mutation.
    pub old_size: Option<usize>,
    /// Size after the mutation.
    pub new_size: Option<usize>,
    /// The key that was inserted, removed or re-assigned, if a single one is known.
    pub key: Option<AffectedKey>,
}

macro_rules! keyed_delta {
    ($delta:ident, $field:ident) => {
        impl $delta {
            /// One entry inserted into a collection of `old_size` entries.
            pub fn insertion($field: AffectedKey, old_size: usize) -> Self {
                Self {
                    kind: DeltaKind::Insertion,
                    old_size: Some(old_size),
                    new_size: Some(old_size + 1),
                    $field: Some($field),
                }
            }

            /// One entry removed from a collection of `old_size` entries.
            pub fn deletion($field: AffectedKey, old_size: usize) -> Self {
                Self {
                    kind: DeltaKind::Deletion,
                    old_size: Some(old_size),
                    new_size: Some(old_size.saturating_sub(1)),
                    $field: Some($field),
                }
            }

            /// One entry changed; the size is unchanged.
            pub fn alteration($field: AffectedKey, size: usize) -> Self {
                Self {
                    kind: DeltaKind::Alteration,
                    old_size: Some(size),
                    new_size: Some(size),
                    $field: Some($field),
                }
            }

            /// Any entry may have changed deeply; the size is unchanged.
            pub fn entire_alteration(size: Option<usize>) -> Self {
                Self {
                    kind: DeltaKind::Alteration,
                    old_size: size,
                    new_size: size,
                    $field: None,
                }
            }

            /// Every entry removed.
            pub fn clear(old_size: usize) -> Self {
                Self {
                    kind: DeltaKind::Clear,
                    old_size: Some(old_size),
                    new_size: Some(0),
                    $field: None,
                }
            }

            /// Anything may have changed.
            pub fn complete(old_size: Option<usize>, new_size: Option<usize>) -> Self {
                Self {
                    kind: DeltaKind::Complete,
                    old_size,
                    new_size,
                    $field: None,
                }
            }

            /// `new_size - old_size`, when both are known.
            pub fn change_size(&self) -> Option<isize> {
                size_difference(self.old_size, self.new_size)
            }

            /// Summarize `self` followed by `later`. The affected entry
            /// survives only if both deltas name the same one.
            pub fn merge(self, later: $delta) -> $delta {
                let kind = self.kind.then(later.kind);
                let $field = match (self.$field, later.$field) {
                    (Some(a), Some(b)) if a == b && kind != DeltaKind::Complete => Some(a),
                    _ => None,
                };
                $delta {
                    kind,
                    old_size: self.old_size,
                    new_size: later.new_size,
                    $field,
                }
            }

            /// Summarize a sequence of deltas into one conservative delta.
            pub fn summarize(deltas: impl IntoIterator<Item = $delta>) -> Option<$delta> {
                let mut deltas = deltas.into_iter();
                let first = deltas.next()?;
                Some(deltas.fold(first, $delta::merge))
            }
        }
    };
}

keyed_delta!(SetDelta, element);
keyed_delta!(MapDelta, key);

/// A mutation of a scalar node, such as an observable or calculated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueDelta {
    /// Either `Alteration` (a new value was set) or `Complete`.
    pub kind: DeltaKind,
}

impl ValueDelta {
    /// A new value was set.
    pub fn alteration() -> Self {
        Self {
            kind: DeltaKind::Alteration,
        }
    }

    /// The value may be entirely different.
    pub fn complete() -> Self {
        Self {
            kind: DeltaKind::Complete,
        }
    }

    /// Summarize `self` followed by `later`.
    pub fn merge(self, later: ValueDelta) -> ValueDelta {
        ValueDelta {
            kind: self.kind.then(later.kind),
        }
    }
}

/// A delta of any node kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// A list mutation.
    List(ListDelta),
    /// A set mutation.
    Set(SetDelta),
    /// A map mutation.
    Map(MapDelta),
    /// A scalar mutation.
    Value(ValueDelta),
}

impl Delta {
    /// The kind of the mutation.
    pub fn kind(&self) -> DeltaKind {
        match self {
            Delta::List(d) => d.kind,
            Delta::Set(d) => d.kind,
            Delta::Map(d) => d.kind,
            Delta::Value(d) => d.kind,
        }
    }

    /// Size before the mutation, if known.
    pub fn old_size(&self) -> Option<usize> {
        match self {
            Delta::List(d) => d.old_size,
            Delta::Set(d) => d.old_size,
            Delta::Map(d) => d.old_size,
            Delta::Value(_) => None,
        }
    }

    /// Size after the mutation, if known.
    pub fn new_size(&self) -> Option<usize> {
        match self {
            Delta::List(d) => d.new_size,
            Delta::Set(d) => d.new_size,
            Delta::Map(d) => d.new_size,
            Delta::Value(_) => None,
        }
    }

    /// `new_size - old_size`, when both are known.
    pub fn change_size(&self) -> Option<isize> {
        size_difference(self.old_size(), self.new_size())
    }

    /// Returns true if the consumer should assume everything changed.
    pub fn is_complete(&self) -> bool {
        self.kind() == DeltaKind::Complete
    }

    /// The list delta, if this is one.
    pub fn as_list(&self) -> Option<&ListDelta> {
        match self {
            Delta::List(d) => Some(d),
            _ => None,
        }
    }

    /// The set delta, if this is one.
    pub fn as_set(&self) -> Option<&SetDelta> {
        match self {
            Delta::Set(d) => Some(d),
            _ => None,
        }
    }

    /// The map delta, if this is one.
    pub fn as_map(&self) -> Option<&MapDelta> {
        match self {
            Delta::Map(d) => Some(d),
            _ => None,
        }
    }

    /// The value delta, if this is one.
    pub fn as_value(&self) -> Option<&ValueDelta> {
        match self {
            Delta::Value(d) => Some(d),
            _ => None,
        }
    }

    /// Summarize `self` followed by `later`.
    ///
    /// Deltas of different node kinds can only be summarized as a complete
    /// value delta.
    pub fn merge(self, later: Delta) -> Delta {
        match (self, later) {
            (Delta::List(a), Delta::List(b)) => Delta::List(a.merge(b)),
            (Delta::Set(a), Delta::Set(b)) => Delta::Set(a.merge(b)),
            (Delta::Map(a), Delta::Map(b)) => Delta::Map(a.merge(b)),
            (Delta::Value(a), Delta::Value(b)) => Delta::Value(a.merge(b)),
            _ => Delta::Value(ValueDelta::complete()),
        }
    }

    /// Summarize a sequence of deltas into one conservative delta.
    pub fn summarize(deltas: impl IntoIterator<Item = Delta>) -> Option<Delta> {
        let mut deltas = deltas.into_iter();
        let first = deltas.next()?;
        Some(deltas.fold(first, Delta::merge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_insertion_sizes() {
        let delta = ListDelta::insertion(3, 3);
        assert_eq!(delta.kind, DeltaKind::Insertion);
        assert_eq!(delta.old_size, Some(3));
        assert_eq!(delta.new_size, Some(4));
        assert_eq!(delta.range, Some(3..4));
        assert_eq!(delta.change_size(), Some(1));
    }

    #[test]
    fn test_unknown_size_propagates() {
        let delta = ListDelta::complete(None, Some(4));
        assert_eq!(delta.change_size(), None);

        let summary = ListDelta::summarize([
            ListDelta::complete(None, Some(2)),
            ListDelta::insertion(2, 2),
        ])
        .unwrap();
        assert_eq!(summary.old_size, None);
        assert_eq!(summary.new_size, Some(3));
        assert_eq!(summary.change_size(), None);
    }

    #[test]
    fn test_summarize_empty() {
        assert!(ListDelta::summarize([]).is_none());
        assert!(Delta::summarize([]).is_none());
    }

    #[test]
    fn test_summarize_same_kind() {
        let summary = ListDelta::summarize([
            ListDelta::insertion(3, 3),
            ListDelta::insertion(0, 4),
        ])
        .unwrap();
        assert_eq!(summary.kind, DeltaKind::Insertion);
        assert_eq!(summary.old_size, Some(3));
        assert_eq!(summary.new_size, Some(5));
        assert_eq!(summary.range, None);
        assert_eq!(summary.change_size(), Some(2));
    }

    #[test]
    fn test_summarize_alterations_cover_ranges() {
        let summary = ListDelta::summarize([
            ListDelta::alteration(Some(4..5), Some(10)),
            ListDelta::alteration(Some(1..2), Some(10)),
        ])
        .unwrap();
        assert_eq!(summary.kind, DeltaKind::Alteration);
        assert_eq!(summary.range, Some(1..5));
    }

    #[test]
    fn test_summarize_mixed_is_complete() {
        let summary = ListDelta::summarize([
            ListDelta::insertion(0, 1),
            ListDelta::deletion(1, 2),
        ])
        .unwrap();
        assert_eq!(summary.kind, DeltaKind::Complete);
        assert_eq!(summary.old_size, Some(1));
        assert_eq!(summary.new_size, Some(1));
        assert_eq!(summary.change_size(), Some(0));
    }

    #[test]
    fn test_summarize_ending_in_clear() {
        let summary = ListDelta::summarize([
            ListDelta::insertion(0, 2),
            ListDelta::clear(3),
        ])
        .unwrap();
        assert_eq!(summary.kind, DeltaKind::Clear);
        assert_eq!(summary.old_size, Some(2));
        assert_eq!(summary.new_size, Some(0));
    }

    #[test]
    fn test_keyed_merge_keeps_identical_key() {
        let key = AffectedKey::new("k".to_string());
        let merged = MapDelta::alteration(key.clone(), 2).merge(MapDelta::alteration(key.clone(), 2));
        assert_eq!(merged.key, Some(key));

        let other = AffectedKey::new("k".to_string());
        let merged = SetDelta::insertion(AffectedKey::new(1u8), 0).merge(SetDelta::insertion(other, 1));
        assert_eq!(merged.kind, DeltaKind::Insertion);
        assert_eq!(merged.element, None);
        assert_eq!(merged.change_size(), Some(2));
    }

    #[test]
    fn test_affected_key_downcast() {
        let key = AffectedKey::new(42i32);
        assert_eq!(key.downcast_ref::<i32>(), Some(&42));
        assert_eq!(key.downcast_ref::<u32>(), None);
        assert_eq!(key.type_name(), "i32");
    }

    #[test]
    fn test_mixed_variants_merge_to_complete_value() {
        let merged = Delta::List(ListDelta::insertion(0, 0)).merge(Delta::Value(ValueDelta::alteration()));
        assert_eq!(merged, Delta::Value(ValueDelta::complete()));
        assert_eq!(merged.old_size(), None);
    }
}
