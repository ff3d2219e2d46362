//! Lazily cached values derived from other nodes.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{
    CalculationError, Change, ChangeHandler, ChangeSystem, Delta, NodeId, ValueDelta,
};

type Calculation<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;

struct CacheState<T> {
    value: Option<Arc<T>>,
    valid: bool,
    /// Source notifications since the last successful computation.
    pending_invalidations: usize,
    computations: usize,
    /// Bumped by every invalidation, so one that lands while computing keeps
    /// the cache invalid.
    generation: u64,
}

pub(crate) struct CalculatedInner<T> {
    pub(crate) system: ChangeSystem,
    pub(crate) node: NodeId,
    sources: Vec<NodeId>,
    calculate: Calculation<T>,
    cache: Mutex<CacheState<T>>,
}

/// A read-only value computed from a fixed set of source nodes.
///
/// Source changes only invalidate the cache and are passed on to this value's
/// listeners; nothing is recomputed until the next read. Repeated reads without
/// an intervening source change return the same `Arc`.
///
/// The calculation must not mutate any node and must not read a node that is
/// being mutated.
///
/// # Example
///
/// ```ignore
/// let numbers = ObservableList::from_vec(&system, vec![1, 2, 3]);
/// let source = numbers.clone();
/// let total = Calculated::new(&system, [numbers.node()], move || {
///     Some(source.read(|items| items.iter().sum::<i32>()))
/// });
/// assert_eq!(*total.get()?, 6);
/// ```
pub struct Calculated<T> {
    inner: Arc<CalculatedInner<T>>,
}

crate::collection::node_handle!("Calculated", Calculated<T>);

impl<T: Send + Sync + 'static> Calculated<T> {
    /// Create a value computed by `calculate` and subscribe it to `sources`.
    ///
    /// Duplicate sources are subscribed once. Returning `None` from
    /// `calculate` is a contract violation reported by [`get`](Self::get).
    pub fn new(
        system: &ChangeSystem,
        sources: impl IntoIterator<Item = NodeId>,
        calculate: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        let mut unique = Vec::new();
        for source in sources {
            if !unique.contains(&source) {
                unique.push(source);
            }
        }

        let inner = Arc::new_cyclic(|weak: &Weak<CalculatedInner<T>>| {
            let handler: Weak<dyn ChangeHandler> = weak.clone();
            let node = system.register_node("calculated", Some(handler));
            for source in &unique {
                if !system.add_listener(*source, node) {
                    tracing::warn!(%node, %source, "calculated over a removed source");
                }
            }
            CalculatedInner {
                system: system.clone(),
                node,
                sources: unique,
                calculate: Box::new(calculate),
                cache: Mutex::new(CacheState {
                    value: None,
                    valid: false,
                    pending_invalidations: 0,
                    computations: 0,
                    generation: 0,
                }),
            }
        });
        Self { inner }
    }

    /// The current value, recomputed first if a source changed since the last
    /// computation.
    pub fn get(&self) -> Result<Arc<T>, CalculationError> {
        let inner = &*self.inner;
        let _scope = inner.system.prepare_read(inner.node);

        let generation = {
            let cache = inner.cache.lock();
            if let (true, Some(value)) = (cache.valid, &cache.value) {
                inner.system.tracer().on_cache_hit(inner.node);
                return Ok(value.clone());
            }
            cache.generation
        };

        tracing::debug!(node = %inner.node, "recompute");
        inner.system.tracer().on_recompute(inner.node);
        // The cache lock is not held here: the calculation may read other
        // calculated values, and a source may invalidate us meanwhile.
        let computed = (inner.calculate)();

        let mut cache = inner.cache.lock();
        cache.computations += 1;
        let Some(value) = computed else {
            tracing::warn!(node = %inner.node, "calculation returned no value");
            return Err(CalculationError::AbsentResult { node: inner.node });
        };
        let value = Arc::new(value);
        cache.value = Some(value.clone());
        if cache.generation == generation {
            cache.valid = true;
            cache.pending_invalidations = 0;
        }
        Ok(value)
    }

    /// Run `f` over the current value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, CalculationError> {
        let _scope = self.inner.system.prepare_read(self.inner.node);
        let value = self.get()?;
        Ok(f(&value))
    }

    /// The nodes this value is computed from.
    pub fn sources(&self) -> &[NodeId] {
        &self.inner.sources
    }

    /// Returns true if the next read is served from the cache.
    pub fn is_valid(&self) -> bool {
        self.inner.cache.lock().valid
    }

    /// Number of times the calculation ran.
    pub fn computations(&self) -> usize {
        self.inner.cache.lock().computations
    }

    /// Source notifications since the last successful computation.
    pub fn pending_invalidations(&self) -> usize {
        self.inner.cache.lock().pending_invalidations
    }
}

impl<U: PartialEq + Send + Sync + 'static> Calculated<Vec<U>> {
    /// Number of elements of the current value.
    pub fn len(&self) -> Result<usize, CalculationError> {
        self.read(Vec::len)
    }

    /// Returns true if the current value holds no elements.
    pub fn is_empty(&self) -> Result<bool, CalculationError> {
        self.read(Vec::is_empty)
    }

    /// Returns true if the current value holds `element`.
    pub fn contains(&self, element: &U) -> Result<bool, CalculationError> {
        self.read(|items| items.contains(element))
    }
}

impl<T: Send + Sync> ChangeHandler for CalculatedInner<T> {
    fn on_internal_change(&self, source: NodeId, _change: &Change) -> Option<Change> {
        let mut cache = self.cache.lock();
        cache.valid = false;
        cache.pending_invalidations += 1;
        cache.generation += 1;
        tracing::trace!(node = %self.node, %source, pending = cache.pending_invalidations, "invalidate");
        Some(Change::derived(Delta::Value(ValueDelta::complete())).with_new_instances())
    }
}

impl<T> Drop for CalculatedInner<T> {
    fn drop(&mut self) {
        for source in &self.sources {
            self.system.remove_listener(*source, self.node);
        }
        self.system.remove_node(self.node);
    }
}
