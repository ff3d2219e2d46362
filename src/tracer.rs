//! Tracer trait for observing change propagation.
//!
//! This module defines the [`Tracer`] trait. The default [`NoopTracer`]
//! provides zero cost when observation is not needed. Log output goes through
//! the `tracing` crate independently of the installed tracer.
//!
//! # Example
//!
//! ```ignore
//! use change_flow::{ChangeSystem, NodeId, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_recompute(&self, node: NodeId) {
//!         println!("recomputing {node}");
//!     }
//! }
//!
//! let system = ChangeSystem::builder().tracer(PrintTracer).build();
//! ```

use crate::{Change, ChangeEvent, NodeId};

/// Observer of the change system.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` because a system may be shared
/// between threads.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a change is recorded for a node in the current transaction.
    #[inline]
    fn on_change_recorded(&self, _node: NodeId, _change: &Change) {}

    /// Called before the change handler of `target` runs for a change of `source`.
    #[inline]
    fn on_handler_invoked(&self, _source: NodeId, _target: NodeId) {}

    /// Called after a top-level transaction delivered its event to
    /// `deliveries` external listeners.
    #[inline]
    fn on_transaction_flushed(&self, _event: &ChangeEvent, _deliveries: usize) {}

    /// Called when a calculated value recomputes.
    #[inline]
    fn on_recompute(&self, _node: NodeId) {}

    /// Called when a calculated value is served from its cache.
    #[inline]
    fn on_cache_hit(&self, _node: NodeId) {}

    /// Called when a read region is entered on a node that is mid-mutation.
    #[inline]
    fn on_invalid_read(&self, _node: NodeId) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`ChangeSystem`](crate::ChangeSystem).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Calculated, ChangeSystem, Changeable, ObservableValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTracer {
        recomputes: AtomicUsize,
        hits: AtomicUsize,
    }

    impl Tracer for Arc<CountingTracer> {
        fn on_recompute(&self, _node: NodeId) {
            self.recomputes.fetch_add(1, Ordering::Relaxed);
        }

        fn on_cache_hit(&self, _node: NodeId) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_calculated_reports_recompute_and_cache_hits() {
        let tracer = Arc::new(CountingTracer {
            recomputes: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        });
        let system = ChangeSystem::builder().tracer(tracer.clone()).build();
        let source = ObservableValue::new(&system, 2);
        let reader = source.clone();
        let doubled = Calculated::new(&system, [source.node()], move || Some(reader.get() * 2));

        assert_eq!(*doubled.get().unwrap(), 4);
        assert_eq!(*doubled.get().unwrap(), 4);
        source.set(3).unwrap();
        assert_eq!(*doubled.get().unwrap(), 6);

        assert_eq!(tracer.recomputes.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<CountingTracer>>();
    }
}
