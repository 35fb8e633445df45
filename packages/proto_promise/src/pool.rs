//! Per-thread free lists of idle promise nodes, keyed by concrete node type.
//!
//! A node is only handed out again if nothing else still references it. Stale handles (e.g. a
//! clone of an `Awaiter` that outlived the operation) keep the previous allocation alive, in
//! which case the pooled instance is discarded and a new one allocated.

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};
use tracing::trace;

use crate::{config, diagnostics};

thread_local! {
    static POOLS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Obtains a node for a new operation, reusing an idle one if possible.
///
/// `init` prepares the node for its new use. It has exclusive access, so no synchronization is
/// needed to set up the fields.
pub(crate) fn acquire<N>(init: impl FnOnce(&mut N)) -> Arc<N>
where
    N: Default + Send + Sync + 'static,
{
    diagnostics::node_acquired();

    let mut node = match take::<N>() {
        Some(node) => node,
        None => {
            let mut fresh = N::default();
            init(&mut fresh);
            return Arc::new(fresh);
        }
    };

    if let Some(exclusive) = Arc::get_mut(&mut node) {
        init(exclusive);
        return node;
    }

    trace!(node_type = type_name::<N>(), "pooled node still referenced, discarding");

    let mut fresh = N::default();
    init(&mut fresh);
    Arc::new(fresh)
}

/// Returns a node that has finished its operation to the current thread's pool.
///
/// The node must already have been reset, with all payloads of its previous use released.
pub(crate) fn repool<N>(node: Arc<N>)
where
    N: Send + Sync + 'static,
{
    diagnostics::node_disposed();

    let Some(capacity) = config::pool_capacity() else {
        return;
    };

    // During thread teardown the pool may already be gone, in which case the node is dropped.
    let rejected = POOLS
        .try_with(|pools| {
            let mut pools = pools.borrow_mut();

            let list = pools
                .entry(TypeId::of::<N>())
                .or_insert_with(|| Box::new(Vec::<Arc<N>>::new()))
                .downcast_mut::<Vec<Arc<N>>>()?;

            if list.len() >= capacity {
                return Some(node);
            }

            list.push(node);
            None
        })
        .ok()
        .flatten();

    // Dropped outside of the pool borrow, as dropping may re-enter the pool.
    drop(rejected);
}

fn take<N>() -> Option<Arc<N>>
where
    N: Send + Sync + 'static,
{
    config::pool_capacity()?;

    let node = POOLS
        .try_with(|pools| {
            pools
                .borrow_mut()
                .get_mut(&TypeId::of::<N>())
                .and_then(|list| list.downcast_mut::<Vec<Arc<N>>>())
                .and_then(Vec::pop)
        })
        .ok()
        .flatten();

    if node.is_some() {
        trace!(node_type = type_name::<N>(), "reusing pooled node");
    } else {
        trace!(node_type = type_name::<N>(), "pool empty, allocating node");
    }

    node
}

/// The number of idle nodes of type `N` in the current thread's pool.
#[cfg(test)]
pub(crate) fn idle_count<N>() -> usize
where
    N: Send + Sync + 'static,
{
    POOLS.with(|pools| {
        pools
            .borrow()
            .get(&TypeId::of::<N>())
            .and_then(|list| list.downcast_ref::<Vec<Arc<N>>>())
            .map_or(0, Vec::len)
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct Sample {
        value: AtomicUsize,
    }

    #[test]
    fn repooled_node_is_reused() {
        let node = acquire(|n: &mut Sample| *n.value.get_mut() = 5);
        let address = Arc::as_ptr(&node);

        repool(node);
        assert_eq!(idle_count::<Sample>(), 1);

        let reused = acquire(|n: &mut Sample| {
            assert_eq!(*n.value.get_mut(), 5);
            *n.value.get_mut() = 6;
        });

        assert_eq!(Arc::as_ptr(&reused), address);
        assert_eq!(reused.value.load(Ordering::Relaxed), 6);
        assert_eq!(idle_count::<Sample>(), 0);

        repool(reused);
    }

    #[test]
    fn referenced_node_is_not_reused() {
        #[derive(Debug, Default)]
        struct Shared;

        let node = acquire(|_: &mut Shared| {});
        let stale = Arc::clone(&node);

        repool(node);

        let fresh = acquire(|_: &mut Shared| {});

        assert!(!Arc::ptr_eq(&fresh, &stale));
        assert_eq!(idle_count::<Shared>(), 0);

        repool(fresh);
    }
}
