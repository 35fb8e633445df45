//! Nodes are returned to the pool once their operation has been fully consumed.
//!
//! The live node count is process-wide, so this file holds a single test.

#![cfg(debug_assertions)]

use std::time::Duration;

use proto_promise::{CancelationSource, Deferred, Promise, live_nodes};

#[test]
fn completed_chains_release_every_node() {
    let baseline = live_nodes();

    for _ in 0..100 {
        let source = CancelationSource::new();
        let (deferred, promise) = Deferred::new();

        let chain = promise
            .then(|value: u64| value + 1)
            .then_cancelable(&source.token(), |value| value * 2)
            .catch(|_: &'static str| 0);

        let preserved = Promise::all([chain, Promise::resolved(1)]).preserve();
        let branch = preserved.branch();
        drop(preserved);

        deferred.resolve(1);
        assert_eq!(branch.wait().unwrap(), vec![4, 1]);
    }

    for _ in 0..100 {
        let (deferred, promise) = Deferred::<u64>::new();
        promise.forget();
        deferred.cancel();
    }

    for _ in 0..100 {
        let (deferred, promise) = Deferred::<u64>::new();
        let awaiter = promise.into_awaiter();
        drop(awaiter);
        deferred.resolve(1);
    }

    for _ in 0..100 {
        // The timer is disposed long before it is due.
        let (deferred, promise) = Deferred::new();
        let limited = promise.with_timeout(Duration::from_secs(3600));
        deferred.resolve(1_u64);
        assert_eq!(limited.wait().unwrap(), 1);
    }

    assert_eq!(live_nodes(), baseline);
}
