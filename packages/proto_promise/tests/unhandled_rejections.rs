//! Reporting of rejections that no stage of a promise chain handled.
//!
//! The handler is process-wide, so this file holds a single test that owns the configuration.

use std::sync::Arc;

use parking_lot::Mutex;
use proto_promise::{Config, Deferred, Promise, reject};

#[test]
fn unhandled_rejections_are_reported_once() {
    let reported = Arc::new(Mutex::new(Vec::new()));

    Config::builder()
        .unhandled_rejection_handler({
            let reported = Arc::clone(&reported);
            move |rejection| {
                if let Some(reason) = rejection.downcast_ref::<&str>() {
                    reported.lock().push(*reason);
                }
            }
        })
        .install();

    // Forgotten before it is rejected.
    let (deferred, promise) = Deferred::<u8>::new();
    promise.forget();
    deferred.reject("forgotten");

    // Rejected, then dropped without being consumed.
    drop(Promise::<u8>::rejected("dropped"));

    // Flows through a chain that never handles it.
    let (deferred, promise) = Deferred::<u8>::new();
    let chained = promise.then(|value| value + 1);
    deferred.reject("through chain");
    drop(chained);

    // Superseded by a failing finally callback, whose own failure is observed.
    _ = Promise::<u8>::rejected("before finally")
        .finally(|| reject("finally failed"))
        .wait();

    // Settles an `all` after it has already failed.
    let (late, late_promise) = Deferred::<u8>::new();
    _ = Promise::all([Promise::rejected("first failure"), late_promise]).wait();
    late.reject("after all failed");

    // Loses a race that has already been won.
    let (loser, loser_promise) = Deferred::<u8>::new();
    _ = Promise::race([Promise::resolved(1), loser_promise]).wait();
    loser.reject("race loser");

    // Dropped as an awaiter without the result being claimed.
    let awaiter = Promise::<u8>::rejected("unclaimed awaiter").into_awaiter();
    drop(awaiter);

    // Handled rejections are not reported.
    _ = Promise::<u8>::rejected("observed").wait();
    _ = Promise::<u8>::rejected("caught")
        .catch(|_: &'static str| 0)
        .wait();

    assert_eq!(
        *reported.lock(),
        vec![
            "forgotten",
            "dropped",
            "through chain",
            "before finally",
            "after all failed",
            "race loser",
            "unclaimed awaiter",
        ]
    );
}
