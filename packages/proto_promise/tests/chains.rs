//! End-to-end behavior of promise chains built from the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use proto_promise::{
    CancelationSource, Deferred, ManualSynchronizationContext, Outcome, Promise, PromiseError,
    State, SynchronizationOption, reject, rethrow,
};
use testing::with_watchdog;

/// Resolved values are incremented, rejections recover to -1 and cancelation passes through.
fn increment_or_recover(promise: Promise<i32>) -> Promise<i32> {
    promise
        .then(|value| value + 1)
        .catch(|_: &'static str| -1)
}

#[test]
fn resolved_value_flows_through_then() {
    let (deferred, promise) = Deferred::new();
    let result = increment_or_recover(promise);

    deferred.resolve(10);

    assert_eq!(result.wait().unwrap(), 11);
}

#[test]
fn rejection_is_recovered_by_catch() {
    let (deferred, promise) = Deferred::new();
    let result = increment_or_recover(promise);

    deferred.reject("broken");

    assert_eq!(result.wait().unwrap(), -1);
}

#[test]
fn cancelation_skips_then_and_catch() {
    let (deferred, promise) = Deferred::new();
    let result = increment_or_recover(promise);

    deferred.cancel();

    assert!(matches!(result.wait(), Err(PromiseError::Canceled)));
}

#[test]
fn catch_ignores_rejections_of_other_types() {
    let result = Promise::<i32>::rejected(404_u16).catch(|_: &'static str| 0);

    let error = result.wait().unwrap_err();
    assert_eq!(error.rejection().unwrap().downcast_ref::<u16>(), Some(&404));
}

#[test]
fn rethrow_forwards_the_original_rejection() {
    let handled = Arc::new(AtomicUsize::new(0));

    let result = Promise::<i32>::rejected("original").catch({
        let handled = Arc::clone(&handled);
        move |_: &'static str| -> i32 {
            handled.fetch_add(1, Ordering::Relaxed);
            rethrow()
        }
    });

    let error = result.wait().unwrap_err();
    assert_eq!(handled.load(Ordering::Relaxed), 1);
    assert_eq!(
        error.rejection().unwrap().downcast_ref::<&str>(),
        Some(&"original")
    );
}

#[test]
fn reject_signal_replaces_the_value() {
    let result = Promise::resolved(1).then(|_: i32| -> i32 { reject("refused") });

    let error = result.wait().unwrap_err();
    assert!(error.rejection().unwrap().is::<&str>());
}

#[test]
fn finally_runs_for_every_outcome() {
    let runs = Arc::new(AtomicUsize::new(0));

    let outcomes = [
        Promise::resolved(1),
        Promise::rejected("nope"),
        Promise::canceled(),
    ];

    for promise in outcomes {
        let runs = Arc::clone(&runs);
        _ = promise
            .finally(move || {
                runs.fetch_add(1, Ordering::Relaxed);
            })
            .wait();
    }

    assert_eq!(runs.load(Ordering::Relaxed), 3);
}

#[test]
fn continue_with_observes_any_outcome() {
    let state = Promise::<u8>::canceled()
        .continue_with(|outcome: Outcome<u8>| outcome.state())
        .wait()
        .unwrap();

    assert_eq!(state, State::Canceled);
}

#[test]
#[cfg_attr(miri, ignore)] // Thread-heavy.
fn nested_adoption_across_threads() {
    with_watchdog(|| {
        let (outer, outer_promise) = Deferred::<u32>::new();

        let result = outer_promise.then_promise(|first| {
            let (middle, middle_promise) = Deferred::new();
            thread::spawn(move || middle.resolve(first + 1));

            middle_promise.then_promise(|second: u32| {
                let (inner, inner_promise) = Deferred::new();
                thread::spawn(move || inner.resolve(second * 10));
                inner_promise
            })
        });

        thread::spawn(move || outer.resolve(1)).join().unwrap();

        assert_eq!(result.wait().unwrap(), 20);
    });
}

#[test]
#[cfg_attr(miri, ignore)] // Thread-heavy.
fn future_await_across_threads() {
    with_watchdog(|| {
        let (deferred, promise) = Deferred::new();

        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            deferred.resolve("from another thread");
        });

        assert_eq!(block_on(promise).unwrap(), "from another thread");
        resolver.join().unwrap();
    });
}

#[test]
fn merge_order_is_input_order() {
    let (deferreds, promises): (Vec<_>, Vec<_>) = (0..5).map(|_| Deferred::new()).unzip();

    let all = Promise::all(promises);

    for (value, deferred) in deferreds.into_iter().enumerate().rev() {
        deferred.resolve(value * 100);
    }

    assert_eq!(all.wait().unwrap(), vec![0, 100, 200, 300, 400]);
}

#[test]
fn merge_fails_with_first_failure_regardless_of_order() {
    let (slow, slow_promise) = Deferred::<u8>::new();
    let (fast, fast_promise) = Deferred::<u8>::new();

    let all = Promise::all([slow_promise, fast_promise]);

    fast.reject("fast failure");
    slow.reject("slow failure");

    let error = all.wait().unwrap_err();
    assert_eq!(
        error.rejection().unwrap().downcast_ref::<&str>(),
        Some(&"fast failure")
    );
}

#[test]
fn preserved_promise_feeds_every_branch() {
    let (deferred, promise) = Deferred::new();
    let preserved = promise.preserve();

    let doubled = preserved.branch().then(|value: u32| value * 2);
    let squared = preserved.branch().then(|value: u32| value * value);
    drop(preserved);

    deferred.resolve(7);

    assert_eq!(doubled.wait().unwrap(), 14);
    assert_eq!(squared.wait().unwrap(), 49);
}

#[test]
fn foreground_context_runs_continuations_when_pumped() {
    let main_loop = Arc::new(ManualSynchronizationContext::new());
    let context: Arc<ManualSynchronizationContext> = Arc::clone(&main_loop);
    let option = SynchronizationOption::Explicit(context);

    let ran = Arc::new(AtomicUsize::new(0));
    let result = Promise::resolved(3).wait_async_forced(option).then({
        let ran = Arc::clone(&ran);
        move |value| {
            ran.fetch_add(1, Ordering::Relaxed);
            value
        }
    });

    assert_eq!(ran.load(Ordering::Relaxed), 0);

    main_loop.execute();

    assert_eq!(ran.load(Ordering::Relaxed), 1);
    assert_eq!(result.wait().unwrap(), 3);
}

#[test]
fn cancelable_wait_cancels_without_touching_upstream() {
    let source = CancelationSource::new();
    let (deferred, promise) = Deferred::<u8>::new();

    let waited = promise.wait_async_cancelable(&source.token());
    source.cancel();

    assert!(waited.wait().unwrap_err().is_canceled());

    // The upstream is still pending and can be settled normally.
    assert!(deferred.is_pending());
    deferred.resolve(1);
}
