use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::raise;
use crate::node::{self, NodeRef, Notifier, release};
use crate::{Promise, PromiseError, UsageError};

/// A polling view of a promise for integration with foreign awaiting mechanisms.
///
/// The awaiter splits consuming a promise into three steps: checking whether it has completed,
/// registering a callback to run on completion and claiming the result. Clones of an awaiter
/// refer to the same promise and may be handed to different parts of the integration, but the
/// promise still has a single consumer: registering a second callback or claiming the result
/// twice panics with a usage error.
///
/// Dropping the last clone without claiming the result forgets the promise, the same as dropping
/// an unconsumed [`Promise`].
///
/// # Example
///
/// ```rust
/// use proto_promise::Deferred;
///
/// let (deferred, promise) = Deferred::new();
/// let awaiter = promise.into_awaiter();
///
/// assert!(!awaiter.is_completed());
///
/// deferred.resolve("ready");
///
/// assert!(awaiter.is_completed());
/// assert_eq!(awaiter.get_result().unwrap(), "ready");
/// ```
pub struct Awaiter<T> {
    claim: Arc<Claim<T>>,
}

/// The consumer's hold on the node, shared by all clones of an awaiter.
struct Claim<T> {
    node: NodeRef<T>,
    id: u16,

    /// Set once the result has been claimed or the promise forgotten.
    consumed: AtomicBool,
}

impl<T> Drop for Claim<T> {
    fn drop(&mut self) {
        if !*self.consumed.get_mut() {
            node::forget(Arc::clone(&self.node), self.id);
        }
    }
}

impl<T> Awaiter<T>
where
    T: Send + 'static,
{
    /// Whether the promise has settled and its result can be claimed.
    ///
    /// # Panics
    ///
    /// Panics if the result has already been claimed.
    #[must_use]
    #[track_caller]
    pub fn is_completed(&self) -> bool {
        self.claim.node.core().is_completed(self.claim.id)
    }

    /// Registers a callback to run once the promise settles.
    ///
    /// If the promise has already settled, the callback runs before this returns. Otherwise it
    /// runs on the thread that settles the promise.
    ///
    /// # Panics
    ///
    /// Panics if a callback has already been registered or the result already claimed.
    #[track_caller]
    pub fn on_completed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let notifier = Notifier::Callback(Box::new(callback));
        let claim = &self.claim;

        if let Some(notifier) = claim.node.core().register_notifier(claim.id, notifier) {
            notifier.notify();
        }
    }

    /// Claims the result of a settled promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise has not yet settled or the result has already been claimed.
    #[track_caller]
    pub fn get_result(&self) -> Result<T, PromiseError> {
        let claim = &self.claim;

        let outcome = claim.node.core().take(claim.id);
        claim.consumed.store(true, Ordering::Relaxed);
        release(Arc::clone(&claim.node));

        outcome.into_result()
    }

    /// Gives up interest in the result of the promise.
    ///
    /// # Panics
    ///
    /// Panics if the result has already been claimed.
    #[track_caller]
    pub fn forget(self) {
        let claim = &self.claim;

        if claim.consumed.swap(true, Ordering::Relaxed) {
            raise(UsageError::AlreadyAwaited);
        }

        node::forget(Arc::clone(&claim.node), claim.id);
    }
}

impl<T> Promise<T>
where
    T: Send + 'static,
{
    /// Converts the promise into an [`Awaiter`].
    #[must_use]
    #[track_caller]
    pub fn into_awaiter(self) -> Awaiter<T> {
        let (node, id) = self.into_node();

        Awaiter {
            claim: Arc::new(Claim {
                node,
                id,
                consumed: AtomicBool::new(false),
            }),
        }
    }
}

impl<T> Clone for Awaiter<T> {
    fn clone(&self) -> Self {
        Self {
            claim: Arc::clone(&self.claim),
        }
    }
}

impl<T> fmt::Debug for Awaiter<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.claim.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Deferred;

    #[test]
    fn callback_runs_on_settle() {
        let (deferred, promise) = Deferred::new();
        let awaiter = promise.into_awaiter();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        awaiter.on_completed(move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(calls.load(Ordering::Relaxed), 0);
        deferred.resolve(9);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        assert_eq!(awaiter.get_result().unwrap(), 9);
    }

    #[test]
    fn callback_runs_inline_when_completed() {
        let awaiter = Promise::resolved(1).into_awaiter();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        awaiter.on_completed(move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(awaiter.get_result().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "already been awaited")]
    fn second_callback_panics() {
        let (_deferred, promise) = Deferred::<u8>::new();
        let awaiter = promise.into_awaiter();
        let clone = awaiter.clone();

        awaiter.on_completed(|| {});
        clone.on_completed(|| {});
    }

    #[test]
    #[should_panic(expected = "before the promise was settled")]
    fn result_before_settle_panics() {
        let (_deferred, promise) = Deferred::<u8>::new();

        _ = promise.into_awaiter().get_result();
    }

    #[test]
    #[should_panic(expected = "no longer valid")]
    fn second_result_panics() {
        let awaiter = Promise::resolved(1).into_awaiter();
        let clone = awaiter.clone();

        awaiter.get_result().unwrap();
        _ = clone.get_result();
    }

    #[test]
    fn dropping_unclaimed_awaiter_forgets() {
        let (deferred, promise) = Deferred::<u8>::new();
        let awaiter = promise.into_awaiter();
        let clone = awaiter.clone();

        let node = Arc::clone(&awaiter.claim.node);
        let id = awaiter.claim.id;

        drop(awaiter);
        drop(clone);

        // Once settled, the forgotten node is disposed, which moves it to a new generation.
        deferred.resolve(1);
        assert_ne!(node.core().id(), id);
    }

    #[test]
    fn dropping_claimed_awaiter_is_silent() {
        let awaiter = Promise::resolved(2_u8).into_awaiter();
        let clone = awaiter.clone();

        assert_eq!(awaiter.get_result().unwrap(), 2);

        drop(awaiter);
        drop(clone);
    }

    #[test]
    #[should_panic(expected = "already been awaited")]
    fn forget_after_claim_panics() {
        let awaiter = Promise::resolved(2_u8).into_awaiter();
        let clone = awaiter.clone();

        awaiter.get_result().unwrap();
        clone.forget();
    }

    #[test]
    fn thread_safety() {
        assert_impl_all!(Awaiter<u32>: Send, Sync, Clone);
    }
}
