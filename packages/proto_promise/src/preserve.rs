use std::any::type_name;
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::deferred::DeferredNode;
use crate::error::raise;
use crate::node::{Waiter, hookup};
use crate::promise::Repr;
use crate::retain::RetainCounter;
use crate::{Outcome, Promise, UsageError, pool};

/// A promise whose outcome can be consumed any number of times.
///
/// Each call to [`branch()`][Self::branch] returns an ordinary single-consumer promise that
/// settles with a clone of the preserved outcome.
///
/// # Example
///
/// ```rust
/// use proto_promise::Deferred;
///
/// let (deferred, promise) = Deferred::new();
/// let preserved = promise.preserve();
///
/// let first = preserved.branch().then(|value: u32| value + 1);
/// let second = preserved.branch().then(|value: u32| value * 2);
///
/// deferred.resolve(10);
///
/// assert_eq!(first.wait().unwrap(), 11);
/// assert_eq!(second.wait().unwrap(), 20);
/// ```
pub struct PreservedPromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    node: Arc<PreservedNode<T>>,
}

/// Holds the upstream outcome and fans it out to every branch.
struct PreservedNode<T> {
    /// The handle and the upstream, if not yet settled.
    retain: RetainCounter,
    shared: Mutex<Shared<T>>,
}

struct Shared<T> {
    outcome: Option<Outcome<T>>,
    branches: SmallVec<[Arc<DeferredNode<T>>; 2]>,
    depth: u16,
}

impl<T> Default for PreservedNode<T> {
    fn default() -> Self {
        Self {
            retain: RetainCounter::new(),
            shared: Mutex::new(Shared {
                outcome: None,
                branches: SmallVec::new(),
                depth: 0,
            }),
        }
    }
}

impl<T> PreservedNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn acquire(retain: u32, outcome: Option<Outcome<T>>, depth: u16) -> Arc<Self> {
        pool::acquire(|node: &mut Self| {
            node.retain.reset(retain);

            let shared = node.shared.get_mut();
            shared.outcome = outcome;
            shared.depth = depth;
        })
    }

    fn branch(&self) -> Promise<T> {
        let mut shared = self.shared.lock();

        if let Some(outcome) = &shared.outcome {
            return Promise::from_outcome(outcome.clone());
        }

        let (branch, promise) = DeferredNode::acquire(shared.depth.saturating_add(1), None);
        shared.branches.push(branch);

        promise
    }

    fn release(self: Arc<Self>) {
        if !self.retain.release() {
            return;
        }

        let outcome = {
            let mut shared = self.shared.lock();
            debug_assert!(shared.branches.is_empty());
            shared.outcome.take()
        };

        // A rejection no branch handled is reported here.
        drop(outcome);

        pool::repool(self);
    }
}

impl<T> Waiter<T> for PreservedNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let branches = {
            let mut shared = self.shared.lock();
            shared.outcome = Some(outcome.clone());
            mem::take(&mut shared.branches)
        };

        for branch in branches {
            _ = branch.try_settle(|| outcome.clone());
        }

        // The stored copy shares the handled state of the branches.
        drop(outcome);

        self.release();
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Converts the promise into one that can be consumed any number of times.
    #[must_use]
    #[track_caller]
    pub fn preserve(self) -> PreservedPromise<T> {
        let depth = self.depth();

        let node = match self.into_repr() {
            Repr::Settled(outcome) => PreservedNode::acquire(1, Some(outcome), depth),
            Repr::Node { node: upstream, id } => {
                let node = PreservedNode::acquire(2, None, depth);

                let waiter = Arc::clone(&node);
                hookup(upstream, id, waiter);

                node
            }
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        };

        PreservedPromise { node }
    }
}

impl<T> PreservedPromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Returns a new promise that settles with a clone of the preserved outcome.
    #[must_use]
    pub fn branch(&self) -> Promise<T> {
        self.node.branch()
    }

    /// Releases the preserved outcome. Equivalent to dropping the handle.
    pub fn forget(self) {
        drop(self);
    }
}

impl<T> Drop for PreservedPromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        Arc::clone(&self.node).release();
    }
}

impl<T> fmt::Debug for PreservedPromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settled = self.node.shared.lock().outcome.is_some();

        f.debug_struct(type_name::<Self>())
            .field("settled", &settled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Deferred, Rejection, State};

    #[test]
    fn branches_before_and_after_settle() {
        let (deferred, promise) = Deferred::new();
        let preserved = promise.preserve();

        let early = preserved.branch();
        assert_eq!(early.state(), State::Pending);

        deferred.resolve("shared".to_owned());

        let late = preserved.branch();
        assert_eq!(late.state(), State::Resolved);

        assert_eq!(early.wait().unwrap(), "shared");
        assert_eq!(late.wait().unwrap(), "shared");
    }

    #[test]
    fn settled_promise_preserves_inline() {
        let preserved = Promise::resolved(3).preserve();

        for _ in 0..3 {
            assert_eq!(preserved.branch().wait().unwrap(), 3);
        }
    }

    #[test]
    fn dropping_handle_keeps_branches_alive() {
        let (deferred, promise) = Deferred::new();
        let preserved = promise.preserve();

        let branch = preserved.branch();
        drop(preserved);

        deferred.resolve(1);
        assert_eq!(branch.wait().unwrap(), 1);
    }

    #[test]
    fn branches_share_rejection() {
        let original = Rejection::new("shared failure");
        let preserved = Promise::<u8>::rejected_with(original.clone()).preserve();

        let error = preserved.branch().wait().unwrap_err();

        assert!(Rejection::ptr_eq(error.rejection().unwrap(), &original));
        assert!(original.is_handled());
    }

    #[test]
    fn canceled_outcome_reaches_all_branches() {
        let (deferred, promise) = Deferred::<u8>::new();
        let preserved = promise.preserve();

        let first = preserved.branch();
        let second = preserved.branch();

        deferred.cancel();

        assert!(first.wait().unwrap_err().is_canceled());
        assert!(second.wait().unwrap_err().is_canceled());
    }

    #[test]
    fn thread_safety() {
        assert_impl_all!(PreservedPromise<u32>: Send, Sync);
    }
}
