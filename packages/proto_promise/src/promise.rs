use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::deferred::DeferredNode;
use crate::error::raise;
use crate::node::{self, NodeRef, release};
use crate::{Outcome, PromiseError, Rejection, State, UsageError};

/// The eventual result of an asynchronous operation.
///
/// A promise is a move-only handle with a single consumer. The consumer either attaches a
/// continuation (e.g. [`then()`][Self::then]), awaits it as a [`Future`], blocks on it via
/// [`wait()`][Self::wait], converts it into an [`Awaiter`][crate::Awaiter] or forgets it.
/// Dropping a promise that has not been consumed forgets it.
///
/// Promises that are already settled when created do not allocate. Pending promises are backed
/// by a pooled node that is reused once the operation has been fully consumed.
///
/// # Example
///
/// ```rust
/// use proto_promise::{Deferred, Promise};
///
/// let (deferred, promise) = Deferred::<u32>::new();
///
/// let doubled = promise.then(|value| value * 2);
///
/// deferred.resolve(21);
///
/// assert_eq!(doubled.wait().unwrap(), 42);
/// ```
pub struct Promise<T> {
    repr: Repr<T>,
}

pub(crate) enum Repr<T> {
    /// Settled without ever needing a node.
    Settled(Outcome<T>),

    /// Backed by a node. `id` is the generation of the node this handle refers to.
    Node { node: NodeRef<T>, id: u16 },

    /// The handle has been consumed by polling it to completion.
    Consumed,
}

impl<T> Promise<T> {
    pub(crate) fn into_repr(mut self) -> Repr<T> {
        mem::replace(&mut self.repr, Repr::Consumed)
    }

    /// The current state of the promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise has already been consumed by awaiting it.
    #[must_use]
    #[track_caller]
    pub fn state(&self) -> State {
        match &self.repr {
            Repr::Settled(outcome) => outcome.state(),
            Repr::Node { node, id } => node.core().state(*id),
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }

    /// The number of continuation stages between this promise and the start of its chain.
    #[must_use]
    pub fn depth(&self) -> u16 {
        match &self.repr {
            Repr::Node { node, .. } => node.core().depth(),
            Repr::Settled(_) | Repr::Consumed => 0,
        }
    }
}

impl<T> Promise<T>
where
    T: Send + 'static,
{
    pub(crate) fn from_node(node: NodeRef<T>, id: u16) -> Self {
        Self {
            repr: Repr::Node { node, id },
        }
    }

    /// Creates a promise that is already resolved with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self::from_outcome(Outcome::Resolved(value))
    }

    /// Creates a promise that is already rejected with `reason`.
    #[must_use]
    pub fn rejected<E>(reason: E) -> Self
    where
        E: Any + Send + Sync + fmt::Debug,
    {
        Self::from_outcome(Outcome::Rejected(Rejection::new(reason)))
    }

    /// Creates a promise that is already rejected with an existing rejection.
    #[must_use]
    pub fn rejected_with(rejection: Rejection) -> Self {
        Self::from_outcome(Outcome::Rejected(rejection))
    }

    /// Creates a promise that is already canceled.
    #[must_use]
    pub fn canceled() -> Self {
        Self::from_outcome(Outcome::Canceled)
    }

    /// Creates a promise that is already settled with `outcome`.
    #[must_use]
    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        Self {
            repr: Repr::Settled(outcome),
        }
    }

    /// Gives up interest in the result of the promise.
    ///
    /// The operation still runs to completion. If it is rejected, the rejection is reported as
    /// unhandled.
    #[track_caller]
    pub fn forget(self) {
        match self.into_repr() {
            Repr::Settled(outcome) => drop(outcome),
            Repr::Node { node, id } => node::forget(node, id),
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }

    /// Converts the promise into a node-backed handle, allocating a node for inline outcomes.
    #[track_caller]
    pub(crate) fn into_node(self) -> (NodeRef<T>, u16) {
        match self.into_repr() {
            Repr::Node { node, id } => (node, id),
            Repr::Settled(outcome) => {
                let (node, promise) = DeferredNode::acquire(0, None);
                node.try_settle(|| outcome);
                promise.into_node()
            }
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Repr::Node { node, id } = mem::replace(&mut self.repr, Repr::Consumed) {
            node::forget(node, id);
        }
    }
}

impl<T> Unpin for Promise<T> {}

impl<T> Future for Promise<T>
where
    T: Send + 'static,
{
    type Output = Result<T, PromiseError>;

    #[track_caller]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match mem::replace(&mut this.repr, Repr::Consumed) {
            Repr::Settled(outcome) => Poll::Ready(outcome.into_result()),
            Repr::Node { node, id } => match node.core().poll(id, cx.waker()) {
                Poll::Ready(outcome) => {
                    release(node);
                    Poll::Ready(outcome.into_result())
                }
                Poll::Pending => {
                    this.repr = Repr::Node { node, id };
                    Poll::Pending
                }
            },
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.repr {
            Repr::Settled(outcome) => Some(outcome.state()),
            Repr::Node { .. } => None,
            Repr::Consumed => return f.write_str("Promise(consumed)"),
        };

        f.debug_struct(type_name::<Self>())
            .field("settled_inline", &state)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}
