use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cancel_helper::{CancelationHelper, Race};
use crate::cancelation::Cancelable;
use crate::error::raise;
use crate::node::{Node, PromiseCore, release, settle};
use crate::{CancelationToken, Outcome, Promise, Rejection, UsageError, pool};

/// A node settled directly by its producer rather than by an upstream promise.
pub(crate) struct DeferredNode<T> {
    core: PromiseCore<T>,
    settled: AtomicBool,
    cancel: CancelationHelper,
}

impl<T> Default for DeferredNode<T> {
    fn default() -> Self {
        Self {
            core: PromiseCore::default(),
            settled: AtomicBool::new(false),
            cancel: CancelationHelper::default(),
        }
    }
}

impl<T> DeferredNode<T>
where
    T: Send + 'static,
{
    /// Creates a pending node along with the promise that consumes it.
    ///
    /// If a cancelable token is given, the node is canceled when the token is.
    pub(crate) fn acquire(depth: u16, token: Option<&CancelationToken>) -> (Arc<Self>, Promise<T>) {
        let cancelable = token.is_some_and(CancelationToken::can_be_canceled);

        let node = pool::acquire(|node: &mut Self| {
            node.core.prepare(1 + u32::from(cancelable), depth);
            *node.settled.get_mut() = false;
            node.cancel.reset();
        });

        if let Some(token) = token.filter(|_| cancelable) {
            let target = Arc::clone(&node);
            node.cancel.register(token, target);
        }

        let consumer = Arc::clone(&node);
        let promise = Promise::from_node(consumer, node.core.id());

        (node, promise)
    }

    /// Settles the node unless it has already been settled (e.g. by its cancelation token).
    ///
    /// The outcome is only constructed if the node is settled by this call.
    pub(crate) fn try_settle(self: &Arc<Self>, make_outcome: impl FnOnce() -> Outcome<T>) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            return false;
        }

        let release_helper = match self.cancel.complete_path() {
            Race::Uncontested => false,
            Race::Won => true,
            Race::Lost { last } => last,
        };

        settle(Arc::clone(self), make_outcome());

        if release_helper {
            release(Arc::clone(self));
        }

        true
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

impl<T> Node for DeferredNode<T>
where
    T: Send + 'static,
{
    type Output = T;

    fn core(&self) -> &PromiseCore<T> {
        &self.core
    }

    fn dispose(self: Arc<Self>) {
        self.core.retire();
        self.cancel.clear();
        pool::repool(self);
    }
}

impl<T> Cancelable for DeferredNode<T>
where
    T: Send + 'static,
{
    fn cancel(self: Arc<Self>) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            settle(Arc::clone(&self), Outcome::Canceled);
        }

        if self.cancel.cancel_path() {
            release(self);
        }
    }
}

/// The producer side of a pending promise.
///
/// A deferred is created together with its promise. The holder of the deferred settles the
/// promise by resolving, rejecting or canceling it. If the deferred is dropped without being
/// settled, the promise is canceled.
///
/// The settling methods take `&self`, so a deferred can be shared between threads that race to
/// settle it. Exactly one of them succeeds.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use proto_promise::Deferred;
///
/// let (deferred, promise) = Deferred::new();
///
/// thread::spawn(move || deferred.resolve(42));
///
/// assert_eq!(promise.wait().unwrap(), 42);
/// ```
pub struct Deferred<T>
where
    T: Send + 'static,
{
    node: Arc<DeferredNode<T>>,
}

impl<T> Deferred<T>
where
    T: Send + 'static,
{
    /// Creates a pending promise and the deferred that settles it.
    #[must_use]
    pub fn new() -> (Self, Promise<T>) {
        let (node, promise) = DeferredNode::acquire(0, None);

        (Self { node }, promise)
    }

    /// Creates a pending promise that is also canceled when `token` is canceled.
    ///
    /// If the token is already canceled, the promise starts out canceled.
    #[must_use]
    pub fn new_cancelable(token: &CancelationToken) -> (Self, Promise<T>) {
        let (node, promise) = DeferredNode::acquire(0, Some(token));

        (Self { node }, promise)
    }

    /// Whether the promise has not yet been settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.node.is_settled()
    }

    /// Resolves the promise with a value.
    ///
    /// # Panics
    ///
    /// Panics if the promise has already been settled.
    #[track_caller]
    pub fn resolve(&self, value: T) {
        if !self.try_resolve(value) {
            raise(UsageError::AlreadySettled);
        }
    }

    /// Resolves the promise with a value, returning `false` if it was already settled.
    pub fn try_resolve(&self, value: T) -> bool {
        self.node.try_settle(|| Outcome::Resolved(value))
    }

    /// Rejects the promise with a reason.
    ///
    /// # Panics
    ///
    /// Panics if the promise has already been settled.
    #[track_caller]
    pub fn reject<E>(&self, reason: E)
    where
        E: Any + Send + Sync + fmt::Debug,
    {
        if !self.try_reject(reason) {
            raise(UsageError::AlreadySettled);
        }
    }

    /// Rejects the promise with a reason, returning `false` if it was already settled.
    pub fn try_reject<E>(&self, reason: E) -> bool
    where
        E: Any + Send + Sync + fmt::Debug,
    {
        self.node
            .try_settle(|| Outcome::Rejected(Rejection::new(reason)))
    }

    /// Rejects the promise with an existing rejection, returning `false` if it was already
    /// settled.
    pub fn try_reject_with(&self, rejection: Rejection) -> bool {
        self.node.try_settle(|| Outcome::Rejected(rejection))
    }

    /// Cancels the promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise has already been settled.
    #[track_caller]
    pub fn cancel(&self) {
        if !self.try_cancel() {
            raise(UsageError::AlreadySettled);
        }
    }

    /// Cancels the promise, returning `false` if it was already settled.
    pub fn try_cancel(&self) -> bool {
        self.node.try_settle(|| Outcome::Canceled)
    }
}

impl<T> Drop for Deferred<T>
where
    T: Send + 'static,
{
    fn drop(&mut self) {
        if !self.node.is_settled() {
            self.try_cancel();
        }
    }
}

impl<T> fmt::Debug for Deferred<T>
where
    T: Send + 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("is_pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
