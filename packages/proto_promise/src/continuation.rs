//! Continuations: a callback attached to a promise that produces the next promise in the chain.
//!
//! Every continuation method is a thin wrapper that decides which outcomes invoke the user
//! callback and which are forwarded untouched. The shared machinery lives in
//! [`Promise::continue_raw()`], which either runs the wrapper inline (upstream already settled)
//! or attaches a [`ContinuationNode`] to the upstream node.

use std::any::Any;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel_helper::{CancelationHelper, Race};
use crate::cancelation::Cancelable;
use crate::error::raise;
use crate::node::{Node, NodeRef, PromiseCore, Waiter, forget, hookup, release, settle};
use crate::promise::Repr;
use crate::{CancelationToken, Outcome, Promise, Rejection, UsageError, pool, signals};

/// What a continuation produces: a final outcome or a promise whose outcome is adopted.
pub(crate) enum Step<U> {
    Settle(Outcome<U>),
    Adopt(Promise<U>),
}

impl<U> Step<U>
where
    U: Send + 'static,
{
    fn value(result: Result<U, Outcome<U>>) -> Self {
        match result {
            Ok(value) => Self::Settle(Outcome::Resolved(value)),
            Err(failure) => Self::Settle(failure),
        }
    }

    fn promise(result: Result<Promise<U>, Outcome<U>>) -> Self {
        match result {
            Ok(promise) => Self::Adopt(promise),
            Err(failure) => Self::Settle(failure),
        }
    }

    fn into_promise(self) -> Promise<U> {
        match self {
            Self::Settle(outcome) => Promise::from_outcome(outcome),
            Self::Adopt(promise) => promise,
        }
    }
}

/// A node that runs a callback on the outcome of its upstream.
struct ContinuationNode<T, U, F> {
    core: PromiseCore<U>,
    callback: Mutex<Option<F>>,
    cancel: CancelationHelper,
    _upstream: PhantomData<fn(T)>,
}

impl<T, U, F> Default for ContinuationNode<T, U, F> {
    fn default() -> Self {
        Self {
            core: PromiseCore::default(),
            callback: Mutex::new(None),
            cancel: CancelationHelper::default(),
            _upstream: PhantomData,
        }
    }
}

impl<T, U, F> ContinuationNode<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
{
    fn attach(
        upstream: NodeRef<T>,
        upstream_id: u16,
        token: Option<&CancelationToken>,
        callback: F,
    ) -> Promise<U> {
        let cancelable = token.is_some_and(CancelationToken::can_be_canceled);
        let depth = upstream.core().depth().saturating_add(1);

        let node = pool::acquire(|node: &mut Self| {
            node.core.prepare(1 + u32::from(cancelable), depth);
            *node.callback.get_mut() = Some(callback);
            node.cancel.reset();
        });

        let id = node.core.id();

        if let Some(token) = token.filter(|_| cancelable) {
            let target = Arc::clone(&node);
            node.cancel.register(token, target);
        }

        let waiter = Arc::clone(&node);
        hookup(upstream, upstream_id, waiter);

        Promise::from_node(node, id)
    }
}

impl<T, U, F> Node for ContinuationNode<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
{
    type Output = U;

    fn core(&self) -> &PromiseCore<U> {
        &self.core
    }

    fn dispose(self: Arc<Self>) {
        self.core.retire();
        self.cancel.clear();
        pool::repool(self);
    }
}

impl<T, U, F> Waiter<T> for ContinuationNode<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        match self.cancel.complete_path() {
            Race::Uncontested => {}
            Race::Won => release(Arc::clone(&self)),
            Race::Lost { last } => {
                drop(outcome);

                if last {
                    release(self);
                }

                return;
            }
        }

        let callback = self.callback.lock().take();

        // Only the path that settles the node takes the callback.
        let Some(callback) = callback else {
            return;
        };

        match callback(outcome) {
            Step::Settle(outcome) => settle(self, outcome),
            Step::Adopt(promise) => adopt(self, promise),
        }
    }
}

impl<T, U, F> Cancelable for ContinuationNode<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
{
    fn cancel(self: Arc<Self>) {
        let callback = self.callback.lock().take();
        drop(callback);

        settle(Arc::clone(&self), Outcome::Canceled);

        if self.cancel.cancel_path() {
            release(self);
        }
    }
}

/// Settles `node` with the eventual outcome of `promise`.
pub(crate) fn adopt<N>(node: Arc<N>, promise: Promise<N::Output>)
where
    N: Node + 'static,
    N::Output: Send + 'static,
{
    match promise.into_repr() {
        Repr::Settled(outcome) => settle(node, outcome),
        Repr::Node {
            node: inner,
            id: inner_id,
        } => {
            if ptr::addr_eq(Arc::as_ptr(&inner), Arc::as_ptr(&node)) {
                // The callback returned the promise it is supposed to settle.
                settle(
                    node,
                    Outcome::Rejected(Rejection::new(UsageError::InvalidReturn)),
                );
                forget(inner, inner_id);
                return;
            }

            node.core().raise_depth(inner.core().depth().saturating_add(1));

            let forward = Forward::<N::Output>::acquire(node);
            hookup(inner, inner_id, forward);
        }
        Repr::Consumed => settle(
            node,
            Outcome::Rejected(Rejection::new(UsageError::InvalidReturn)),
        ),
    }
}

/// Relays the outcome of an adopted promise to the node that adopted it.
struct Forward<T> {
    target: Mutex<Option<NodeRef<T>>>,
}

impl<T> Default for Forward<T> {
    fn default() -> Self {
        Self {
            target: Mutex::new(None),
        }
    }
}

impl<T> Forward<T>
where
    T: Send + 'static,
{
    fn acquire(target: NodeRef<T>) -> Arc<Self> {
        pool::acquire(|forward: &mut Self| *forward.target.get_mut() = Some(target))
    }
}

impl<T> Waiter<T> for Forward<T>
where
    T: Send + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let target = self.target.lock().take();
        pool::repool(self);

        if let Some(target) = target {
            settle(target, outcome);
        }
    }
}

impl<T> Promise<T>
where
    T: Send + 'static,
{
    /// Attaches `callback` to run on the outcome of this promise.
    ///
    /// If `token` is canceled before the outcome arrives, the callback is dropped without
    /// running and the returned promise is canceled.
    #[track_caller]
    pub(crate) fn continue_raw<U, F>(self, token: Option<&CancelationToken>, callback: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Step<U> + Send + 'static,
    {
        match self.into_repr() {
            Repr::Settled(outcome) => {
                if token.is_some_and(CancelationToken::is_cancelation_requested) {
                    drop(outcome);
                    return Promise::canceled();
                }

                callback(outcome).into_promise()
            }
            Repr::Node { node, id } => ContinuationNode::attach(node, id, token, callback),
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }

    /// Transforms the resolved value of the promise.
    ///
    /// Rejections and cancelation are forwarded to the returned promise without invoking
    /// `on_resolved`. If `on_resolved` panics, the returned promise is rejected (see
    /// [`cancel()`][crate::cancel] and [`reject()`][crate::reject] for unwinding with a specific
    /// outcome).
    ///
    /// # Example
    ///
    /// ```rust
    /// use proto_promise::Promise;
    ///
    /// let length = Promise::resolved("hello").then(str::len);
    ///
    /// assert_eq!(length.wait().unwrap(), 5);
    /// ```
    #[track_caller]
    pub fn then<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_inner(None, on_resolved)
    }

    /// Like [`then()`][Self::then] but the returned promise is canceled if `token` is canceled
    /// before this promise settles.
    #[track_caller]
    pub fn then_cancelable<U, F>(self, token: &CancelationToken, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_inner(Some(token), on_resolved)
    }

    #[track_caller]
    fn then_inner<U, F>(self, token: Option<&CancelationToken>, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.continue_raw(token, move |outcome| match outcome.split() {
            Ok(value) => Step::value(signals::invoke(None, || on_resolved(value))),
            Err(failure) => Step::Settle(failure),
        })
    }

    /// Continues with the promise returned by `on_resolved`, which is adopted by the returned
    /// promise.
    #[track_caller]
    pub fn then_promise<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.then_promise_inner(None, on_resolved)
    }

    /// Like [`then_promise()`][Self::then_promise] but the returned promise is canceled if
    /// `token` is canceled before this promise settles.
    #[track_caller]
    pub fn then_promise_cancelable<U, F>(
        self,
        token: &CancelationToken,
        on_resolved: F,
    ) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.then_promise_inner(Some(token), on_resolved)
    }

    #[track_caller]
    fn then_promise_inner<U, F>(
        self,
        token: Option<&CancelationToken>,
        on_resolved: F,
    ) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.continue_raw(token, move |outcome| match outcome.split() {
            Ok(value) => Step::promise(signals::invoke(None, || on_resolved(value))),
            Err(failure) => Step::Settle(failure),
        })
    }

    /// Recovers from a rejection whose reason is of type `E`.
    ///
    /// Rejections with a reason of any other type, resolutions and cancelation are forwarded
    /// untouched. Calling [`rethrow()`][crate::rethrow] from `on_rejected` forwards the
    /// rejection as-is.
    ///
    /// # Example
    ///
    /// ```rust
    /// use proto_promise::Promise;
    ///
    /// let recovered = Promise::<i32>::rejected("broken").catch(|_reason: &str| -1);
    ///
    /// assert_eq!(recovered.wait().unwrap(), -1);
    /// ```
    #[track_caller]
    pub fn catch<E, F>(self, on_rejected: F) -> Self
    where
        E: Any + Clone,
        F: FnOnce(E) -> T + Send + 'static,
    {
        self.catch_inner(None, on_rejected)
    }

    /// Like [`catch()`][Self::catch] but the returned promise is canceled if `token` is
    /// canceled before this promise settles.
    #[track_caller]
    pub fn catch_cancelable<E, F>(self, token: &CancelationToken, on_rejected: F) -> Self
    where
        E: Any + Clone,
        F: FnOnce(E) -> T + Send + 'static,
    {
        self.catch_inner(Some(token), on_rejected)
    }

    #[track_caller]
    fn catch_inner<E, F>(self, token: Option<&CancelationToken>, on_rejected: F) -> Self
    where
        E: Any + Clone,
        F: FnOnce(E) -> T + Send + 'static,
    {
        self.continue_raw(token, move |outcome| match outcome {
            Outcome::Rejected(rejection) => {
                let reason = rejection.downcast_ref::<E>().cloned();

                match reason {
                    Some(reason) => {
                        Step::value(signals::invoke(Some(rejection), || on_rejected(reason)))
                    }
                    None => Step::Settle(Outcome::Rejected(rejection)),
                }
            }
            other => Step::Settle(other),
        })
    }

    /// Recovers from a rejection whose reason is of type `E` with a promise that the returned
    /// promise adopts.
    #[track_caller]
    pub fn catch_promise<E, F>(self, on_rejected: F) -> Self
    where
        E: Any + Clone,
        F: FnOnce(E) -> Self + Send + 'static,
    {
        self.continue_raw(None, move |outcome| match outcome {
            Outcome::Rejected(rejection) => {
                let reason = rejection.downcast_ref::<E>().cloned();

                match reason {
                    Some(reason) => {
                        Step::promise(signals::invoke(Some(rejection), || on_rejected(reason)))
                    }
                    None => Step::Settle(Outcome::Rejected(rejection)),
                }
            }
            other => Step::Settle(other),
        })
    }

    /// Recovers from a rejection with a reason of any type.
    #[track_caller]
    pub fn catch_any<F>(self, on_rejected: F) -> Self
    where
        F: FnOnce(Rejection) -> T + Send + 'static,
    {
        self.continue_raw(None, move |outcome| match outcome {
            Outcome::Rejected(rejection) => {
                let original = rejection.clone();
                Step::value(signals::invoke(Some(original), || on_rejected(rejection)))
            }
            other => Step::Settle(other),
        })
    }

    /// Recovers from cancelation. Resolutions and rejections are forwarded untouched.
    #[track_caller]
    pub fn catch_cancelation<F>(self, on_canceled: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.continue_raw(None, move |outcome| match outcome {
            Outcome::Canceled => Step::value(signals::invoke(None, on_canceled)),
            other => Step::Settle(other),
        })
    }

    /// Runs `on_settled` on whatever outcome the promise settles with.
    ///
    /// If the outcome is a rejection, it counts as handled once `on_settled` returns.
    #[track_caller]
    pub fn continue_with<U, F>(self, on_settled: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.continue_with_inner(None, on_settled)
    }

    /// Like [`continue_with()`][Self::continue_with] but the returned promise is canceled if
    /// `token` is canceled before this promise settles.
    #[track_caller]
    pub fn continue_with_cancelable<U, F>(
        self,
        token: &CancelationToken,
        on_settled: F,
    ) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.continue_with_inner(Some(token), on_settled)
    }

    #[track_caller]
    fn continue_with_inner<U, F>(self, token: Option<&CancelationToken>, on_settled: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.continue_raw(token, move |outcome| {
            let original = outcome.rejection().cloned();
            Step::value(signals::invoke(original, || on_settled(outcome)))
        })
    }

    /// Runs `on_settled` on whatever outcome the promise settles with and adopts the promise
    /// it returns.
    #[track_caller]
    pub fn continue_with_promise<U, F>(self, on_settled: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Promise<U> + Send + 'static,
    {
        self.continue_raw(None, move |outcome| {
            let original = outcome.rejection().cloned();
            Step::promise(signals::invoke(original, || on_settled(outcome)))
        })
    }

    /// Runs `on_finally` once the promise settles, then forwards the original outcome.
    ///
    /// If `on_finally` fails, its failure replaces the original outcome and an original
    /// rejection is reported as unhandled.
    #[track_caller]
    pub fn finally<F>(self, on_finally: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.continue_raw(None, move |outcome| {
            match signals::invoke::<(), T>(None, on_finally) {
                Ok(()) => Step::Settle(outcome),
                Err(failure) => {
                    drop(outcome);
                    Step::Settle(failure)
                }
            }
        })
    }

    /// Like [`finally()`][Self::finally] but the original outcome is only forwarded once the
    /// promise returned by `on_finally` has resolved.
    #[track_caller]
    pub fn finally_promise<F>(self, on_finally: F) -> Self
    where
        F: FnOnce() -> Promise<()> + Send + 'static,
    {
        self.continue_raw(None, move |outcome| {
            match signals::invoke::<Promise<()>, T>(None, on_finally) {
                Ok(cleanup) => Step::Adopt(cleanup.continue_raw(None, move |done| {
                    match done.split::<T>() {
                        Ok(()) => Step::Settle(outcome),
                        Err(failure) => {
                            drop(outcome);
                            Step::Settle(failure)
                        }
                    }
                })),
                Err(failure) => {
                    drop(outcome);
                    Step::Settle(failure)
                }
            }
        })
    }
}
