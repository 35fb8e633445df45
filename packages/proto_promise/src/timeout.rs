//! Waiting for a promise with a time limit and/or a cancelation token.
//!
//! Up to three sources race to settle a [`WaitNode`]: the upstream promise, the timer and the
//! cancelation token. A tri-state claims the win. The winner unregisters the token and disposes
//! the timer, settling the node only after the timer disposal has completed so that no timer
//! callback can still be touching the node once its consumer sees the outcome.

use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancelation::Cancelable;
use crate::continuation::Step;
use crate::error::raise;
use crate::node::{self, Node, NodeRef, PromiseCore, Waiter, hookup, release, settle};
use crate::promise::Repr;
use crate::timer::Timer;
use crate::{
    CancelationRegistration, CancelationToken, Outcome, Promise, Rejection, TimeoutError,
    TimerFactory, UsageError, config, pool,
};

/// Sources may not settle the node before setup has completed.
const INITIAL: u8 = 0;
const WAITING: u8 = 1;
const COMPLETED: u8 = 2;

struct WaitNode<T> {
    core: PromiseCore<T>,
    state: AtomicU8,
    timeout: Duration,
    timer: Mutex<Option<Box<dyn Timer>>>,
    registration: Mutex<Option<CancelationRegistration>>,
}

impl<T> Default for WaitNode<T> {
    fn default() -> Self {
        Self {
            core: PromiseCore::default(),
            state: AtomicU8::new(INITIAL),
            timeout: Duration::ZERO,
            timer: Mutex::new(None),
            registration: Mutex::new(None),
        }
    }
}

impl<T> WaitNode<T>
where
    T: Send + 'static,
{
    fn start(
        upstream: NodeRef<T>,
        upstream_id: u16,
        timer: Option<(Duration, &dyn TimerFactory)>,
        token: Option<&CancelationToken>,
    ) -> Promise<T> {
        let cancelable = token.is_some_and(CancelationToken::can_be_canceled);
        let depth = upstream.core().depth().saturating_add(1);

        let node = pool::acquire(|node: &mut Self| {
            // Consumer and upstream, plus the timer and the token if present.
            node.core.prepare(
                2 + u32::from(timer.is_some()) + u32::from(cancelable),
                depth,
            );
            *node.state.get_mut() = INITIAL;
            node.timeout = timer.map_or(Duration::ZERO, |(timeout, _)| timeout);
            *node.timer.get_mut() = None;
            *node.registration.get_mut() = None;
        });

        let id = node.core.id();

        if let Some((timeout, factory)) = timer {
            let target = Arc::clone(&node);
            let timer = factory.create_timer(Box::new(move || target.on_timeout()), timeout);
            *node.timer.lock() = Some(timer);
        }

        node.state.store(WAITING, Ordering::SeqCst);

        let waiter = Arc::clone(&node);
        hookup(upstream, upstream_id, waiter);

        if let Some(token) = token.filter(|_| cancelable) {
            let target = Arc::clone(&node);
            let registration = token.register_cancelable(target);
            *node.registration.lock() = Some(registration);

            // The winner may have looked for the registration before it was stored.
            if node.state.load(Ordering::SeqCst) == COMPLETED {
                node.unregister_token();
            }
        }

        Promise::from_node(node, id)
    }

    fn try_win(&self) -> bool {
        loop {
            match self.state.compare_exchange(
                WAITING,
                COMPLETED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(INITIAL) => hint::spin_loop(),
                Err(_) => return false,
            }
        }
    }

    fn on_timeout(self: &Arc<Self>) {
        if self.try_win() {
            let reason = TimeoutError::new(self.timeout);
            Arc::clone(self).finish(Outcome::Rejected(Rejection::new(reason)));
        }
    }

    fn finish(self: Arc<Self>, outcome: Outcome<T>) {
        self.unregister_token();

        let timer = self.timer.lock().take();

        match timer {
            None => settle(self, outcome),
            Some(timer) => timer
                .dispose_async()
                .continue_raw(None, move |_disposed| {
                    settle(Arc::clone(&self), outcome);
                    release(self);
                    Step::Settle(Outcome::Resolved(()))
                })
                .forget(),
        }
    }

    fn unregister_token(self: &Arc<Self>) {
        let registration = self.registration.lock().take();

        if registration.is_some_and(CancelationRegistration::try_unregister) {
            release(Arc::clone(self));
        }
    }
}

impl<T> Node for WaitNode<T>
where
    T: Send + 'static,
{
    type Output = T;

    fn core(&self) -> &PromiseCore<T> {
        &self.core
    }

    fn dispose(self: Arc<Self>) {
        self.core.retire();
        pool::repool(self);
    }
}

impl<T> Waiter<T> for WaitNode<T>
where
    T: Send + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        if self.try_win() {
            Arc::clone(&self).finish(outcome);
        } else {
            drop(outcome);
        }

        release(self);
    }
}

impl<T> Cancelable for WaitNode<T>
where
    T: Send + 'static,
{
    fn cancel(self: Arc<Self>) {
        if self.try_win() {
            Arc::clone(&self).finish(Outcome::Canceled);
        }

        release(self);
    }
}

impl<T> Promise<T>
where
    T: Send + 'static,
{
    /// Returns a promise that settles like this one, or rejects with a [`TimeoutError`] if this
    /// one has not settled within `timeout`.
    ///
    /// Uses the configured timer factory. A zero timeout rejects immediately unless the promise
    /// has already settled.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::time::Duration;
    ///
    /// use proto_promise::{Deferred, TimeoutError};
    ///
    /// let (_deferred, promise) = Deferred::<u32>::new();
    ///
    /// let error = promise
    ///     .with_timeout(Duration::from_millis(10))
    ///     .wait()
    ///     .unwrap_err();
    ///
    /// assert!(error.rejection().unwrap().is::<TimeoutError>());
    /// ```
    #[must_use]
    #[track_caller]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let factory = Arc::clone(config::current().timer_factory());
        self.with_timeout_using(timeout, &*factory)
    }

    /// Like [`with_timeout()`][Self::with_timeout] but creates the timer with `factory`.
    #[must_use]
    #[track_caller]
    pub fn with_timeout_using(self, timeout: Duration, factory: &dyn TimerFactory) -> Self {
        self.limit(Some((timeout, factory)), None)
    }

    /// Returns a promise that settles like this one, or is canceled if `token` is canceled
    /// first.
    ///
    /// Unlike the cancelable continuations, this does not attach a callback. The promise being
    /// waited for keeps running and its outcome is dropped if the wait is canceled.
    #[must_use]
    #[track_caller]
    pub fn wait_async_cancelable(self, token: &CancelationToken) -> Self {
        self.limit(None, Some(token))
    }

    /// Combines [`with_timeout()`][Self::with_timeout] and
    /// [`wait_async_cancelable()`][Self::wait_async_cancelable], settling on whichever of
    /// this promise, the timeout or the token comes first.
    #[must_use]
    #[track_caller]
    pub fn with_timeout_cancelable(self, timeout: Duration, token: &CancelationToken) -> Self {
        let factory = Arc::clone(config::current().timer_factory());
        self.limit(Some((timeout, &*factory)), Some(token))
    }

    #[track_caller]
    fn limit(
        self,
        timer: Option<(Duration, &dyn TimerFactory)>,
        token: Option<&CancelationToken>,
    ) -> Self {
        let (upstream, id) = match self.into_repr() {
            Repr::Settled(outcome) => return Self::from_outcome(outcome),
            Repr::Node { node, id } => (node, id),
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        };

        if upstream.core().is_completed(id) {
            return Self::from_node(upstream, id);
        }

        if token.is_some_and(CancelationToken::is_cancelation_requested) {
            node::forget(upstream, id);
            return Self::canceled();
        }

        if let Some((timeout, _)) = timer {
            if timeout.is_zero() {
                node::forget(upstream, id);
                return Self::rejected(TimeoutError::new(timeout));
            }
        }

        let token = token.filter(|token| token.can_be_canceled());

        if timer.is_none() && token.is_none() {
            return Self::from_node(upstream, id);
        }

        WaitNode::start(upstream, id, timer, token)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::mem;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;
    use crate::{CancelationSource, Deferred, State, TimerCallback};

    /// Fires its timer only when told to, so races can be driven deterministically.
    #[derive(Default)]
    struct ManualTimers {
        pending: Mutex<Vec<TimerCallback>>,
        disposed: Arc<AtomicUsize>,
    }

    impl ManualTimers {
        fn fire_all(&self) {
            let callbacks = mem::take(&mut *self.pending.lock());

            for callback in callbacks {
                callback();
            }
        }
    }

    struct ManualTimer {
        disposed: Arc<AtomicUsize>,
    }

    impl Timer for ManualTimer {
        fn dispose_async(self: Box<Self>) -> Promise<()> {
            self.disposed.fetch_add(1, Ordering::Relaxed);
            Promise::resolved(())
        }
    }

    impl TimerFactory for ManualTimers {
        fn create_timer(&self, callback: TimerCallback, _due: Duration) -> Box<dyn Timer> {
            self.pending.lock().push(callback);

            Box::new(ManualTimer {
                disposed: Arc::clone(&self.disposed),
            })
        }
    }

    #[test]
    fn settled_promise_ignores_timeout() {
        let timers = ManualTimers::default();

        let promise = Promise::resolved(1).with_timeout_using(Duration::ZERO, &timers);

        assert_eq!(promise.wait().unwrap(), 1);
        assert_eq!(timers.pending.lock().len(), 0);
    }

    #[test]
    fn zero_timeout_rejects_pending_promise() {
        let (_deferred, promise) = Deferred::<u8>::new();

        let error = promise
            .with_timeout_using(Duration::ZERO, &ManualTimers::default())
            .wait()
            .unwrap_err();

        let timeout = error.rejection().unwrap().downcast_ref::<TimeoutError>().unwrap();
        assert_eq!(timeout.timeout(), Duration::ZERO);
    }

    #[test]
    fn upstream_first_disposes_timer() {
        let timers = ManualTimers::default();
        let (deferred, promise) = Deferred::new();

        let limited = promise.with_timeout_using(Duration::from_secs(1), &timers);
        assert_eq!(limited.state(), State::Pending);

        deferred.resolve(5);
        assert_eq!(limited.wait().unwrap(), 5);
        assert_eq!(timers.disposed.load(Ordering::Relaxed), 1);

        // A late timer callback loses the race and changes nothing.
        timers.fire_all();
    }

    #[test]
    fn timer_first_rejects() {
        let timers = ManualTimers::default();
        let (deferred, promise) = Deferred::<u8>::new();

        let limited = promise.with_timeout_using(Duration::from_millis(50), &timers);

        timers.fire_all();
        assert_eq!(timers.disposed.load(Ordering::Relaxed), 1);

        let error = limited.wait().unwrap_err();
        let timeout = error.rejection().unwrap().downcast_ref::<TimeoutError>().unwrap();
        assert_eq!(timeout.timeout(), Duration::from_millis(50));

        // The upstream still completes, its outcome is dropped.
        deferred.resolve(1);
    }

    #[test]
    fn token_cancels_wait() {
        let source = CancelationSource::new();
        let (deferred, promise) = Deferred::<u8>::new();

        let waited = promise.wait_async_cancelable(&source.token());
        source.cancel();

        assert!(waited.wait().unwrap_err().is_canceled());
        deferred.resolve(1);
    }

    #[test]
    fn canceled_token_cancels_immediately() {
        let (_deferred, promise) = Deferred::<u8>::new();

        let waited = promise.wait_async_cancelable(&CancelationToken::canceled());

        assert_eq!(waited.state(), State::Canceled);
    }

    #[test]
    fn upstream_beats_token() {
        let source = CancelationSource::new();
        let (deferred, promise) = Deferred::new();

        let waited = promise.wait_async_cancelable(&source.token());
        deferred.resolve(2);
        source.cancel();

        assert_eq!(waited.wait().unwrap(), 2);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Thread-heavy.
    fn all_sources_race() {
        testing::with_watchdog(|| {
            for _ in 0..100 {
                let timers = Arc::new(ManualTimers::default());
                let source = CancelationSource::new();
                let (deferred, promise) = Deferred::<u8>::new();

                let limited = promise.limit(
                    Some((Duration::from_secs(1), &*timers)),
                    Some(&source.token()),
                );

                let timer_thread = {
                    let timers = Arc::clone(&timers);
                    thread::spawn(move || timers.fire_all())
                };
                let settle_thread = thread::spawn(move || deferred.resolve(1));
                source.cancel();

                timer_thread.join().unwrap();
                settle_thread.join().unwrap();

                let state = match limited.wait() {
                    Ok(_) => State::Resolved,
                    Err(error) if error.is_canceled() => State::Canceled,
                    Err(_) => State::Rejected,
                };
                assert_ne!(state, State::Pending);
                assert_eq!(timers.disposed.load(Ordering::Relaxed), 1);
            }
        });
    }
}
