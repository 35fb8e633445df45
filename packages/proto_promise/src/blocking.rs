//! Blocking the calling thread until a promise settles.

use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::raise;
use crate::node::{Waiter, hookup};
use crate::promise::Repr;
use crate::{Outcome, Promise, PromiseError, UsageError};

const INITIAL: u8 = 0;
const WAITING: u8 = 1;
const COMPLETED: u8 = 2;

/// Most promises waited on synchronously settle quickly, so we spin briefly before parking.
const SPIN_ITERATIONS: usize = 100;

/// Receives the outcome on behalf of a thread that blocks until it arrives.
struct SyncWait<T> {
    state: AtomicU8,
    outcome: Mutex<Option<Outcome<T>>>,
    wakeup: Condvar,
}

impl<T> SyncWait<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(INITIAL),
            outcome: Mutex::new(None),
            wakeup: Condvar::new(),
        }
    }

    fn spin(&self) {
        for _ in 0..SPIN_ITERATIONS {
            if self.state.load(Ordering::Acquire) == COMPLETED {
                return;
            }

            hint::spin_loop();
        }
    }

    /// Takes the slot lock after announcing that a thread is about to block on it.
    fn lock_waiting(&self) -> MutexGuard<'_, Option<Outcome<T>>> {
        self.spin();

        let outcome = self.outcome.lock();

        // If the outcome arrived in the meantime, it is already in the slot.
        _ = self.state.compare_exchange(INITIAL, WAITING, Ordering::AcqRel, Ordering::Acquire);

        outcome
    }

    fn block(&self) -> Outcome<T> {
        let mut outcome = self.lock_waiting();

        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }

            self.wakeup.wait(&mut outcome);
        }
    }

    /// Blocks until the outcome arrives or `deadline` passes, whichever comes first.
    fn block_until(&self, deadline: Instant) -> Option<Outcome<T>> {
        let mut outcome = self.lock_waiting();

        loop {
            if let Some(outcome) = outcome.take() {
                return Some(outcome);
            }

            if self.wakeup.wait_until(&mut outcome, deadline).timed_out() {
                return outcome.take();
            }
        }
    }
}

/// A blocking wait that has been set up: either the outcome is known or a waiter receives it.
enum Blocking<T> {
    Ready(Outcome<T>),
    Registered(Arc<SyncWait<T>>),
}

impl<T> Waiter<T> for SyncWait<T>
where
    T: Send + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        *self.outcome.lock() = Some(outcome);

        if self.state.swap(COMPLETED, Ordering::AcqRel) == WAITING {
            self.wakeup.notify_one();
        }
    }
}

impl<T> Promise<T>
where
    T: Send + 'static,
{
    /// Blocks the current thread until the promise settles.
    ///
    /// Must not be called on a thread that needs to run in order for the promise to settle
    /// (e.g. the thread that pumps the foreground context the promise continues on).
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::thread;
    ///
    /// use proto_promise::Deferred;
    ///
    /// let (deferred, promise) = Deferred::<()>::new();
    ///
    /// thread::spawn(move || deferred.reject("unavailable"));
    ///
    /// let error = promise.wait().unwrap_err();
    /// assert!(error.rejection().unwrap().is::<&str>());
    /// ```
    #[track_caller]
    pub fn wait(self) -> Result<T, PromiseError> {
        match self.start_blocking() {
            Blocking::Ready(outcome) => outcome.into_result(),
            Blocking::Registered(waiter) => waiter.block().into_result(),
        }
    }

    /// Blocks the current thread until the promise settles or `timeout` elapses.
    ///
    /// Returns `None` on timeout, in which case the promise is forgotten: its outcome is
    /// dropped when it arrives.
    #[track_caller]
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T, PromiseError>> {
        // A deadline too far in the future to represent is no deadline at all.
        let deadline = Instant::now().checked_add(timeout);

        match deadline {
            Some(deadline) => match self.start_blocking() {
                Blocking::Ready(outcome) => Some(outcome.into_result()),
                Blocking::Registered(waiter) => {
                    waiter.block_until(deadline).map(Outcome::into_result)
                }
            },
            None => Some(self.wait()),
        }
    }

    #[track_caller]
    fn start_blocking(self) -> Blocking<T> {
        match self.into_repr() {
            Repr::Settled(outcome) => Blocking::Ready(outcome),
            Repr::Node { node, id } => {
                let waiter = Arc::new(SyncWait::new());
                let registered = Arc::clone(&waiter);
                hookup(node, id, registered);

                Blocking::Registered(waiter)
            }
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }
}
