//! The promise node: the completion/claim protocol shared by every kind of promise.
//!
//! Each node owns a single slot that records both "who to notify when I complete" and "my own
//! completion/claim status". Registration of a waiter and completion of the node both go through
//! the slot, so whichever of the two happens second is responsible for delivering the outcome.
//! The delivery itself always happens outside of the slot lock.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::task::{Poll, Waker};

use parking_lot::Mutex;

use crate::error::raise;
use crate::retain::RetainCounter;
use crate::{Outcome, State, UsageError};

/// A shared reference to a node of any concrete type that produces a `T`.
pub(crate) type NodeRef<T> = Arc<dyn Node<Output = T>>;

/// A promise node: produces one outcome and hands it to one consumer.
pub(crate) trait Node: Send + Sync {
    type Output;

    fn core(&self) -> &PromiseCore<Self::Output>;

    /// Resets the node and returns it to its pool.
    ///
    /// Called exactly once per use of the node, by the holder that released the last retain.
    fn dispose(self: Arc<Self>);
}

/// Something that consumes the outcome of a node it is registered on.
pub(crate) trait Waiter<T>: Send + Sync + 'static {
    fn handle(self: Arc<Self>, outcome: Outcome<T>);
}

/// Wakes up a consumer that polls for the outcome rather than receiving it.
pub(crate) enum Notifier {
    Waker(Waker),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Notifier {
    pub(crate) fn notify(self) {
        match self {
            Self::Waker(waker) => waker.wake(),
            Self::Callback(callback) => callback(),
        }
    }
}

enum Slot<T> {
    /// Not completed, nobody waiting.
    Pending,

    /// Not completed, the waiter receives the outcome on completion.
    Waiting(Arc<dyn Waiter<T>>),

    /// Not completed, the consumer claims the outcome after being notified.
    Notify(Notifier),

    /// Completed, outcome not yet claimed.
    Completed(Outcome<T>),

    /// Not completed, the consumer lost interest. The outcome is dropped on completion.
    Forgotten,

    /// The outcome has been handed off. No further operations are valid.
    Claimed,
}

/// What the completing side has to do after storing its outcome.
enum Completion<T> {
    Stored,
    Deliver(Arc<dyn Waiter<T>>, Outcome<T>),
    Notify(Notifier),
    Abandoned(Outcome<T>),
}

/// The state shared by every node type.
pub(crate) struct PromiseCore<T> {
    /// Generation of the node. Incremented on every disposal, invalidating outstanding handles.
    id: AtomicU16,
    depth: AtomicU16,
    retain: RetainCounter,
    slot: Mutex<Slot<T>>,
}

impl<T> Default for PromiseCore<T> {
    fn default() -> Self {
        Self {
            id: AtomicU16::new(0),
            depth: AtomicU16::new(0),
            retain: RetainCounter::new(),
            slot: Mutex::new(Slot::Pending),
        }
    }
}

impl<T> PromiseCore<T> {
    /// Prepares the node for a new use. `retain` is the number of independent holders.
    pub(crate) fn prepare(&mut self, retain: u32, depth: u16) {
        *self.slot.get_mut() = Slot::Pending;
        *self.depth.get_mut() = depth;
        self.retain.reset(retain);
    }

    pub(crate) fn id(&self) -> u16 {
        self.id.load(Ordering::Acquire)
    }

    /// The number of continuation stages between this node and the start of its chain.
    pub(crate) fn depth(&self) -> u16 {
        self.depth.load(Ordering::Relaxed)
    }

    pub(crate) fn raise_depth(&self, depth: u16) {
        self.depth.fetch_max(depth, Ordering::Relaxed);
    }

    /// Clears the slot and invalidates all handles to the current generation.
    pub(crate) fn retire(&self) {
        let previous = mem::replace(&mut *self.slot.lock(), Slot::Pending);
        self.id.fetch_add(1, Ordering::Release);

        debug_assert!(
            matches!(previous, Slot::Claimed),
            "node retired before its outcome was claimed"
        );

        drop(previous);
    }

    #[track_caller]
    fn validate(&self, id: u16) {
        if self.id() != id {
            raise(UsageError::InvalidHandle);
        }
    }

    fn complete(&self, outcome: Outcome<T>) -> Completion<T> {
        let mut slot = self.slot.lock();

        match mem::replace(&mut *slot, Slot::Claimed) {
            Slot::Pending => {
                *slot = Slot::Completed(outcome);
                Completion::Stored
            }
            Slot::Waiting(waiter) => Completion::Deliver(waiter, outcome),
            Slot::Notify(notifier) => {
                *slot = Slot::Completed(outcome);
                Completion::Notify(notifier)
            }
            Slot::Forgotten => Completion::Abandoned(outcome),
            previous @ (Slot::Completed(_) | Slot::Claimed) => {
                *slot = previous;
                drop(slot);
                panic!("promise node completed twice - indicates a serious bug in completion logic");
            }
        }
    }

    /// Registers a waiter, or returns the outcome if the node has already completed.
    ///
    /// If an outcome is returned, the caller has claimed it and must deliver it to the waiter.
    #[track_caller]
    fn register(&self, id: u16, waiter: &Arc<dyn Waiter<T>>) -> Option<Outcome<T>> {
        self.validate(id);

        let mut slot = self.slot.lock();

        match mem::replace(&mut *slot, Slot::Claimed) {
            Slot::Pending => {
                *slot = Slot::Waiting(Arc::clone(waiter));
                None
            }
            Slot::Completed(outcome) => Some(outcome),
            previous => {
                *slot = previous;
                drop(slot);
                raise(UsageError::AlreadyAwaited);
            }
        }
    }

    /// Registers a notifier that is invoked on completion. The outcome stays in the node until
    /// claimed via `take()`.
    ///
    /// Returns the notifier back if the node has already completed.
    #[track_caller]
    pub(crate) fn register_notifier(&self, id: u16, notifier: Notifier) -> Option<Notifier> {
        self.validate(id);

        let mut slot = self.slot.lock();

        match mem::replace(&mut *slot, Slot::Claimed) {
            Slot::Pending => {
                *slot = Slot::Notify(notifier);
                None
            }
            previous @ Slot::Completed(_) => {
                *slot = previous;
                Some(notifier)
            }
            previous => {
                *slot = previous;
                drop(slot);
                raise(UsageError::AlreadyAwaited);
            }
        }
    }

    /// Polls for the outcome, registering the waker if the node has not yet completed.
    #[track_caller]
    pub(crate) fn poll(&self, id: u16, waker: &Waker) -> Poll<Outcome<T>> {
        self.validate(id);

        let mut slot = self.slot.lock();

        match mem::replace(&mut *slot, Slot::Claimed) {
            Slot::Pending => {
                *slot = Slot::Notify(Notifier::Waker(waker.clone()));
                Poll::Pending
            }
            Slot::Notify(Notifier::Waker(mut existing)) => {
                existing.clone_from(waker);
                *slot = Slot::Notify(Notifier::Waker(existing));
                Poll::Pending
            }
            Slot::Completed(outcome) => Poll::Ready(outcome),
            previous => {
                *slot = previous;
                drop(slot);
                raise(UsageError::AlreadyAwaited);
            }
        }
    }

    /// The state of the node as observed by its consumer.
    #[track_caller]
    pub(crate) fn state(&self, id: u16) -> State {
        self.validate(id);

        match &*self.slot.lock() {
            Slot::Completed(outcome) => outcome.state(),
            _ => State::Pending,
        }
    }

    /// Whether the node has completed and its outcome is waiting to be claimed.
    #[track_caller]
    pub(crate) fn is_completed(&self, id: u16) -> bool {
        self.validate(id);

        matches!(&*self.slot.lock(), Slot::Completed(_))
    }

    /// Claims the outcome of a completed node.
    #[track_caller]
    pub(crate) fn take(&self, id: u16) -> Outcome<T> {
        self.validate(id);

        let mut slot = self.slot.lock();

        match mem::replace(&mut *slot, Slot::Claimed) {
            Slot::Completed(outcome) => outcome,
            previous => {
                let error = if matches!(previous, Slot::Pending | Slot::Notify(_)) {
                    UsageError::NotCompleted
                } else {
                    UsageError::AlreadyAwaited
                };

                *slot = previous;
                drop(slot);
                raise(error);
            }
        }
    }

    /// Gives up the consumer's interest in the outcome.
    ///
    /// Returns the outcome if the node had already completed, in which case the caller has
    /// claimed it.
    #[track_caller]
    fn forget(&self, id: u16) -> Option<Outcome<T>> {
        self.validate(id);

        let mut slot = self.slot.lock();

        match mem::replace(&mut *slot, Slot::Claimed) {
            Slot::Pending => {
                *slot = Slot::Forgotten;
                None
            }
            Slot::Notify(notifier) => {
                *slot = Slot::Forgotten;
                drop(slot);
                drop(notifier);
                None
            }
            Slot::Completed(outcome) => Some(outcome),
            previous => {
                *slot = previous;
                drop(slot);
                raise(UsageError::AlreadyAwaited);
            }
        }
    }
}

/// Completes a node and hands the outcome to its consumer.
///
/// This is the single place where a node transitions out of pending.
pub(crate) fn settle<N>(node: Arc<N>, outcome: Outcome<N::Output>)
where
    N: Node + ?Sized,
    N::Output: 'static,
{
    match node.core().complete(outcome) {
        Completion::Stored => {}
        Completion::Notify(notifier) => notifier.notify(),
        Completion::Deliver(waiter, outcome) => {
            release(node);
            waiter.handle(outcome);
        }
        Completion::Abandoned(outcome) => {
            // A rejection nobody will ever see is reported as the outcome is dropped.
            drop(outcome);
            release(node);
        }
    }
}

/// Registers `waiter` as the consumer of `upstream`, delivering immediately if `upstream` has
/// already completed.
#[track_caller]
pub(crate) fn hookup<T>(upstream: NodeRef<T>, id: u16, waiter: Arc<dyn Waiter<T>>)
where
    T: Send + 'static,
{
    if let Some(outcome) = upstream.core().register(id, &waiter) {
        release(upstream);
        waiter.handle(outcome);
    }
}

/// Gives up the consumer's interest in `node`.
#[track_caller]
pub(crate) fn forget<T>(node: NodeRef<T>, id: u16) {
    if let Some(outcome) = node.core().forget(id) {
        release(node);
        drop(outcome);
    }
}

/// Releases one retain on the node, disposing of it if this was the last one.
pub(crate) fn release<N>(node: Arc<N>)
where
    N: Node + ?Sized,
{
    if node.core().retain.release() {
        node.dispose();
    }
}
