//! Moving the continuation of a promise onto a synchronization context.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{PostedTask, Runnable};
use crate::error::raise;
use crate::node::{Node, PromiseCore, Waiter, hookup, settle};
use crate::promise::Repr;
use crate::{Outcome, Promise, SynchronizationContext, UsageError, config, pool};

/// Where the continuations of a promise run.
#[derive(Clone)]
#[non_exhaustive]
pub enum SynchronizationOption {
    /// On whichever thread settles the promise.
    Synchronous,

    /// On the configured foreground context.
    Foreground,

    /// On the configured background context.
    Background,

    /// On the given context.
    Explicit(Arc<dyn SynchronizationContext>),
}

impl SynchronizationOption {
    /// The context to schedule onto, `None` for synchronous execution.
    #[track_caller]
    fn resolve(&self) -> Option<Arc<dyn SynchronizationContext>> {
        match self {
            Self::Synchronous => None,
            Self::Foreground => match config::current().foreground_context() {
                Some(context) => Some(Arc::clone(context)),
                None => raise(UsageError::NoForegroundContext),
            },
            Self::Background => Some(Arc::clone(config::current().background_context())),
            Self::Explicit(context) => Some(Arc::clone(context)),
        }
    }
}

impl fmt::Debug for SynchronizationOption {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synchronous => f.write_str("Synchronous"),
            Self::Foreground => f.write_str("Foreground"),
            Self::Background => f.write_str("Background"),
            Self::Explicit(_) => f.write_str("Explicit(..)"),
        }
    }
}

/// A node that settles with the outcome of its upstream, but only on its target context.
struct SwitchNode<T> {
    core: PromiseCore<T>,
    context: Mutex<Option<Arc<dyn SynchronizationContext>>>,
    forced: bool,
    outcome: Mutex<Option<Outcome<T>>>,
}

impl<T> Default for SwitchNode<T> {
    fn default() -> Self {
        Self {
            core: PromiseCore::default(),
            context: Mutex::new(None),
            forced: false,
            outcome: Mutex::new(None),
        }
    }
}

impl<T> SwitchNode<T>
where
    T: Send + 'static,
{
    fn acquire(context: Arc<dyn SynchronizationContext>, forced: bool, depth: u16) -> Arc<Self> {
        pool::acquire(|node: &mut Self| {
            node.core.prepare(1, depth);
            *node.context.get_mut() = Some(context);
            node.forced = forced;
        })
    }
}

impl<T> Node for SwitchNode<T>
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

impl<T> Waiter<T> for SwitchNode<T>
where
    T: Send + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let context = self.context.lock().take();

        match context {
            Some(context) if self.forced || !context.is_current() => {
                *self.outcome.lock() = Some(outcome);
                context.post(PostedTask::from_runnable(self));
            }
            _ => settle(self, outcome),
        }
    }
}

impl<T> Runnable for SwitchNode<T>
where
    T: Send + 'static,
{
    fn run(self: Arc<Self>) {
        let outcome = self.outcome.lock().take();

        if let Some(outcome) = outcome {
            settle(self, outcome);
        }
    }
}

impl<T> Promise<T>
where
    T: Send + 'static,
{
    /// Returns a promise that settles with the same outcome as this one, but on the context
    /// selected by `option`.
    ///
    /// If the outcome arrives while already running on the target context, the returned promise
    /// settles inline. Use [`wait_async_forced()`][Self::wait_async_forced] to always post.
    ///
    /// # Panics
    ///
    /// Panics if `option` is [`SynchronizationOption::Foreground`] and no foreground context
    /// has been configured.
    #[must_use]
    #[track_caller]
    pub fn wait_async(self, option: SynchronizationOption) -> Self {
        self.switch_context(&option, false)
    }

    /// Like [`wait_async()`][Self::wait_async] but always posts to the target context, even if
    /// already running on it.
    #[must_use]
    #[track_caller]
    pub fn wait_async_forced(self, option: SynchronizationOption) -> Self {
        self.switch_context(&option, true)
    }

    /// Runs `f` on the context selected by `option`, resolving the returned promise with its
    /// result.
    ///
    /// # Example
    ///
    /// ```rust
    /// use proto_promise::{Promise, SynchronizationOption};
    ///
    /// let promise = Promise::run(SynchronizationOption::Background, || 6 * 7);
    ///
    /// assert_eq!(promise.wait().unwrap(), 42);
    /// ```
    #[track_caller]
    pub fn run<F>(option: SynchronizationOption, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Promise::<()>::switch_to(option).then(move |()| f())
    }

    /// Runs `f` on the context selected by `option` and adopts the promise it returns.
    #[track_caller]
    pub fn run_promise<F>(option: SynchronizationOption, f: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Promise::<()>::switch_to(option).then_promise(move |()| f())
    }

    #[track_caller]
    fn switch_context(self, option: &SynchronizationOption, forced: bool) -> Self {
        let Some(context) = option.resolve() else {
            return self;
        };

        match self.into_repr() {
            Repr::Settled(outcome) => {
                if !forced && context.is_current() {
                    return Self::from_outcome(outcome);
                }

                let node = SwitchNode::acquire(context, forced, 1);
                let consumer = Arc::clone(&node);
                let promise = Self::from_node(consumer, node.core.id());
                node.handle(outcome);
                promise
            }
            Repr::Node { node: upstream, id } => {
                let depth = upstream.core().depth().saturating_add(1);
                let node = SwitchNode::acquire(context, forced, depth);
                let node_id = node.core.id();

                let waiter = Arc::clone(&node);
                hookup(upstream, id, waiter);

                Self::from_node(node, node_id)
            }
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }
}

impl Promise<()> {
    /// Returns a promise that resolves on the context selected by `option`.
    ///
    /// Continuations attached to the returned promise start out running on that context.
    #[must_use]
    #[track_caller]
    pub fn switch_to(option: SynchronizationOption) -> Self {
        Self::resolved(()).switch_context(&option, true)
    }
}
