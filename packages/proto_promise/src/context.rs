//! Synchronization contexts: the places continuations can be scheduled onto.

use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crossbeam::queue::SegQueue;
use futures::executor::ThreadPool;
use tracing::{debug, trace};

/// Runs posted work somewhere, e.g. on a UI thread, a game loop or a thread pool.
///
/// The promise runtime posts a task whenever a continuation has to be moved onto the context.
/// Every posted task must eventually be run exactly once. A task dropped without running leaves
/// the promise waiting on it pending forever.
pub trait SynchronizationContext: Send + Sync + 'static {
    /// Schedules `task` to run on the context.
    fn post(&self, task: PostedTask);

    /// Whether the calling thread is currently running work of this context.
    ///
    /// If so, continuations that are not explicitly forced to be posted run inline.
    fn is_current(&self) -> bool {
        false
    }
}

/// Work owned by the promise runtime that does not need a separate allocation to be posted.
pub(crate) trait Runnable: Send + Sync + 'static {
    fn run(self: Arc<Self>);
}

/// A unit of work posted to a [`SynchronizationContext`].
pub struct PostedTask {
    kind: TaskKind,
}

enum TaskKind {
    Node(Arc<dyn Runnable>),
    Boxed(Box<dyn FnOnce() + Send>),
}

impl PostedTask {
    /// Wraps a closure so it can be posted to a context.
    #[must_use]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            kind: TaskKind::Boxed(Box::new(f)),
        }
    }

    pub(crate) fn from_runnable(runnable: Arc<dyn Runnable>) -> Self {
        Self {
            kind: TaskKind::Node(runnable),
        }
    }

    /// Runs the task on the current thread.
    pub fn run(self) {
        match self.kind {
            TaskKind::Node(runnable) => runnable.run(),
            TaskKind::Boxed(f) => f(),
        }
    }
}

impl fmt::Debug for PostedTask {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TaskKind::Node(_) => "node",
            TaskKind::Boxed(_) => "boxed",
        };

        f.debug_struct(type_name::<Self>())
            .field("kind", &kind)
            .finish()
    }
}

/// A context whose tasks are run when its owner explicitly asks for them to run.
///
/// This is the model of a foreground thread such as a game loop: other threads post work and
/// the owning thread drains the queue once per iteration via [`execute()`][Self::execute].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use proto_promise::{ManualSynchronizationContext, Promise, SynchronizationOption};
///
/// let context = Arc::new(ManualSynchronizationContext::new());
///
/// let promise = Promise::resolved(5)
///     .wait_async_forced(SynchronizationOption::Explicit(context.clone()))
///     .then(|value| value + 1);
///
/// assert_eq!(context.execute(), 1);
/// assert_eq!(promise.wait().unwrap(), 6);
/// ```
pub struct ManualSynchronizationContext {
    queue: SegQueue<PostedTask>,
    owner: ThreadId,
}

impl ManualSynchronizationContext {
    /// Creates a context owned by the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            owner: thread::current().id(),
        }
    }

    /// Runs the tasks that were posted before this call, returning how many ran.
    ///
    /// Tasks posted while executing run on the next call.
    pub fn execute(&self) -> usize {
        let pending = self.queue.len();
        let mut executed: usize = 0;

        for _ in 0..pending {
            let Some(task) = self.queue.pop() else {
                break;
            };

            task.run();
            executed = executed.wrapping_add(1);
        }

        trace!(executed, "executed posted tasks");

        executed
    }

    /// The number of tasks waiting to be executed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }
}

impl Default for ManualSynchronizationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SynchronizationContext for ManualSynchronizationContext {
    fn post(&self, task: PostedTask) {
        self.queue.push(task);
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }
}

impl fmt::Debug for ManualSynchronizationContext {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pending_count", &self.pending_count())
            .field("owner", &self.owner)
            .finish()
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The ID of the `ThreadPoolContext` that owns the current thread, 0 if none.
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

/// A context that runs tasks on a pool of background threads.
///
/// The threads are started when the first task is posted.
pub struct ThreadPoolContext {
    id: u64,
    pool: OnceLock<ThreadPool>,
}

impl ThreadPoolContext {
    /// Creates a context whose thread pool starts on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            pool: OnceLock::new(),
        }
    }

    fn pool(&self) -> &ThreadPool {
        self.pool.get_or_init(|| {
            let pool_id = self.id;

            debug!(pool_id, "starting background thread pool");

            ThreadPool::builder()
                .name_prefix(format!("proto-promise-{pool_id}-"))
                .after_start(move |worker_index| {
                    CURRENT_POOL.set(pool_id);
                    debug!(pool_id, worker_index, "background thread started");
                })
                .create()
                .expect("failed to start background thread pool: thread spawning failure is not supported")
        })
    }
}

impl Default for ThreadPoolContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SynchronizationContext for ThreadPoolContext {
    fn post(&self, task: PostedTask) {
        self.pool().spawn_ok(async move { task.run() });
    }

    fn is_current(&self) -> bool {
        CURRENT_POOL.get() == self.id
    }
}

impl fmt::Debug for ThreadPoolContext {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("started", &self.pool.get().is_some())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::mpsc;
    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn manual_context_runs_on_execute() {
        let context = ManualSynchronizationContext::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            context.post(PostedTask::new(move || {
                runs.fetch_add(1, Ordering::Relaxed);
            }));
        }

        assert_eq!(context.pending_count(), 3);
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        assert_eq!(context.execute(), 3);
        assert_eq!(runs.load(Ordering::Relaxed), 3);
        assert_eq!(context.execute(), 0);
    }

    #[test]
    fn reposted_task_runs_next_time() {
        let context = Arc::new(ManualSynchronizationContext::new());

        let inner = Arc::clone(&context);
        context.post(PostedTask::new(move || {
            inner.post(PostedTask::new(|| {}));
        }));

        assert_eq!(context.execute(), 1);
        assert_eq!(context.execute(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Thread-heavy.
    fn manual_context_is_current_only_on_owner() {
        testing::with_watchdog(|| {
            let context = Arc::new(ManualSynchronizationContext::new());
            assert!(context.is_current());

            let remote = Arc::clone(&context);
            let on_other_thread = thread::spawn(move || remote.is_current()).join().unwrap();
            assert!(!on_other_thread);
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Thread-heavy.
    fn thread_pool_runs_on_own_threads() {
        testing::with_watchdog(|| {
            let context = Arc::new(ThreadPoolContext::new());
            assert!(!context.is_current());

            let (sender, receiver) = mpsc::channel();
            let remote = Arc::clone(&context);

            context.post(PostedTask::new(move || {
                sender.send(remote.is_current()).unwrap();
            }));

            assert!(receiver.recv().unwrap());
        });
    }

    #[test]
    fn thread_safety() {
        assert_impl_all!(PostedTask: Send);
        assert_impl_all!(ManualSynchronizationContext: Send, Sync);
        assert_impl_all!(ThreadPoolContext: Send, Sync);
    }
}
