//! Timers used to bound how long a promise is waited for.

use std::any::type_name;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use foldhash::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::{Deferred, Promise};

/// The callback a timer invokes once it is due.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// A scheduled one-shot callback.
pub trait Timer: Send {
    /// Cancels the timer if it has not fired yet.
    ///
    /// The returned promise resolves once the callback is guaranteed not to be running and
    /// never to run in the future. If the callback is running when this is called, that is
    /// after it returns.
    fn dispose_async(self: Box<Self>) -> Promise<()>;
}

/// Creates timers.
pub trait TimerFactory: Send + Sync {
    /// Schedules `callback` to run once `due` has elapsed.
    ///
    /// The callback must never be invoked before this returns.
    fn create_timer(&self, callback: TimerCallback, due: Duration) -> Box<dyn Timer>;
}

/// A timer factory backed by a dedicated timer thread.
///
/// The thread is started when the first timer is created. Once the factory has been dropped, the
/// thread keeps serving the timers already created and stops after the last of them has fired or
/// been disposed. All callbacks run on the timer thread, so they are expected to be short.
pub struct SystemTimerFactory {
    queue: Arc<TimerQueue>,
    started: OnceLock<()>,
}

impl SystemTimerFactory {
    /// Creates a factory whose timer thread starts on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Arc::new(TimerQueue::default()),
            started: OnceLock::new(),
        }
    }

    fn ensure_started(&self) {
        self.started.get_or_init(|| {
            let queue = Arc::clone(&self.queue);

            thread::Builder::new()
                .name("proto-promise-timer".to_owned())
                .spawn(move || {
                    debug!("timer thread started");
                    queue.run();
                    debug!("timer thread exiting");
                })
                .expect("failed to spawn timer thread: thread spawning failure is not supported");
        });
    }
}

impl Default for SystemTimerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerFactory for SystemTimerFactory {
    fn create_timer(&self, callback: TimerCallback, due: Duration) -> Box<dyn Timer> {
        self.ensure_started();

        let id = self.queue.schedule(callback, due);

        Box::new(SystemTimer {
            queue: Arc::clone(&self.queue),
            id,
        })
    }
}

impl Drop for SystemTimerFactory {
    fn drop(&mut self) {
        self.queue.shut_down();
    }
}

impl fmt::Debug for SystemTimerFactory {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("started", &self.started.get().is_some())
            .finish_non_exhaustive()
    }
}

struct SystemTimer {
    queue: Arc<TimerQueue>,
    id: u64,
}

impl Timer for SystemTimer {
    fn dispose_async(self: Box<Self>) -> Promise<()> {
        self.queue.cancel(self.id)
    }
}

/// Below this many deadlines, stale entries of disposed timers are left for the timer thread to
/// skip.
const PRUNE_THRESHOLD: usize = 64;

#[derive(Default)]
struct TimerQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

#[derive(Default)]
struct QueueState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, TimerCallback>,
    next_id: u64,

    /// The timer whose callback is executing right now.
    running: Option<u64>,

    /// Disposals that wait for the running callback to return.
    disposals: Vec<(u64, Deferred<()>)>,

    shutdown: bool,
}

impl TimerQueue {
    fn schedule(&self, callback: TimerCallback, due: Duration) -> u64 {
        let mut state = self.state.lock();

        let id = state.next_id;
        state.next_id = id.wrapping_add(1);
        state.callbacks.insert(id, callback);

        // A deadline beyond what `Instant` can represent never arrives.
        if let Some(deadline) = Instant::now().checked_add(due) {
            state.deadlines.push(Reverse((deadline, id)));
            self.changed.notify_one();
        }

        id
    }

    fn cancel(&self, id: u64) -> Promise<()> {
        let mut state = self.state.lock();

        if state.running == Some(id) {
            let (deferred, promise) = Deferred::new();
            state.disposals.push((id, deferred));
            return promise;
        }

        let callback = state.callbacks.remove(&id);
        state.prune_deadlines();

        if state.is_finished() {
            self.changed.notify_one();
        }

        drop(state);

        // The callback may own promise machinery, so it is dropped outside the lock.
        drop(callback);

        Promise::resolved(())
    }

    fn shut_down(&self) {
        self.state.lock().shutdown = true;
        self.changed.notify_one();
    }

    fn run(&self) {
        let mut state = self.state.lock();

        while !state.is_finished() {
            let next = state.deadlines.peek().copied();

            match next {
                Some(Reverse((deadline, id))) if deadline <= Instant::now() => {
                    state.deadlines.pop();

                    // Disposed timers leave their deadline behind.
                    let Some(callback) = state.callbacks.remove(&id) else {
                        continue;
                    };

                    state.running = Some(id);
                    MutexGuard::unlocked(&mut state, || invoke(callback));
                    state.running = None;

                    let (finished, waiting) = mem::take(&mut state.disposals)
                        .into_iter()
                        .partition::<Vec<_>, _>(|(disposed_id, _)| *disposed_id == id);
                    state.disposals = waiting;

                    MutexGuard::unlocked(&mut state, || {
                        for (_, deferred) in finished {
                            deferred.resolve(());
                        }
                    });
                }
                Some(Reverse((deadline, _))) => {
                    _ = self.changed.wait_until(&mut state, deadline);
                }
                None => self.changed.wait(&mut state),
            }
        }
    }
}

impl QueueState {
    /// Whether the factory is gone and no timer it created can fire anymore.
    fn is_finished(&self) -> bool {
        self.shutdown && self.callbacks.is_empty()
    }

    /// Drops the deadlines of disposed timers once they make up most of the heap.
    fn prune_deadlines(&mut self) {
        let live = self.callbacks.len();

        if self.deadlines.len() <= live.saturating_mul(2).max(PRUNE_THRESHOLD) {
            return;
        }

        let callbacks = &self.callbacks;
        self.deadlines.retain(|Reverse((_, id))| callbacks.contains_key(id));
    }
}

fn invoke(callback: TimerCallback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default();

        error!(message, "timer callback panicked");
    }
}
