//! Fan-in of many promises into one.
//!
//! Every input is attached to a shared `MergeNode` through a pooled `PassThrough` that
//! carries the position of the input. The merge node counts down the inputs that have not yet
//! reported. The count starts out at `usize::MAX` and is only corrected to the real number of
//! inputs once all of them have been attached, so inputs that settle synchronously while the
//! rest are still being attached can never bring it to zero early.
//!
//! Independently of the count, a policy may decide to finish early (e.g. on the first failure).
//! The decision is latched so the merged promise is settled exactly once either way.

use std::iter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::raise;
use crate::node::{Node, PromiseCore, Waiter, hookup, release, settle};
use crate::promise::Repr;
use crate::{Outcome, Promise, UsageError, pool};

/// What a policy decides after an input has reported.
enum Verdict<R> {
    /// Keep waiting for more inputs.
    Pending,

    /// Settle the merged promise now. Inputs that report afterwards are ignored.
    Finish(Outcome<R>),
}

/// Records the outcome of input `index` into the aggregate.
type Report<T, S, R> = fn(&mut S, usize, Outcome<T>) -> Verdict<R>;

/// Produces the merged outcome once every input has reported without finishing early.
type Finish<S, R> = fn(S) -> Outcome<R>;

struct MergeNode<S, R> {
    core: PromiseCore<R>,

    /// Inputs that have not yet reported, offset by `usize::MAX` until all are attached.
    wait_count: AtomicUsize,
    is_complete: AtomicBool,

    /// Failures reported after completion are marked handled instead of being reported as
    /// unhandled rejections.
    suppress_late: bool,

    aggregate: Mutex<Option<S>>,
    finish: Option<Finish<S, R>>,
}

impl<S, R> Default for MergeNode<S, R> {
    fn default() -> Self {
        Self {
            core: PromiseCore::default(),
            wait_count: AtomicUsize::new(usize::MAX),
            is_complete: AtomicBool::new(false),
            suppress_late: false,
            aggregate: Mutex::new(None),
            finish: None,
        }
    }
}

impl<S, R> MergeNode<S, R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    fn acquire(aggregate: S, finish: Finish<S, R>, suppress_late: bool) -> Arc<Self> {
        pool::acquire(|node: &mut Self| {
            // The consumer and the inputs as a whole.
            node.core.prepare(2, 0);
            *node.wait_count.get_mut() = usize::MAX;
            *node.is_complete.get_mut() = false;
            node.suppress_late = suppress_late;
            *node.aggregate.get_mut() = Some(aggregate);
            node.finish = Some(finish);
        })
    }

    #[track_caller]
    fn attach<T>(self: &Arc<Self>, index: usize, promise: Promise<T>, report: Report<T, S, R>)
    where
        T: Send + 'static,
    {
        match promise.into_repr() {
            Repr::Settled(outcome) => self.report(index, outcome, report),
            Repr::Node { node: upstream, id } => {
                self.core
                    .raise_depth(upstream.core().depth().saturating_add(1));

                let relay = PassThrough::acquire(Arc::clone(self), index, report);
                hookup(upstream, id, relay);
            }
            Repr::Consumed => raise(UsageError::AlreadyAwaited),
        }
    }

    fn report<T>(self: &Arc<Self>, index: usize, outcome: Outcome<T>, report: Report<T, S, R>) {
        let mut late = None;

        let finished = if self.is_complete.load(Ordering::Acquire) {
            late = Some(outcome);
            None
        } else {
            let mut aggregate = self.aggregate.lock();

            match aggregate.as_mut() {
                Some(state) => match report(state, index, outcome) {
                    Verdict::Pending => None,
                    Verdict::Finish(merged) => {
                        self.is_complete.store(true, Ordering::Release);
                        let leftover = aggregate.take();
                        drop(aggregate);

                        // Values of inputs that reported before the finish are released here.
                        drop(leftover);
                        Some(merged)
                    }
                },
                None => {
                    late = Some(outcome);
                    None
                }
            }
        };

        if let Some(merged) = finished {
            settle(Arc::clone(self), merged);
        }

        if let Some(late) = late {
            if self.suppress_late {
                if let Some(rejection) = late.rejection() {
                    rejection.mark_handled();
                }
            }

            drop(late);
        }

        self.arrived();
    }

    fn arrived(self: &Arc<Self>) {
        if self.wait_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.all_reported();
        }
    }

    /// Called once after every input has been attached.
    fn mark_ready(self: &Arc<Self>, total: usize) {
        // Undoes the initial offset of `usize::MAX` (i.e. -1) and adds the real total.
        let correction = total.wrapping_add(1);
        let previous = self.wait_count.fetch_add(correction, Ordering::AcqRel);

        if previous.wrapping_add(correction) == 0 {
            self.all_reported();
        }
    }

    fn all_reported(self: &Arc<Self>) {
        let pending = {
            let mut aggregate = self.aggregate.lock();

            if self.is_complete.swap(true, Ordering::AcqRel) {
                None
            } else {
                aggregate.take().zip(self.finish)
            }
        };

        if let Some((state, finish)) = pending {
            settle(Arc::clone(self), finish(state));
        }

        release(Arc::clone(self));
    }
}

impl<S, R> Node for MergeNode<S, R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn core(&self) -> &PromiseCore<R> {
        &self.core
    }

    fn dispose(self: Arc<Self>) {
        self.core.retire();
        pool::repool(self);
    }
}

/// Relays the outcome of one input to the merge node, tagged with the position of the input.
struct PassThrough<T, S, R> {
    target: Mutex<Option<Relay<T, S, R>>>,
}

struct Relay<T, S, R> {
    merge: Arc<MergeNode<S, R>>,
    index: usize,
    report: Report<T, S, R>,
}

impl<T, S, R> Default for PassThrough<T, S, R> {
    fn default() -> Self {
        Self {
            target: Mutex::new(None),
        }
    }
}

impl<T, S, R> PassThrough<T, S, R>
where
    T: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    fn acquire(merge: Arc<MergeNode<S, R>>, index: usize, report: Report<T, S, R>) -> Arc<Self> {
        pool::acquire(|relay: &mut Self| {
            *relay.target.get_mut() = Some(Relay {
                merge,
                index,
                report,
            });
        })
    }
}

impl<T, S, R> Waiter<T> for PassThrough<T, S, R>
where
    T: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    fn handle(self: Arc<Self>, outcome: Outcome<T>) {
        let relay = self.target.lock().take();

        // The relay has served its purpose before the merge logic runs.
        pool::repool(self);

        if let Some(Relay {
            merge,
            index,
            report,
        }) = relay
        {
            merge.report(index, outcome, report);
        }
    }
}

/// Attaches `promises` to a new merge node and returns the merged promise.
#[track_caller]
fn merge_all<T, S, R>(
    promises: Vec<Promise<T>>,
    aggregate: S,
    report: Report<T, S, R>,
    finish: Finish<S, R>,
    suppress_late: bool,
) -> Promise<R>
where
    T: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    let node = MergeNode::acquire(aggregate, finish, suppress_late);
    let id = node.core.id();
    let total = promises.len();

    for (index, promise) in promises.into_iter().enumerate() {
        node.attach(index, promise, report);
    }

    node.mark_ready(total);

    Promise::from_node(node, id)
}

#[track_caller]
fn collect_nonempty<T, I>(promises: I) -> Vec<Promise<T>>
where
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<_> = promises.into_iter().collect();

    if promises.is_empty() {
        raise(UsageError::EmptyInput);
    }

    promises
}

/// Per-input results of a homogeneous merge, in input order.
struct Slots<V> {
    values: Vec<Option<V>>,
}

impl<V> Slots<V> {
    fn new(len: usize) -> Self {
        Self {
            values: iter::repeat_with(|| None).take(len).collect(),
        }
    }

    fn fill(&mut self, index: usize, value: V) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = Some(value);
        }
    }
}

fn report_all<T>(slots: &mut Slots<T>, index: usize, outcome: Outcome<T>) -> Verdict<Vec<T>> {
    match outcome.split() {
        Ok(value) => {
            slots.fill(index, value);
            Verdict::Pending
        }
        Err(failure) => Verdict::Finish(failure),
    }
}

fn finish_all<T>(slots: Slots<T>) -> Outcome<Vec<T>> {
    let values: Option<Vec<T>> = slots.values.into_iter().collect();

    // Every input resolved, otherwise the merge would have finished early.
    values.map_or(Outcome::Canceled, Outcome::Resolved)
}

fn report_settled<T>(
    slots: &mut Slots<Outcome<T>>,
    index: usize,
    outcome: Outcome<T>,
) -> Verdict<Vec<Outcome<T>>> {
    // The caller receives every rejection as a value and is responsible for it from here on.
    if let Some(rejection) = outcome.rejection() {
        rejection.mark_handled();
    }

    slots.fill(index, outcome);
    Verdict::Pending
}

fn finish_settled<T>(slots: Slots<Outcome<T>>) -> Outcome<Vec<Outcome<T>>> {
    Outcome::Resolved(
        slots
            .values
            .into_iter()
            .map(|outcome| outcome.unwrap_or(Outcome::Canceled))
            .collect(),
    )
}

fn report_race<T>(_: &mut (), index: usize, outcome: Outcome<T>) -> Verdict<(usize, T)> {
    Verdict::Finish(outcome.map(|value| (index, value)))
}

/// The most recent failure of a `first` merge, surfaced only if no input resolves.
///
/// Failures that end up not being surfaced are marked handled.
struct LastFailure<T> {
    failure: Option<Outcome<(usize, T)>>,
}

impl<T> Drop for LastFailure<T> {
    fn drop(&mut self) {
        if let Some(rejection) = self.failure.as_ref().and_then(Outcome::rejection) {
            rejection.mark_handled();
        }
    }
}

fn report_first<T>(
    last: &mut LastFailure<T>,
    index: usize,
    outcome: Outcome<T>,
) -> Verdict<(usize, T)> {
    match outcome.split() {
        Ok(value) => Verdict::Finish(Outcome::Resolved((index, value))),
        Err(failure) => {
            let superseded = last.failure.replace(failure);

            if let Some(rejection) = superseded.as_ref().and_then(Outcome::rejection) {
                rejection.mark_handled();
            }

            Verdict::Pending
        }
    }
}

fn finish_first<T>(mut last: LastFailure<T>) -> Outcome<(usize, T)> {
    last.failure.take().unwrap_or(Outcome::Canceled)
}

fn finish_race<T>((): ()) -> Outcome<(usize, T)> {
    // Unreachable with at least one input: every report finishes the race.
    Outcome::Canceled
}

fn without_index<T>((_, value): (usize, T)) -> T {
    value
}

impl<T> Promise<T>
where
    T: Send + 'static,
{
    /// Returns a promise that resolves with the values of all `promises`, in input order, once
    /// every one of them has resolved.
    ///
    /// If any input is rejected or canceled, the returned promise settles the same way right
    /// away, without waiting for the rest. Rejections of inputs that fail after that are
    /// reported as unhandled.
    ///
    /// An empty input resolves immediately with an empty vector.
    ///
    /// # Example
    ///
    /// ```rust
    /// use proto_promise::{Deferred, Promise};
    ///
    /// let (first, first_promise) = Deferred::new();
    /// let (second, second_promise) = Deferred::new();
    ///
    /// let all = Promise::all([first_promise, second_promise]);
    ///
    /// second.resolve(2);
    /// first.resolve(1);
    ///
    /// assert_eq!(all.wait().unwrap(), vec![1, 2]);
    /// ```
    #[track_caller]
    pub fn all<I>(promises: I) -> Promise<Vec<T>>
    where
        I: IntoIterator<Item = Self>,
    {
        let promises: Vec<_> = promises.into_iter().collect();
        let slots = Slots::new(promises.len());

        merge_all(promises, slots, report_all, finish_all, false)
    }

    /// Returns a promise that resolves with the outcomes of all `promises`, in input order,
    /// once every one of them has settled. The returned promise never fails.
    #[track_caller]
    pub fn all_settled<I>(promises: I) -> Promise<Vec<Outcome<T>>>
    where
        I: IntoIterator<Item = Self>,
    {
        let promises: Vec<_> = promises.into_iter().collect();
        let slots = Slots::new(promises.len());

        merge_all(promises, slots, report_settled, finish_settled, false)
    }

    /// Returns a promise that settles like whichever of `promises` settles first, whether it
    /// resolves, is rejected or is canceled.
    ///
    /// Rejections of the inputs that lose the race are reported as unhandled.
    ///
    /// # Panics
    ///
    /// Panics if `promises` is empty.
    #[track_caller]
    pub fn race<I>(promises: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        Self::race_with_index(promises).then(without_index)
    }

    /// Like [`race()`][Self::race] but also yields the position of the winning input.
    ///
    /// # Panics
    ///
    /// Panics if `promises` is empty.
    #[track_caller]
    pub fn race_with_index<I>(promises: I) -> Promise<(usize, T)>
    where
        I: IntoIterator<Item = Self>,
    {
        merge_all(
            collect_nonempty(promises),
            (),
            report_race,
            finish_race,
            false,
        )
    }

    /// Returns a promise that resolves like whichever of `promises` resolves first.
    ///
    /// Rejections and cancelations are ignored unless every input fails, in which case the
    /// returned promise settles like the last input to fail.
    ///
    /// # Panics
    ///
    /// Panics if `promises` is empty.
    ///
    /// # Example
    ///
    /// ```rust
    /// use proto_promise::Promise;
    ///
    /// let first = Promise::first([
    ///     Promise::rejected("unreachable mirror"),
    ///     Promise::resolved("fallback mirror"),
    /// ]);
    ///
    /// assert_eq!(first.wait().unwrap(), "fallback mirror");
    /// ```
    #[track_caller]
    pub fn first<I>(promises: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        Self::first_with_index(promises).then(without_index)
    }

    /// Like [`first()`][Self::first] but also yields the position of the winning input.
    ///
    /// # Panics
    ///
    /// Panics if `promises` is empty.
    #[track_caller]
    pub fn first_with_index<I>(promises: I) -> Promise<(usize, T)>
    where
        I: IntoIterator<Item = Self>,
    {
        merge_all(
            collect_nonempty(promises),
            LastFailure { failure: None },
            report_first,
            finish_first,
            true,
        )
    }
}

impl<A, B> Promise<(A, B)>
where
    A: Send + 'static,
    B: Send + 'static,
{
    /// Returns a promise that resolves with the values of both promises once both resolve.
    ///
    /// Fails like the first of the two to fail.
    #[track_caller]
    pub fn merge(a: Promise<A>, b: Promise<B>) -> Self {
        let node = MergeNode::acquire((None, None), finish_pair::<A, B>, false);
        let id = node.core.id();

        node.attach(0, a, |(slot, _), _, outcome| store(slot, outcome));
        node.attach(1, b, |(_, slot), _, outcome| store(slot, outcome));
        node.mark_ready(2);

        Self::from_node(node, id)
    }
}

impl<A, B, C> Promise<(A, B, C)>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    /// Returns a promise that resolves with the values of all three promises once all resolve.
    ///
    /// Fails like the first of the three to fail.
    #[track_caller]
    pub fn merge3(a: Promise<A>, b: Promise<B>, c: Promise<C>) -> Self {
        let node = MergeNode::acquire((None, None, None), finish_triple::<A, B, C>, false);
        let id = node.core.id();

        node.attach(0, a, |(slot, _, _), _, outcome| store(slot, outcome));
        node.attach(1, b, |(_, slot, _), _, outcome| store(slot, outcome));
        node.attach(2, c, |(_, _, slot), _, outcome| store(slot, outcome));
        node.mark_ready(3);

        Self::from_node(node, id)
    }
}

fn store<V, R>(slot: &mut Option<V>, outcome: Outcome<V>) -> Verdict<R> {
    match outcome.split() {
        Ok(value) => {
            *slot = Some(value);
            Verdict::Pending
        }
        Err(failure) => Verdict::Finish(failure),
    }
}

fn finish_pair<A, B>(values: (Option<A>, Option<B>)) -> Outcome<(A, B)> {
    match values {
        (Some(a), Some(b)) => Outcome::Resolved((a, b)),
        _ => Outcome::Canceled,
    }
}

fn finish_triple<A, B, C>(values: (Option<A>, Option<B>, Option<C>)) -> Outcome<(A, B, C)> {
    match values {
        (Some(a), Some(b), Some(c)) => Outcome::Resolved((a, b, c)),
        _ => Outcome::Canceled,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;
    use crate::{Deferred, PromiseError, Rejection, State};

    #[test]
    fn all_preserves_input_order() {
        let (deferreds, promises): (Vec<_>, Vec<_>) = (0..4).map(|_| Deferred::new()).unzip();

        let all = Promise::all(promises);

        for (value, deferred) in deferreds.iter().enumerate().rev() {
            assert_eq!(all.state(), State::Pending);
            deferred.resolve(value);
        }

        assert_eq!(all.wait().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn all_of_nothing_resolves_empty() {
        let all = Promise::<u8>::all(Vec::new());

        assert_eq!(all.wait().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn all_with_settled_inputs() {
        let all = Promise::all([Promise::resolved(1), Promise::resolved(2)]);

        assert_eq!(all.state(), State::Resolved);
        assert_eq!(all.wait().unwrap(), vec![1, 2]);
    }

    #[test]
    fn all_fails_on_first_failure_without_waiting() {
        let (_pending, pending_promise) = Deferred::<u8>::new();
        let (failing, failing_promise) = Deferred::new();

        let all = Promise::all([pending_promise, failing_promise]);
        failing.reject("broken");

        let error = all.wait().unwrap_err();
        assert_eq!(error.rejection().unwrap().downcast_ref::<&str>(), Some(&"broken"));
    }

    #[test]
    fn all_cancels_on_canceled_input() {
        let all = Promise::all([Promise::resolved(1), Promise::canceled()]);

        assert!(matches!(all.wait(), Err(PromiseError::Canceled)));
    }

    #[test]
    fn all_settled_collects_every_outcome() {
        let rejection = Rejection::new("nope");

        let settled = Promise::all_settled([
            Promise::resolved(1),
            Promise::rejected_with(rejection.clone()),
            Promise::canceled(),
        ])
        .wait()
        .unwrap();

        assert_eq!(settled.len(), 3);
        assert_eq!(settled.first().map(Outcome::state), Some(State::Resolved));
        assert_eq!(settled.get(1).map(Outcome::state), Some(State::Rejected));
        assert_eq!(settled.get(2).map(Outcome::state), Some(State::Canceled));
        assert!(rejection.is_handled());
    }

    #[test]
    fn race_takes_first_settled() {
        let (slow, slow_promise) = Deferred::new();
        let (fast, fast_promise) = Deferred::new();

        let race = Promise::race_with_index([slow_promise, fast_promise]);

        fast.resolve("fast");
        slow.resolve("slow");

        assert_eq!(race.wait().unwrap(), (1, "fast"));
    }

    #[test]
    fn race_settles_with_first_failure() {
        let (_pending, pending_promise) = Deferred::<u8>::new();

        let race = Promise::race([pending_promise, Promise::canceled()]);

        assert!(race.wait().unwrap_err().is_canceled());
    }

    #[test]
    #[should_panic(expected = "at least one promise")]
    fn race_of_nothing_panics() {
        _ = Promise::<u8>::race(Vec::new());
    }

    #[test]
    fn first_skips_failures() {
        let rejection = Rejection::new("first failure");
        let (winner, winner_promise) = Deferred::new();

        let first = Promise::first_with_index([
            Promise::rejected_with(rejection.clone()),
            winner_promise,
            Promise::canceled(),
        ]);

        assert_eq!(first.state(), State::Pending);
        winner.resolve(7);

        assert_eq!(first.wait().unwrap(), (1, 7));
        assert!(rejection.is_handled());
    }

    #[test]
    fn first_settles_like_last_failure() {
        let (late, late_promise) = Deferred::<u8>::new();

        let first = Promise::first([Promise::canceled(), late_promise]);
        late.reject("last");

        let error = first.wait().unwrap_err();
        assert_eq!(error.rejection().unwrap().downcast_ref::<&str>(), Some(&"last"));
    }

    #[test]
    fn merge_combines_heterogeneous_values() {
        let (text, text_promise) = Deferred::new();

        let merged = Promise::merge(text_promise, Promise::resolved(5_u64));
        text.resolve("five".to_owned());

        assert_eq!(merged.wait().unwrap(), ("five".to_owned(), 5));
    }

    #[test]
    fn merge3_fails_like_first_failure() {
        let merged = Promise::merge3(
            Promise::resolved(1_u8),
            Promise::<bool>::rejected("second"),
            Promise::resolved('c'),
        );

        let error = merged.wait().unwrap_err();
        assert!(error.rejection().unwrap().is::<&str>());
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Thread-heavy.
    fn all_settles_once_under_concurrent_inputs() {
        testing::with_watchdog(|| {
            for _ in 0..50 {
                let (deferreds, promises): (Vec<_>, Vec<_>) =
                    (0..8).map(|_| Deferred::new()).unzip();

                let all = Promise::all(promises);

                let workers: Vec<_> = deferreds
                    .into_iter()
                    .enumerate()
                    .map(|(value, deferred)| thread::spawn(move || deferred.resolve(value)))
                    .collect();

                for worker in workers {
                    worker.join().unwrap();
                }

                assert_eq!(all.wait().unwrap(), (0..8).collect::<Vec<_>>());
            }
        });
    }
}
