//! Cooperative cancelation: sources, tokens and registrations.
//!
//! A [`CancelationSource`] owns the right to cancel. It hands out any number of
//! [`CancelationToken`]s, which observers use to check for cancelation or to register callbacks
//! that run when cancelation is requested.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::signals;

const ACTIVE: u8 = 0;
const CANCELED: u8 = 1;
const DISPOSED: u8 = 2;

/// Something inside the runtime that reacts to cancelation being requested.
pub(crate) trait Cancelable: Send + Sync + 'static {
    fn cancel(self: Arc<Self>);
}

enum Callback {
    Boxed(Box<dyn FnOnce() + Send>),
    Node(Arc<dyn Cancelable>),
}

impl Callback {
    fn invoke(self) {
        match self {
            Self::Boxed(callback) => callback(),
            Self::Node(node) => node.cancel(),
        }
    }
}

struct Shared {
    status: AtomicU8,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    // Keyed by registration order.
    callbacks: BTreeMap<u64, Callback>,
    next_id: u64,

    // Registrations on the tokens a linked source follows.
    links: Vec<CancelationRegistration>,
}

static ALREADY_CANCELED: LazyLock<Arc<Shared>> = LazyLock::new(|| Arc::new(Shared::new(CANCELED)));

impl Shared {
    fn new(status: u8) -> Self {
        Self {
            status: AtomicU8::new(status),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    fn register(self: &Arc<Self>, callback: Callback) -> CancelationRegistration {
        let mut inner = self.inner.lock();

        match self.status() {
            ACTIVE => {
                let id = inner.next_id;
                inner.next_id = id.wrapping_add(1);
                inner.callbacks.insert(id, callback);

                CancelationRegistration {
                    kind: RegistrationKind::Live {
                        source: Arc::clone(self),
                        id,
                    },
                }
            }
            CANCELED => {
                drop(inner);
                callback.invoke();

                CancelationRegistration {
                    kind: RegistrationKind::Invoked,
                }
            }
            _ => CancelationRegistration {
                kind: RegistrationKind::Empty,
            },
        }
    }

    fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();

        if self.status() != ACTIVE {
            return false;
        }

        self.status.store(CANCELED, Ordering::Release);

        let callbacks = mem::take(&mut inner.callbacks);
        let links = mem::take(&mut inner.links);
        drop(inner);

        for link in links {
            _ = link.try_unregister();
        }

        let mut first_panic = None;

        for (_, callback) in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback.invoke())) {
                warn!("cancelation callback panicked");
                first_panic.get_or_insert(payload);
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }

        true
    }

    fn dispose(&self) {
        let mut inner = self.inner.lock();

        if self.status() != ACTIVE {
            return;
        }

        self.status.store(DISPOSED, Ordering::Release);

        let callbacks = mem::take(&mut inner.callbacks);
        let links = mem::take(&mut inner.links);
        drop(inner);

        for link in links {
            _ = link.try_unregister();
        }

        // Discarded without being invoked. Registrations report this as a successful unregister.
        drop(callbacks);
    }

    fn unregister(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();

        let removed = inner.callbacks.remove(&id);
        let won = removed.is_some() || self.status() == DISPOSED;
        drop(inner);

        drop(removed);
        won
    }
}

/// The owner of the right to request cancelation.
///
/// Dropping a source without canceling it disposes it: its tokens can no longer be canceled and
/// callbacks registered on them are discarded without being invoked.
///
/// # Example
///
/// ```rust
/// use proto_promise::{CancelationSource, Deferred};
///
/// let source = CancelationSource::new();
/// let (_deferred, promise) = Deferred::<u32>::new_cancelable(&source.token());
///
/// source.cancel();
///
/// assert!(promise.wait().unwrap_err().is_canceled());
/// ```
pub struct CancelationSource {
    shared: Arc<Shared>,
}

impl CancelationSource {
    /// Creates a new source that has not been canceled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(ACTIVE)),
        }
    }

    /// Creates a new source that is canceled as soon as any of the given tokens is canceled.
    ///
    /// If any of the tokens is already canceled, the new source starts out canceled.
    #[must_use]
    pub fn new_linked(tokens: &[CancelationToken]) -> Self {
        let source = Self::new();

        for token in tokens {
            let target = Arc::downgrade(&source.shared);
            let registration = token.register(move || cancel_linked(&target));

            let mut inner = source.shared.inner.lock();

            if source.shared.status() == ACTIVE {
                inner.links.push(registration);
            } else {
                drop(inner);
                _ = registration.try_unregister();
            }
        }

        source
    }

    /// Returns a token that observes this source.
    #[must_use]
    pub fn token(&self) -> CancelationToken {
        CancelationToken {
            source: Some(Arc::clone(&self.shared)),
        }
    }

    /// Requests cancelation. Does nothing if cancelation was already requested.
    ///
    /// Registered callbacks run synchronously on the calling thread, in registration order.
    ///
    /// # Panics
    ///
    /// If any callback panics, the remaining callbacks still run and the first panic is then
    /// resumed on the calling thread.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Requests cancelation, returning whether this call was the one that canceled the source.
    ///
    /// # Panics
    ///
    /// If any callback panics, the remaining callbacks still run and the first panic is then
    /// resumed on the calling thread.
    pub fn try_cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Whether cancelation has been requested.
    #[must_use]
    pub fn is_cancelation_requested(&self) -> bool {
        self.shared.status() == CANCELED
    }
}

impl Default for CancelationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelationSource {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for CancelationSource {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("is_cancelation_requested", &self.is_cancelation_requested())
            .finish_non_exhaustive()
    }
}

fn cancel_linked(target: &Weak<Shared>) {
    if let Some(shared) = target.upgrade() {
        shared.cancel();
    }
}

/// Observes a [`CancelationSource`].
///
/// Tokens are cheap to clone. A default token (see [`CancelationToken::none()`]) can never be
/// canceled.
#[derive(Clone, Default)]
pub struct CancelationToken {
    source: Option<Arc<Shared>>,
}

impl CancelationToken {
    /// A token that can never be canceled.
    #[must_use]
    pub fn none() -> Self {
        Self { source: None }
    }

    /// A token that is already canceled.
    #[must_use]
    pub fn canceled() -> Self {
        Self {
            source: Some(Arc::clone(&ALREADY_CANCELED)),
        }
    }

    /// Whether cancelation has been requested.
    #[must_use]
    pub fn is_cancelation_requested(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|source| source.status() == CANCELED)
    }

    /// Whether the token is or may in the future be canceled.
    #[must_use]
    pub fn can_be_canceled(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|source| source.status() != DISPOSED)
    }

    /// Registers a callback to run when cancelation is requested.
    ///
    /// If cancelation has already been requested, the callback runs synchronously before this
    /// method returns. If the token can never be canceled, the callback is dropped.
    pub fn register<F>(&self, callback: F) -> CancelationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_callback(Callback::Boxed(Box::new(callback)))
    }

    /// Cancels the promise produced by the currently executing callback if cancelation has been
    /// requested.
    ///
    /// Intended for use inside promise callbacks. See [`cancel()`][crate::cancel].
    pub fn throw_if_cancelation_requested(&self) {
        if self.is_cancelation_requested() {
            signals::cancel();
        }
    }

    pub(crate) fn register_cancelable(
        &self,
        target: Arc<dyn Cancelable>,
    ) -> CancelationRegistration {
        self.register_callback(Callback::Node(target))
    }

    fn register_callback(&self, callback: Callback) -> CancelationRegistration {
        match &self.source {
            Some(source) => source.register(callback),
            None => CancelationRegistration {
                kind: RegistrationKind::Empty,
            },
        }
    }
}

impl fmt::Debug for CancelationToken {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("can_be_canceled", &self.can_be_canceled())
            .field("is_cancelation_requested", &self.is_cancelation_requested())
            .finish()
    }
}

enum RegistrationKind {
    /// The callback will never run.
    Empty,

    /// The callback already ran during registration.
    Invoked,

    Live { source: Arc<Shared>, id: u64 },
}

/// A callback registered on a [`CancelationToken`].
///
/// Dropping the registration does not unregister the callback.
pub struct CancelationRegistration {
    kind: RegistrationKind,
}

impl CancelationRegistration {
    /// Attempts to unregister the callback.
    ///
    /// Returns `true` if the callback is guaranteed never to run: it was removed before
    /// cancelation started invoking it, or it was discarded by the disposal of its source.
    /// Returns `false` if the callback has run, is running or is about to run.
    #[must_use]
    pub fn try_unregister(self) -> bool {
        match self.kind {
            RegistrationKind::Empty => true,
            RegistrationKind::Invoked => false,
            RegistrationKind::Live { source, id } => source.unregister(id),
        }
    }
}

impl fmt::Debug for CancelationRegistration {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            RegistrationKind::Empty => "empty",
            RegistrationKind::Invoked => "invoked",
            RegistrationKind::Live { .. } => "live",
        };

        f.debug_struct(type_name::<Self>())
            .field("kind", &kind)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn callbacks_run_in_registration_order() {
        let source = CancelationSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            drop(token.register(move || order.lock().push(i)));
        }

        assert!(!token.is_cancelation_requested());
        assert!(source.try_cancel());
        assert!(token.is_cancelation_requested());
        assert!(!source.try_cancel());

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn register_after_cancel_runs_inline() {
        let source = CancelationSource::new();
        source.cancel();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let registration = source.token().register(move || flag.store(true, Ordering::Relaxed));

        assert!(ran.load(Ordering::Relaxed));
        assert!(!registration.try_unregister());
    }

    #[test]
    fn unregister_prevents_invocation() {
        let source = CancelationSource::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let registration = source.token().register(move || flag.store(true, Ordering::Relaxed));
        assert!(registration.try_unregister());

        source.cancel();
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[test]
    fn unregister_after_invocation_fails() {
        let source = CancelationSource::new();
        let registration = source.token().register(|| {});

        source.cancel();

        assert!(!registration.try_unregister());
    }

    #[test]
    fn disposed_source_discards_callbacks() {
        let source = CancelationSource::new();
        let token = source.token();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let registration = token.register(move || flag.store(true, Ordering::Relaxed));
        assert!(token.can_be_canceled());

        drop(source);

        assert!(!token.can_be_canceled());
        assert!(!token.is_cancelation_requested());
        assert!(registration.try_unregister());
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[test]
    fn none_token_never_fires() {
        let token = CancelationToken::none();

        assert!(!token.can_be_canceled());
        assert!(!token.is_cancelation_requested());
        assert!(token.register(|| panic!("must not run")).try_unregister());
    }

    #[test]
    fn canceled_token_is_canceled() {
        let token = CancelationToken::canceled();

        assert!(token.can_be_canceled());
        assert!(token.is_cancelation_requested());
    }

    #[test]
    fn linked_source_follows_parents() {
        let parent_a = CancelationSource::new();
        let parent_b = CancelationSource::new();
        let linked = CancelationSource::new_linked(&[parent_a.token(), parent_b.token()]);

        assert!(!linked.is_cancelation_requested());

        parent_b.cancel();

        assert!(linked.is_cancelation_requested());
        assert!(!parent_a.is_cancelation_requested());
    }

    #[test]
    fn linked_to_canceled_starts_canceled() {
        let linked = CancelationSource::new_linked(&[CancelationToken::canceled()]);

        assert!(linked.is_cancelation_requested());
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let source = CancelationSource::new();
        let token = source.token();
        let ran = Arc::new(AtomicUsize::new(0));

        drop(token.register(|| panic!("first")));

        let counter = Arc::clone(&ran);
        drop(token.register(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        let result = panic::catch_unwind(AssertUnwindSafe(|| source.cancel()));

        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert!(source.is_cancelation_requested());
    }

    #[test]
    fn throw_if_cancelation_requested_unwinds() {
        let source = CancelationSource::new();
        let token = source.token();

        token.throw_if_cancelation_requested();

        source.cancel();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            token.throw_if_cancelation_requested();
        }));
        assert!(result.is_err());
    }

    #[test]
    fn thread_safety() {
        assert_impl_all!(CancelationSource: Send, Sync);
        assert_impl_all!(CancelationToken: Send, Sync);
        assert_impl_all!(CancelationRegistration: Send, Sync);
    }
}
