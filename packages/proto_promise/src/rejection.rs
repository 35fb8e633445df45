use std::any::{self, Any};
#[cfg(debug_assertions)]
use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::diagnostics::RejectionSite;
use crate::{Panicked, config};

type Payload = Box<dyn Any + Send + Sync>;
type FormatFn = fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result;

/// The reason a promise was rejected.
///
/// The payload is an arbitrary value (not necessarily an error type). Clones share the payload
/// and share the "handled" state: once any stage of a promise chain takes responsibility for the
/// rejection, no clone of it is reported as unhandled.
///
/// If the last clone of a rejection is dropped without any stage having handled it, the rejection
/// is reported exactly once through the configured unhandled rejection handler (see
/// [`ConfigBuilder::unhandled_rejection_handler`][crate::ConfigBuilder::unhandled_rejection_handler]).
///
/// # Example
///
/// ```rust
/// use proto_promise::Rejection;
///
/// let rejection = Rejection::new("disk on fire");
///
/// assert!(rejection.is::<&str>());
/// assert_eq!(rejection.downcast_ref::<&str>(), Some(&"disk on fire"));
/// # rejection.mark_handled();
/// ```
#[derive(Clone)]
pub struct Rejection {
    inner: Arc<RejectionInner>,
}

struct RejectionInner {
    // Only `None` while the inner value is being dropped.
    payload: Option<Payload>,
    format: FormatFn,
    type_name: &'static str,
    handled: AtomicBool,
    site: RejectionSite,
}

impl Rejection {
    /// Creates a rejection with the given reason as payload.
    #[must_use]
    pub fn new<E>(reason: E) -> Self
    where
        E: Any + Send + Sync + fmt::Debug,
    {
        Self {
            inner: Arc::new(RejectionInner {
                payload: Some(Box::new(reason)),
                format: format_payload::<E>,
                type_name: any::type_name::<E>(),
                handled: AtomicBool::new(false),
                site: RejectionSite::here(),
            }),
        }
    }

    /// Creates a rejection from the payload of a caught panic.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Self::new(Panicked::new(message))
    }

    /// Whether the payload is of type `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: Any,
    {
        self.payload().is::<E>()
    }

    /// Returns a reference to the payload if it is of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Any,
    {
        self.payload().downcast_ref::<E>()
    }

    /// The type name of the payload, for diagnostic purposes.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// Whether two rejections share the same payload.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Marks the rejection as handled, suppressing the unhandled rejection report.
    ///
    /// Consumers receiving a rejection from the promise API (e.g. via [`PromiseError`]) have
    /// already observed it, so it is marked handled for them. This method is for code that
    /// creates rejections outside of a promise chain and then decides not to use them.
    ///
    /// [`PromiseError`]: crate::PromiseError
    pub fn mark_handled(&self) {
        self.inner.handled.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_handled(&self) -> bool {
        self.inner.handled.load(Ordering::Acquire)
    }

    fn payload(&self) -> &(dyn Any + Send + Sync) {
        self.inner
            .payload
            .as_deref()
            .expect("payload is only taken while the rejection is being dropped")
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejection")
            .field("type_name", &self.inner.type_name)
            .field("payload", &DebugPayload(self.payload(), self.inner.format))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.inner.format)(self.payload(), f)
    }
}

impl Error for Rejection {}

impl Drop for RejectionInner {
    fn drop(&mut self) {
        if self.handled.load(Ordering::Acquire) {
            return;
        }

        let Some(payload) = self.payload.take() else {
            return;
        };

        let unhandled = UnhandledRejection {
            payload,
            format: self.format,
            type_name: self.type_name,
            site: self.site.take(),
        };

        let handler = config::current().unhandled_rejection_handler();

        // We may be running inside an unwinding drop glue, where a second panic would abort.
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&unhandled))).is_err() {
            tracing::error!(
                type_name = unhandled.type_name,
                "unhandled rejection handler panicked"
            );
        }
    }
}

/// A rejection that was dropped without any stage of its promise chain handling it.
///
/// Delivered to the configured unhandled rejection handler.
pub struct UnhandledRejection {
    payload: Payload,
    format: FormatFn,
    type_name: &'static str,
    site: RejectionSite,
}

impl UnhandledRejection {
    /// Whether the payload is of type `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: Any,
    {
        self.payload.is::<E>()
    }

    /// Returns a reference to the payload if it is of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Any,
    {
        self.payload.downcast_ref::<E>()
    }

    /// The type name of the payload, for diagnostic purposes.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The backtrace of the site that created the rejection.
    ///
    /// Only available in debug builds. For any data to be present, `RUST_BACKTRACE=1` or
    /// `RUST_LIB_BACKTRACE=1` must be set.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        self.site.backtrace()
    }
}

impl fmt::Debug for UnhandledRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnhandledRejection")
            .field("type_name", &self.type_name)
            .field("payload", &DebugPayload(&*self.payload, self.format))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for UnhandledRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.format)(&*self.payload, f)
    }
}

/// The default unhandled rejection handler.
pub(crate) fn log_unhandled(rejection: &UnhandledRejection) {
    tracing::error!(
        type_name = rejection.type_name(),
        reason = %rejection,
        "a rejected promise was dropped without its rejection being handled"
    );
}

struct DebugPayload<'a>(&'a (dyn Any + Send + Sync), FormatFn);

impl fmt::Debug for DebugPayload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.1)(self.0, f)
    }
}

fn format_payload<E>(payload: &(dyn Any + Send + Sync), f: &mut fmt::Formatter<'_>) -> fmt::Result
where
    E: Any + fmt::Debug,
{
    match payload.downcast_ref::<E>() {
        Some(value) => fmt::Debug::fmt(value, f),
        None => f.write_str("<payload of unexpected type>"),
    }
}
