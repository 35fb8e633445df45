use std::time::Duration;

use thiserror::Error;

use crate::Rejection;

/// A programmer error: the promise API was used in a way its contract forbids.
///
/// Usage errors are never delivered through the promise chain as ordinary rejections when they
/// can be detected synchronously. Instead, the offending call panics with the error message.
/// The only exceptions are errors detected inside a continuation (e.g. a callback returning an
/// invalid promise), which reject the downstream promise with the usage error as payload.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum UsageError {
    /// The handle refers to a node that has since been disposed or reused.
    #[error("promise handle is no longer valid - it has already been awaited or forgotten")]
    InvalidHandle,

    /// A second consumer attempted to await or forget a promise that permits only one.
    #[error("promise has already been awaited or forgotten - a promise may only be consumed once")]
    AlreadyAwaited,

    /// The result of a promise was requested before the promise was settled.
    #[error("the result of a promise was requested before the promise was settled")]
    NotCompleted,

    /// A callback returned a promise that cannot be adopted.
    #[error("a callback returned a promise handle that is no longer valid")]
    InvalidReturn,

    /// `rethrow()` was used outside of a rejection handler.
    #[error("rethrow() may only be called from within a rejection handler")]
    InvalidRethrow,

    /// Continuations were scheduled on the foreground context but none is configured.
    #[error("no foreground synchronization context has been configured")]
    NoForegroundContext,

    /// A race between zero promises was requested. Such a race would never settle.
    #[error("at least one promise is required to race promises against each other")]
    EmptyInput,

    /// The deferred was already settled (e.g. canceled via its cancelation token).
    #[error("the deferred promise has already been settled")]
    AlreadySettled,
}

/// Raises a usage error at the point of misuse.
#[cold]
#[track_caller]
pub(crate) fn raise(error: UsageError) -> ! {
    panic!("{error}");
}

/// The reason a promise did not resolve, as observed by a consumer of the promise.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PromiseError {
    /// The promise was rejected with the contained reason.
    #[error("promise was rejected: {0}")]
    Rejected(Rejection),

    /// The promise was canceled.
    #[error("promise was canceled")]
    Canceled,
}

impl PromiseError {
    /// Returns the rejection reason if the promise was rejected.
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Canceled => None,
        }
    }

    /// Whether the promise was canceled rather than rejected.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// The rejection reason of a wait that did not settle within its time limit.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("the operation did not settle within {timeout:?}")]
pub struct TimeoutError {
    timeout: Duration,
}

impl TimeoutError {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The time limit that was exceeded.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// The rejection reason used when a callback panics.
///
/// The panic message is preserved if the panic payload was a string.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("callback panicked: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    pub(crate) fn new(message: String) -> Self {
        Self { message }
    }

    /// The panic message, or a placeholder if the payload was not a string.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    #[should_panic(expected = "already been awaited or forgotten")]
    fn raise_panics_with_message() {
        raise(UsageError::AlreadyAwaited);
    }

    #[test]
    fn timeout_error_reports_limit() {
        let error = TimeoutError::new(Duration::from_millis(50));

        assert_eq!(error.timeout(), Duration::from_millis(50));
        assert!(!error.to_string().is_empty());
    }

    #[test]
    fn canceled_error_has_no_rejection() {
        let error = PromiseError::Canceled;

        assert!(error.is_canceled());
        assert!(error.rejection().is_none());
    }

    #[test]
    fn thread_safety() {
        assert_impl_all!(UsageError: Send, Sync);
        assert_impl_all!(PromiseError: Send, Sync);
        assert_impl_all!(TimeoutError: Send, Sync);
        assert_impl_all!(Panicked: Send, Sync);
    }
}
