//! Control-flow signals raised from inside user callbacks.
//!
//! A callback attached to a promise communicates its outcome by returning normally (the value
//! resolves the downstream promise) or by unwinding. The unwinding payload decides the outcome:
//!
//! * [`cancel()`] and [`CancelationToken::throw_if_cancelation_requested()`] cancel the
//!   downstream promise.
//! * [`rethrow()`] rejects the downstream promise with the rejection being handled.
//! * [`reject()`] rejects the downstream promise with a new reason.
//! * Any other panic rejects the downstream promise with a [`Panicked`] reason.
//!
//! The signals are raised via [`std::panic::resume_unwind`], so no panic hook runs for them.
//! Raising a signal outside of a promise callback unwinds the calling thread like any panic.
//!
//! [`CancelationToken::throw_if_cancelation_requested()`]: crate::CancelationToken::throw_if_cancelation_requested

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::{Outcome, Rejection, UsageError};

struct CancelSignal;

struct RethrowSignal;

struct RejectSignal(Rejection);

/// Cancels the promise produced by the currently executing callback.
pub fn cancel() -> ! {
    panic::resume_unwind(Box::new(CancelSignal))
}

/// Rejects the promise produced by the currently executing rejection handler with the same
/// rejection that the handler received.
///
/// If called from a callback that is not handling a rejection, the downstream promise is
/// rejected with [`UsageError::InvalidRethrow`].
pub fn rethrow() -> ! {
    panic::resume_unwind(Box::new(RethrowSignal))
}

/// Rejects the promise produced by the currently executing callback with the given reason.
pub fn reject<E>(reason: E) -> !
where
    E: Any + Send + Sync + fmt::Debug,
{
    panic::resume_unwind(Box::new(RejectSignal(Rejection::new(reason))))
}

/// Invokes a user callback at the callback boundary.
///
/// `original` is the rejection being handled, if any. It is marked as handled unless the
/// callback rethrows it, in which case it is forwarded downstream as-is.
pub(crate) fn invoke<R, U>(
    original: Option<Rejection>,
    callback: impl FnOnce() -> R,
) -> Result<R, Outcome<U>> {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(value) => {
            if let Some(original) = original {
                original.mark_handled();
            }

            Ok(value)
        }
        Err(payload) => Err(unwind_outcome(payload, original)),
    }
}

fn unwind_outcome<U>(payload: Box<dyn Any + Send>, original: Option<Rejection>) -> Outcome<U> {
    if payload.is::<RethrowSignal>() {
        return Outcome::Rejected(
            original.unwrap_or_else(|| Rejection::new(UsageError::InvalidRethrow)),
        );
    }

    if let Some(original) = original {
        original.mark_handled();
    }

    if payload.is::<CancelSignal>() {
        return Outcome::Canceled;
    }

    match payload.downcast::<RejectSignal>() {
        Ok(signal) => Outcome::Rejected(signal.0),
        Err(payload) => Outcome::Rejected(Rejection::from_panic(&*payload)),
    }
}
