use crate::{PromiseError, Rejection};

/// The state of a promise.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum State {
    /// The promise has not yet been settled.
    Pending,

    /// The promise was resolved with a value.
    Resolved,

    /// The promise was rejected with a reason.
    Rejected,

    /// The promise was canceled.
    Canceled,
}

/// The terminal result of a promise.
///
/// Unlike `Result`, an outcome distinguishes between "something went wrong" ([`Rejected`]) and
/// "the operation was explicitly canceled" ([`Canceled`]), which carries no payload.
///
/// [`Rejected`]: Outcome::Rejected
/// [`Canceled`]: Outcome::Canceled
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Outcome<T> {
    /// The promise was resolved with a value.
    Resolved(T),

    /// The promise was rejected with a reason.
    Rejected(Rejection),

    /// The promise was canceled.
    Canceled,
}

impl<T> Outcome<T> {
    /// The terminal state this outcome represents.
    #[must_use]
    pub fn state(&self) -> State {
        match self {
            Self::Resolved(_) => State::Resolved,
            Self::Rejected(_) => State::Rejected,
            Self::Canceled => State::Canceled,
        }
    }

    /// Whether the outcome is a resolved value.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// The rejection reason, if the outcome is a rejection.
    ///
    /// Inspecting a rejection through this method does not mark it as handled.
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Transforms the resolved value, passing rejections and cancelation through unchanged.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Resolved(value) => Outcome::Resolved(f(value)),
            Self::Rejected(rejection) => Outcome::Rejected(rejection),
            Self::Canceled => Outcome::Canceled,
        }
    }

    /// Converts the outcome into a `Result`, taking responsibility for any rejection.
    ///
    /// A rejection returned from here is marked as handled and will not be reported as
    /// unhandled when dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the outcome is a rejection or a cancelation.
    pub fn into_result(self) -> Result<T, PromiseError> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Rejected(rejection) => {
                rejection.mark_handled();
                Err(PromiseError::Rejected(rejection))
            }
            Self::Canceled => Err(PromiseError::Canceled),
        }
    }

    /// Splits off the resolved value, re-typing a failure so it can be forwarded downstream.
    pub(crate) fn split<U>(self) -> Result<T, Outcome<U>> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Rejected(rejection) => Err(Outcome::Rejected(rejection)),
            Self::Canceled => Err(Outcome::Canceled),
        }
    }
}

impl<T> From<Result<T, PromiseError>> for Outcome<T> {
    fn from(result: Result<T, PromiseError>) -> Self {
        match result {
            Ok(value) => Self::Resolved(value),
            Err(PromiseError::Rejected(rejection)) => Self::Rejected(rejection),
            Err(PromiseError::Canceled) => Self::Canceled,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn state_matches_variant() {
        assert_eq!(Outcome::Resolved(1).state(), State::Resolved);
        assert_eq!(Outcome::<i32>::Canceled.state(), State::Canceled);

        let rejection = Rejection::new("nope");
        rejection.mark_handled();
        assert_eq!(Outcome::<i32>::Rejected(rejection).state(), State::Rejected);
    }

    #[test]
    fn map_only_touches_value() {
        assert_eq!(
            Outcome::Resolved(20).map(|x| x + 1).into_result().unwrap(),
            21
        );

        let canceled = Outcome::<i32>::Canceled.map(|x| x + 1);
        assert_eq!(canceled.state(), State::Canceled);
    }

    #[test]
    fn into_result_marks_rejection_handled() {
        let rejection = Rejection::new("boom");
        let outcome = Outcome::<()>::Rejected(rejection.clone());

        let error = outcome.into_result().unwrap_err();

        assert!(rejection.is_handled());
        assert_eq!(error.rejection().unwrap().downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn split_forwards_failures() {
        let failure = Outcome::<u8>::Canceled.split::<String>().unwrap_err();
        assert_eq!(failure.state(), State::Canceled);

        assert_eq!(Outcome::Resolved(7_u8).split::<String>().unwrap(), 7);
    }

    #[test]
    fn thread_safety() {
        assert_impl_all!(Outcome<u32>: Send, Sync);
        assert_impl_all!(State: Send, Sync);
    }
}
