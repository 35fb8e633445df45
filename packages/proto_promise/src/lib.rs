#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Cancelable promises for synchronous and asynchronous code, with pooled nodes so that
//! steady-state promise chains do not allocate.
//!
//! A [`Promise<T>`] is the eventual outcome of an operation: it is either resolved with a `T`,
//! rejected with a [`Rejection`] or canceled. The producing side of an operation holds a
//! [`Deferred<T>`] and settles it from any thread. The consuming side attaches continuations,
//! awaits the promise as a [`Future`][std::future::Future], blocks on it or forgets it.
//!
//! ```rust
//! use std::thread;
//!
//! use proto_promise::{Deferred, Promise};
//!
//! let (deferred, promise) = Deferred::<u32>::new();
//!
//! let answer = promise
//!     .then(|value| value + 1)
//!     .catch(|_: &'static str| 0);
//!
//! thread::spawn(move || deferred.resolve(41));
//!
//! assert_eq!(answer.wait().unwrap(), 42);
//! ```
//!
//! # Single consumer
//!
//! Every promise has exactly one consumer and every consuming operation takes the promise by
//! value. To hand the same outcome to several consumers, convert the promise into a
//! [`PreservedPromise`] via [`Promise::preserve()`] and take a branch for each consumer.
//!
//! Misusing a promise (e.g. claiming the result of an [`Awaiter`] twice) is a programmer error
//! and panics with a [`UsageError`] message.
//!
//! # Cancelation
//!
//! Cancelation is cooperative and driven by a [`CancelationSource`]. Continuations attached with
//! a [`CancelationToken`] (e.g. [`Promise::then_cancelable()`]) never run once the token has been
//! canceled. Their promise settles as canceled instead. If the upstream outcome and the
//! cancelation race, exactly one of them wins.
//!
//! ```rust
//! use proto_promise::{CancelationSource, Deferred};
//!
//! let source = CancelationSource::new();
//! let (deferred, promise) = Deferred::<u32>::new();
//!
//! let continued = promise.then_cancelable(&source.token(), |value| value * 2);
//!
//! source.cancel();
//! deferred.resolve(5);
//!
//! assert!(continued.wait().unwrap_err().is_canceled());
//! ```
//!
//! # Scheduling
//!
//! Continuations run on whichever thread settles their upstream promise. Use
//! [`Promise::wait_async()`] with a [`SynchronizationOption`] to move the rest of a chain onto a
//! foreground context (see [`ManualSynchronizationContext`]), the background thread pool or any
//! custom [`SynchronizationContext`].
//!
//! # Configuration
//!
//! Process-wide settings such as the foreground context, the timer factory and the handler for
//! unhandled rejections are installed via [`Config::builder()`].

mod awaiter;
mod blocking;
mod cancel_helper;
mod cancelation;
mod config;
mod context;
mod continuation;
mod deferred;
mod diagnostics;
mod error;
mod merge;
mod node;
mod outcome;
mod pool;
mod preserve;
mod promise;
mod rejection;
mod retain;
mod signals;
mod switch;
mod timeout;
mod timer;

pub use awaiter::*;
pub use cancelation::*;
pub use config::*;
pub use context::*;
pub use deferred::*;
#[cfg(debug_assertions)]
pub use diagnostics::live_nodes;
pub use error::*;
pub use outcome::*;
pub use preserve::*;
pub use promise::*;
pub use rejection::*;
pub use signals::*;
pub use switch::*;
pub use timer::*;
