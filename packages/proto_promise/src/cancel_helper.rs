use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::cancelation::Cancelable;
use crate::{CancelationRegistration, CancelationToken};

/// Result of the completion path's attempt to claim a cancelable node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Race {
    /// The node was never registered with a token. Nothing to release.
    Uncontested,

    /// The completion path won. The caller releases the retain the helper holds on the node.
    Won,

    /// Cancelation won. The caller must not run its continuation and releases the helper's
    /// retain on the node only if `last` is set.
    Lost { last: bool },
}

/// Resolves the race between "upstream completed" and "cancelation requested" for a node.
///
/// While registered, the helper holds one retain on its node. It tracks two paths internally,
/// the completion path and the cancelation path. Whichever of them finishes last releases the
/// node retain. If the completion path unregisters the callback before it fires, it finishes
/// both paths at once.
#[derive(Debug, Default)]
pub(crate) struct CancelationHelper {
    registration: Mutex<Option<CancelationRegistration>>,
    remaining: AtomicU8,
}

impl CancelationHelper {
    /// Prepares the helper for a new use of its node.
    pub(crate) fn reset(&mut self) {
        *self.registration.get_mut() = None;
        *self.remaining.get_mut() = 0;
    }

    /// Registers the node with the token.
    ///
    /// The caller must already have added the node retain owned by the helper. If the token is
    /// already canceled, `target` is canceled before this returns.
    pub(crate) fn register(&self, token: &CancelationToken, target: Arc<dyn Cancelable>) {
        self.remaining.store(2, Ordering::Release);

        let registration = token.register_cancelable(target);
        *self.registration.lock() = Some(registration);
    }

    /// Called once by the completion path before it runs its continuation.
    pub(crate) fn complete_path(&self) -> Race {
        let Some(registration) = self.registration.lock().take() else {
            return Race::Uncontested;
        };

        if registration.try_unregister() {
            self.remaining.store(0, Ordering::Release);
            Race::Won
        } else {
            Race::Lost {
                last: self.finish_path(),
            }
        }
    }

    /// Called once by the cancelation path after it has settled the node. Returns whether the
    /// caller must release the helper's retain on the node.
    pub(crate) fn cancel_path(&self) -> bool {
        self.finish_path()
    }

    /// Drops the registration, if any. Only valid while the node is being disposed.
    pub(crate) fn clear(&self) {
        let registration = self.registration.lock().take();
        drop(registration);
    }

    fn finish_path(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}
