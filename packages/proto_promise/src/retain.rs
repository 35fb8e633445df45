use std::sync::atomic::{self, AtomicU32};

/// Thread-safe retain count for a pooled node.
///
/// A node is returned to its pool only by the holder that brings the count to zero. Every
/// independent code path that may decide "I am done with this node" owns one unit of the count
/// (e.g. the consumer of the promise, a cancelation registration, the fan-in of a merge).
#[derive(Debug)]
pub(crate) struct RetainCounter {
    count: AtomicU32,
}

impl RetainCounter {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Sets the count for a fresh use of the owning node.
    ///
    /// Only valid while nobody else can observe the node (i.e. during initialization).
    pub(crate) fn reset(&self, initial: u32) {
        self.count.store(initial, atomic::Ordering::Relaxed);
    }

    /// Releases one retain and returns true if this was the last one.
    ///
    /// # Panics
    ///
    /// Panics if the count would underflow.
    #[must_use]
    pub(crate) fn release(&self) -> bool {
        match self.count.fetch_sub(1, atomic::Ordering::Release) {
            1 => {
                // We need an Acquire fence here to ensure we have observed all writes before the
                // node is reset. On x86 this does nothing but weaker architectures may delay writes.
                atomic::fence(atomic::Ordering::Acquire);

                true
            }
            0 => panic!(
                "retain count underflow - indicates a serious bug in node lifecycle logic"
            ),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> u32 {
        self.count.load(atomic::Ordering::Relaxed)
    }
}
