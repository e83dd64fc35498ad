use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::PtyError;

/// A shared OS handle that can be invalidated while other threads use it.
///
/// Callers take a snapshot under a short-held lock and run the blocking
/// call on the snapshot after the lock is released. `invalidate` swaps in
/// the closed sentinel under the same lock, so a racing reader or writer
/// either holds a still-live handle (and sees the OS "closed" error once
/// teardown runs) or fails immediately without touching the OS.
pub struct GuardedHandle<T: ?Sized> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> GuardedHandle<T> {
    pub fn new(handle: Arc<T>) -> Self {
        Self {
            slot: Mutex::new(Some(handle)),
        }
    }

    /// Clone the live handle, or fail with [`PtyError::Closed`].
    pub fn snapshot(&self) -> Result<Arc<T>, PtyError> {
        self.lock().clone().ok_or(PtyError::Closed)
    }

    /// Replace the handle with the closed sentinel and return what was there.
    pub fn invalidate(&self) -> Option<Arc<T>> {
        self.lock().take()
    }

    pub fn is_live(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        // The slot only holds an Option; a panic elsewhere cannot leave it torn.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: ?Sized> std::fmt::Debug for GuardedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedHandle")
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_after_invalidate_fails_closed() {
        let handle = GuardedHandle::new(Arc::new(5u32));
        assert_eq!(*handle.snapshot().unwrap(), 5);

        let taken = handle.invalidate();
        assert_eq!(taken.as_deref(), Some(&5));
        assert_eq!(handle.snapshot().unwrap_err(), PtyError::Closed);
        assert!(handle.invalidate().is_none());
    }

    #[test]
    fn snapshot_outlives_invalidation() {
        let handle = GuardedHandle::new(Arc::new(String::from("live")));
        let snap = handle.snapshot().unwrap();
        handle.invalidate();
        // In-flight users keep their clone until they finish.
        assert_eq!(snap.as_str(), "live");
        assert!(!handle.is_live());
    }
}
