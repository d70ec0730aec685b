use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

/// Per-VM lock serializing every mutation of one VM's trackers.
///
/// The trackers do no locking of their own. They keep a reference to the
/// owning VM's lock and assert, in debug builds, that it is held whenever
/// they are touched.
#[derive(Debug, Default)]
pub struct VmLock {
    mutex: Mutex<()>,
    holders: AtomicUsize,
}

impl VmLock {
    /// Creates a new, unlocked VM lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, blocking until it is available.
    pub fn lock(&self) -> VmLockGuard<'_> {
        let guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.holders.fetch_add(1, Ordering::AcqRel);

        VmLockGuard {
            lock: self,
            _guard: guard,
        }
    }

    /// Returns `true` while some caller holds the lock.
    pub fn is_held(&self) -> bool {
        self.holders.load(Ordering::Acquire) != 0
    }
}

/// Guard returned by [`VmLock::lock`].
pub struct VmLockGuard<'a> {
    lock: &'a VmLock,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for VmLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.holders.fetch_sub(1, Ordering::AcqRel);
    }
}
