use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Poisoned locks are recovered with `into_inner()` so one panicking worker cannot
/// wedge every later request; each recovery is logged under a stable lock name.
pub(crate) fn lock_recover<'a, T>(mutex: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("event=lock_poisoned lock={} action=recover", name);
        poisoned.into_inner()
    })
}

pub(crate) fn read_recover<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        log::warn!("event=lock_poisoned lock={} action=recover_read", name);
        poisoned.into_inner()
    })
}

pub(crate) fn write_recover<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        log::warn!("event=lock_poisoned lock={} action=recover_write", name);
        poisoned.into_inner()
    })
}
