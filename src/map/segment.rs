//! Per-segment locking
//!
//! A thin layer over `parking_lot::RwLock` that honors the configured
//! fairness on every release: fair segments hand the lock directly to the
//! longest waiter, unfair ones let the releasing thread barge back in.

use parking_lot::{
    RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};

/// Outcome of the shared phase of [`SegmentLock::upgradable`]
pub enum Access<C, R> {
    /// Finished without structural change
    Done(R),
    /// Needs the exclusive lock; carries what the shared phase found
    Upgrade(C),
}

pub struct SegmentLock<T> {
    lock: RwLock<T>,
    fair: bool,
}

impl<T> SegmentLock<T> {
    pub fn new(value: T, fair: bool) -> Self {
        Self {
            lock: RwLock::new(value),
            fair,
        }
    }

    /// Shared access; concurrent with other readers and one upgradable holder
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.lock.read();
        let result = f(&guard);
        if self.fair {
            RwLockReadGuard::unlock_fair(guard);
        }
        result
    }

    /// Exclusive access for structural changes
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock.write();
        let result = f(&mut guard);
        if self.fair {
            RwLockWriteGuard::unlock_fair(guard);
        }
        result
    }

    /// Shared phase excluding other writers, upgraded to exclusive only when
    /// `read` asks for it. Readers are not blocked during the shared phase.
    pub fn upgradable<C, R>(
        &self,
        read: impl FnOnce(&T) -> Access<C, R>,
        write: impl FnOnce(&mut T, C) -> R,
    ) -> R {
        let guard = self.lock.upgradable_read();
        match read(&guard) {
            Access::Done(result) => {
                if self.fair {
                    RwLockUpgradableReadGuard::unlock_fair(guard);
                }
                result
            }
            Access::Upgrade(carry) => {
                let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
                let result = write(&mut guard, carry);
                if self.fair {
                    RwLockWriteGuard::unlock_fair(guard);
                }
                result
            }
        }
    }

    /// Hold the segment exclusively until the guard drops
    pub fn hold(&self) -> RwLockWriteGuard<'_, T> {
        self.lock.write()
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }
}
