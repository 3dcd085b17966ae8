//! Long-term locks for processes.
//!
//! A sleep lock yields the CPU while waiting to acquire, and may be held
//! across voluntary suspension. It must never be taken from interrupt
//! context: the wait path calls `sleep`, which needs a process.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    ptr,
};

use crate::{kernel::Kernel, proc, proc::ProcId, sync::SpinLock};

struct RawSleepLock {
    /// (is the lock held, pid of the holder)
    locked: SpinLock<(bool, ProcId)>,
}

impl RawSleepLock {
    const fn new() -> Self {
        Self {
            locked: SpinLock::new((false, ProcId::INVALID)),
        }
    }

    fn chan(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    fn acquire(&self, k: &Kernel) {
        let mut locked = self.locked.lock();
        while locked.0 {
            locked = proc::sleep(k, self.chan(), locked);
        }
        locked.0 = true;
        locked.1 = proc::myproc_id(k);
    }

    /// Acquires only if the lock is free right now; never sleeps, so it is
    /// safe while a spinlock is held.
    fn try_acquire(&self, k: &Kernel) -> bool {
        let mut locked = self.locked.lock();
        if locked.0 {
            return false;
        }
        locked.0 = true;
        locked.1 = proc::myproc_id(k);
        true
    }

    fn release(&self, k: &Kernel) {
        let mut locked = self.locked.lock();
        locked.0 = false;
        locked.1 = ProcId::INVALID;
        proc::wakeup(k, self.chan());
    }

    fn holding(&self, k: &Kernel) -> bool {
        let locked = self.locked.lock();
        locked.0 && locked.1 == proc::myproc_id(k)
    }
}

pub struct SleepLock<T> {
    lock: RawSleepLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSleepLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, sleeping until it is free.
    pub fn lock<'a>(&'a self, k: &'a Kernel) -> SleepLockGuard<'a, T> {
        self.lock.acquire(k);
        SleepLockGuard { lock: self, k }
    }

    /// Acquires the lock without sleeping, or fails.
    pub fn try_lock<'a>(&'a self, k: &'a Kernel) -> Option<SleepLockGuard<'a, T>> {
        if self.lock.try_acquire(k) {
            Some(SleepLockGuard { lock: self, k })
        } else {
            None
        }
    }

    pub fn holding(&self, k: &Kernel) -> bool {
        self.lock.holding(k)
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    k: &'a Kernel,
}

unsafe impl<T> Send for SleepLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SleepLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release(self.k);
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}
