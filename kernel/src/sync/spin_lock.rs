//! Mutual exclusion spin locks.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    ptr,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{cpu, cpu::Cpu, kernel::Kernel, proc};

pub struct RawSpinLock {
    locked: AtomicBool,
    /// The cpu holding the lock, for `holding()`.
    cpu: UnsafeCell<*const Cpu>,
}

unsafe impl Sync for RawSpinLock {}
unsafe impl Send for RawSpinLock {}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: UnsafeCell::new(ptr::null()),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    /// Holding a lock this way disables interrupts on the current CPU.
    pub fn acquire(&self) {
        // Disable interrupts to avoid deadlock with interrupt handlers
        // taking the same lock on this CPU.
        cpu::push_off();

        assert!(!self.holding(), "spinlock double acquire");

        // `Acquire` keeps the critical section's loads and stores after
        // this point.
        while self.locked.swap(true, Ordering::Acquire) {
            // Host threads outnumber host cores; give the holder a chance
            // to run instead of burning its quantum.
            std::hint::spin_loop();
            std::thread::yield_now();
        }

        // Record info about lock acquisition for holding() and debugging.
        unsafe {
            *self.cpu.get() = ptr::from_ref(cpu::current());
        }
    }

    /// Releases the lock.
    pub fn release(&self) {
        assert!(self.holding(), "spinlock release without hold");

        unsafe {
            *self.cpu.get() = ptr::null();
        }

        // `Release` makes the critical section's stores visible before the
        // lock word clears.
        self.locked.store(false, Ordering::Release);

        cpu::pop_off();
    }

    /// Checks whether this cpu is holding the lock.
    ///
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        assert!(!cpu::interrupts_enabled());
        self.locked.load(Ordering::Relaxed)
            && ptr::eq(unsafe { *self.cpu.get() }, cpu::current())
    }
}

pub struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock.acquire();
        SpinLockGuard { lock: self }
    }

    /// Checks whether this cpu is holding the lock.
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Releases a lock whose guard lives on another kernel thread's
    /// stack.
    ///
    /// # Safety
    ///
    /// Only for the context-switch convention: the caller must have been
    /// handed ownership of the lock by a switch, and the guard-owning
    /// thread must not release it again.
    pub unsafe fn force_release(&self) {
        self.lock.release();
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard came from, usable to reacquire after a sleep.
    pub fn spin(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

/// A condition variable built on sleep/wakeup.
///
/// The counter makes a wait immune to the lost-wakeup race: a notify that
/// lands between the caller's predicate check and its sleep still bumps
/// the counter, and the sleeper re-checks it.
pub struct SpinLockCondVar {
    counter: AtomicU64,
}

impl Default for SpinLockCondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLockCondVar {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    fn chan(&self) -> usize {
        ptr::from_ref(&self.counter) as usize
    }

    pub fn wait<'a, T>(
        &self,
        k: &Kernel,
        mut guard: SpinLockGuard<'a, T>,
    ) -> SpinLockGuard<'a, T> {
        let seen = self.counter.load(Ordering::Relaxed);
        loop {
            guard = proc::sleep(k, self.chan(), guard);
            if seen != self.counter.load(Ordering::Relaxed) {
                break;
            }
        }
        guard
    }

    pub fn notify(&self, k: &Kernel) {
        self.counter.fetch_add(1, Ordering::Relaxed);
        proc::wakeup(k, self.chan());
    }
}
