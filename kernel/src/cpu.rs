//! Per-CPU state.
//!
//! Each simulated CPU owns a scheduler context, the pointer to the process
//! it is currently running, and the interrupt bookkeeping that the lock
//! discipline depends on: the nesting depth of `push_off` and the
//! interrupt-enable flag saved at the outermost `push_off`.
//!
//! A host thread claims a CPU by storing it in thread-local storage; the
//! scheduler re-stamps the claim every time it hands a CPU to a process.
//! Interrupt-handler threads (timer, disk, external input) run on
//! dedicated interrupt contexts past the scheduler CPUs, which is the
//! hosted analog of "an interrupt runs on whichever CPU took it".

use core::{
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering},
};
use std::cell::Cell;

use crate::proc::{scheduler::Context, Proc};

/// Interrupt contexts appended after the scheduler CPUs:
/// timer, disk, external input.
pub const NIRQ_CTX: usize = 3;

pub struct Cpu {
    pub id: usize,
    /// The process running on this cpu, or null.
    proc: AtomicPtr<Proc>,
    /// Page directory currently loaded, `cr3` style.
    cr3: AtomicU32,
    /// Depth of `push_off()` nesting.
    noff: AtomicU32,
    /// Were interrupts enabled before the outermost `push_off()`?
    intena: AtomicBool,
    /// The interrupt-enable flag itself.
    int_on: AtomicBool,
    /// Context to switch into to enter this CPU's scheduler.
    pub(crate) scheduler: Context,
}

impl Cpu {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            proc: AtomicPtr::new(ptr::null_mut()),
            cr3: AtomicU32::new(0),
            noff: AtomicU32::new(0),
            intena: AtomicBool::new(false),
            int_on: AtomicBool::new(false),
            scheduler: Context::new(),
        }
    }

    pub(crate) fn set_proc(&self, p: Option<&Proc>) {
        let ptr = p.map_or(ptr::null_mut(), |p| ptr::from_ref(p).cast_mut());
        self.proc.store(ptr, Ordering::Release);
    }

    pub(crate) fn proc(&self) -> Option<&Proc> {
        let p = self.proc.load(Ordering::Acquire);
        unsafe { p.as_ref() }
    }

    pub(crate) fn set_cr3(&self, pgdir: u32) {
        self.cr3.store(pgdir, Ordering::Release);
    }

    pub(crate) fn cr3(&self) -> u32 {
        self.cr3.load(Ordering::Acquire)
    }
}

thread_local! {
    static CURRENT: Cell<*const Cpu> = const { Cell::new(ptr::null()) };
}

/// Claims `cpu` for the calling host thread.
///
/// # Safety
///
/// The caller must guarantee no other thread is on this CPU at the same
/// time, and that the `Cpu` outlives the claim (kernel threads are joined
/// or parked before the kernel is dropped).
pub(crate) unsafe fn set_current(cpu: *const Cpu) {
    CURRENT.with(|c| c.set(cpu));
}

/// The CPU the calling thread runs on.
pub(crate) fn current() -> &'static Cpu {
    try_current().expect("no cpu claimed by this thread")
}

pub(crate) fn try_current() -> Option<&'static Cpu> {
    let p = CURRENT.with(Cell::get);
    unsafe { p.as_ref() }
}

/// The process running on the calling thread's CPU.
///
/// Interrupts are pushed off while the pointer is read, so the answer
/// cannot go stale under a preemption.
pub(crate) fn current_proc() -> Option<&'static Proc> {
    push_off();
    let p = current().proc();
    pop_off();
    p
}

pub(crate) fn interrupts_enabled() -> bool {
    current().int_on.load(Ordering::Relaxed)
}

/// `sti` analog.
pub(crate) fn enable_interrupts() {
    current().int_on.store(true, Ordering::Relaxed);
}

// push_off/pop_off are like cli/sti except that they are matched: it
// takes two pop_off()s to undo two push_off()s. Also, if interrupts are
// initially off, then push_off, pop_off leaves them off.

pub(crate) fn push_off() {
    let c = current();
    let old = c.int_on.swap(false, Ordering::Relaxed);
    if c.noff.load(Ordering::Relaxed) == 0 {
        c.intena.store(old, Ordering::Relaxed);
    }
    c.noff.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn pop_off() {
    let c = current();
    assert!(!c.int_on.load(Ordering::Relaxed), "pop_off: interruptible");
    let noff = c.noff.load(Ordering::Relaxed);
    assert!(noff > 0, "pop_off: not pushed");
    c.noff.store(noff - 1, Ordering::Relaxed);
    if noff == 1 && c.intena.load(Ordering::Relaxed) {
        c.int_on.store(true, Ordering::Relaxed);
    }
}

/// Nesting depth of `push_off` on the current CPU.
pub(crate) fn ncli() -> u32 {
    current().noff.load(Ordering::Relaxed)
}

/// Saved interrupt-enable flag from the outermost `push_off`.
///
/// This is a property of the kernel thread, not of the CPU, which is why
/// `sched` saves and restores it across a context switch.
pub(crate) fn intena() -> bool {
    current().intena.load(Ordering::Relaxed)
}

pub(crate) fn set_intena(v: bool) {
    current().intena.store(v, Ordering::Relaxed);
}
