//! Per-CPU scheduler and the context hand-off.
//!
//! Each CPU's scheduler scans for a RUNNABLE process, marks it RUNNING
//! and switches to it; the process eventually switches back. The
//! process-table lock is held across every switch and released by
//! whichever kernel thread resumes, the exact xv6 `swtch` convention.
//!
//! A [`Context`] is the hosted stand-in for a saved register set: a
//! binary semaphore parking the kernel thread that switched away.
//! `Context::switch(old, new)` unparks the thread waiting in `new` and
//! parks the caller in `old`. Since the lock stays held across the
//! hand-off and the resumed thread always runs on the CPU that acquired
//! it, the owner bookkeeping stays consistent.

use core::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

use crate::{
    cpu,
    kernel::Kernel,
    param::NPROC,
    proc::{Proc, ProcState, ProcTable},
    sync::SpinLockGuard,
};

/// A kernel thread's switch point.
pub struct Context {
    run: Mutex<bool>,
    cv: Condvar,
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            run: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut run = self.run.lock().unwrap();
        *run = true;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut run = self.run.lock().unwrap();
        while !*run {
            run = self.cv.wait(run).unwrap();
        }
        *run = false;
    }

    /// Parks the caller in `old` after unparking whoever waits in `new`.
    pub(crate) fn switch(old: &Context, new: &Context) {
        new.notify();
        old.wait();
    }
}

/// Per-CPU process scheduler.
///
/// Each CPU's scheduler thread calls this once; it returns only at
/// kernel shutdown.
pub(crate) fn scheduler(k: &Arc<Kernel>, cpu_id: usize) {
    let cpu = &k.cpus[cpu_id];
    unsafe { cpu::set_current(cpu) };

    while !k.is_shutdown() {
        // The most recent process to run may have had interrupts turned
        // off; enable them to avoid a deadlock if all processes are
        // waiting.
        cpu::enable_interrupts();

        let mut found = false;
        let mut pt = k.ptable.lock();
        for i in 0..NPROC {
            if pt.slots[i].state != ProcState::Runnable {
                continue;
            }

            // Switch to chosen process. It is the process's job to
            // release the table lock and then reacquire it before
            // jumping back to us.
            let p = &k.procs[i];
            super::switchuvm(k, p);
            pt.slots[i].state = ProcState::Running;
            cpu.set_proc(Some(p));
            p.sched_cpu.store(cpu_id, Ordering::Release);

            Context::switch(&cpu.scheduler, &p.context);

            // Process is done running for now. It should have changed
            // its state before coming back.
            cpu.set_proc(None);
            super::switchkvm(k);
            found = true;
        }
        drop(pt);

        if !found {
            // wfi analog: nothing runnable until some interrupt thread
            // changes that.
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }
}

/// Enters the scheduler; must hold only the process-table lock and have
/// already changed the process's state.
///
/// Saves and restores the CPU's `intena` flag because it is a property
/// of this kernel thread, not of the CPU.
pub(crate) fn sched(k: &Kernel, pt: &mut SpinLockGuard<'_, ProcTable>, p: &Proc) {
    assert!(k.ptable.holding(), "sched ptable.lock");
    assert_eq!(cpu::ncli(), 1, "sched locks");
    assert_ne!(pt.slots[p.idx].state, ProcState::Running, "sched running");
    assert!(!cpu::interrupts_enabled(), "sched interruptible");

    let intena = cpu::intena();
    let my_cpu = cpu::current();
    Context::switch(&p.context, &my_cpu.scheduler);

    // Resumed, possibly on a different CPU: re-stamp the claim before
    // touching any per-CPU state.
    let cpu_id = p.sched_cpu.load(Ordering::Acquire);
    unsafe { cpu::set_current(&k.cpus[cpu_id]) };
    cpu::set_intena(intena);
}

/// The final departure of an exiting process.
///
/// Transfers the held process-table lock to this CPU's scheduler and
/// returns; the caller's thread must touch no kernel state afterwards.
pub(crate) fn exit_switch(k: &Kernel, pt: SpinLockGuard<'_, ProcTable>) {
    assert!(k.ptable.holding(), "exit_switch ptable.lock");
    // Ownership of the lock moves to the scheduler; the guard must not
    // run its release.
    core::mem::forget(pt);
    cpu::current().scheduler.notify();
}

/// First entry of a fresh process, still holding the table lock handed
/// over by the scheduler.
pub(crate) fn forkret(k: &Arc<Kernel>, p: &Proc) {
    let cpu_id = p.sched_cpu.load(Ordering::Acquire);
    unsafe { cpu::set_current(&k.cpus[cpu_id]) };

    // The scheduler's guard lives on the scheduler's stack; release its
    // lock from here, as the convention requires.
    unsafe { k.ptable.force_release() };

    // File system initialization must run in the context of a regular
    // process (it sleeps on disk I/O), so the first process to ever be
    // scheduled mounts the root device on its way out.
    k.mount_once();
}
