//! Processes: the table, the lifecycle, and sleep/wakeup.
//!
//! A single spinlock protects every process state transition and the
//! parent links; per-process private state (address space, open files,
//! trap frame) is touched only by the owning kernel thread and by the
//! fork/wait/exit paths, which synchronize through the table lock.

use core::{
    cell::UnsafeCell,
    fmt, ptr,
    sync::atomic::{AtomicI32, AtomicUsize, Ordering},
};
use std::sync::{mpsc, Arc};

use arrayvec::ArrayString;
use dataview::PodMethods as _;

use crate::{
    cpu,
    error::{KernelError, Result},
    file::{fclose, fdup, File},
    fs::{
        inode::{idup, iput, Inode},
        path,
    },
    kernel::Kernel,
    memory::{
        page_table::PageDir,
        vm_user::{allocuvm, copyuvm, deallocuvm, freevm, inituvm},
        PhysAddr, PAGE_SIZE,
    },
    param::{NOFILE, NPROC},
    sync::SpinLockGuard,
    trap::TrapFrame,
    usermode::{self, Prog},
};

pub mod exec;
pub(crate) mod elf;
pub mod scheduler;

use self::scheduler::Context;

/// A sleep/wakeup rendezvous token: the address of some kernel object.
pub type Chan = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ProcId(i32);

impl ProcId {
    pub const INVALID: Self = ProcId(-1);

    pub const fn new(pid: i32) -> Self {
        Self(pid)
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping { chan: Chan },
    Runnable,
    Running,
    Zombie { status: i32 },
}

/// Per-process state guarded by the process-table lock.
pub struct ProcSlot {
    pub state: ProcState,
    pub pid: ProcId,
    pub parent: Option<usize>,
    pub killed: bool,
    /// Process name (debugging).
    pub name: ArrayString<16>,
}

pub struct ProcTable {
    pub slots: [ProcSlot; NPROC],
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| ProcSlot {
                state: ProcState::Unused,
                pid: ProcId::INVALID,
                parent: None,
                killed: false,
                name: ArrayString::new(),
            }),
        }
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process state owned by the process's own kernel thread.
pub struct ProcPrivate {
    /// Size of user memory (bytes).
    pub sz: u32,
    /// User page directory.
    pub pgdir: Option<PageDir>,
    /// Bottom of the kernel stack frame for this process.
    pub kstack: Option<PhysAddr>,
    /// Open files.
    pub ofile: [Option<File>; NOFILE],
    /// Current directory.
    pub cwd: Option<Inode>,
    /// The user program to run on return to user space.
    pub prog: Option<Prog>,
    /// Program handed to the next fork for the child to run.
    pub spawn: Option<Prog>,
    /// Last timer tick observed on the trap-return path.
    pub last_tick: u32,
    /// Harness-side listener for this process's exit.
    pub exit_watch: Option<mpsc::Sender<i32>>,
}

impl ProcPrivate {
    const fn new() -> Self {
        Self {
            sz: 0,
            pgdir: None,
            kstack: None,
            ofile: [const { None }; NOFILE],
            cwd: None,
            prog: None,
            spawn: None,
            last_tick: 0,
            exit_watch: None,
        }
    }
}

/// The stable per-process shell: the context hand-off primitive and the
/// private data the table lock does not guard.
pub struct Proc {
    pub idx: usize,
    /// Mirror of the pid for lock-free identity checks.
    pid: AtomicI32,
    /// CPU the scheduler last dispatched this process to.
    pub(crate) sched_cpu: AtomicUsize,
    pub(crate) context: Context,
    private: UnsafeCell<ProcPrivate>,
}

unsafe impl Sync for Proc {}

impl Proc {
    pub(crate) fn new(idx: usize) -> Self {
        Self {
            idx,
            pid: AtomicI32::new(-1),
            sched_cpu: AtomicUsize::new(0),
            context: Context::new(),
            private: UnsafeCell::new(ProcPrivate::new()),
        }
    }

    pub fn pid(&self) -> ProcId {
        ProcId(self.pid.load(Ordering::Acquire))
    }

    /// The process's private side.
    ///
    /// # Safety
    ///
    /// Only the owning kernel thread, or a fork/wait/exit path holding
    /// the table lock over a process that cannot run, may take this.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn private(&self) -> &mut ProcPrivate {
        unsafe { &mut *self.private.get() }
    }

    /// Physical address of this process's trap frame, at the top of its
    /// kernel stack page.
    fn trapframe_pa(&self) -> PhysAddr {
        let kstack = unsafe { self.private() }
            .kstack
            .expect("process has no kernel stack");
        kstack.byte_add((PAGE_SIZE - size_of::<TrapFrame>()) as u32)
    }

    pub fn trapframe(&self, k: &Kernel) -> TrapFrame {
        k.mem.read_pod(self.trapframe_pa())
    }

    pub fn set_trapframe(&self, k: &Kernel, tf: &TrapFrame) {
        k.mem.write_pod(self.trapframe_pa(), tf);
    }

    fn chan(&self) -> Chan {
        ptr::from_ref(self) as Chan
    }
}

/// The process running on the calling thread's CPU.
pub fn myproc(k: &Kernel) -> &'static Proc {
    let _ = k;
    cpu::current_proc().expect("myproc: no process")
}

pub(crate) fn myproc_id(k: &Kernel) -> ProcId {
    let _ = k;
    cpu::current_proc().map_or(ProcId::INVALID, Proc::pid)
}

/// Reads the sticky killed flag.
pub fn killed(k: &Kernel, p: &Proc) -> bool {
    let pt = k.ptable.lock();
    pt.slots[p.idx].killed
}

/// Looks in the process table for an UNUSED slot.
///
/// If found, moves it to EMBRYO, assigns a pid and a kernel stack, and
/// returns it. The caller finishes initialization and sets RUNNABLE.
fn allocproc(k: &Kernel) -> Result<usize> {
    let mut pt = k.ptable.lock();
    let Some(idx) = pt
        .slots
        .iter()
        .position(|s| s.state == ProcState::Unused)
    else {
        return Err(KernelError::NoFreeProc);
    };

    let pid = k.nextpid.fetch_add(1, Ordering::Relaxed);
    pt.slots[idx].state = ProcState::Embryo;
    pt.slots[idx].pid = ProcId(pid);
    pt.slots[idx].killed = false;
    pt.slots[idx].parent = None;
    drop(pt);

    let p = &k.procs[idx];
    p.pid.store(pid, Ordering::Release);

    // Allocate the kernel stack; the trap frame lives at its top.
    match k.kmem.alloc(&k.mem) {
        Ok(kstack) => {
            let private = unsafe { p.private() };
            private.kstack = Some(kstack);
            p.set_trapframe(k, &TrapFrame::zeroed());
            Ok(idx)
        }
        Err(e) => {
            let mut pt = k.ptable.lock();
            pt.slots[idx].state = ProcState::Unused;
            pt.slots[idx].pid = ProcId::INVALID;
            p.pid.store(-1, Ordering::Release);
            Err(e)
        }
    }
}

/// Returns an EMBRYO slot to UNUSED, freeing what allocproc and its
/// caller built so far. Only for construction failure paths.
fn unalloc(k: &Kernel, idx: usize) {
    let p = &k.procs[idx];
    let private = unsafe { p.private() };
    if let Some(kstack) = private.kstack.take() {
        k.kmem.free(&k.mem, kstack);
    }
    if let Some(pgdir) = private.pgdir.take() {
        freevm(&k.mem, &k.kmem, pgdir, private.sz);
    }
    private.sz = 0;
    private.prog = None;
    p.pid.store(-1, Ordering::Release);

    let mut pt = k.ptable.lock();
    pt.slots[idx].state = ProcState::Unused;
    pt.slots[idx].pid = ProcId::INVALID;
}

/// The body of every process's host thread.
fn proc_thread(k: Arc<Kernel>, idx: usize) {
    let p = &k.procs[idx];

    // Wait for the scheduler's first dispatch.
    p.context.wait();

    let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        scheduler::forkret(&k, p);
        usermode::enter(&k, p)
    }));

    match run {
        Ok(status) => {
            let watch = exit_proc(&k, p, status);
            // Off the machine now; only host-side reporting is allowed.
            if let Some(watch) = watch {
                let _ = watch.send(status);
            }
        }
        Err(_) => {
            // A kernel invariant died on this thread; the machine is
            // wedged. Dropping the watcher tells the harness.
            drop(unsafe { p.private() }.exit_watch.take());
        }
    }
}

fn spawn_thread(k: &Arc<Kernel>, idx: usize) {
    let k = Arc::clone(k);
    std::thread::Builder::new()
        .name(format!("proc{idx}"))
        .spawn(move || proc_thread(k, idx))
        .expect("cannot spawn process thread");
}

/// Sets up the first user process: installs the bootstrap image in a
/// fresh address space and marks it RUNNABLE.
pub(crate) fn userinit(k: &Arc<Kernel>, prog: Prog, watch: mpsc::Sender<i32>) -> Result<ProcId> {
    let idx = allocproc(k)?;
    let p = &k.procs[idx];
    let private = unsafe { p.private() };

    let pgdir = crate::memory::vm::setupkvm(&k.mem, &k.kmem)?;
    inituvm(&k.mem, &k.kmem, pgdir, usermode::INIT_CODE)?;
    private.pgdir = Some(pgdir);
    private.sz = PAGE_SIZE as u32;

    let mut tf = TrapFrame::user_default();
    tf.eip = 0; // beginning of initcode
    tf.esp = PAGE_SIZE as u32;
    p.set_trapframe(k, &tf);

    private.prog = Some(prog);
    private.exit_watch = Some(watch);

    // The root inode can be pinned before the disk is mounted: iget
    // touches only the cache.
    let tx = k.begin_tx();
    private.cwd = Some(path::resolve(&tx, None, b"/")?);
    drop(tx);

    k.initproc.store(idx, Ordering::Release);
    spawn_thread(k, idx);

    let mut pt = k.ptable.lock();
    pt.slots[idx].name = ArrayString::from("initcode").unwrap();
    pt.slots[idx].state = ProcState::Runnable;
    Ok(ProcId(p.pid.load(Ordering::Acquire)))
}

/// Creates a new process copying the caller.
///
/// The child's trap frame returns 0; the parent gets the child's pid.
pub fn fork(k: &Arc<Kernel>, p: &Proc) -> Result<ProcId> {
    let parent = unsafe { p.private() };
    // Taken up front so a failed fork cannot leave the continuation
    // behind for a later, unrelated fork.
    let spawn = parent.spawn.take();

    let idx = allocproc(k)?;
    let np = &k.procs[idx];
    let child = unsafe { np.private() };

    // Copy the user address space.
    let pgdir = match copyuvm(
        &k.mem,
        &k.kmem,
        parent.pgdir.expect("fork: parent has no pgdir"),
        parent.sz,
    ) {
        Ok(pgdir) => pgdir,
        Err(e) => {
            unalloc(k, idx);
            return Err(e);
        }
    };
    child.pgdir = Some(pgdir);
    child.sz = parent.sz;

    // Same saved user registers, but fork returns 0 in the child.
    let mut tf = p.trapframe(k);
    tf.eax = 0;
    np.set_trapframe(k, &tf);

    // Duplicate open files and the working directory.
    for (of, nof) in parent.ofile.iter().zip(child.ofile.iter_mut()) {
        if let Some(of) = of {
            *nof = Some(fdup(k, of));
        }
    }
    child.cwd = parent.cwd.as_ref().map(|c| idup(k, c));

    // The harness supplies the child's continuation, since a host
    // thread's stack cannot be duplicated.
    child.prog = spawn;

    let pid = np.pid();
    spawn_thread(k, idx);

    let mut pt = k.ptable.lock();
    let name = pt.slots[p.idx].name;
    pt.slots[idx].name = name;
    pt.slots[idx].parent = Some(p.idx);
    pt.slots[idx].state = ProcState::Runnable;
    drop(pt);

    Ok(pid)
}

/// Grows or shrinks the current process's memory by `n` bytes.
pub fn growproc(k: &Kernel, p: &Proc, n: i32) -> Result<()> {
    let private = unsafe { p.private() };
    let pgdir = private.pgdir.expect("growproc: no pgdir");
    let sz = private.sz;

    let newsz = if n > 0 {
        allocuvm(&k.mem, &k.kmem, pgdir, sz, sz.wrapping_add(n as u32))?
    } else if n < 0 {
        deallocuvm(&k.mem, &k.kmem, pgdir, sz, sz.wrapping_sub(n.unsigned_abs()))
    } else {
        sz
    };
    private.sz = newsz;
    switchuvm(k, p);
    Ok(())
}

/// Loads the process's page directory into its CPU.
pub(crate) fn switchuvm(k: &Kernel, p: &Proc) {
    let private = unsafe { p.private() };
    assert!(private.kstack.is_some(), "switchuvm: no kstack");
    let pgdir = private.pgdir.expect("switchuvm: no pgdir");
    cpu::current().set_cr3(pgdir.phys_addr().addr());
    let _ = k;
}

/// Back to the kernel-only page directory.
pub(crate) fn switchkvm(k: &Kernel) {
    cpu::current().set_cr3(k.kpgdir().phys_addr().addr());
}

/// Atomically releases `guard` and sleeps on `chan`; reacquires the lock
/// when awakened.
///
/// The table lock is taken before the caller's lock is released, so a
/// concurrent `wakeup` (which takes the table lock) cannot slip between
/// the release and the state change.
pub fn sleep<'a, T>(
    k: &Kernel,
    chan: Chan,
    guard: SpinLockGuard<'a, T>,
) -> SpinLockGuard<'a, T> {
    let p = myproc(k);

    let mut pt = k.ptable.lock();
    let lk = guard.spin();
    drop(guard);

    // Go to sleep.
    pt.slots[p.idx].state = ProcState::Sleeping { chan };
    scheduler::sched(k, &mut pt, p);
    drop(pt);

    // Reacquire original lock.
    lk.lock()
}

/// Wakes up all processes sleeping on `chan`. The caller must hold the
/// table lock.
pub(crate) fn wakeup1(pt: &mut ProcTable, chan: Chan) {
    for slot in &mut pt.slots {
        if slot.state == (ProcState::Sleeping { chan }) {
            slot.state = ProcState::Runnable;
        }
    }
}

/// Wakes up all processes sleeping on `chan`.
pub fn wakeup(k: &Kernel, chan: Chan) {
    let mut pt = k.ptable.lock();
    wakeup1(&mut pt, chan);
}

/// Gives up the CPU for one scheduling round.
pub fn yield_(k: &Kernel, p: &Proc) {
    let mut pt = k.ptable.lock();
    pt.slots[p.idx].state = ProcState::Runnable;
    scheduler::sched(k, &mut pt, p);
}

/// Marks the process with the given pid as killed.
///
/// The victim won't be torn down until it next crosses the trap-return
/// path; if it is sleeping, it is made runnable so it can get there.
pub fn kill(k: &Kernel, pid: ProcId) -> Result<()> {
    let mut pt = k.ptable.lock();
    for slot in &mut pt.slots {
        if slot.state != ProcState::Unused && slot.pid == pid {
            slot.killed = true;
            if matches!(slot.state, ProcState::Sleeping { .. }) {
                slot.state = ProcState::Runnable;
            }
            return Ok(());
        }
    }
    Err(KernelError::ProcessNotFound)
}

/// The real exit path, run by the process's own thread as it leaves.
///
/// Closes files, releases the working directory, reparents children to
/// init, wakes the parent and becomes a ZOMBIE. Returns the harness
/// watcher so the caller can report after the hand-off.
pub(crate) fn exit_proc(k: &Kernel, p: &Proc, status: i32) -> Option<mpsc::Sender<i32>> {
    let private = unsafe { p.private() };

    // Close all open files.
    for of in private.ofile.iter_mut() {
        if let Some(f) = of.take() {
            fclose(k, f);
        }
    }

    if let Some(cwd) = private.cwd.take() {
        let tx = k.begin_tx();
        iput(&tx, cwd);
    }

    let watch = private.exit_watch.take();
    let init_idx = k.initproc.load(Ordering::Acquire);

    let mut pt = k.ptable.lock();

    // Give any children to init; wake init if a zombie is among them.
    for i in 0..NPROC {
        if pt.slots[i].parent == Some(p.idx) {
            pt.slots[i].parent = Some(init_idx);
            if matches!(pt.slots[i].state, ProcState::Zombie { .. }) {
                wakeup1(&mut pt, k.procs[init_idx].chan());
            }
        }
    }

    // Parent might be sleeping in wait().
    if let Some(parent) = pt.slots[p.idx].parent {
        wakeup1(&mut pt, k.procs[parent].chan());
    }

    pt.slots[p.idx].state = ProcState::Zombie { status };

    // Jump into the scheduler, never to return.
    scheduler::exit_switch(k, pt);
    watch
}

/// Waits for a child process to exit; returns its pid.
pub fn wait(k: &Kernel, p: &Proc) -> Result<ProcId> {
    let mut pt = k.ptable.lock();
    loop {
        // Scan through the table looking for exited children.
        let mut havekids = false;
        for i in 0..NPROC {
            if pt.slots[i].parent != Some(p.idx) {
                continue;
            }
            havekids = true;
            if matches!(pt.slots[i].state, ProcState::Zombie { .. }) {
                let pid = pt.slots[i].pid;

                // Zombies never run again; their private side is ours.
                let np = &k.procs[i];
                let private = unsafe { np.private() };
                if let Some(kstack) = private.kstack.take() {
                    k.kmem.free(&k.mem, kstack);
                }
                if let Some(pgdir) = private.pgdir.take() {
                    freevm(&k.mem, &k.kmem, pgdir, private.sz);
                }
                private.sz = 0;
                private.prog = None;
                private.exit_watch = None;
                np.pid.store(-1, Ordering::Release);

                pt.slots[i].pid = ProcId::INVALID;
                pt.slots[i].parent = None;
                pt.slots[i].name.clear();
                pt.slots[i].killed = false;
                pt.slots[i].state = ProcState::Unused;
                return Ok(pid);
            }
        }

        // No point waiting if we don't have any children.
        if !havekids || pt.slots[p.idx].killed {
            return Err(KernelError::NoChildProcess);
        }

        // Wait for children to exit.
        pt.slots[p.idx].state = ProcState::Sleeping { chan: p.chan() };
        scheduler::sched(k, &mut pt, p);
    }
}

/// Prints a process listing to the console. Runs when a user types ^P.
pub fn dump(k: &Kernel) {
    let listing: Vec<(ProcId, ProcState, ArrayString<16>)> = {
        let pt = k.ptable.lock();
        pt.slots
            .iter()
            .filter(|s| s.state != ProcState::Unused)
            .map(|s| (s.pid, s.state, s.name))
            .collect()
    };

    kprintln!(k);
    for (pid, state, name) in listing {
        let state = match state {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping { .. } => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie { .. } => "zombie",
        };
        kprintln!(k, "{} {} {}", pid, state, name);
    }
}
