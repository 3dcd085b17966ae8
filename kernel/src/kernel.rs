//! The kernel as a value.
//!
//! One `Kernel` owns the whole machine state: the physical memory arena,
//! the page allocator, the buffer cache, the log, the inode/file/process
//! tables, the console, and the CPUs. `boot` brings the moving parts up
//! in the same order the original brings up hardware; `shutdown` parks
//! them again. Tests construct as many private kernels as they like.

use core::{
    ptr,
    sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
};
use std::{
    collections::HashMap,
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    console::{self, Console},
    cpu::{self, Cpu, NIRQ_CTX},
    error::Result,
    file::{device::Devices, FileTable},
    fs::{
        self,
        bio::Bcache,
        ide::{self, Ide},
        inode::Itable,
        log::Log,
        repr::SuperBlock,
    },
    hal::{disk::DiskBackend, mem::PhysMemory},
    memory::{
        page::Kmem,
        page_table::PageDir,
        vm::setupkvm,
        BOOT_MAPPED, KERN_IMAGE_END, PHYSTOP_DEFAULT,
    },
    param::{NCPU, NPROC, ROOTDEV},
    proc::{self, scheduler, Proc, ProcTable},
    sync::SpinLock,
    usermode::{InitHandle, Prog, UserCtx},
};

type SharedProg = Arc<dyn Fn(&mut UserCtx<'_>) -> i32 + Send + Sync + 'static>;

#[derive(Clone)]
pub struct Config {
    /// Scheduler CPUs to bring up.
    pub ncpu: usize,
    /// Top of simulated physical memory.
    pub phystop: u32,
    /// Wall-clock length of one timer tick.
    pub tick: Duration,
    /// Mirror console output to the host's stdout.
    pub echo_console: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ncpu: 2,
            phystop: PHYSTOP_DEFAULT,
            tick: Duration::from_millis(1),
            echo_console: false,
        }
    }
}

pub struct Kernel {
    pub(crate) mem: PhysMemory,
    pub(crate) kmem: Kmem,
    kpgdir: OnceLock<PageDir>,

    pub(crate) cpus: Box<[Cpu]>,
    ncpu: usize,

    pub(crate) ptable: SpinLock<ProcTable>,
    pub(crate) procs: Box<[Proc]>,
    pub(crate) nextpid: AtomicI32,
    pub(crate) initproc: AtomicUsize,

    pub(crate) ticks: SpinLock<u32>,

    pub(crate) bcache: Bcache,
    pub(crate) ide: Ide,
    pub(crate) log: Log,
    pub(crate) itable: Itable,
    pub(crate) ftable: FileTable,
    pub(crate) devsw: Devices,
    pub(crate) console: Console,

    superblock: OnceLock<SuperBlock>,
    mounted: AtomicBool,

    progs: Mutex<HashMap<Vec<u8>, SharedProg>>,

    panicked: AtomicBool,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes external interrupt injections onto the one external
    /// interrupt context.
    irq_gate: Mutex<()>,
}

impl Kernel {
    /// Brings the machine up: memory, kernel page table, console, disk
    /// worker, timer and the per-CPU schedulers. The first process comes
    /// later, from [`Kernel::user_init`].
    pub fn boot(config: Config, disk: impl DiskBackend + 'static) -> Arc<Kernel> {
        let ncpu = config.ncpu.clamp(1, NCPU);
        assert!(config.phystop > BOOT_MAPPED, "machine too small");

        let k = Arc::new(Kernel {
            mem: PhysMemory::new(config.phystop),
            kmem: Kmem::new(),
            kpgdir: OnceLock::new(),
            cpus: (0..ncpu + NIRQ_CTX).map(Cpu::new).collect(),
            ncpu,
            ptable: SpinLock::new(ProcTable::new()),
            procs: (0..NPROC).map(Proc::new).collect(),
            nextpid: AtomicI32::new(1),
            initproc: AtomicUsize::new(usize::MAX),
            ticks: SpinLock::new(0),
            bcache: Bcache::new(),
            ide: Ide::new(Box::new(disk)),
            log: Log::new(),
            itable: Itable::new(),
            ftable: FileTable::new(),
            devsw: Devices::new(),
            console: Console::new(config.echo_console),
            superblock: OnceLock::new(),
            mounted: AtomicBool::new(false),
            progs: Mutex::new(HashMap::new()),
            panicked: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            irq_gate: Mutex::new(()),
        });

        // The boot path runs on CPU 0 until the schedulers take over.
        unsafe { cpu::set_current(&k.cpus[0]) };

        // Physical pages the boot page directory maps, then the kernel
        // window, then the rest of memory with locking on.
        k.kmem.init1(&k.mem, KERN_IMAGE_END, BOOT_MAPPED);
        let kpgdir = setupkvm(&k.mem, &k.kmem).expect("kvmalloc");
        k.kpgdir.set(kpgdir).unwrap();
        console::init(&k);
        k.kmem.init2(&k.mem, BOOT_MAPPED, config.phystop);

        let mut threads = Vec::new();

        // Disk worker, on its interrupt context.
        {
            let k2 = Arc::clone(&k);
            let ctx = ncpu + 1;
            threads.push(
                std::thread::Builder::new()
                    .name("ide".into())
                    .spawn(move || {
                        unsafe { cpu::set_current(&k2.cpus[ctx]) };
                        ide::worker(&k2);
                    })
                    .unwrap(),
            );
        }

        // Timer, on its interrupt context.
        {
            let k2 = Arc::clone(&k);
            let ctx = ncpu;
            let tick = config.tick;
            threads.push(
                std::thread::Builder::new()
                    .name("timer".into())
                    .spawn(move || {
                        unsafe { cpu::set_current(&k2.cpus[ctx]) };
                        while !k2.is_shutdown() {
                            std::thread::sleep(tick);
                            let mut ticks = k2.ticks.lock();
                            *ticks = ticks.wrapping_add(1);
                            drop(ticks);
                            proc::wakeup(&k2, k2.ticks_chan());
                        }
                    })
                    .unwrap(),
            );
        }

        unsafe { cpu::set_current(ptr::null()) };

        // One scheduler per CPU.
        for id in 0..ncpu {
            let k2 = Arc::clone(&k);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("cpu{id}"))
                    .spawn(move || scheduler::scheduler(&k2, id))
                    .unwrap(),
            );
        }

        *k.threads.lock().unwrap() = threads;
        k
    }

    /// Runs `f` on the external interrupt context. This is how anything
    /// outside the machine (tests, the demo binary, injected input)
    /// is allowed to touch kernel locks. A thread that already has a
    /// CPU (a process injecting input into itself) takes the interrupt
    /// on its own CPU instead.
    pub(crate) fn enter_external<R>(&self, f: impl FnOnce() -> R) -> R {
        if cpu::try_current().is_some() {
            return f();
        }
        let _gate = self.irq_gate.lock().unwrap();
        unsafe { cpu::set_current(&self.cpus[self.ncpu + 2]) };
        let r = f();
        unsafe { cpu::set_current(ptr::null()) };
        r
    }

    /// Creates the first user process around `f`.
    pub fn user_init(
        self: &Arc<Self>,
        f: impl FnOnce(&mut UserCtx<'_>) -> i32 + Send + 'static,
    ) -> Result<InitHandle> {
        let (watch, rx) = mpsc::channel();
        let pid =
            self.enter_external(|| proc::userinit(self, Prog::once(f), watch))?;
        Ok(InitHandle { pid, rx })
    }

    /// Registers an executable: `exec(path)` transfers control to `f`
    /// after loading the on-disk image at that path.
    pub fn register_prog(
        &self,
        path: &str,
        f: impl Fn(&mut UserCtx<'_>) -> i32 + Send + Sync + 'static,
    ) {
        let key = path.trim_start_matches('/').as_bytes().to_vec();
        self.progs.lock().unwrap().insert(key, Arc::new(f));
    }

    pub(crate) fn lookup_prog(&self, path: &[u8]) -> Option<Prog> {
        let key: &[u8] = if path.first() == Some(&b'/') {
            &path[1..]
        } else {
            path
        };
        let progs = self.progs.lock().unwrap();
        progs.get(key).map(|f| Prog::Shared(Arc::clone(f)))
    }

    /// Parks the machine: schedulers, timer and disk worker exit and are
    /// joined. All processes should have exited first.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ide.shutdown_nudge();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fatal kernel error: report, raise the panicked flag that freezes
    /// every other CPU's console output, and take this CPU down.
    pub fn panic(&self, msg: &str) -> ! {
        kprintln!(self, "panic: {}", msg);
        let bt = std::backtrace::Backtrace::force_capture();
        kprintln!(self, "{}", bt);
        self.panicked.store(true, Ordering::SeqCst);
        panic!("kernel panic: {msg}");
    }

    pub fn has_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    pub(crate) fn ticks_chan(&self) -> usize {
        ptr::from_ref(&self.ticks) as usize
    }

    pub fn ticks(&self) -> u32 {
        self.enter_external(|| *self.ticks.lock())
    }

    pub(crate) fn kpgdir(&self) -> PageDir {
        *self.kpgdir.get().expect("kernel page table not built")
    }

    pub(crate) fn set_superblock(&self, sb: SuperBlock) {
        self.superblock.set(sb).ok().expect("superblock already read");
    }

    pub(crate) fn superblock(&self) -> &SuperBlock {
        self.superblock.get().expect("file system not mounted")
    }

    /// Mounts the root file system the first time a process runs.
    pub(crate) fn mount_once(&self) {
        if self
            .mounted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            fs::init(self, ROOTDEV);
        }
    }

    pub(crate) fn initproc_idx(&self) -> Option<usize> {
        let idx = self.initproc.load(Ordering::Acquire);
        (idx != usize::MAX).then_some(idx)
    }

    // Diagnostics, mostly for tests.

    /// Frames currently on the free list.
    pub fn free_pages(&self) -> usize {
        self.enter_external(|| self.kmem.free_count())
    }

    /// At most one cache buffer names any (device, block) pair.
    pub fn bcache_identities_unique(&self) -> bool {
        self.enter_external(|| self.bcache.identities_unique())
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Injects bytes as serial-line input interrupts.
    pub fn serial_input(&self, bytes: &[u8]) {
        self.enter_external(|| {
            for &b in bytes {
                console::intr(self, b);
            }
        });
    }

    /// Injects raw keyboard scancodes.
    pub fn kbd_input(&self, scancodes: &[u8]) {
        self.enter_external(|| {
            for &sc in scancodes {
                console::kbd_intr(self, sc);
            }
        });
    }
}
