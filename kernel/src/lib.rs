//! ox6: the xv6 kernel core on a simulated 32-bit x86 SMP machine.
//!
//! The whole kernel is a value: [`Kernel::boot`] constructs the physical
//! memory arena, the page allocator, the buffer cache, the log, the inode
//! and file tables, the process table and the per-CPU schedulers, and
//! returns a handle that tests (and the demo binary) drive through the
//! system-call trap path.
//!
//! The machine is simulated, the kernel is not: page tables are real x86
//! two-level tables living in simulated frames, the log is a real redo log
//! on a block device, and every locking rule of the original design
//! (spinlocks with interrupts pushed off, sleeplocks, the single
//! process-table lock held across context switches) is enforced with the
//! original assertions.

#[macro_use]
pub mod console;

pub mod cpu;
pub mod error;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod memory;
pub mod param;
pub mod proc;
pub mod sync;
pub mod syscall;
pub mod trap;
pub mod usermode;

pub use self::{
    error::{KernelError, Result},
    fs::stat::Stat,
    hal::disk::{DiskBackend, MemDisk},
    kernel::{Config, Kernel},
    syscall::OpenFlags,
    usermode::{InitHandle, UserCtx},
};
