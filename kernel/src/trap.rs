//! Trap frames and user-trap dispatch.
//!
//! Every kernel entry from user space lands here: system calls, timer
//! ticks, and faults. The trap frame is the register snapshot at kernel
//! entry and lives at the top of the process's kernel stack page.
//!
//! On the way back to user space the process pays its debts: a killed
//! process exits instead of returning, and a timer tick forces a yield,
//! which is what makes user-mode scheduling round-robin.

use std::sync::Arc;

use dataview::{Pod, PodMethods as _};

use crate::{kernel::Kernel, proc, proc::Proc, syscall};

/// Eflags interrupt-enable bit.
pub const FL_IF: u32 = 0x200;

/// User code segment selector (ring 3).
pub const SEG_UCODE: u16 = (3 << 3) | 3;
/// User data segment selector (ring 3).
pub const SEG_UDATA: u16 = (4 << 3) | 3;

/// Register snapshot at kernel entry, laid out the way the hardware and
/// the entry path push it.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct TrapFrame {
    // registers as pushed by pusha
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // useless & ignored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // rest of trap frame
    pub gs: u16,
    pub padding1: u16,
    pub fs: u16,
    pub padding2: u16,
    pub es: u16,
    pub padding3: u16,
    pub ds: u16,
    pub padding4: u16,
    pub trapno: u32,

    // below here defined by x86 hardware
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding5: u16,
    pub eflags: u32,

    // below here only when crossing rings
    pub esp: u32,
    pub ss: u16,
    pub padding6: u16,
}

impl TrapFrame {
    /// A frame set up to enter user mode: user segments, interrupts on.
    pub fn user_default() -> Self {
        let mut tf = Self::zeroed();
        tf.cs = SEG_UCODE;
        tf.ds = SEG_UDATA;
        tf.es = tf.ds;
        tf.ss = tf.ds;
        tf.eflags = FL_IF;
        tf
    }
}

/// What entered the kernel.
#[derive(Debug, Clone, Copy)]
pub enum Trap {
    /// Software interrupt with the call number in `eax`.
    Syscall,
    /// Clock tick delivered to this CPU.
    Timer,
    /// Access fault at the given address.
    PageFault { addr: u32 },
}

/// How the trap resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Resume user execution.
    Return,
    /// The process is done; unwind to the exit path.
    Exit,
}

/// Handles a trap taken from user space, then runs the return-path
/// checks.
pub fn usertrap(k: &Arc<Kernel>, p: &Proc, trap: Trap) -> TrapOutcome {
    match trap {
        Trap::Syscall => {
            if proc::killed(k, p) {
                return TrapOutcome::Exit;
            }
            if syscall::dispatch(k, p) == TrapOutcome::Exit {
                return TrapOutcome::Exit;
            }
        }
        Trap::Timer => {}
        Trap::PageFault { addr } => {
            // In user space; assume process misbehaved.
            let pid = p.pid();
            let tf = p.trapframe(k);
            kprintln!(
                k,
                "pid {} ({}): trap 14 eip {:#x} addr {:#x}--kill proc",
                pid,
                crate::cpu::current().id,
                tf.eip,
                addr
            );
            let mut pt = k.ptable.lock();
            pt.slots[p.idx].killed = true;
        }
    }

    // Force process exit if it has been killed and is in user space.
    if proc::killed(k, p) {
        return TrapOutcome::Exit;
    }

    // Force process to give up the CPU on a clock tick. A tick that
    // landed during a system call is honored here, on the way out.
    let ticks = *k.ticks.lock();
    let private = unsafe { p.private() };
    if matches!(trap, Trap::Timer) || private.last_tick != ticks {
        private.last_tick = ticks;
        proc::yield_(k, p);
    }

    // Check again: the process may have been killed while it yielded.
    if proc::killed(k, p) {
        return TrapOutcome::Exit;
    }

    TrapOutcome::Return
}
