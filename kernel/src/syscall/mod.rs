//! System call dispatch and argument fetching.
//!
//! Arguments arrive on the caller's user stack: at the time of the trap,
//! `esp` points at a return address, with the word-sized arguments right
//! above it. Every fetch is bounds-checked against the process's
//! address-space size; user code cannot make the kernel read or write
//! outside its own address space.

use std::sync::Arc;

use bitflags::bitflags;
use strum::FromRepr;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    memory::{vm_user::copyin, VirtAddr},
    param::MAXPATH,
    proc::Proc,
    trap::TrapOutcome,
};

mod file;
mod proc;

bitflags! {
    /// `open` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum SyscallNo {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
}

/// Fetches the 32-bit word at `addr` in the current process.
pub fn fetchint(k: &Kernel, p: &Proc, addr: u32) -> Result<i32> {
    let private = unsafe { p.private() };
    if addr >= private.sz || addr.checked_add(4).is_none_or(|end| end > private.sz) {
        return Err(KernelError::BadAddress(VirtAddr::new(addr)));
    }
    let mut word = [0_u8; 4];
    copyin(
        &k.mem,
        private.pgdir.unwrap(),
        &mut word,
        VirtAddr::new(addr),
    )?;
    Ok(i32::from_le_bytes(word))
}

/// Fetches the NUL-terminated string at `addr`; the terminator must lie
/// within the address space and within `MAXPATH` bytes.
pub fn fetchstr(k: &Kernel, p: &Proc, addr: u32) -> Result<Vec<u8>> {
    let private = unsafe { p.private() };
    if addr >= private.sz {
        return Err(KernelError::BadAddress(VirtAddr::new(addr)));
    }
    let pgdir = private.pgdir.unwrap();

    let mut out = Vec::new();
    let max = u32::min(private.sz - addr, MAXPATH as u32);
    for i in 0..max {
        let mut byte = [0_u8; 1];
        copyin(&k.mem, pgdir, &mut byte, VirtAddr::new(addr + i))?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
    }
    Err(KernelError::UnterminatedString(VirtAddr::new(addr)))
}

/// Fetches the n-th 32-bit system call argument.
pub fn argint(k: &Kernel, p: &Proc, n: usize) -> Result<i32> {
    let esp = p.trapframe(k).esp;
    fetchint(k, p, esp + 4 + 4 * n as u32)
}

/// Fetches the n-th argument as a pointer to a block of `size` bytes,
/// checking that it lies within the process's address space.
pub fn argptr(k: &Kernel, p: &Proc, n: usize, size: usize) -> Result<VirtAddr> {
    let i = argint(k, p, n)?;
    let private = unsafe { p.private() };
    let addr = i as u32;
    if i < 0
        || addr >= private.sz
        || addr.checked_add(size as u32).is_none_or(|end| end > private.sz)
    {
        return Err(KernelError::BadAddress(VirtAddr::new(addr)));
    }
    Ok(VirtAddr::new(addr))
}

/// Fetches the n-th argument as a NUL-terminated string.
pub fn argstr(k: &Kernel, p: &Proc, n: usize) -> Result<Vec<u8>> {
    let addr = argint(k, p, n)?;
    fetchstr(k, p, addr as u32)
}

/// Fetches the n-th argument as a file descriptor index; the caller
/// resolves it against its own open-file table.
pub fn argfd(k: &Kernel, p: &Proc, n: usize) -> Result<usize> {
    let fd = argint(k, p, n)?;
    let private = unsafe { p.private() };
    let fd = usize::try_from(fd).map_err(|_| KernelError::BadFileDescriptor)?;
    if fd >= private.ofile.len() || private.ofile[fd].is_none() {
        return Err(KernelError::BadFileDescriptor);
    }
    Ok(fd)
}

/// Dispatches the system call named by `eax`, leaving the return value
/// (or -1) in `eax`.
pub(crate) fn dispatch(k: &Arc<Kernel>, p: &Proc) -> TrapOutcome {
    let num = p.trapframe(k).eax;

    let ret: Result<u32> = match SyscallNo::from_repr(num) {
        None => {
            let pt = k.ptable.lock();
            let (pid, name) = (pt.slots[p.idx].pid, pt.slots[p.idx].name);
            drop(pt);
            kprintln!(k, "{} {}: unknown sys call {}", pid, name, num);
            Err(KernelError::BadAddress(VirtAddr::ZERO))
        }
        Some(SyscallNo::Fork) => self::proc::sys_fork(k, p),
        Some(SyscallNo::Exit) => return self::proc::sys_exit(k, p),
        Some(SyscallNo::Wait) => self::proc::sys_wait(k, p),
        Some(SyscallNo::Pipe) => self::file::sys_pipe(k, p),
        Some(SyscallNo::Read) => self::file::sys_read(k, p),
        Some(SyscallNo::Kill) => self::proc::sys_kill(k, p),
        Some(SyscallNo::Exec) => self::file::sys_exec(k, p),
        Some(SyscallNo::Fstat) => self::file::sys_fstat(k, p),
        Some(SyscallNo::Chdir) => self::file::sys_chdir(k, p),
        Some(SyscallNo::Dup) => self::file::sys_dup(k, p),
        Some(SyscallNo::Getpid) => self::proc::sys_getpid(k, p),
        Some(SyscallNo::Sbrk) => self::proc::sys_sbrk(k, p),
        Some(SyscallNo::Sleep) => self::proc::sys_sleep(k, p),
        Some(SyscallNo::Uptime) => self::proc::sys_uptime(k, p),
        Some(SyscallNo::Open) => self::file::sys_open(k, p),
        Some(SyscallNo::Write) => self::file::sys_write(k, p),
        Some(SyscallNo::Mknod) => self::file::sys_mknod(k, p),
        Some(SyscallNo::Unlink) => self::file::sys_unlink(k, p),
        Some(SyscallNo::Link) => self::file::sys_link(k, p),
        Some(SyscallNo::Mkdir) => self::file::sys_mkdir(k, p),
        Some(SyscallNo::Close) => self::file::sys_close(k, p),
    };

    let mut tf = p.trapframe(k);
    tf.eax = ret.unwrap_or(u32::MAX);
    p.set_trapframe(k, &tf);
    TrapOutcome::Return
}
