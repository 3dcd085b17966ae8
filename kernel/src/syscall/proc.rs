//! Process-related system calls.

use std::sync::Arc;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    proc::{self, Proc, ProcId},
    syscall::argint,
    trap::TrapOutcome,
};

pub fn sys_fork(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let pid = proc::fork(k, p)?;
    Ok(pid.get() as u32)
}

pub fn sys_exit(k: &Arc<Kernel>, p: &Proc) -> TrapOutcome {
    if k.initproc_idx() == Some(p.idx) {
        k.panic("init exiting");
    }
    TrapOutcome::Exit
}

pub fn sys_wait(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let pid = proc::wait(k, p)?;
    Ok(pid.get() as u32)
}

pub fn sys_kill(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let pid = argint(k, p, 0)?;
    proc::kill(k, ProcId::new(pid))?;
    Ok(0)
}

pub fn sys_getpid(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let _ = k;
    Ok(p.pid().get() as u32)
}

pub fn sys_sbrk(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let n = argint(k, p, 0)?;
    let addr = unsafe { p.private() }.sz;
    proc::growproc(k, p, n)?;
    Ok(addr)
}

pub fn sys_sleep(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let n = argint(k, p, 0)?;
    let n = u32::try_from(n).map_err(|_| KernelError::Killed)?;

    let mut ticks = k.ticks.lock();
    let ticks0 = *ticks;
    while ticks.wrapping_sub(ticks0) < n {
        if proc::killed(k, p) {
            return Err(KernelError::Killed);
        }
        ticks = proc::sleep(k, k.ticks_chan(), ticks);
    }
    Ok(0)
}

pub fn sys_uptime(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let _ = p;
    Ok(*k.ticks.lock())
}
