//! User mode, hosted.
//!
//! The machine does not decode user instructions; a user program is a
//! host closure bound to an executable path. Everything a program does
//! to the kernel still goes the long way around: arguments are written
//! into the process's own user stack through its page tables, the trap
//! frame's `eax` names the call, and the trap layer fetches and
//! validates every word exactly as it would for machine code.
//!
//! Two consequences of having no instruction set:
//!
//! * `fork` duplicates kernel state faithfully (address space, files,
//!   trap frame with `eax` = 0), but a host thread's stack cannot be
//!   duplicated, so the child's continuation closure is passed in by the
//!   caller.
//! * A successful `exec` loads the ELF image for real and then transfers
//!   control to the program registered for that path; the calling
//!   closure must return immediately afterwards, like machine code that
//!   never gets to run another instruction.

use std::sync::{mpsc, Arc};

use dataview::PodMethods as _;

use crate::{
    fs::stat::Stat,
    kernel::Kernel,
    memory::{
        vm_user::{copyin, copyout},
        VirtAddr,
    },
    proc::{Proc, ProcId},
    syscall::{OpenFlags, SyscallNo},
    trap::{self, Trap, TrapOutcome},
};

/// The bootstrap image installed by userinit at virtual address 0: the
/// hand-assembled stub that execs `/init` and spins on exit. The hosted
/// machine never decodes these bytes, but they are mapped, copied and
/// forked like any other user page.
pub static INIT_CODE: &[u8] = &[
    0x6a, 0x24, // push $argv
    0x6a, 0x1c, // push $init
    0x6a, 0x00, // push $0  (fake return pc)
    0xb8, 0x07, 0x00, 0x00, 0x00, // mov $SYS_exec, %eax
    0xcd, 0x40, // int $64
    0xb8, 0x02, 0x00, 0x00, 0x00, // mov $SYS_exit, %eax
    0xcd, 0x40, // int $64
    0xeb, 0xf9, // jmp <exit loop>
    b'/', b'i', b'n', b'i', b't', 0x00, 0x00, 0x00, // $init
    0x17, 0x00, 0x00, 0x00, // argv[0] = $init
    0x00, 0x00, 0x00, 0x00, // argv[1] = 0
];

const _: () = assert!(INIT_CODE.len() < 128);

/// A user program body.
pub enum Prog {
    /// Runs once; the usual shape for fork children and test drivers.
    Once(Box<dyn FnOnce(&mut UserCtx<'_>) -> i32 + Send + 'static>),
    /// An installed executable; exec may start it any number of times.
    Shared(Arc<dyn Fn(&mut UserCtx<'_>) -> i32 + Send + Sync + 'static>),
}

impl Prog {
    pub fn once(f: impl FnOnce(&mut UserCtx<'_>) -> i32 + Send + 'static) -> Self {
        Prog::Once(Box::new(f))
    }

    fn run(self, u: &mut UserCtx<'_>) -> i32 {
        match self {
            Prog::Once(f) => f(u),
            Prog::Shared(f) => f(u),
        }
    }
}

/// Runs a process's user side until it exits; the return value is the
/// exit status.
pub(crate) fn enter(k: &Arc<Kernel>, p: &Proc) -> i32 {
    loop {
        let prog = unsafe { p.private() }.prog.take();
        let Some(prog) = prog else {
            // Nothing to run in user space; the process just exits.
            return 0;
        };

        let mut u = UserCtx {
            k,
            p,
            dead: None,
            exec_handoff: false,
        };
        let ret = prog.run(&mut u);

        if let Some(status) = u.dead {
            return status;
        }
        if u.exec_handoff {
            // Control continues in the newly loaded image.
            continue;
        }
        // Falling off the end of a program is an exit.
        return ret;
    }
}

/// The register file and memory of a process, as its own user code sees
/// them. Every method that enters the kernel goes through the trap
/// path.
pub struct UserCtx<'k> {
    k: &'k Arc<Kernel>,
    p: &'k Proc,
    dead: Option<i32>,
    exec_handoff: bool,
}

impl UserCtx<'_> {
    /// Direct store to this process's own memory, as a `mov` would do.
    /// Fails on unmapped or kernel-only pages, as the MMU would.
    pub fn poke(&self, va: u32, data: &[u8]) -> bool {
        let private = unsafe { self.p.private() };
        copyout(&self.k.mem, private.pgdir.unwrap(), VirtAddr::new(va), data).is_ok()
    }

    /// Direct load from this process's own memory.
    pub fn peek(&self, va: u32, data: &mut [u8]) -> bool {
        let private = unsafe { self.p.private() };
        copyin(&self.k.mem, private.pgdir.unwrap(), data, VirtAddr::new(va)).is_ok()
    }

    /// Issues one system call: arguments on the user stack, number in
    /// `eax`, then the software interrupt.
    pub fn syscall(&mut self, no: SyscallNo, args: &[u32]) -> i32 {
        self.syscall_with(no, args, &[]).0
    }

    /// Like [`Self::syscall`], but first copies `blobs` onto the user
    /// stack; an argument equal to `BLOB_TAG + i` is replaced with the
    /// address of blob `i`. Returns the call's result and the addresses
    /// the blobs were placed at, so callers can read back what the
    /// kernel wrote into them.
    fn syscall_with(&mut self, no: SyscallNo, args: &[u32], blobs: &[&[u8]]) -> (i32, [u32; 8]) {
        if self.dead.is_some() {
            return (-1, [0; 8]);
        }

        let tf_entry = self.p.trapframe(self.k);
        let mut sp = tf_entry.esp;

        // Push blob data (strings, buffers) first.
        let mut blob_addrs = [0_u32; 8];
        for (i, blob) in blobs.iter().enumerate() {
            sp -= blob.len() as u32;
            sp &= !3;
            if !self.poke(sp, blob) {
                // The harness misbuilt a frame; that is a driver bug.
                panic!("user stack unwritable at {sp:#x}");
            }
            blob_addrs[i] = sp;
        }

        // Then the call frame: fake return address plus the arguments.
        let mut frame = Vec::with_capacity(4 * (args.len() + 1));
        frame.extend_from_slice(&0xffff_ffff_u32.to_le_bytes());
        for &a in args {
            let a = if a & BLOB_TAG == BLOB_TAG {
                blob_addrs[(a & 0x7) as usize]
            } else {
                a
            };
            frame.extend_from_slice(&a.to_le_bytes());
        }
        sp -= frame.len() as u32;
        sp &= !3;
        if !self.poke(sp, &frame) {
            panic!("user stack unwritable at {sp:#x}");
        }

        let mut tf = tf_entry;
        tf.esp = sp;
        tf.eax = no as u32;
        self.p.set_trapframe(self.k, &tf);

        let outcome = trap::usertrap(self.k, self.p, Trap::Syscall);

        let mut tf_after = self.p.trapframe(self.k);
        let ret = tf_after.eax as i32;

        if outcome == TrapOutcome::Exit {
            self.dead.get_or_insert(-1);
            return (-1, blob_addrs);
        }

        if no == SyscallNo::Exec && ret == 0 {
            // The old image is gone; do not touch its stack.
            self.exec_handoff = true;
        } else {
            tf_after.esp = tf_entry.esp;
            self.p.set_trapframe(self.k, &tf_after);
        }
        (ret, blob_addrs)
    }

    /// Issues a system call by raw number, for numbers the dispatch
    /// table may not know.
    pub fn syscall_raw(&mut self, no: u32) -> i32 {
        if self.dead.is_some() {
            return -1;
        }
        let tf_entry = self.p.trapframe(self.k);
        let mut tf = tf_entry;
        tf.eax = no;
        self.p.set_trapframe(self.k, &tf);

        let outcome = trap::usertrap(self.k, self.p, Trap::Syscall);
        let tf_after = self.p.trapframe(self.k);
        if outcome == TrapOutcome::Exit {
            self.dead.get_or_insert(-1);
            return -1;
        }
        tf_after.eax as i32
    }

    /// Lets a pending timer tick preempt this process, as it would
    /// between two user instructions.
    pub fn pause(&mut self) {
        if self.dead.is_some() {
            return;
        }
        if trap::usertrap(self.k, self.p, Trap::Timer) == TrapOutcome::Exit {
            self.dead.get_or_insert(-1);
        }
    }

    // The system-call stubs, in the shape the C library would give them.

    pub fn fork(
        &mut self,
        child: impl FnOnce(&mut UserCtx<'_>) -> i32 + Send + 'static,
    ) -> i32 {
        unsafe { self.p.private() }.spawn = Some(Prog::once(child));
        self.syscall(SyscallNo::Fork, &[])
    }

    pub fn exit(&mut self, status: i32) -> i32 {
        self.dead = Some(status);
        let mut tf = self.p.trapframe(self.k);
        tf.eax = SyscallNo::Exit as u32;
        self.p.set_trapframe(self.k, &tf);
        let _ = trap::usertrap(self.k, self.p, Trap::Syscall);
        -1
    }

    pub fn wait(&mut self) -> i32 {
        self.syscall(SyscallNo::Wait, &[])
    }

    pub fn kill(&mut self, pid: i32) -> i32 {
        self.syscall(SyscallNo::Kill, &[pid as u32])
    }

    pub fn getpid(&mut self) -> i32 {
        self.syscall(SyscallNo::Getpid, &[])
    }

    pub fn sbrk(&mut self, n: i32) -> i32 {
        self.syscall(SyscallNo::Sbrk, &[n as u32])
    }

    pub fn sleep(&mut self, ticks: i32) -> i32 {
        self.syscall(SyscallNo::Sleep, &[ticks as u32])
    }

    pub fn uptime(&mut self) -> i32 {
        self.syscall(SyscallNo::Uptime, &[])
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> i32 {
        let path0 = nul_terminated(path);
        self.syscall_with(SyscallNo::Open, &[BLOB_TAG, flags.bits()], &[&path0])
            .0
    }

    pub fn close(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNo::Close, &[fd as u32])
    }

    pub fn dup(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNo::Dup, &[fd as u32])
    }

    /// `read(fd, buf, n)` against a caller-supplied user address.
    pub fn read_at(&mut self, fd: i32, va: u32, n: usize) -> i32 {
        self.syscall(SyscallNo::Read, &[fd as u32, va, n as u32])
    }

    /// `write(fd, buf, n)` against a caller-supplied user address.
    pub fn write_at(&mut self, fd: i32, va: u32, n: usize) -> i32 {
        self.syscall(SyscallNo::Write, &[fd as u32, va, n as u32])
    }

    /// Convenience read through a scratch buffer in user memory.
    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> i32 {
        let Some(va) = self.scratch(buf.len()) else {
            return -1;
        };
        let r = self.read_at(fd, va, buf.len());
        if r > 0 {
            let r = r as usize;
            if !self.peek(va, &mut buf[..r]) {
                return -1;
            }
        }
        r
    }

    /// Convenience write through a scratch buffer in user memory.
    pub fn write(&mut self, fd: i32, data: &[u8]) -> i32 {
        let Some(va) = self.scratch(data.len()) else {
            return -1;
        };
        if !self.poke(va, data) {
            return -1;
        }
        self.write_at(fd, va, data.len())
    }

    pub fn fstat(&mut self, fd: i32) -> Option<Stat> {
        let zero = Stat::zeroed();
        let (r, addrs) = self.syscall_with(
            SyscallNo::Fstat,
            &[fd as u32, BLOB_TAG],
            &[zero.as_bytes()],
        );
        if r < 0 {
            return None;
        }
        let mut st = Stat::zeroed();
        if !self.peek(addrs[0], st.as_bytes_mut()) {
            return None;
        }
        Some(st)
    }

    pub fn pipe(&mut self) -> Option<(i32, i32)> {
        let (r, addrs) = self.syscall_with(SyscallNo::Pipe, &[BLOB_TAG], &[&[0_u8; 8]]);
        if r < 0 {
            return None;
        }
        let mut fds = [0_u8; 8];
        if !self.peek(addrs[0], &mut fds) {
            return None;
        }
        let fd0 = i32::from_le_bytes(fds[..4].try_into().unwrap());
        let fd1 = i32::from_le_bytes(fds[4..].try_into().unwrap());
        Some((fd0, fd1))
    }

    pub fn link(&mut self, old: &str, new: &str) -> i32 {
        let old0 = nul_terminated(old);
        let new0 = nul_terminated(new);
        self.syscall_with(SyscallNo::Link, &[BLOB_TAG, BLOB_TAG + 1], &[&old0, &new0])
            .0
    }

    pub fn unlink(&mut self, path: &str) -> i32 {
        let path0 = nul_terminated(path);
        self.syscall_with(SyscallNo::Unlink, &[BLOB_TAG], &[&path0]).0
    }

    pub fn mkdir(&mut self, path: &str) -> i32 {
        let path0 = nul_terminated(path);
        self.syscall_with(SyscallNo::Mkdir, &[BLOB_TAG], &[&path0]).0
    }

    pub fn mknod(&mut self, path: &str, major: i16, minor: i16) -> i32 {
        let path0 = nul_terminated(path);
        self.syscall_with(
            SyscallNo::Mknod,
            &[BLOB_TAG, major as u32, minor as u32],
            &[&path0],
        )
        .0
    }

    pub fn chdir(&mut self, path: &str) -> i32 {
        let path0 = nul_terminated(path);
        self.syscall_with(SyscallNo::Chdir, &[BLOB_TAG], &[&path0]).0
    }

    /// Replaces this image with the program at `path`. On success the
    /// caller must return; the process continues in the new program.
    pub fn exec(&mut self, path: &str, args: &[&str]) -> i32 {
        let path0 = nul_terminated(path);

        // argv strings, then the argv pointer array, all in user memory.
        let tf = self.p.trapframe(self.k);
        let mut sp = tf.esp;
        let mut addrs = Vec::new();
        for arg in args {
            let bytes = nul_terminated(arg);
            sp -= bytes.len() as u32;
            sp &= !3;
            if !self.poke(sp, &bytes) {
                return -1;
            }
            addrs.push(sp);
        }
        addrs.push(0);
        let mut argv_bytes = Vec::new();
        for a in &addrs {
            argv_bytes.extend_from_slice(&a.to_le_bytes());
        }
        sp -= argv_bytes.len() as u32;
        sp &= !3;
        if !self.poke(sp, &argv_bytes) {
            return -1;
        }
        let argv = sp;

        sp -= path0.len() as u32;
        sp &= !3;
        if !self.poke(sp, &path0) {
            return -1;
        }
        let path_addr = sp;

        // Build the call frame below everything just pushed.
        let mut frame = Vec::new();
        frame.extend_from_slice(&0xffff_ffff_u32.to_le_bytes());
        frame.extend_from_slice(&path_addr.to_le_bytes());
        frame.extend_from_slice(&argv.to_le_bytes());
        sp -= frame.len() as u32;
        sp &= !3;
        if !self.poke(sp, &frame) {
            return -1;
        }

        let mut tf = self.p.trapframe(self.k);
        let entry_esp = tf.esp;
        tf.esp = sp;
        tf.eax = SyscallNo::Exec as u32;
        self.p.set_trapframe(self.k, &tf);

        let outcome = trap::usertrap(self.k, self.p, Trap::Syscall);
        let mut tf_after = self.p.trapframe(self.k);
        let ret = tf_after.eax as i32;

        if outcome == TrapOutcome::Exit {
            self.dead.get_or_insert(-1);
            return -1;
        }
        if ret == 0 {
            self.exec_handoff = true;
        } else {
            tf_after.esp = entry_esp;
            self.p.set_trapframe(self.k, &tf_after);
        }
        ret
    }

    /// The argc/argv the loader left on the stack, for a program started
    /// by exec.
    pub fn args(&self) -> Vec<String> {
        let tf = self.p.trapframe(self.k);
        let mut word = [0_u8; 4];
        if !self.peek(tf.esp + 4, &mut word) {
            return Vec::new();
        }
        let argc = u32::from_le_bytes(word);
        if !self.peek(tf.esp + 8, &mut word) {
            return Vec::new();
        }
        let argv = u32::from_le_bytes(word);

        let mut out = Vec::new();
        for i in 0..argc {
            if !self.peek(argv + 4 * i, &mut word) {
                break;
            }
            let mut sp = u32::from_le_bytes(word);
            let mut s = Vec::new();
            let mut byte = [0_u8; 1];
            while self.peek(sp, &mut byte) && byte[0] != 0 {
                s.push(byte[0]);
                sp += 1;
            }
            out.push(String::from_utf8_lossy(&s).into_owned());
        }
        out
    }

    /// A scratch buffer in this process's heap, grown with sbrk.
    fn scratch(&mut self, len: usize) -> Option<u32> {
        let addr = self.sbrk(len as i32);
        if addr < 0 {
            return None;
        }
        Some(addr as u32)
    }
}

const BLOB_TAG: u32 = 0xb10b_0000;

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

/// Handle on the first process, returned by [`Kernel::user_init`].
pub struct InitHandle {
    pub(crate) pid: ProcId,
    pub(crate) rx: mpsc::Receiver<i32>,
}

impl InitHandle {
    pub fn pid(&self) -> i32 {
        self.pid.get()
    }

    /// Blocks until init exits; `None` means its kernel thread died on a
    /// panic instead.
    pub fn wait(self) -> Option<i32> {
        self.rx.recv().ok()
    }

    /// Like `wait`, but gives up after `timeout`.
    pub fn wait_timeout(self, timeout: std::time::Duration) -> Option<i32> {
        self.rx.recv_timeout(timeout).ok()
    }
}
