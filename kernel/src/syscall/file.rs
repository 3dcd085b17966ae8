//! File-related system calls. Mostly argument marshalling around the
//! file-descriptor and file-system layers.

use core::cell::Cell;
use std::sync::Arc;

use crate::{
    error::{KernelError, Result},
    file::{falloc, fclose, fdup, pipe::Pipe, File, FileInner, FileKind},
    fs::{
        inode::iput,
        ops, path,
        stat::{T_DEV, T_DIR, T_FILE},
    },
    kernel::Kernel,
    memory::vm_user::{copyout, DstBuf, SrcBuf},
    param::{MAXARG, NDEV},
    proc::{exec, Proc, ProcPrivate},
    syscall::{argfd, argint, argptr, argstr, fetchint, fetchstr, OpenFlags},
};

/// Allocates a file descriptor for the given file; hands the file back
/// on exhaustion.
fn fdalloc(private: &mut ProcPrivate, f: File) -> core::result::Result<usize, File> {
    for (fd, slot) in private.ofile.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(f);
            return Ok(fd);
        }
    }
    Err(f)
}

pub fn sys_dup(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let fd = argfd(k, p, 0)?;
    let private = unsafe { p.private() };
    let f = fdup(k, private.ofile[fd].as_ref().unwrap());
    match fdalloc(private, f) {
        Ok(fd) => Ok(fd as u32),
        Err(f) => {
            fclose(k, f);
            Err(KernelError::TooManyOpenFiles)
        }
    }
}

pub fn sys_read(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let fd = argfd(k, p, 0)?;
    let n = argint(k, p, 2)?;
    let n = usize::try_from(n).map_err(|_| KernelError::BadFileDescriptor)?;
    let va = argptr(k, p, 1, n)?;

    let private = unsafe { p.private() };
    let dst = DstBuf::User {
        pgdir: private.pgdir.unwrap(),
        va,
        len: n,
    };
    let r = crate::file::fread(k, private.ofile[fd].as_ref().unwrap(), dst)?;
    Ok(r as u32)
}

pub fn sys_write(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let fd = argfd(k, p, 0)?;
    let n = argint(k, p, 2)?;
    let n = usize::try_from(n).map_err(|_| KernelError::BadFileDescriptor)?;
    let va = argptr(k, p, 1, n)?;

    let private = unsafe { p.private() };
    let src = SrcBuf::User {
        pgdir: private.pgdir.unwrap(),
        va,
        len: n,
    };
    let r = crate::file::fwrite(k, private.ofile[fd].as_ref().unwrap(), src)?;
    Ok(r as u32)
}

pub fn sys_close(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let fd = argfd(k, p, 0)?;
    let private = unsafe { p.private() };
    let f = private.ofile[fd].take().unwrap();
    fclose(k, f);
    Ok(0)
}

pub fn sys_fstat(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let fd = argfd(k, p, 0)?;
    let va = argptr(k, p, 1, size_of::<crate::fs::stat::Stat>())?;

    let private = unsafe { p.private() };
    let st = crate::file::fstat(k, private.ofile[fd].as_ref().unwrap())?;
    copyout(&k.mem, private.pgdir.unwrap(), va, dataview::PodMethods::as_bytes(&st))?;
    Ok(0)
}

pub fn sys_link(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let old = argstr(k, p, 0)?;
    let new = argstr(k, p, 1)?;

    let tx = k.begin_tx();
    let private = unsafe { p.private() };
    ops::link(&tx, private.cwd.as_ref(), &old, &new)?;
    Ok(0)
}

pub fn sys_unlink(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let path = argstr(k, p, 0)?;

    let tx = k.begin_tx();
    let private = unsafe { p.private() };
    ops::unlink(&tx, private.cwd.as_ref(), &path)?;
    Ok(0)
}

pub fn sys_open(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let path = argstr(k, p, 0)?;
    let omode = OpenFlags::from_bits_retain(argint(k, p, 1)? as u32);

    let tx = k.begin_tx();
    let private = unsafe { p.private() };
    let cwd = private.cwd.as_ref();

    let ip = if omode.contains(OpenFlags::CREATE) {
        ops::create(&tx, cwd, &path, T_FILE, 0, 0)?
    } else {
        let ip = path::resolve(&tx, cwd, &path)?;
        let g = ip.lock(k);
        if g.ty == T_DIR && omode != OpenFlags::RDONLY {
            g.unlock_put(&tx, ip);
            return Err(KernelError::BadInodeType);
        }
        g.unlock();
        ip
    };

    let g = ip.lock(k);
    let (ty, major) = (g.ty, g.major);
    if ty == T_DEV && (major < 0 || major as usize >= NDEV) {
        g.unlock_put(&tx, ip);
        return Err(KernelError::NoDevice);
    }
    g.unlock();

    let readable = !omode.contains(OpenFlags::WRONLY);
    let writable = omode.contains(OpenFlags::WRONLY) || omode.contains(OpenFlags::RDWR);
    let kind = if ty == T_DEV {
        FileKind::Device { major, ip }
    } else {
        FileKind::Inode {
            ip,
            off: Cell::new(0),
        }
    };

    let f = match falloc(k, FileInner { kind, readable, writable }) {
        Ok(f) => f,
        Err(inner) => {
            let (FileKind::Inode { ip, .. } | FileKind::Device { ip, .. }) = inner.kind
            else {
                unreachable!()
            };
            iput(&tx, ip);
            return Err(KernelError::TooManyOpenFilesSystem);
        }
    };
    drop(tx);

    match fdalloc(private, f) {
        Ok(fd) => Ok(fd as u32),
        Err(f) => {
            fclose(k, f);
            Err(KernelError::TooManyOpenFiles)
        }
    }
}

pub fn sys_mkdir(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let path = argstr(k, p, 0)?;

    let tx = k.begin_tx();
    let private = unsafe { p.private() };
    let ip = ops::create(&tx, private.cwd.as_ref(), &path, T_DIR, 0, 0)?;
    iput(&tx, ip);
    Ok(0)
}

pub fn sys_mknod(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let path = argstr(k, p, 0)?;
    let major = argint(k, p, 1)? as i16;
    let minor = argint(k, p, 2)? as i16;

    let tx = k.begin_tx();
    let private = unsafe { p.private() };
    let ip = ops::create(&tx, private.cwd.as_ref(), &path, T_DEV, major, minor)?;
    iput(&tx, ip);
    Ok(0)
}

pub fn sys_chdir(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let path = argstr(k, p, 0)?;

    let tx = k.begin_tx();
    let private = unsafe { p.private() };
    let ip = path::resolve(&tx, private.cwd.as_ref(), &path)?;
    let g = ip.lock(k);
    if g.ty != T_DIR {
        g.unlock_put(&tx, ip);
        return Err(KernelError::NotADirectory);
    }
    g.unlock();
    let old = private.cwd.replace(ip).unwrap();
    iput(&tx, old);
    Ok(0)
}

pub fn sys_pipe(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let va = argptr(k, p, 0, 2 * size_of::<i32>())?;
    let private = unsafe { p.private() };

    let pipe = Pipe::new();
    let rf = falloc(
        k,
        FileInner {
            kind: FileKind::Pipe {
                pipe: Arc::clone(&pipe),
            },
            readable: true,
            writable: false,
        },
    )
    .map_err(|_| KernelError::TooManyOpenFilesSystem)?;
    let wf = match falloc(
        k,
        FileInner {
            kind: FileKind::Pipe { pipe },
            readable: false,
            writable: true,
        },
    ) {
        Ok(wf) => wf,
        Err(_) => {
            fclose(k, rf);
            return Err(KernelError::TooManyOpenFilesSystem);
        }
    };

    let fd0 = match fdalloc(private, rf) {
        Ok(fd) => fd,
        Err(rf) => {
            fclose(k, rf);
            fclose(k, wf);
            return Err(KernelError::TooManyOpenFiles);
        }
    };
    let fd1 = match fdalloc(private, wf) {
        Ok(fd) => fd,
        Err(wf) => {
            fclose(k, private.ofile[fd0].take().unwrap());
            fclose(k, wf);
            return Err(KernelError::TooManyOpenFiles);
        }
    };

    let fds = [fd0 as i32, fd1 as i32];
    let mut bytes = [0_u8; 8];
    bytes[..4].copy_from_slice(&fds[0].to_le_bytes());
    bytes[4..].copy_from_slice(&fds[1].to_le_bytes());
    if copyout(&k.mem, private.pgdir.unwrap(), va, &bytes).is_err() {
        fclose(k, private.ofile[fd0].take().unwrap());
        fclose(k, private.ofile[fd1].take().unwrap());
        return Err(KernelError::BadAddress(va));
    }
    Ok(0)
}

pub fn sys_exec(k: &Arc<Kernel>, p: &Proc) -> Result<u32> {
    let path = argstr(k, p, 0)?;
    let uargv = argint(k, p, 1)? as u32;

    let mut argv: Vec<Vec<u8>> = Vec::new();
    loop {
        if argv.len() >= MAXARG {
            return Err(KernelError::ArgumentListTooLong);
        }
        let uarg = fetchint(k, p, uargv + 4 * argv.len() as u32)? as u32;
        if uarg == 0 {
            break;
        }
        argv.push(fetchstr(k, p, uarg)?);
    }

    exec::exec(k, p, &path, &argv)?;
    Ok(0)
}
