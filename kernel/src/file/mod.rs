//! Open files.
//!
//! Open-file objects live in a global table and are shared by reference
//! count: `dup` and `fork` add holders, `close` drops one, and the last
//! close tears down whatever the object wraps (pipe end or inode
//! reference). A [`File`] handle is one reference-count unit and must be
//! closed explicitly, like an inode pin.

use core::cell::{Cell, UnsafeCell};
use std::sync::Arc;

use crate::{
    error::{KernelError, Result},
    fs::{
        inode::{iput, Inode},
        repr::BSIZE,
        stat::Stat,
    },
    kernel::Kernel,
    memory::vm_user::{DstBuf, SrcBuf},
    param::{MAXOPBLOCKS, NFILE},
    sync::SpinLock,
};

pub mod device;
pub mod pipe;

use self::pipe::Pipe;

pub enum FileKind {
    Pipe {
        pipe: Arc<Pipe>,
    },
    Inode {
        ip: Inode,
        /// Current byte offset; read-modify-written only while the
        /// inode's sleeplock is held.
        off: Cell<u32>,
    },
    Device {
        major: i16,
        ip: Inode,
    },
}

pub struct FileInner {
    pub kind: FileKind,
    pub readable: bool,
    pub writable: bool,
}

struct FileObj {
    inner: UnsafeCell<Option<FileInner>>,
}

// The slot's contents are written only while allocating (refcount 0 -> 1)
// and while freeing (1 -> 0), both under the table lock; in between,
// holders get shared access and the offset cell is serialized by the
// inode sleeplock.
unsafe impl Sync for FileObj {}

pub struct FileTable {
    refs: SpinLock<[u32; NFILE]>,
    files: Box<[FileObj]>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            refs: SpinLock::new([0; NFILE]),
            files: (0..NFILE)
                .map(|_| FileObj {
                    inner: UnsafeCell::new(None),
                })
                .collect(),
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A counted handle on an open-file object.
pub struct File {
    idx: usize,
}

impl Drop for File {
    fn drop(&mut self) {
        panic!("file handle leaked: slot {}", self.idx);
    }
}

/// Allocates an open-file object. On exhaustion the contents come back
/// to the caller, who owns whatever references they carry.
pub fn falloc(k: &Kernel, inner: FileInner) -> core::result::Result<File, FileInner> {
    let mut refs = k.ftable.refs.lock();
    for (i, r) in refs.iter_mut().enumerate() {
        if *r == 0 {
            *r = 1;
            unsafe { *k.ftable.files[i].inner.get() = Some(inner) };
            return Ok(File { idx: i });
        }
    }
    Err(inner)
}

/// Increments the object's reference count.
pub fn fdup(k: &Kernel, f: &File) -> File {
    let mut refs = k.ftable.refs.lock();
    assert!(refs[f.idx] > 0, "fdup: closed file");
    refs[f.idx] += 1;
    File { idx: f.idx }
}

fn inner<'a>(k: &'a Kernel, f: &File) -> &'a FileInner {
    unsafe { (*k.ftable.files[f.idx].inner.get()).as_ref().unwrap() }
}

/// Decrements the reference count; the last holder tears the object
/// down (closing a pipe end, or releasing the inode inside a
/// transaction).
pub fn fclose(k: &Kernel, f: File) {
    let mut refs = k.ftable.refs.lock();
    assert!(refs[f.idx] > 0, "fclose: closed file");
    refs[f.idx] -= 1;
    if refs[f.idx] > 0 {
        core::mem::forget(f);
        return;
    }

    let inner = unsafe { (*k.ftable.files[f.idx].inner.get()).take().unwrap() };
    drop(refs);

    match inner.kind {
        FileKind::Pipe { pipe } => pipe.close(k, inner.writable),
        FileKind::Inode { ip, .. } | FileKind::Device { ip, .. } => {
            let tx = k.begin_tx();
            iput(&tx, ip);
        }
    }
    core::mem::forget(f);
}

/// Gets metadata about file `f`.
pub fn fstat(k: &Kernel, f: &File) -> Result<Stat> {
    match &inner(k, f).kind {
        FileKind::Inode { ip, .. } | FileKind::Device { ip, .. } => {
            let g = ip.lock(k);
            let st = g.stat();
            g.unlock();
            Ok(st)
        }
        FileKind::Pipe { .. } => Err(KernelError::BadFileDescriptor),
    }
}

/// Reads from file `f` into `dst`.
pub fn fread(k: &Kernel, f: &File, dst: DstBuf<'_>) -> Result<usize> {
    let fi = inner(k, f);
    if !fi.readable {
        return Err(KernelError::NotReadable);
    }

    match &fi.kind {
        FileKind::Pipe { pipe } => pipe.read(k, dst),
        FileKind::Device { major, .. } => k.devsw.read(k, *major, dst),
        FileKind::Inode { ip, off } => {
            let mut g = ip.lock(k);
            let pos = off.get();
            let r = g.read(k, dst, pos)?;
            off.set(pos + r as u32);
            g.unlock();
            Ok(r)
        }
    }
}

/// Writes `src` to file `f`.
pub fn fwrite(k: &Kernel, f: &File, src: SrcBuf<'_>) -> Result<usize> {
    let fi = inner(k, f);
    if !fi.writable {
        return Err(KernelError::NotWritable);
    }

    match &fi.kind {
        FileKind::Pipe { pipe } => pipe.write(k, src),
        FileKind::Device { major, .. } => k.devsw.write(k, *major, src),
        FileKind::Inode { ip, off } => {
            // Write a few blocks at a time to keep each transaction
            // within the log's per-operation budget: i-node, indirect
            // block, allocation bitmap, and two blocks of slop for
            // non-aligned writes.
            let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
            let n = src.len();
            let mut i = 0;
            while i < n {
                let n1 = usize::min(n - i, max);
                let tx = k.begin_tx();
                let mut g = ip.lock(k);
                let pos = off.get();
                let r = g.write(&tx, src.slice(i, n1), pos)?;
                off.set(pos + r as u32);
                g.unlock();
                drop(tx);
                assert_eq!(r, n1, "short filewrite");
                i += r;
            }
            Ok(n)
        }
    }
}
