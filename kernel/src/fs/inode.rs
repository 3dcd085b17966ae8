//! Inodes.
//!
//! An inode describes a single unnamed file: type, link count, size, and
//! the list of blocks holding the content. Inodes sit in the inode table
//! region of the disk, and the kernel keeps a fixed cache of in-memory
//! copies.
//!
//! An in-memory inode goes through the usual states:
//!
//! * Allocation: an inode is allocated if its on-disk type is non-zero.
//!   [`ialloc`] allocates, [`iput`] frees when both the reference count
//!   and the link count have fallen to zero.
//!
//! * Referencing: [`iget`] finds or creates a cache entry pinned by its
//!   reference count; [`idup`] adds a pin, [`iput`] drops one. A pinned
//!   entry is never recycled, so long-term holders (open files, working
//!   directories) keep their pointers valid without holding any lock.
//!
//! * Validity: the cached copy of the disk fields exists only after
//!   [`Inode::lock`] has read them; `iput` discards the copy when the
//!   last reference goes away.
//!
//! * Locked: file system code may only examine and modify the fields and
//!   content through an [`InodeGuard`], which holds the per-inode
//!   sleeplock.
//!
//! `lock` is separate from `get` so that system calls can hold a
//! long-term reference to an inode and lock it only for short stretches;
//! the separation is also what keeps path lookup deadlock-free.
//!
//! Dropping the last reference is a disk write (truncate plus free) when
//! the link count is zero, so every `iput` path runs inside a
//! transaction and takes a `&Tx`.

use core::{
    mem,
    ops::{Deref, DerefMut},
};

use dataview::PodMethods as _;

use crate::{
    error::{KernelError, Result},
    fs::{
        bio::bread,
        data_block::{balloc, bfree},
        log::Tx,
        repr::{
            BlockNo, Dinode, IndirectBlock, InodeBlock, InodeNo, BSIZE, MAXFILE, NDIRECT,
            NINDIRECT,
        },
        stat::{Stat, T_DEV},
    },
    kernel::Kernel,
    memory::vm_user::{DstBuf, SrcBuf},
    param::NINODE,
    sync::{SleepLock, SleepLockGuard, SpinLock},
};

/// In-memory copy of the disk fields.
#[derive(Clone)]
pub struct InodeData {
    pub ty: i16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    addrs: [Option<BlockNo>; NDIRECT + 1],
}

impl InodeData {
    fn from_disk(d: &Dinode) -> Self {
        let mut addrs = [None; NDIRECT + 1];
        for (a, &raw) in addrs.iter_mut().zip(&d.addrs) {
            *a = (raw != 0).then(|| BlockNo::new(raw));
        }
        Self {
            ty: d.ty,
            major: d.major,
            minor: d.minor,
            nlink: d.nlink,
            size: d.size,
            addrs,
        }
    }

    fn to_disk(&self, d: &mut Dinode) {
        d.ty = self.ty;
        d.major = self.major;
        d.minor = self.minor;
        d.nlink = self.nlink;
        d.size = self.size;
        for (raw, a) in d.addrs.iter_mut().zip(&self.addrs) {
            *raw = a.map_or(0, BlockNo::value);
        }
    }
}

#[derive(Clone, Copy)]
struct InodeMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

struct InodeSlot {
    data: SleepLock<Option<InodeData>>,
}

pub struct Itable {
    meta: SpinLock<[InodeMeta; NINODE]>,
    slots: Box<[InodeSlot]>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            meta: SpinLock::new(
                [InodeMeta {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                }; NINODE],
            ),
            slots: (0..NINODE)
                .map(|_| InodeSlot {
                    data: SleepLock::new(None),
                })
                .collect(),
        }
    }
}

impl Default for Itable {
    fn default() -> Self {
        Self::new()
    }
}

/// A pinned, unlocked reference to a cached inode.
///
/// Handles are reference-count units: they are produced by `iget`,
/// `idup` and `ialloc`, and every one of them must eventually go through
/// [`iput`]. Dropping one on the floor is a kernel bug.
pub struct Inode {
    idx: usize,
    pub dev: u32,
    pub inum: InodeNo,
}

impl Drop for Inode {
    fn drop(&mut self) {
        panic!(
            "inode handle leaked: dev={} inum={}",
            self.dev,
            self.inum.value()
        );
    }
}

/// Finds the inode with number `inum` on device `dev` and returns its
/// pinned in-memory copy. Does not lock the inode and does not read it
/// from disk.
pub fn iget(k: &Kernel, dev: u32, inum: InodeNo) -> Inode {
    let mut meta = k.itable.meta.lock();

    let mut empty = None;
    for (i, e) in meta.iter_mut().enumerate() {
        if e.refcnt > 0 && e.dev == dev && e.inum == inum.value() {
            e.refcnt += 1;
            return Inode { idx: i, dev, inum };
        }
        if empty.is_none() && e.refcnt == 0 {
            empty = Some(i);
        }
    }

    let Some(i) = empty else {
        panic!("iget: no inodes");
    };
    meta[i] = InodeMeta {
        dev,
        inum: inum.value(),
        refcnt: 1,
    };
    // A recycled slot must not leak the previous tenant's fields.
    *k.itable.slots[i]
        .data
        .try_lock(k)
        .expect("unreferenced inode is locked") = None;
    Inode { idx: i, dev, inum }
}

/// Increments the reference count; returns the new pin.
pub fn idup(k: &Kernel, ip: &Inode) -> Inode {
    let mut meta = k.itable.meta.lock();
    meta[ip.idx].refcnt += 1;
    Inode {
        idx: ip.idx,
        dev: ip.dev,
        inum: ip.inum,
    }
}

/// Allocates an inode on device `dev`, marking it in use with type `ty`.
///
/// Returns an unlocked but allocated and referenced inode, or an error
/// if the inode table on disk is full.
pub fn ialloc(tx: &Tx<'_>, dev: u32, ty: i16) -> Result<Inode> {
    let k = tx.kernel();
    let sb = k.superblock();

    for inum in 1..sb.ninodes {
        let ino = InodeNo::new(inum);
        let mut buf = bread(k, dev, sb.inode_block(ino).value());
        let dip = buf
            .bytes
            .as_data_view_mut()
            .get_mut::<InodeBlock>(0)
            .inode_mut(ino);
        if dip.is_free() {
            *dip = Dinode {
                ty,
                major: 0,
                minor: 0,
                nlink: 0,
                size: 0,
                addrs: [0; NDIRECT + 1],
            };
            tx.write(&mut buf);
            drop(buf);
            return Ok(iget(k, dev, ino));
        }
    }
    kprintln!(k, "ialloc: no inodes");
    Err(KernelError::OutOfInodes)
}

/// Drops a reference to an in-memory inode.
///
/// If that was the last reference and the inode has no links, frees the
/// inode and its content on disk, which is why the caller must be inside
/// a transaction.
pub fn iput(tx: &Tx<'_>, ip: Inode) {
    let k = tx.kernel();
    let mut meta = k.itable.meta.lock();

    if meta[ip.idx].refcnt == 1 {
        // refcnt == 1 means no other holder, so this try_lock cannot
        // block (or deadlock).
        let mut inner = k.itable.slots[ip.idx]
            .data
            .try_lock(k)
            .expect("sole inode reference is locked");
        let dead = matches!(&*inner, Some(d) if d.nlink == 0);
        if dead {
            // The inode has no links and no other references: truncate
            // and free. nlink == 0 means no directory entry points here,
            // so no one can iget it while the table lock is released.
            drop(meta);

            let mut guard = InodeGuard {
                dev: ip.dev,
                inum: ip.inum,
                idx: ip.idx,
                guard: inner,
            };
            guard.trunc(tx);
            guard.ty = 0;
            guard.update(tx);
            *guard.guard = None;
            drop(guard);

            meta = k.itable.meta.lock();
        } else {
            drop(inner);
        }
    }

    meta[ip.idx].refcnt -= 1;
    mem::forget(ip);
}

impl Inode {
    /// Locks the inode, reading its fields from disk if needed.
    pub fn lock<'a>(&self, k: &'a Kernel) -> InodeGuard<'a> {
        let mut guard = k.itable.slots[self.idx].data.lock(k);
        if guard.is_none() {
            let sb = k.superblock();
            let buf = bread(k, self.dev, sb.inode_block(self.inum).value());
            let dip = buf.bytes.as_data_view().get::<InodeBlock>(0).inode(self.inum);
            let data = InodeData::from_disk(dip);
            assert_ne!(data.ty, 0, "ilock: no type");
            *guard = Some(data);
        }
        InodeGuard {
            dev: self.dev,
            inum: self.inum,
            idx: self.idx,
            guard,
        }
    }
}

/// A locked inode. Dereferences to the cached disk fields.
pub struct InodeGuard<'a> {
    pub dev: u32,
    pub inum: InodeNo,
    idx: usize,
    guard: SleepLockGuard<'a, Option<InodeData>>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeData;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

impl InodeGuard<'_> {
    /// Unlocks the inode.
    pub fn unlock(self) {
        // the sleeplock guard is dropped
    }

    /// Common idiom: unlock, then drop the reference.
    pub fn unlock_put(self, tx: &Tx<'_>, ip: Inode) {
        drop(self);
        iput(tx, ip);
    }

    /// Copies a modified in-memory inode to disk.
    ///
    /// Must be called after every change to a field that lives on disk.
    pub fn update(&mut self, tx: &Tx<'_>) {
        let k = tx.kernel();
        let sb = k.superblock();
        let mut buf = bread(k, self.dev, sb.inode_block(self.inum).value());
        let dip = buf
            .bytes
            .as_data_view_mut()
            .get_mut::<InodeBlock>(0)
            .inode_mut(self.inum);
        self.guard.as_ref().unwrap().to_disk(dip);
        tx.write(&mut buf);
    }

    /// Returns the disk block holding the `bn`-th block of this file,
    /// allocating direct, indirect-container and indirect-target blocks
    /// on demand.
    fn bmap_alloc(&mut self, tx: &Tx<'_>, bn: usize) -> Result<BlockNo> {
        let k = tx.kernel();
        if bn < NDIRECT {
            if let Some(b) = self.addrs[bn] {
                return Ok(b);
            }
            let b = balloc(tx, self.dev)?;
            self.addrs[bn] = Some(b);
            return Ok(b);
        }

        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");

        // Load indirect block, allocating if necessary.
        let ind = match self.addrs[NDIRECT] {
            Some(b) => b,
            None => {
                let b = balloc(tx, self.dev)?;
                self.addrs[NDIRECT] = Some(b);
                b
            }
        };
        let mut buf = bread(k, self.dev, ind.value());
        let slot = &mut buf.bytes.as_data_view_mut().get_mut::<IndirectBlock>(0).0[bn];
        if *slot != 0 {
            return Ok(BlockNo::new(*slot));
        }
        let b = balloc(tx, self.dev)?;
        // buf was not invalidated: balloc touches only bitmap and the
        // new block, never this indirect block.
        let slot = &mut buf.bytes.as_data_view_mut().get_mut::<IndirectBlock>(0).0[bn];
        *slot = b.value();
        tx.write(&mut buf);
        Ok(b)
    }

    /// Like `bmap_alloc` but never allocates; `None` means the block has
    /// never been written.
    fn bmap_read(&self, k: &Kernel, bn: usize) -> Option<BlockNo> {
        if bn < NDIRECT {
            return self.addrs[bn];
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");
        let ind = self.addrs[NDIRECT]?;
        let buf = bread(k, self.dev, ind.value());
        let raw = buf.bytes.as_data_view().get::<IndirectBlock>(0).0[bn];
        (raw != 0).then(|| BlockNo::new(raw))
    }

    /// Discards the inode's contents: frees every data block, the
    /// indirect container, and resets the size to zero.
    pub fn trunc(&mut self, tx: &Tx<'_>) {
        let k = tx.kernel();
        for i in 0..NDIRECT {
            if let Some(b) = self.addrs[i].take() {
                bfree(tx, self.dev, b);
            }
        }

        if let Some(ind) = self.addrs[NDIRECT].take() {
            let buf = bread(k, self.dev, ind.value());
            let targets = buf.bytes.as_data_view().get::<IndirectBlock>(0).0;
            drop(buf);
            for raw in targets {
                if raw != 0 {
                    bfree(tx, self.dev, BlockNo::new(raw));
                }
            }
            bfree(tx, self.dev, ind);
        }

        self.size = 0;
        self.update(tx);
    }

    /// Copies stat information from the inode.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev,
            ino: self.inum.value(),
            ty: self.ty,
            nlink: self.nlink,
            size: self.size,
        }
    }

    /// Reads data from the inode into `dst` starting at byte `off`.
    ///
    /// Device inodes dispatch to the major's read handler, which ignores
    /// the offset.
    pub fn read(&mut self, k: &Kernel, mut dst: DstBuf<'_>, off: u32) -> Result<usize> {
        if self.ty == T_DEV {
            return k.devsw.read(k, self.major, dst);
        }

        let size = self.size;
        let n = dst.len() as u32;
        if off > size || off.checked_add(n).is_none() {
            return Ok(0);
        }
        let n = u32::min(n, size - off) as usize;

        let mut tot = 0;
        while tot < n {
            let off = off as usize + tot;
            let Some(b) = self.bmap_read(k, off / BSIZE) else {
                break;
            };
            let buf = bread(k, self.dev, b.value());
            let m = usize::min(n - tot, BSIZE - off % BSIZE);
            dst.write(&k.mem, tot, &buf.bytes[off % BSIZE..][..m])?;
            tot += m;
        }
        Ok(tot)
    }

    /// Writes data from `src` into the inode starting at byte `off`,
    /// extending the file if needed (up to MAXFILE blocks).
    ///
    /// Returns the number of bytes written; a short count means some
    /// error stopped the copy.
    pub fn write(&mut self, tx: &Tx<'_>, src: SrcBuf<'_>, off: u32) -> Result<usize> {
        let k = tx.kernel();
        if self.ty == T_DEV {
            return k.devsw.write(k, self.major, src);
        }

        let n = src.len() as u32;
        if off > self.size || off.checked_add(n).is_none() {
            return Err(KernelError::FileTooLarge);
        }
        if (off + n) as usize > MAXFILE * BSIZE {
            return Err(KernelError::FileTooLarge);
        }

        let mut tot = 0;
        while tot < n as usize {
            let off = off as usize + tot;
            let b = self.bmap_alloc(tx, off / BSIZE)?;
            let mut buf = bread(k, self.dev, b.value());
            let m = usize::min(n as usize - tot, BSIZE - off % BSIZE);
            src.read(&k.mem, tot, &mut buf.bytes[off % BSIZE..][..m])?;
            tx.write(&mut buf);
            tot += m;
        }

        if off + tot as u32 > self.size {
            self.size = off + tot as u32;
        }
        // Write the inode back even if the size didn't change, because
        // bmap_alloc may have added blocks to addrs.
        self.update(tx);
        Ok(tot)
    }

    /// Reads one POD record at byte offset `off`.
    pub fn read_as<T: dataview::Pod>(&mut self, k: &Kernel, off: u32) -> Result<T> {
        let mut val = T::zeroed();
        let n = self.read(k, DstBuf::Kernel(val.as_bytes_mut()), off)?;
        if n != size_of::<T>() {
            return Err(KernelError::EntryNotFound);
        }
        Ok(val)
    }

    /// Writes one POD record at byte offset `off`.
    pub fn write_data<T: dataview::Pod>(&mut self, tx: &Tx<'_>, off: u32, val: &T) -> Result<()> {
        let n = self.write(tx, SrcBuf::Kernel(val.as_bytes()), off)?;
        assert_eq!(n, size_of::<T>(), "short inode record write");
        Ok(())
    }
}
