//! Buffer cache.
//!
//! The buffer cache is a fixed arena of cached copies of disk blocks,
//! linked into one LRU list through indices kept beside each slot.
//! `bread` returns a buffer locked for exclusive use; dropping the guard
//! is `brelse` and moves the buffer to the most-recently-used end.
//!
//! The cache spinlock protects the list structure, identities and
//! reference counts; each buffer's sleeplock serializes content access
//! and disk traffic for that block. At most one buffer in the cache ever
//! names a given (device, block) pair.

use core::ops::{Deref, DerefMut};

use crate::{
    fs::repr::BSIZE,
    kernel::Kernel,
    param::NBUF,
    sync::{SleepLock, SleepLockGuard, SpinLock},
};

/// Cached contents of one disk block, under the buffer's sleeplock.
///
/// The block bytes come first so they inherit the struct's word
/// alignment; the on-disk POD types are viewed in place over them.
#[repr(C)]
pub struct BufData {
    pub bytes: [u8; BSIZE],
    pub dev: u32,
    pub blockno: u32,
    /// Has data been read from disk?
    pub valid: bool,
    /// Must data be written to disk?
    pub dirty: bool,
}

pub struct Buf {
    data: SleepLock<BufData>,
}

#[derive(Clone, Copy)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    prev: usize,
    next: usize,
}

/// List metadata; index `NBUF` is the sentinel head.
struct BcacheMeta {
    entries: [BufMeta; NBUF + 1],
}

const HEAD: usize = NBUF;

impl BcacheMeta {
    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.entries[i].prev, self.entries[i].next);
        self.entries[prev].next = next;
        self.entries[next].prev = prev;
    }

    fn insert_mru(&mut self, i: usize) {
        let first = self.entries[HEAD].next;
        self.entries[i].prev = HEAD;
        self.entries[i].next = first;
        self.entries[first].prev = i;
        self.entries[HEAD].next = i;
    }
}

pub struct Bcache {
    meta: SpinLock<BcacheMeta>,
    bufs: Box<[Buf]>,
}

impl Bcache {
    pub fn new() -> Self {
        let mut meta = BcacheMeta {
            entries: [BufMeta {
                dev: 0,
                blockno: 0,
                refcnt: 0,
                prev: HEAD,
                next: HEAD,
            }; NBUF + 1],
        };
        // Thread all buffers into the list.
        for i in 0..NBUF {
            meta.insert_mru(i);
        }

        let bufs = (0..NBUF)
            .map(|_| Buf {
                data: SleepLock::new(BufData {
                    bytes: [0; BSIZE],
                    dev: 0,
                    blockno: 0,
                    valid: false,
                    dirty: false,
                }),
            })
            .collect();

        Self {
            meta: SpinLock::new(meta),
            bufs,
        }
    }

    /// Looks through the cache for block `blockno` on device `dev`,
    /// allocating an LRU clean buffer if it is not cached.
    ///
    /// In either case, returns a locked buffer. Panics if every buffer is
    /// referenced or dirty.
    fn get<'a>(&'a self, k: &'a Kernel, dev: u32, blockno: u32) -> BufGuard<'a> {
        let mut meta = self.meta.lock();

        // Is the block already cached?
        let mut i = meta.entries[HEAD].next;
        while i != HEAD {
            let e = &mut meta.entries[i];
            if e.dev == dev && e.blockno == blockno {
                e.refcnt += 1;
                drop(meta);
                let guard = self.bufs[i].data.lock(k);
                return BufGuard {
                    bcache: self,
                    idx: i,
                    guard: Some(guard),
                };
            }
            i = meta.entries[i].next;
        }

        // Not cached; recycle the least recently used buffer that is
        // neither referenced nor pinned dirty by the log.
        let mut i = meta.entries[HEAD].prev;
        while i != HEAD {
            if meta.entries[i].refcnt == 0 {
                // refcnt == 0 means nobody holds the sleeplock.
                let mut guard = self
                    .bufs[i]
                    .data
                    .try_lock(k)
                    .expect("unreferenced buffer is locked");
                if guard.dirty {
                    drop(guard);
                    i = meta.entries[i].prev;
                    continue;
                }
                let e = &mut meta.entries[i];
                e.dev = dev;
                e.blockno = blockno;
                e.refcnt = 1;
                drop(meta);
                guard.dev = dev;
                guard.blockno = blockno;
                guard.valid = false;
                return BufGuard {
                    bcache: self,
                    idx: i,
                    guard: Some(guard),
                };
            }
            i = meta.entries[i].prev;
        }

        panic!("bget: no buffers");
    }

    /// True if no two cache slots name the same (device, block).
    pub fn identities_unique(&self) -> bool {
        let meta = self.meta.lock();
        for a in 0..NBUF {
            for b in a + 1..NBUF {
                let (ea, eb) = (&meta.entries[a], &meta.entries[b]);
                if ea.blockno != 0
                    && ea.dev == eb.dev
                    && ea.blockno == eb.blockno
                {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for Bcache {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked buffer; dropping it is `brelse`.
pub struct BufGuard<'a> {
    bcache: &'a Bcache,
    idx: usize,
    guard: Option<SleepLockGuard<'a, BufData>>,
}

impl BufGuard<'_> {
    pub fn blockno(&self) -> u32 {
        self.guard.as_ref().unwrap().blockno
    }

    /// Extra reference so the buffer stays in the cache after release.
    /// The log pins every block it has absorbed until install.
    pub fn pin(&self) {
        let mut meta = self.bcache.meta.lock();
        meta.entries[self.idx].refcnt += 1;
    }

    pub fn unpin(&self) {
        let mut meta = self.bcache.meta.lock();
        assert!(meta.entries[self.idx].refcnt > 1, "bunpin: not pinned");
        meta.entries[self.idx].refcnt -= 1;
    }
}

impl Deref for BufGuard<'_> {
    type Target = BufData;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Release the sleeplock first; the list update below may not
        // sleep.
        drop(self.guard.take());

        let mut meta = self.bcache.meta.lock();
        meta.entries[self.idx].refcnt -= 1;
        if meta.entries[self.idx].refcnt == 0 {
            // No one is waiting for it; most recently used now.
            meta.unlink(self.idx);
            meta.insert_mru(self.idx);
        }
    }
}

/// Returns a locked buffer with the contents of the indicated block.
pub fn bread<'a>(k: &'a Kernel, dev: u32, blockno: u32) -> BufGuard<'a> {
    let mut b = k.bcache.get(k, dev, blockno);
    if !b.valid {
        k.ide.rw(k, &mut b);
        assert!(b.valid);
    }
    b
}

/// Writes the buffer's contents to disk. The caller holds the buffer.
pub fn bwrite(k: &Kernel, b: &mut BufGuard<'_>) {
    b.dirty = true;
    k.ide.rw(k, b);
    assert!(!b.dirty);
}
