//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls.
//! The logging system only commits when there are no FS system calls
//! active. Thus there is never any reasoning required about whether a
//! commit might write an uncommitted system call's data to disk.
//!
//! A system call holds a [`Tx`] for its whole duration; constructing one
//! is `begin_op`, dropping it is `end_op`, and the last `end_op` commits.
//! Since any inode release may have to free disk blocks, every path that
//! can drop an inode reference takes a `&Tx`.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format is a header block holding the count and target block numbers,
//! followed by the logged blocks themselves.

use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use dataview::PodMethods as _;

use crate::{
    fs::{
        bio::{bread, bwrite, BufGuard},
        repr::{LogHeader, SuperBlock},
    },
    kernel::Kernel,
    param::{LOGSIZE, MAXOPBLOCKS},
    proc,
    sync::SpinLock,
};

struct LogState {
    /// How many FS system calls are executing.
    outstanding: usize,
    /// In commit(), please wait.
    committing: bool,
    /// In-memory mirror of the header block.
    n: u32,
    block: [u32; LOGSIZE],
}

pub struct Log {
    lock: SpinLock<LogState>,
    start: AtomicU32,
    size: AtomicU32,
    dev: AtomicU32,
}

impl Log {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(LogState {
                outstanding: 0,
                committing: false,
                n: 0,
                block: [0; LOGSIZE],
            }),
            start: AtomicU32::new(0),
            size: AtomicU32::new(0),
            dev: AtomicU32::new(0),
        }
    }

    fn chan(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    fn start(&self) -> u32 {
        self.start.load(Ordering::Relaxed)
    }

    fn dev(&self) -> u32 {
        self.dev.load(Ordering::Relaxed)
    }

    pub fn init(&self, k: &Kernel, dev: u32, sb: &SuperBlock) {
        assert!(sb.nlog as usize > LOGSIZE, "log area too small");
        self.start.store(sb.logstart, Ordering::Relaxed);
        self.size.store(sb.nlog, Ordering::Relaxed);
        self.dev.store(dev, Ordering::Relaxed);
        self.recover(k);
    }

    /// Reads the on-disk header into memory.
    fn read_head(&self, k: &Kernel) {
        let buf = bread(k, self.dev(), self.start());
        let lh = *buf.bytes.as_data_view().get::<LogHeader>(0);
        drop(buf);
        let mut state = self.lock.lock();
        state.n = lh.n;
        state.block = lh.block;
    }

    /// Writes the in-memory header to disk.
    ///
    /// This is the true point at which the current transaction commits.
    fn write_head(&self, k: &Kernel, n: u32, block: &[u32; LOGSIZE]) {
        let mut buf = bread(k, self.dev(), self.start());
        let lh = LogHeader { n, block: *block };
        *buf.bytes.as_data_view_mut().get_mut::<LogHeader>(0) = lh;
        bwrite(k, &mut buf);
    }

    /// Copies committed blocks from the log to their home locations.
    fn install_trans(&self, k: &Kernel, n: u32, block: &[u32; LOGSIZE], recovering: bool) {
        for tail in 0..n {
            let lbuf = bread(k, self.dev(), self.start() + tail + 1);
            let mut dbuf = bread(k, self.dev(), block[tail as usize]);
            dbuf.bytes = lbuf.bytes;
            bwrite(k, &mut dbuf);
            if !recovering {
                dbuf.unpin();
            }
        }
    }

    fn recover(&self, k: &Kernel) {
        self.read_head(k);
        let (n, block) = {
            let state = self.lock.lock();
            (state.n, state.block)
        };
        // If committed, copy from log to disk.
        self.install_trans(k, n, &block, true);
        {
            let mut state = self.lock.lock();
            state.n = 0;
        }
        // Clear the log.
        self.write_head(k, 0, &[0; LOGSIZE]);
    }

    /// Called at the start of each FS system call.
    fn begin_op(&self, k: &Kernel) {
        let mut state = self.lock.lock();
        loop {
            if state.committing {
                state = proc::sleep(k, self.chan(), state);
            } else if state.n as usize + (state.outstanding + 1) * MAXOPBLOCKS > LOGSIZE {
                // This op might exhaust log space; wait for commit.
                state = proc::sleep(k, self.chan(), state);
            } else {
                state.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call.
    ///
    /// Commits if this was the last outstanding operation.
    fn end_op(&self, k: &Kernel) {
        let mut do_commit = false;

        let mut state = self.lock.lock();
        state.outstanding -= 1;
        assert!(!state.committing, "end_op while committing");
        if state.outstanding == 0 {
            do_commit = true;
            state.committing = true;
        } else {
            // begin_op() may be waiting for log space, and decrementing
            // outstanding has decreased the amount of reserved space.
            proc::wakeup(k, self.chan());
        }
        drop(state);

        if do_commit {
            // Call commit without holding locks, since commit sleeps on
            // disk I/O.
            self.commit(k);
            let mut state = self.lock.lock();
            state.committing = false;
            proc::wakeup(k, self.chan());
            drop(state);
        }
    }

    /// Copies modified blocks from the cache to the log.
    fn write_log(&self, k: &Kernel, n: u32, block: &[u32; LOGSIZE]) {
        for tail in 0..n {
            let from = bread(k, self.dev(), block[tail as usize]);
            let mut to = bread(k, self.dev(), self.start() + tail + 1);
            to.bytes = from.bytes;
            bwrite(k, &mut to);
        }
    }

    fn commit(&self, k: &Kernel) {
        let (n, block) = {
            let state = self.lock.lock();
            (state.n, state.block)
        };
        if n > 0 {
            self.write_log(k, n, &block); // modified blocks from cache to log
            self.write_head(k, n, &block); // header to disk -- the real commit
            self.install_trans(k, n, &block, false); // now install to home locations
            let mut state = self.lock.lock();
            state.n = 0;
            drop(state);
            self.write_head(k, 0, &block); // erase the transaction from the log
        }
    }

    /// Records the buffer's block number in the transaction and pins the
    /// buffer in the cache until install.
    ///
    /// A block written several times in one transaction collapses into a
    /// single log slot ("log absorption").
    fn write(&self, b: &mut BufGuard<'_>) {
        let mut state = self.lock.lock();
        assert!(
            (state.n as usize) < LOGSIZE
                && state.n + 1 < self.size.load(Ordering::Relaxed),
            "too big a transaction"
        );
        assert!(state.outstanding >= 1, "log write outside of transaction");

        let n = state.n as usize;
        let i = (0..n)
            .find(|&i| state.block[i] == b.blockno()) // log absorption
            .unwrap_or(n);
        state.block[i] = b.blockno();
        if i == n {
            // Add new block to log.
            b.pin();
            state.n += 1;
        }
        // Keep it cached until the commit installs it.
        b.dirty = true;
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle on one FS operation inside the current transaction.
///
/// Constructed by [`Kernel::begin_tx`]; dropping it ends the operation
/// and commits if it was the last one outstanding.
pub struct Tx<'a> {
    k: &'a Kernel,
}

impl Kernel {
    pub fn begin_tx(&self) -> Tx<'_> {
        self.log.begin_op(self);
        Tx { k: self }
    }
}

impl<'a> Tx<'a> {
    pub fn kernel(&self) -> &'a Kernel {
        self.k
    }

    /// Writes a buffer through the log instead of directly to disk.
    /// This is the file system's only write path during an operation.
    pub fn write(&self, b: &mut BufGuard<'_>) {
        self.k.log.write(b);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.k.log.end_op(self.k);
    }
}
