//! Disk driver.
//!
//! The driver exposes one primitive, `rw`: issue the I/O a buffer needs.
//! If the buffer is dirty it is written to its block and the dirty flag
//! clears; otherwise the block is read and the valid flag sets. Requests
//! queue FIFO; the worker thread plays the part of the drive plus its
//! completion interrupt, and wakes the sleeping requester when a request
//! finishes.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
};

use crate::{
    fs::repr::BSIZE,
    hal::disk::DiskBackend,
    kernel::Kernel,
    param::ROOTDEV,
    proc,
    sync::SpinLock,
};

use super::bio::BufGuard;

struct Request {
    write: bool,
    blockno: u32,
    done: AtomicBool,
    data: UnsafeCell<[u8; BSIZE]>,
}

// `data` is touched by the requester before the push and after `done`,
// and by the worker in between; the queue lock and the done flag order
// those phases.
unsafe impl Sync for Request {}
unsafe impl Send for Request {}

impl Request {
    fn chan(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// Host-side doorbell; this is the drive's request line, not a kernel
/// lock.
struct Doorbell {
    rings: Mutex<u64>,
    cv: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        *self.rings.lock().unwrap() += 1;
        self.cv.notify_one();
    }

    fn wait(&self, seen: &mut u64) {
        let mut rings = self.rings.lock().unwrap();
        while *rings == *seen {
            rings = self.cv.wait(rings).unwrap();
        }
        *seen = *rings;
    }
}

pub struct Ide {
    queue: SpinLock<VecDeque<Arc<Request>>>,
    doorbell: Doorbell,
    backend: Box<dyn DiskBackend>,
}

impl Ide {
    pub fn new(backend: Box<dyn DiskBackend>) -> Self {
        Self {
            queue: SpinLock::new(VecDeque::new()),
            doorbell: Doorbell {
                rings: Mutex::new(0),
                cv: Condvar::new(),
            },
            backend,
        }
    }

    /// Syncs a buffer with disk.
    ///
    /// If dirty, writes the buffer to its block and clears dirty.
    /// Else, reads the block into the buffer and sets valid.
    /// The caller holds the buffer's sleeplock and sleeps here until the
    /// completion interrupt.
    pub fn rw(&self, k: &Kernel, b: &mut BufGuard<'_>) {
        assert!(
            b.dirty || !b.valid,
            "iderw: nothing to do for block {}",
            b.blockno
        );
        assert_eq!(b.dev, ROOTDEV, "iderw: unknown device {}", b.dev);

        let req = Arc::new(Request {
            write: b.dirty,
            blockno: b.blockno,
            done: AtomicBool::new(false),
            data: UnsafeCell::new(b.bytes),
        });

        let mut queue = self.queue.lock();
        queue.push_back(Arc::clone(&req));
        self.doorbell.ring();

        // Wait for the request to finish.
        while !req.done.load(Ordering::Acquire) {
            queue = proc::sleep(k, req.chan(), queue);
        }
        drop(queue);

        if req.write {
            b.dirty = false;
        } else {
            b.bytes = unsafe { *req.data.get() };
            b.valid = true;
        }
    }

    /// Wakes the worker so it can notice a shutdown.
    pub(crate) fn shutdown_nudge(&self) {
        self.doorbell.ring();
    }

    /// One request, performed on the worker.
    fn perform(&self, req: &Arc<Request>) {
        let sector = req.blockno as usize;
        if req.write {
            let data = unsafe { &*req.data.get() };
            self.backend.write_sector(sector, data);
        } else {
            let data = unsafe { &mut *req.data.get() };
            self.backend.read_sector(sector, data);
        }
    }
}

/// The drive: drains the queue FIFO and raises the completion
/// "interrupt" (done flag + wakeup) for each request.
///
/// Runs on a dedicated interrupt context until kernel shutdown.
pub(crate) fn worker(k: &Arc<Kernel>) {
    let mut seen = 0_u64;
    loop {
        let req = {
            let mut queue = k.ide.queue.lock();
            queue.pop_front()
        };

        let Some(req) = req else {
            if k.is_shutdown() {
                return;
            }
            k.ide.doorbell.wait(&mut seen);
            continue;
        };

        k.ide.perform(&req);

        // Completion interrupt.
        let queue = k.ide.queue.lock();
        req.done.store(true, Ordering::Release);
        proc::wakeup(k, req.chan());
        drop(queue);
    }
}
