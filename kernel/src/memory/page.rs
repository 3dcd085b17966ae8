//! Physical page allocator, for user processes, kernel stacks,
//! page-table pages, and file-system buffers.
//!
//! Allocates whole 4096-byte frames. The free list is threaded through
//! the frames themselves: the first word of a free frame holds the
//! physical address of the next free frame.
//!
//! Initialization happens in two phases: `init1` donates the pages the
//! boot page directory already maps, before any other CPU runs; `init2`
//! donates the rest and turns the lock on.

use core::{cell::UnsafeCell, sync::atomic::{AtomicBool, Ordering}};

use crate::{
    error::KernelError,
    hal::mem::PhysMemory,
    memory::{page_roundup, PhysAddr, PAGE_SIZE},
    sync::RawSpinLock,
};

struct FreeList {
    /// Physical address of the first free frame; 0 terminates the list.
    head: u32,
    nfree: usize,
}

pub struct Kmem {
    lock: RawSpinLock,
    use_lock: AtomicBool,
    freelist: UnsafeCell<FreeList>,
}

unsafe impl Sync for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            lock: RawSpinLock::new(),
            use_lock: AtomicBool::new(false),
            freelist: UnsafeCell::new(FreeList { head: 0, nfree: 0 }),
        }
    }

    /// Early phase: donate `[start, end)` while the machine is still
    /// single-threaded, lock off.
    pub fn init1(&self, mem: &PhysMemory, start: u32, end: u32) {
        self.free_range(mem, start, end);
    }

    /// Late phase: donate the remaining memory and enable locking.
    pub fn init2(&self, mem: &PhysMemory, start: u32, end: u32) {
        self.free_range(mem, start, end);
        self.use_lock.store(true, Ordering::Release);
    }

    fn free_range(&self, mem: &PhysMemory, start: u32, end: u32) {
        let mut pa = page_roundup(start);
        while pa + PAGE_SIZE as u32 <= end {
            self.free(mem, PhysAddr::new(pa));
            pa += PAGE_SIZE as u32;
        }
    }

    /// Frees the frame at `pa`, which normally should have been returned
    /// by a call to `alloc()`.
    pub fn free(&self, mem: &PhysMemory, pa: PhysAddr) {
        assert!(
            pa.is_page_aligned()
                && pa.addr() >= crate::memory::KERN_IMAGE_END
                && pa.addr() < mem.phystop(),
            "kfree: pa {:#x} was never allocatable",
            pa
        );

        // Fill with junk to catch dangling refs.
        mem.fill(pa, 1, PAGE_SIZE);

        let locked = self.use_lock.load(Ordering::Acquire);
        if locked {
            self.lock.acquire();
        }
        let fl = unsafe { &mut *self.freelist.get() };
        mem.write_u32(pa, fl.head);
        fl.head = pa.addr();
        fl.nfree += 1;
        if locked {
            self.lock.release();
        }
    }

    /// Allocates one 4096-byte frame of physical memory.
    pub fn alloc(&self, mem: &PhysMemory) -> Result<PhysAddr, KernelError> {
        let locked = self.use_lock.load(Ordering::Acquire);
        if locked {
            self.lock.acquire();
        }
        let fl = unsafe { &mut *self.freelist.get() };
        let head = fl.head;
        let res = if head == 0 {
            Err(KernelError::NoFreePage)
        } else {
            let pa = PhysAddr::new(head);
            fl.head = mem.read_u32(pa);
            fl.nfree -= 1;
            Ok(pa)
        };
        if locked {
            self.lock.release();
        }

        // Fill with junk so stale contents are never mistaken for state.
        if let Ok(pa) = res {
            mem.fill(pa, 5, PAGE_SIZE);
        }
        res
    }

    /// Allocates a zeroed frame.
    pub fn alloc_zeroed(&self, mem: &PhysMemory) -> Result<PhysAddr, KernelError> {
        let pa = self.alloc(mem)?;
        mem.fill(pa, 0, PAGE_SIZE);
        Ok(pa)
    }

    /// Number of frames currently on the free list.
    pub fn free_count(&self) -> usize {
        let locked = self.use_lock.load(Ordering::Acquire);
        if locked {
            self.lock.acquire();
        }
        let n = unsafe { &*self.freelist.get() }.nfree;
        if locked {
            self.lock.release();
        }
        n
    }
}

impl Default for Kmem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, Cpu};
    use crate::memory::KERN_IMAGE_END;

    fn with_cpu<R>(f: impl FnOnce() -> R) -> R {
        let c = Cpu::new(0);
        unsafe { cpu::set_current(&c) };
        let r = f();
        unsafe { cpu::set_current(core::ptr::null()) };
        r
    }

    #[test]
    fn alloc_free_cycle() {
        with_cpu(|| {
            let top = KERN_IMAGE_END + 15 * PAGE_SIZE as u32;
            let mem = PhysMemory::new(top);
            let kmem = Kmem::new();
            kmem.init2(&mem, KERN_IMAGE_END, top);
            assert_eq!(kmem.free_count(), 15);

            let a = kmem.alloc(&mem).unwrap();
            let b = kmem.alloc(&mem).unwrap();
            assert_ne!(a, b);
            assert_eq!(kmem.free_count(), 13);

            kmem.free(&mem, a);
            kmem.free(&mem, b);
            assert_eq!(kmem.free_count(), 15);
        });
    }

    #[test]
    fn exhaustion_surfaces() {
        with_cpu(|| {
            let top = KERN_IMAGE_END + 3 * PAGE_SIZE as u32;
            let mem = PhysMemory::new(top);
            let kmem = Kmem::new();
            kmem.init2(&mem, KERN_IMAGE_END, top);
            let mut held = Vec::new();
            while let Ok(pa) = kmem.alloc(&mem) {
                held.push(pa);
            }
            assert_eq!(held.len(), 3);
            assert_eq!(
                kmem.alloc(&mem).unwrap_err(),
                KernelError::NoFreePage
            );
        });
    }

    #[test]
    fn freed_frames_are_junked() {
        with_cpu(|| {
            let top = KERN_IMAGE_END + 4 * PAGE_SIZE as u32;
            let mem = PhysMemory::new(top);
            let kmem = Kmem::new();
            kmem.init2(&mem, KERN_IMAGE_END, top);
            let pa = kmem.alloc(&mem).unwrap();
            mem.fill(pa, 0xaa, PAGE_SIZE);
            kmem.free(&mem, pa);
            // Past the embedded next pointer, the junk pattern shows.
            let mut buf = [0_u8; 8];
            mem.read_bytes(pa.byte_add(4), &mut buf);
            assert_eq!(buf, [1; 8]);
        });
    }

    #[test]
    #[should_panic(expected = "never allocatable")]
    fn freeing_a_reserved_frame_is_fatal() {
        with_cpu(|| {
            let top = KERN_IMAGE_END + 4 * PAGE_SIZE as u32;
            let mem = PhysMemory::new(top);
            let kmem = Kmem::new();
            kmem.init2(&mem, KERN_IMAGE_END, top);
            kmem.free(&mem, PhysAddr::new(0x1000));
        });
    }
}
