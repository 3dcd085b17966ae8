//! The user half of an address space.
//!
//! User memory is [0, sz) with `sz` below `KERNBASE`. Growth allocates
//! zeroed frames with user+writable mappings; shrink frees frames and
//! clears entries. The kernel reaches into user memory only through the
//! page tables, so every access is permission-checked the same way the
//! MMU would.

use crate::{
    error::{KernelError, Result},
    hal::mem::PhysMemory,
    memory::{
        page::Kmem,
        page_table::{PageDir, PtEntry, PtEntryFlags},
        vm::setupkvm,
        PhysAddr, VirtAddr, KERNBASE, PAGE_SIZE,
    },
};

/// Loads the initcode image into address 0 of `pgdir`.
///
/// For the very first process. `src.len()` must be less than a page.
pub fn inituvm(mem: &PhysMemory, kmem: &Kmem, pgdir: PageDir, src: &[u8]) -> Result<()> {
    assert!(src.len() < PAGE_SIZE, "inituvm: more than a page");
    let frame = kmem.alloc_zeroed(mem)?;
    pgdir.map_pages(
        mem,
        kmem,
        VirtAddr::ZERO,
        PAGE_SIZE as u64,
        frame,
        PtEntryFlags::UW,
    )?;
    mem.write_bytes(frame, src);
    Ok(())
}

/// Translates a user virtual address to a physical address, only if the
/// page is present and user-accessible.
pub fn uva2ka(mem: &PhysMemory, pgdir: PageDir, va: VirtAddr) -> Result<PhysAddr> {
    let pte = pgdir
        .entry(mem, va)
        .unwrap_or(PtEntry::zero());
    if !pte.is_present() || !pte.flags().contains(PtEntryFlags::U) {
        return Err(KernelError::BadAddress(va));
    }
    Ok(pte.addr().byte_add(va.page_offset() as u32))
}

/// Copies `src` into user memory at `va`, straddling pages as needed.
pub fn copyout(mem: &PhysMemory, pgdir: PageDir, va: VirtAddr, src: &[u8]) -> Result<()> {
    let mut off = 0;
    while off < src.len() {
        let va0 = va.byte_add(off as u32);
        let pa = uva2ka(mem, pgdir, va0)?;
        let n = usize::min(src.len() - off, PAGE_SIZE - va0.page_offset());
        mem.write_bytes(pa, &src[off..off + n]);
        off += n;
    }
    Ok(())
}

/// Copies user memory at `va` into `dst`, straddling pages as needed.
pub fn copyin(mem: &PhysMemory, pgdir: PageDir, dst: &mut [u8], va: VirtAddr) -> Result<()> {
    let mut off = 0;
    while off < dst.len() {
        let va0 = va.byte_add(off as u32);
        let pa = uva2ka(mem, pgdir, va0)?;
        let n = usize::min(dst.len() - off, PAGE_SIZE - va0.page_offset());
        mem.read_bytes(pa, &mut dst[off..off + n]);
        off += n;
    }
    Ok(())
}

/// Allocates page-table entries and physical memory to grow the process
/// from `oldsz` to `newsz`, which need not be page-aligned.
///
/// On failure every page this call added is freed again and the old size
/// survives untouched.
pub fn allocuvm(
    mem: &PhysMemory,
    kmem: &Kmem,
    pgdir: PageDir,
    oldsz: u32,
    newsz: u32,
) -> Result<u32> {
    if newsz >= KERNBASE {
        return Err(KernelError::BadAddress(VirtAddr::new(newsz)));
    }
    if newsz < oldsz {
        return Ok(oldsz);
    }

    let mut va = VirtAddr::new(oldsz).page_roundup();
    while va.addr() < newsz {
        let frame = match kmem.alloc_zeroed(mem) {
            Ok(f) => f,
            Err(e) => {
                deallocuvm(mem, kmem, pgdir, va.addr(), oldsz);
                return Err(e);
            }
        };
        if let Err(e) = pgdir.map_pages(
            mem,
            kmem,
            va,
            PAGE_SIZE as u64,
            frame,
            PtEntryFlags::UW,
        ) {
            kmem.free(mem, frame);
            deallocuvm(mem, kmem, pgdir, va.addr(), oldsz);
            return Err(e);
        }
        va = va.byte_add(PAGE_SIZE as u32);
    }
    Ok(newsz)
}

/// Deallocates user pages to bring the process size from `oldsz` to
/// `newsz`. Returns the new size.
pub fn deallocuvm(
    mem: &PhysMemory,
    kmem: &Kmem,
    pgdir: PageDir,
    oldsz: u32,
    newsz: u32,
) -> u32 {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut va = VirtAddr::new(newsz).page_roundup();
    while va.addr() < oldsz {
        match pgdir.walk(mem, kmem, va, false) {
            Err(_) => {
                // no page table here; skip to the next directory slot
                let next = (va.addr() & !0x3f_ffff) + 0x40_0000;
                if next == 0 || next >= oldsz {
                    break;
                }
                va = VirtAddr::new(next);
                continue;
            }
            Ok(pte_pa) => {
                let pte = PtEntry::from_bits(mem.read_u32(pte_pa));
                if pte.is_present() {
                    kmem.free(mem, pte.addr());
                    mem.write_u32(pte_pa, 0);
                }
            }
        }
        va = va.byte_add(PAGE_SIZE as u32);
    }
    newsz
}

/// Frees a user address space: all user frames, then the page tables and
/// the directory itself.
pub fn freevm(mem: &PhysMemory, kmem: &Kmem, pgdir: PageDir, sz: u32) {
    deallocuvm(mem, kmem, pgdir, sz, 0);
    pgdir.free_tables(mem, kmem);
}

/// Clears the user-access bit on the page containing `va`.
///
/// Used to create an inaccessible guard page beneath the user stack.
pub fn clearpteu(mem: &PhysMemory, kmem: &Kmem, pgdir: PageDir, va: VirtAddr) {
    let pte_pa = pgdir
        .walk(mem, kmem, va, false)
        .expect("clearpteu: unmapped page");
    let pte = PtEntry::from_bits(mem.read_u32(pte_pa));
    assert!(pte.is_present(), "clearpteu: unmapped page");
    let flags = pte.flags().difference(PtEntryFlags::U);
    mem.write_u32(pte_pa, PtEntry::new(pte.addr(), flags).bits());
}

/// Duplicates a user address space for fork: fresh frames, copied
/// contents, permission flags preserved per page.
pub fn copyuvm(mem: &PhysMemory, kmem: &Kmem, src: PageDir, sz: u32) -> Result<PageDir> {
    let dst = setupkvm(mem, kmem)?;

    let mut va = 0_u32;
    while va < sz {
        let res: Result<()> = (|| {
            let pte_pa = src.walk(mem, kmem, VirtAddr::new(va), false)?;
            let pte = PtEntry::from_bits(mem.read_u32(pte_pa));
            assert!(pte.is_present(), "copyuvm: page not present");

            let frame = kmem.alloc(mem)?;
            mem.copy(frame, pte.addr(), PAGE_SIZE);
            if let Err(e) = dst.map_pages(
                mem,
                kmem,
                VirtAddr::new(va),
                PAGE_SIZE as u64,
                frame,
                pte.flags().difference(PtEntryFlags::P),
            ) {
                kmem.free(mem, frame);
                return Err(e);
            }
            Ok(())
        })();

        if res.is_err() {
            freevm(mem, kmem, dst, va);
            return Err(res.unwrap_err());
        }
        va += PAGE_SIZE as u32;
    }
    Ok(dst)
}

/// Loads `size` bytes of a program segment into `pgdir` at `va`, pulling
/// file content through `read`. The destination pages must already be
/// mapped.
pub fn loaduvm(
    mem: &PhysMemory,
    kmem: &Kmem,
    pgdir: PageDir,
    va: VirtAddr,
    size: usize,
    mut read: impl FnMut(usize, &mut [u8]) -> Result<usize>,
) -> Result<()> {
    assert!(va.is_page_aligned(), "loaduvm: va must be page aligned");

    let mut off = 0;
    let mut buf = [0_u8; PAGE_SIZE];
    while off < size {
        let pte_pa = pgdir.walk(mem, kmem, va.byte_add(off as u32), false)?;
        let pte = PtEntry::from_bits(mem.read_u32(pte_pa));
        assert!(pte.is_present(), "loaduvm: address not mapped");

        let n = usize::min(size - off, PAGE_SIZE);
        if read(off, &mut buf[..n])? != n {
            return Err(KernelError::InvalidExecutable);
        }
        mem.write_bytes(pte.addr(), &buf[..n]);
        off += n;
    }
    Ok(())
}

/// A copy destination that may live in user or kernel memory.
///
/// Devices, pipes and `readi` move bytes to wherever the caller's buffer
/// is; user destinations go through the page tables and inherit their
/// permission checks.
pub enum DstBuf<'a> {
    Kernel(&'a mut [u8]),
    User {
        pgdir: PageDir,
        va: VirtAddr,
        len: usize,
    },
}

impl DstBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            DstBuf::Kernel(b) => b.len(),
            DstBuf::User { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `src` into this buffer at byte offset `off`.
    pub fn write(&mut self, mem: &PhysMemory, off: usize, src: &[u8]) -> Result<()> {
        assert!(off + src.len() <= self.len());
        match self {
            DstBuf::Kernel(b) => {
                b[off..off + src.len()].copy_from_slice(src);
                Ok(())
            }
            DstBuf::User { pgdir, va, .. } => {
                copyout(mem, *pgdir, va.byte_add(off as u32), src)
            }
        }
    }
}

/// A copy source that may live in user or kernel memory.
pub enum SrcBuf<'a> {
    Kernel(&'a [u8]),
    User {
        pgdir: PageDir,
        va: VirtAddr,
        len: usize,
    },
}

impl SrcBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            SrcBuf::Kernel(b) => b.len(),
            SrcBuf::User { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A sub-range of this buffer.
    pub fn slice(&self, start: usize, len: usize) -> SrcBuf<'_> {
        assert!(start + len <= self.len());
        match self {
            SrcBuf::Kernel(b) => SrcBuf::Kernel(&b[start..start + len]),
            SrcBuf::User { pgdir, va, .. } => SrcBuf::User {
                pgdir: *pgdir,
                va: va.byte_add(start as u32),
                len,
            },
        }
    }

    /// Copies out of this buffer at byte offset `off` into `dst`.
    pub fn read(&self, mem: &PhysMemory, off: usize, dst: &mut [u8]) -> Result<()> {
        assert!(off + dst.len() <= self.len());
        match self {
            SrcBuf::Kernel(b) => {
                dst.copy_from_slice(&b[off..off + dst.len()]);
                Ok(())
            }
            SrcBuf::User { pgdir, va, .. } => {
                copyin(mem, *pgdir, dst, va.byte_add(off as u32))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, Cpu};
    use crate::memory::KERN_TEXT_END;

    fn setup() -> (PhysMemory, Kmem, PageDir) {
        let mem = PhysMemory::new(0x80_0000);
        let kmem = Kmem::new();
        kmem.init2(&mem, KERN_TEXT_END + 0x10_0000, 0x80_0000);
        let pgdir = setupkvm(&mem, &kmem).unwrap();
        (mem, kmem, pgdir)
    }

    fn with_cpu<R>(f: impl FnOnce() -> R) -> R {
        let c = Cpu::new(0);
        unsafe { cpu::set_current(&c) };
        let r = f();
        unsafe { cpu::set_current(core::ptr::null()) };
        r
    }

    #[test]
    fn grow_copy_shrink() {
        with_cpu(|| {
            let (mem, kmem, pgdir) = setup();
            let free0 = kmem.free_count();

            let sz = allocuvm(&mem, &kmem, pgdir, 0, 3 * PAGE_SIZE as u32).unwrap();
            assert_eq!(sz, 3 * PAGE_SIZE as u32);

            copyout(&mem, pgdir, VirtAddr::new(0x1ffe), b"spans").unwrap();
            let mut back = [0_u8; 5];
            copyin(&mem, pgdir, &mut back, VirtAddr::new(0x1ffe)).unwrap();
            assert_eq!(&back, b"spans");

            // shrinking back returns every frame the growth took
            let sz = deallocuvm(&mem, &kmem, pgdir, sz, 0);
            assert_eq!(sz, 0);
            assert_eq!(kmem.free_count() + 1, free0); // one user page table remains
            freevm(&mem, &kmem, pgdir, 0);
            assert!(kmem.free_count() > free0);
        });
    }

    #[test]
    fn alloc_failure_restores_old_size() {
        with_cpu(|| {
            let (mem, kmem, pgdir) = setup();
            let oldsz = allocuvm(&mem, &kmem, pgdir, 0, 2 * PAGE_SIZE as u32).unwrap();

            // ask for more than the machine has
            let err = allocuvm(&mem, &kmem, pgdir, oldsz, 0x0700_0000);
            assert!(err.is_err());

            // the first two pages are still usable
            copyout(&mem, pgdir, VirtAddr::new(0), b"ok").unwrap();
            // and nothing beyond them is mapped
            assert!(uva2ka(&mem, pgdir, VirtAddr::new(oldsz)).is_err());
        });
    }

    #[test]
    fn fork_copy_preserves_flags_and_contents() {
        with_cpu(|| {
            let (mem, kmem, pgdir) = setup();
            let sz = allocuvm(&mem, &kmem, pgdir, 0, 2 * PAGE_SIZE as u32).unwrap();
            copyout(&mem, pgdir, VirtAddr::new(0x10), b"parent").unwrap();
            clearpteu(&mem, &kmem, pgdir, VirtAddr::new(PAGE_SIZE as u32));

            let child = copyuvm(&mem, &kmem, pgdir, sz).unwrap();

            let mut buf = [0_u8; 6];
            copyin(&mem, child, &mut buf, VirtAddr::new(0x10)).unwrap();
            assert_eq!(&buf, b"parent");

            // distinct frames
            let pp = pgdir.entry(&mem, VirtAddr::ZERO).unwrap().addr();
            let cp = child.entry(&mem, VirtAddr::ZERO).unwrap().addr();
            assert_ne!(pp, cp);

            // the guard page stayed inaccessible in the child
            let guard = child.entry(&mem, VirtAddr::new(PAGE_SIZE as u32)).unwrap();
            assert!(!guard.flags().contains(PtEntryFlags::U));
            assert!(
                uva2ka(&mem, child, VirtAddr::new(PAGE_SIZE as u32)).is_err()
            );
        });
    }

    #[test]
    fn no_user_mapping_at_or_above_kernbase() {
        with_cpu(|| {
            let (mem, kmem, pgdir) = setup();
            allocuvm(&mem, &kmem, pgdir, 0, PAGE_SIZE as u32).unwrap();
            assert!(
                allocuvm(&mem, &kmem, pgdir, PAGE_SIZE as u32, KERNBASE + 1).is_err()
            );
            assert!(uva2ka(&mem, pgdir, VirtAddr::new(KERNBASE)).is_err());
        });
    }
}
