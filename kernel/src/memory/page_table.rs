//! The x86 two-level page table.
//!
//! A page directory holds 1024 32-bit entries, each naming a page table of
//! 1024 entries; both levels live in single frames of the physical
//! arena. A virtual address is split into:
//!
//! ```text
//!   22..=31 -- 10 bits of page-directory index.
//!   12..=21 -- 10 bits of page-table index.
//!    0..=11 -- 12 bits byte offset within the page.
//! ```

use bitflags::bitflags;

use crate::{
    error::{KernelError, Result},
    hal::mem::PhysMemory,
    memory::{page::Kmem, PhysAddr, VirtAddr, PAGE_SIZE},
};

pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;

bitflags! {
    /// Page table / directory entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: u32 {
        /// Present.
        const P = 1 << 0;
        /// Writeable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;

        const UW = Self::U.bits() | Self::W.bits();
    }
}

/// One page table or page directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(u32);

impl PtEntry {
    const FLAGS_MASK: u32 = 0xfff;

    pub fn new(pa: PhysAddr, flags: PtEntryFlags) -> Self {
        assert!(pa.is_page_aligned());
        Self(pa.addr() | flags.bits())
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PtEntryFlags::P)
    }

    pub fn flags(self) -> PtEntryFlags {
        PtEntryFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & !Self::FLAGS_MASK)
    }
}

/// A page directory, identified by the frame that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDir(PhysAddr);

impl PageDir {
    /// Allocates an empty page directory.
    pub fn alloc(mem: &PhysMemory, kmem: &Kmem) -> Result<Self> {
        let pa = kmem.alloc_zeroed(mem)?;
        Ok(Self(pa))
    }

    pub fn from_phys(pa: PhysAddr) -> Self {
        assert!(pa.is_page_aligned());
        Self(pa)
    }

    pub fn phys_addr(self) -> PhysAddr {
        self.0
    }

    fn pde_addr(self, va: VirtAddr) -> PhysAddr {
        self.0.byte_add(va.pdx() as u32 * 4)
    }

    /// Returns the physical address of the PTE that corresponds to `va`.
    ///
    /// If `alloc` is true, creates the needed page-table page.
    pub fn walk(
        self,
        mem: &PhysMemory,
        kmem: &Kmem,
        va: VirtAddr,
        alloc: bool,
    ) -> Result<PhysAddr> {
        let pde_pa = self.pde_addr(va);
        let pde = PtEntry::from_bits(mem.read_u32(pde_pa));
        let table = if pde.is_present() {
            pde.addr()
        } else {
            if !alloc {
                return Err(KernelError::BadAddress(va));
            }
            let table = kmem.alloc_zeroed(mem)?;
            // Permissions are controlled at the PTE level; the directory
            // entry is maximally permissive.
            let pde = PtEntry::new(
                table,
                PtEntryFlags::P | PtEntryFlags::W | PtEntryFlags::U,
            );
            mem.write_u32(pde_pa, pde.bits());
            table
        };
        Ok(table.byte_add(va.ptx() as u32 * 4))
    }

    /// Reads the leaf entry for `va`, without allocating.
    pub fn entry(self, mem: &PhysMemory, va: VirtAddr) -> Option<PtEntry> {
        let pde = PtEntry::from_bits(mem.read_u32(self.pde_addr(va)));
        if !pde.is_present() {
            return None;
        }
        let pte_pa = pde.addr().byte_add(va.ptx() as u32 * 4);
        Some(PtEntry::from_bits(mem.read_u32(pte_pa)))
    }

    /// Creates PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`.
    ///
    /// `size` may not be zero; `va` need not be page-aligned. Mapping over
    /// an already-present page is a kernel bug and panics.
    pub fn map_pages(
        self,
        mem: &PhysMemory,
        kmem: &Kmem,
        va: VirtAddr,
        size: u64,
        mut pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<()> {
        assert!(size > 0, "map_pages: zero size");

        let mut cur = va.page_rounddown();
        let last =
            VirtAddr::new(((va.addr() as u64 + size - 1) & !(PAGE_SIZE as u64 - 1)) as u32);
        loop {
            let pte_pa = self.walk(mem, kmem, cur, true)?;
            let old = PtEntry::from_bits(mem.read_u32(pte_pa));
            assert!(!old.is_present(), "remap at va {:#x}", cur);
            mem.write_u32(pte_pa, PtEntry::new(pa, perm | PtEntryFlags::P).bits());
            if cur == last {
                break;
            }
            cur = cur.byte_add(PAGE_SIZE as u32);
            pa = pa.byte_add(PAGE_SIZE as u32);
        }
        Ok(())
    }

    /// Frees every second-level page table and the directory frame.
    ///
    /// All leaf frames must already have been released.
    pub fn free_tables(self, mem: &PhysMemory, kmem: &Kmem) {
        for i in 0..NPDENTRIES {
            let pde_pa = self.0.byte_add(i as u32 * 4);
            let pde = PtEntry::from_bits(mem.read_u32(pde_pa));
            if pde.is_present() {
                kmem.free(mem, pde.addr());
            }
        }
        kmem.free(mem, self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, Cpu};

    fn setup() -> (PhysMemory, Kmem) {
        let top = crate::memory::KERN_IMAGE_END + 0x40000;
        let mem = PhysMemory::new(top);
        let kmem = Kmem::new();
        kmem.init2(&mem, crate::memory::KERN_IMAGE_END, top);
        (mem, kmem)
    }

    fn with_cpu<R>(f: impl FnOnce() -> R) -> R {
        let c = Cpu::new(0);
        unsafe { cpu::set_current(&c) };
        let r = f();
        unsafe { cpu::set_current(core::ptr::null()) };
        r
    }

    #[test]
    fn walk_allocates_tables() {
        with_cpu(|| {
            let (mem, kmem) = setup();
            let pgdir = PageDir::alloc(&mem, &kmem).unwrap();

            let va = VirtAddr::new(0x0040_3000);
            assert!(pgdir.walk(&mem, &kmem, va, false).is_err());
            let pte_pa = pgdir.walk(&mem, &kmem, va, true).unwrap();
            assert_eq!(mem.read_u32(pte_pa), 0);

            // same table reused for a neighboring page
            let pte2 = pgdir.walk(&mem, &kmem, va.byte_add(0x1000), true).unwrap();
            assert_eq!(pte2.addr(), pte_pa.addr() + 4);
        });
    }

    #[test]
    fn map_then_lookup() {
        with_cpu(|| {
            let (mem, kmem) = setup();
            let pgdir = PageDir::alloc(&mem, &kmem).unwrap();
            let frame = kmem.alloc(&mem).unwrap();

            pgdir
                .map_pages(
                    &mem,
                    &kmem,
                    VirtAddr::new(0x5000),
                    PAGE_SIZE as u64,
                    frame,
                    PtEntryFlags::UW,
                )
                .unwrap();

            let pte = pgdir.entry(&mem, VirtAddr::new(0x5000)).unwrap();
            assert!(pte.is_present());
            assert_eq!(pte.addr(), frame);
            assert!(pte.flags().contains(PtEntryFlags::U | PtEntryFlags::W));
        });
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn double_map_panics() {
        with_cpu(|| {
            let (mem, kmem) = setup();
            let pgdir = PageDir::alloc(&mem, &kmem).unwrap();
            let frame = kmem.alloc(&mem).unwrap();
            let va = VirtAddr::new(0x5000);
            let sz = PAGE_SIZE as u64;
            pgdir
                .map_pages(&mem, &kmem, va, sz, frame, PtEntryFlags::W)
                .unwrap();
            pgdir
                .map_pages(&mem, &kmem, va, sz, frame, PtEntryFlags::W)
                .unwrap();
        });
    }
}
