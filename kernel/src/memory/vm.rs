//! The kernel half of every address space.
//!
//! Every page directory carries identical mappings above `KERNBASE`:
//! the low device hole, the kernel image (text read-only), the rest of
//! physical memory, and the high device window. User mappings never
//! appear at or above `KERNBASE`.

use crate::{
    error::Result,
    hal::mem::PhysMemory,
    memory::{
        page::Kmem,
        page_table::{PageDir, PtEntryFlags},
        PhysAddr, VirtAddr, DEVSPACE, EXTMEM, KERNBASE, KERN_TEXT_END,
    },
};

struct Kmap {
    virt: u32,
    phys_start: u32,
    phys_end: u64,
    perm: PtEntryFlags,
}

/// Sets up a page directory holding only the kernel window.
pub fn setupkvm(mem: &PhysMemory, kmem: &Kmem) -> Result<PageDir> {
    let phystop = mem.phystop() as u64;
    let kmap = [
        // I/O space
        Kmap {
            virt: KERNBASE,
            phys_start: 0,
            phys_end: EXTMEM as u64,
            perm: PtEntryFlags::W,
        },
        // kernel text + rodata
        Kmap {
            virt: KERNBASE + EXTMEM,
            phys_start: EXTMEM,
            phys_end: KERN_TEXT_END as u64,
            perm: PtEntryFlags::empty(),
        },
        // kernel data + free memory
        Kmap {
            virt: KERNBASE + KERN_TEXT_END,
            phys_start: KERN_TEXT_END,
            phys_end: phystop,
            perm: PtEntryFlags::W,
        },
        // more devices
        Kmap {
            virt: DEVSPACE,
            phys_start: DEVSPACE,
            phys_end: 1 << 32,
            perm: PtEntryFlags::W,
        },
    ];

    let pgdir = PageDir::alloc(mem, kmem)?;
    for m in &kmap {
        let size = m.phys_end - m.phys_start as u64;
        if let Err(e) = pgdir.map_pages(
            mem,
            kmem,
            VirtAddr::new(m.virt),
            size,
            PhysAddr::new(m.phys_start),
            m.perm,
        ) {
            pgdir.free_tables(mem, kmem);
            return Err(e);
        }
    }
    Ok(pgdir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, Cpu};
    use crate::memory::{p2v, v2p, PAGE_SIZE};

    #[test]
    fn kernel_window_translates() {
        let c = Cpu::new(0);
        unsafe { cpu::set_current(&c) };

        let mem = PhysMemory::new(0x80_0000);
        let kmem = Kmem::new();
        kmem.init2(&mem, super::KERN_TEXT_END + 0x10_0000, 0x80_0000);
        let pgdir = setupkvm(&mem, &kmem).unwrap();

        // a kernel virtual address resolves to its physical twin
        let pa = PhysAddr::new(0x20_0000);
        let pte = pgdir.entry(&mem, p2v(pa)).unwrap();
        assert!(pte.is_present());
        assert_eq!(pte.addr(), pa);
        assert_eq!(v2p(p2v(pa)), pa);

        // kernel text is mapped read-only and never user-accessible
        let text = pgdir
            .entry(&mem, VirtAddr::new(KERNBASE + EXTMEM))
            .unwrap();
        assert!(!text.flags().contains(PtEntryFlags::W));
        for va in (KERNBASE..KERNBASE + 0x40_0000).step_by(PAGE_SIZE) {
            if let Some(pte) = pgdir.entry(&mem, VirtAddr::new(va)) {
                assert!(!pte.flags().contains(PtEntryFlags::U));
            }
        }

        unsafe { cpu::set_current(core::ptr::null()) };
    }
}
