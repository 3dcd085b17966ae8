//! ELF32 executable format.

use dataview::Pod;

pub const ELF_MAGIC: u32 = 0x464C_457F; // "\x7FELF" in little endian

/// Loadable program segment.
pub const ELF_PROG_LOAD: u32 = 1;

/// File header.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct ElfHeader {
    pub magic: u32,
    pub elf: [u8; 12],
    pub ty: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program section header.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct ProgHeader {
    pub ty: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

const _: () = {
    assert!(size_of::<ElfHeader>() == 52);
    assert!(size_of::<ProgHeader>() == 32);
};
