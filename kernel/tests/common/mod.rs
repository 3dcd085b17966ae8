//! Shared scaffolding for the end-to-end tests.
#![allow(dead_code)]

use std::sync::Arc;

use ox6_kernel::{Config, Kernel, MemDisk};

/// A minimal ELF32 image: one PT_LOAD segment at virtual address 0
/// carrying `payload`, entry point 0.
pub fn tiny_elf(payload: &[u8]) -> Vec<u8> {
    let ehsize = 52_u32;
    let phsize = 32_u32;
    let file_off = ehsize + phsize;

    let mut out = Vec::new();
    // ELF header
    out.extend_from_slice(&0x464C_457F_u32.to_le_bytes()); // magic
    out.extend_from_slice(&[1, 1, 1, 0]); // 32-bit, little-endian, v1
    out.extend_from_slice(&[0; 8]); // padding
    out.extend_from_slice(&2_u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&3_u16.to_le_bytes()); // EM_386
    out.extend_from_slice(&1_u32.to_le_bytes()); // version
    out.extend_from_slice(&0_u32.to_le_bytes()); // entry
    out.extend_from_slice(&ehsize.to_le_bytes()); // phoff
    out.extend_from_slice(&0_u32.to_le_bytes()); // shoff
    out.extend_from_slice(&0_u32.to_le_bytes()); // flags
    out.extend_from_slice(&(ehsize as u16).to_le_bytes()); // ehsize
    out.extend_from_slice(&(phsize as u16).to_le_bytes()); // phentsize
    out.extend_from_slice(&1_u16.to_le_bytes()); // phnum
    out.extend_from_slice(&0_u16.to_le_bytes()); // shentsize
    out.extend_from_slice(&0_u16.to_le_bytes()); // shnum
    out.extend_from_slice(&0_u16.to_le_bytes()); // shstrndx
    assert_eq!(out.len(), ehsize as usize);

    // Program header: PT_LOAD
    out.extend_from_slice(&1_u32.to_le_bytes()); // ty
    out.extend_from_slice(&file_off.to_le_bytes()); // off
    out.extend_from_slice(&0_u32.to_le_bytes()); // vaddr
    out.extend_from_slice(&0_u32.to_le_bytes()); // paddr
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()); // filesz
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()); // memsz
    out.extend_from_slice(&5_u32.to_le_bytes()); // flags r-x
    out.extend_from_slice(&0x1000_u32.to_le_bytes()); // align

    out.extend_from_slice(payload);
    out
}

pub fn boot_with_disk(files: &[(&str, &[u8])]) -> (Arc<Kernel>, MemDisk) {
    let image = ox6_mkfs::build_image(files);
    let disk = MemDisk::from_image(&image);
    let k = Kernel::boot(Config::default(), disk.clone());
    (k, disk)
}

pub fn boot(files: &[(&str, &[u8])]) -> Arc<Kernel> {
    boot_with_disk(files).0
}
