//! exec: replace a process's user image with a program from the file
//! system.
//!
//! Failure at any point leaves the old image intact; the process commits
//! to the new one only after everything (segments, stack, arguments)
//! is in place.

use std::sync::Arc;

use arrayvec::ArrayString;

use crate::{
    error::{KernelError, Result},
    fs::path,
    kernel::Kernel,
    memory::{
        page_roundup,
        page_table::PageDir,
        vm::setupkvm,
        vm_user::{allocuvm, clearpteu, copyout, freevm, loaduvm},
        VirtAddr, PAGE_SIZE,
    },
    param::MAXARG,
    proc::{
        elf::{ElfHeader, ProgHeader, ELF_MAGIC, ELF_PROG_LOAD},
        switchuvm, Proc,
    },
};

pub fn exec(k: &Arc<Kernel>, p: &Proc, path_bytes: &[u8], argv: &[Vec<u8>]) -> Result<()> {
    if argv.len() > MAXARG {
        return Err(KernelError::ArgumentListTooLong);
    }

    let private = unsafe { p.private() };

    // Load the image under a transaction; everything after the load is
    // pure memory work.
    let (pgdir, sz, entry) = {
        let tx = k.begin_tx();
        let ip = path::resolve(&tx, private.cwd.as_ref(), path_bytes)?;
        let mut g = ip.lock(k);

        let res = (|| -> Result<(PageDir, u32, u32)> {
            // Check ELF header.
            let elf: ElfHeader = g
                .read_as(k, 0)
                .map_err(|_| KernelError::InvalidExecutable)?;
            if elf.magic != ELF_MAGIC {
                return Err(KernelError::InvalidExecutable);
            }

            let pgdir = setupkvm(&k.mem, &k.kmem)?;

            // Load program into memory.
            let mut sz = 0_u32;
            let res = (|| -> Result<u32> {
                for i in 0..elf.phnum {
                    let off = elf.phoff + u32::from(i) * size_of::<ProgHeader>() as u32;
                    let ph: ProgHeader = g
                        .read_as(k, off)
                        .map_err(|_| KernelError::InvalidExecutable)?;
                    if ph.ty != ELF_PROG_LOAD {
                        continue;
                    }
                    if ph.memsz < ph.filesz {
                        return Err(KernelError::InvalidExecutable);
                    }
                    let end = ph
                        .vaddr
                        .checked_add(ph.memsz)
                        .ok_or(KernelError::InvalidExecutable)?;
                    if ph.vaddr as usize % PAGE_SIZE != 0 {
                        return Err(KernelError::InvalidExecutable);
                    }

                    sz = allocuvm(&k.mem, &k.kmem, pgdir, sz, end)?;
                    loaduvm(
                        &k.mem,
                        &k.kmem,
                        pgdir,
                        VirtAddr::new(ph.vaddr),
                        ph.filesz as usize,
                        |seg_off, buf| {
                            g.read(
                                k,
                                crate::memory::vm_user::DstBuf::Kernel(buf),
                                ph.off + seg_off as u32,
                            )
                        },
                    )?;
                }
                Ok(sz)
            })();

            match res {
                Ok(sz) => Ok((pgdir, sz, elf.entry)),
                Err(e) => {
                    freevm(&k.mem, &k.kmem, pgdir, sz);
                    Err(e)
                }
            }
        })();

        match res {
            Ok(loaded) => {
                g.unlock_put(&tx, ip);
                loaded
            }
            Err(e) => {
                g.unlock_put(&tx, ip);
                return Err(e);
            }
        }
    };

    let res = (|| -> Result<(u32, u32)> {
        // Allocate two pages at the next page boundary: an inaccessible
        // guard, then the user stack.
        let sz = page_roundup(sz);
        let sz = allocuvm(&k.mem, &k.kmem, pgdir, sz, sz + 2 * PAGE_SIZE as u32)?;
        clearpteu(
            &k.mem,
            &k.kmem,
            pgdir,
            VirtAddr::new(sz - 2 * PAGE_SIZE as u32),
        );
        let mut sp = sz;

        // Push argument strings, prepare rest of stack in ustack.
        let mut ustack = [0_u32; 3 + MAXARG + 1];
        for (i, arg) in argv.iter().enumerate() {
            sp = (sp - (arg.len() as u32 + 1)) & !3;
            copyout(&k.mem, pgdir, VirtAddr::new(sp), arg)?;
            copyout(
                &k.mem,
                pgdir,
                VirtAddr::new(sp + arg.len() as u32),
                &[0],
            )?;
            ustack[3 + i] = sp;
        }
        ustack[3 + argv.len()] = 0;

        ustack[0] = 0xffff_ffff; // fake return PC
        ustack[1] = argv.len() as u32;
        ustack[2] = sp - (argv.len() as u32 + 1) * 4; // argv pointer

        sp -= (3 + argv.len() as u32 + 1) * 4;
        let words = (3 + argv.len() + 1) * 4;
        let mut bytes = vec![0_u8; words];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(&ustack) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        copyout(&k.mem, pgdir, VirtAddr::new(sp), &bytes)?;

        Ok((sz, sp))
    })();

    let (sz, sp) = match res {
        Ok(v) => v,
        Err(e) => {
            freevm(&k.mem, &k.kmem, pgdir, sz);
            return Err(e);
        }
    };

    // Save program name for debugging.
    let name = path_bytes
        .rsplit(|&b| b == b'/')
        .next()
        .unwrap_or(path_bytes);
    {
        let mut pt = k.ptable.lock();
        let mut s = ArrayString::<16>::new();
        for &b in name.iter().take(15) {
            s.push(b as char);
        }
        pt.slots[p.idx].name = s;
    }

    // Commit to the user image.
    let old_pgdir = private.pgdir.replace(pgdir);
    let old_sz = core::mem::replace(&mut private.sz, sz);

    let mut tf = p.trapframe(k);
    tf.eip = entry; // main
    tf.esp = sp;
    p.set_trapframe(k, &tf);

    // The machine does not decode user instructions; control transfers
    // to the program registered for this path.
    private.prog = k.lookup_prog(path_bytes);

    switchuvm(k, p);
    if let Some(old) = old_pgdir {
        freevm(&k.mem, &k.kmem, old, old_sz);
    }
    Ok(())
}
