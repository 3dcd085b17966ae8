//! Directories.
//!
//! A directory is an inode of type `T_DIR` whose content is an array of
//! fixed-size entries. Entry 0 is "." and entry 1 is "..".

use dataview::PodMethods as _;

use crate::{
    error::{KernelError, Result},
    fs::{
        inode::{iget, iput, Inode, InodeGuard},
        log::Tx,
        repr::{DirEntry, InodeNo},
        stat::T_DIR,
    },
    kernel::Kernel,
};

const DE_SIZE: u32 = size_of::<DirEntry>() as u32;

/// Looks for a directory entry named `name`.
///
/// On a hit, returns the entry's pinned (unlocked) inode and the byte
/// offset of the entry, for a later in-place erase.
pub fn dirlookup(
    k: &Kernel,
    dp: &mut InodeGuard<'_>,
    name: &[u8],
) -> Option<(Inode, u32)> {
    assert_eq!(dp.ty, T_DIR, "dirlookup not DIR");

    for off in (0..dp.size).step_by(DE_SIZE as usize) {
        let de: DirEntry = dp.read_as(k, off).expect("dirlookup read");
        let Some(ino) = de.ino() else { continue };
        if de.is_name(name) {
            return Some((iget(k, dp.dev, ino), off));
        }
    }
    None
}

/// Writes a new directory entry (`name`, `ino`) into the directory.
pub fn dirlink(tx: &Tx<'_>, dp: &mut InodeGuard<'_>, name: &[u8], ino: InodeNo) -> Result<()> {
    let k = tx.kernel();

    // Check that name is not present.
    if let Some((ip, _)) = dirlookup(k, dp, name) {
        iput(tx, ip);
        return Err(KernelError::AlreadyExists);
    }

    // Look for an empty dirent, or append.
    assert_eq!(dp.size % DE_SIZE, 0, "dirlink: odd directory size");
    let mut off = dp.size;
    for o in (0..dp.size).step_by(DE_SIZE as usize) {
        let de: DirEntry = dp.read_as(k, o).expect("dirlink read");
        if de.ino().is_none() {
            off = o;
            break;
        }
    }

    let mut de = DirEntry::zeroed();
    de.set_name(name);
    de.inum = u16::try_from(ino.value()).expect("inode number fits a dirent");
    dp.write_data(tx, off, &de)?;
    Ok(())
}

/// Is the directory empty except for "." and ".."?
pub fn isdirempty(k: &Kernel, dp: &mut InodeGuard<'_>) -> bool {
    for off in ((2 * DE_SIZE)..dp.size).step_by(DE_SIZE as usize) {
        let de: DirEntry = dp.read_as(k, off).expect("isdirempty read");
        if de.ino().is_some() {
            return false;
        }
    }
    true
}
