//! Multi-step file system operations: create, link, unlink.
//!
//! These are the paths that juggle two locked inodes at once (parent
//! directory plus child); everything else in the tree locks at most one.

use dataview::PodMethods as _;

use crate::{
    error::{KernelError, Result},
    fs::{
        dir::{dirlink, dirlookup, isdirempty},
        inode::{ialloc, iput, Inode},
        log::Tx,
        path::{resolve, resolve_parent},
        repr::{DirEntry, DIRSIZ},
        stat::{T_DEV, T_DIR, T_FILE},
    },
};

/// Creates `path` as an inode of type `ty`.
///
/// For `T_FILE`, an existing file or device at the path is returned
/// instead (open-with-create semantics). Returns a pinned, unlocked
/// inode.
pub fn create(
    tx: &Tx<'_>,
    cwd: Option<&Inode>,
    path: &[u8],
    ty: i16,
    major: i16,
    minor: i16,
) -> Result<Inode> {
    let k = tx.kernel();
    let mut name = [0; DIRSIZ];
    let (dp_ip, name) = resolve_parent(tx, cwd, path, &mut name)?;
    let mut dp = dp_ip.lock(k);

    if let Some((ip, _off)) = dirlookup(k, &mut dp, name) {
        dp.unlock_put(tx, dp_ip);
        let g = ip.lock(k);
        if ty == T_FILE && (g.ty == T_FILE || g.ty == T_DEV) {
            g.unlock();
            return Ok(ip);
        }
        g.unlock_put(tx, ip);
        return Err(KernelError::AlreadyExists);
    }

    let ip = match ialloc(tx, dp.dev, ty) {
        Ok(ip) => ip,
        Err(e) => {
            dp.unlock_put(tx, dp_ip);
            return Err(e);
        }
    };

    let mut g = ip.lock(k);
    g.major = major;
    g.minor = minor;
    g.nlink = 1;
    g.update(tx);

    if ty == T_DIR {
        // for ".."
        dp.nlink += 1;
        dp.update(tx);
        // No error path: a fresh directory always has room for dots.
        dirlink(tx, &mut g, b".", ip.inum).expect("create dots");
        dirlink(tx, &mut g, b"..", dp.inum).expect("create dots");
    }

    dirlink(tx, &mut dp, name, ip.inum).expect("create: dirlink");

    dp.unlock_put(tx, dp_ip);
    g.unlock();
    Ok(ip)
}

/// Creates `new` as a second link to the same inode as `old`.
pub fn link(tx: &Tx<'_>, cwd: Option<&Inode>, old: &[u8], new: &[u8]) -> Result<()> {
    let k = tx.kernel();

    let ip = resolve(tx, cwd, old)?;
    let mut g = ip.lock(k);
    if g.ty == T_DIR {
        g.unlock_put(tx, ip);
        return Err(KernelError::BadInodeType);
    }
    g.nlink += 1;
    g.update(tx);
    g.unlock();

    let res: Result<()> = (|| {
        let mut name = [0; DIRSIZ];
        let (dp_ip, name) = resolve_parent(tx, cwd, new, &mut name)?;
        let mut dp = dp_ip.lock(k);
        if dp.dev != ip.dev {
            dp.unlock_put(tx, dp_ip);
            return Err(KernelError::EntryNotFound);
        }
        if let Err(e) = dirlink(tx, &mut dp, name, ip.inum) {
            dp.unlock_put(tx, dp_ip);
            return Err(e);
        }
        dp.unlock_put(tx, dp_ip);
        Ok(())
    })();

    match res {
        Ok(()) => {
            iput(tx, ip);
            Ok(())
        }
        Err(e) => {
            let mut g = ip.lock(k);
            g.nlink -= 1;
            g.update(tx);
            g.unlock_put(tx, ip);
            Err(e)
        }
    }
}

/// Removes the directory entry at `path`; the inode itself dies when its
/// last reference goes away.
pub fn unlink(tx: &Tx<'_>, cwd: Option<&Inode>, path: &[u8]) -> Result<()> {
    let k = tx.kernel();
    let mut name = [0; DIRSIZ];
    let (dp_ip, name) = resolve_parent(tx, cwd, path, &mut name)?;
    let mut dp = dp_ip.lock(k);

    // Cannot unlink "." or "..".
    if name == b"." || name == b".." {
        dp.unlock_put(tx, dp_ip);
        return Err(KernelError::EntryNotFound);
    }

    let Some((ip, off)) = dirlookup(k, &mut dp, name) else {
        dp.unlock_put(tx, dp_ip);
        return Err(KernelError::EntryNotFound);
    };
    let mut g = ip.lock(k);

    assert!(g.nlink > 0, "unlink: nlink < 1");
    if g.ty == T_DIR && !isdirempty(k, &mut g) {
        g.unlock_put(tx, ip);
        dp.unlock_put(tx, dp_ip);
        return Err(KernelError::DirectoryNotEmpty);
    }

    let de = DirEntry::zeroed();
    dp.write_data(tx, off, &de).expect("unlink: dirent erase");
    if g.ty == T_DIR {
        dp.nlink -= 1;
        dp.update(tx);
    }
    dp.unlock_put(tx, dp_ip);

    g.nlink -= 1;
    g.update(tx);
    g.unlock_put(tx, ip);
    Ok(())
}
