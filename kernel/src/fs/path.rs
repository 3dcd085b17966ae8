//! Path resolution.

use crate::{
    error::{KernelError, Result},
    fs::{
        dir::dirlookup,
        inode::{idup, iget, iput, Inode},
        log::Tx,
        repr::{InodeNo, DIRSIZ},
        stat::T_DIR,
    },
    param::ROOTDEV,
};

/// Copies the next path element out of `path`.
///
/// Returns the element and the remainder with leading slashes removed,
/// or `None` when the path is exhausted.
///
/// ```text
/// skip_elem(b"a/bb/c")  == Some((b"a", b"bb/c"))
/// skip_elem(b"///a//bb") == Some((b"a", b"bb"))
/// skip_elem(b"a")        == Some((b"a", b""))
/// skip_elem(b"")         == None
/// skip_elem(b"////")     == None
/// ```
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let (elem, path) = path.split_at(end);
    let next = path.iter().position(|&c| c != b'/').unwrap_or(path.len());
    Some((elem, &path[next..]))
}

/// Looks up and returns the inode for `path`.
///
/// If `parent` is true, returns the inode for the parent directory and
/// copies the final path element into `name_out`.
///
/// Must be called inside a transaction since it calls `iput`.
fn namex(
    tx: &Tx<'_>,
    cwd: Option<&Inode>,
    mut path: &[u8],
    parent: bool,
    name_out: &mut [u8; DIRSIZ],
) -> Result<Inode> {
    let k = tx.kernel();
    let mut ip = if path.first() == Some(&b'/') {
        iget(k, ROOTDEV, InodeNo::ROOT)
    } else {
        idup(k, cwd.expect("relative path without a working directory"))
    };

    while let Some((elem, rest)) = skip_elem(path) {
        path = rest;

        let n = usize::min(elem.len(), DIRSIZ);
        name_out[..n].copy_from_slice(&elem[..n]);
        name_out[n..].fill(0);

        let mut guard = ip.lock(k);
        if guard.ty != T_DIR {
            guard.unlock_put(tx, ip);
            return Err(KernelError::NotADirectory);
        }

        if parent && path.is_empty() {
            // Stop one level early.
            guard.unlock();
            return Ok(ip);
        }

        let Some((next, _off)) = dirlookup(k, &mut guard, elem) else {
            guard.unlock_put(tx, ip);
            return Err(KernelError::EntryNotFound);
        };
        guard.unlock_put(tx, ip);
        ip = next;
    }

    if parent {
        iput(tx, ip);
        return Err(KernelError::EntryNotFound);
    }
    Ok(ip)
}

/// Resolves `path` to its inode.
pub fn resolve(tx: &Tx<'_>, cwd: Option<&Inode>, path: &[u8]) -> Result<Inode> {
    let mut name = [0; DIRSIZ];
    namex(tx, cwd, path, false, &mut name)
}

/// Resolves `path` to the inode of its parent directory, plus the final
/// path element.
pub fn resolve_parent<'n>(
    tx: &Tx<'_>,
    cwd: Option<&Inode>,
    path: &[u8],
    name: &'n mut [u8; DIRSIZ],
) -> Result<(Inode, &'n [u8])> {
    let ip = namex(tx, cwd, path, true, name)?;
    let len = name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
    Ok((ip, &name[..len]))
}

#[cfg(test)]
mod tests {
    use super::skip_elem;

    #[test]
    fn element_splitting() {
        assert_eq!(skip_elem(b"a/bb/c"), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_elem(b"///a//bb"), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_elem(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b"a/"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b""), None);
        assert_eq!(skip_elem(b"////"), None);
    }
}
