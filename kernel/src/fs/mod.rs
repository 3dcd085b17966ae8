//! File system implementation.
//!
//! Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inodes with special contents (lists of other inodes).
//!   + Names: paths for convenient naming.
//!
//! The (higher-level) system call implementations are in `syscall/file.rs`.

use dataview::PodMethods as _;

use crate::kernel::Kernel;

pub mod bio;
pub mod data_block;
pub mod dir;
pub mod ide;
pub mod inode;
pub mod log;
pub mod ops;
pub mod path;
pub mod repr;
pub mod stat;

use self::repr::SuperBlock;

/// Reads the super block from block 1.
fn readsb(k: &Kernel, dev: u32) -> SuperBlock {
    let buf = bio::bread(k, dev, SuperBlock::SUPER_BLOCK_NO.value());
    *buf.bytes.as_data_view().get::<SuperBlock>(0)
}

/// Mounts the file system on `dev`: super block first, then the log,
/// whose initialization replays any committed-but-uninstalled
/// transaction.
///
/// Must run in process context because it sleeps on disk reads; the
/// first process does it on its way out of the first scheduling.
pub fn init(k: &Kernel, dev: u32) {
    let sb = readsb(k, dev);
    assert!(
        sb.size > 0 && sb.nlog > 0 && sb.ninodes > 0,
        "bad super block"
    );
    k.set_superblock(sb);
    k.log.init(k, dev, &sb);
}
