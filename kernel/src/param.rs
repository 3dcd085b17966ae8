//! System-wide tunables.

/// Maximum number of processes.
pub const NPROC: usize = 64;
/// Maximum number of CPUs.
pub const NCPU: usize = 8;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Open files per system.
pub const NFILE: usize = 100;
/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;
/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Maximum blocks any single FS operation may write.
pub const MAXOPBLOCKS: usize = 10;
/// Maximum data blocks in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;
/// Size of the disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// Size of the file system image in blocks.
pub const FSSIZE: usize = 1000;

/// Maximum number of exec arguments.
pub const MAXARG: usize = 32;
/// Maximum path length accepted by system calls.
pub const MAXPATH: usize = 128;
/// Pipe capacity in bytes.
pub const PIPESIZE: usize = 512;
