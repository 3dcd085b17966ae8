use dataview::Pod;

/// Directory
pub const T_DIR: i16 = 1;
/// File
pub const T_FILE: i16 = 2;
/// Device
pub const T_DEV: i16 = 3;

/// File metadata, as returned by `fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
#[repr(C)]
pub struct Stat {
    /// File system's disk device
    pub dev: u32,
    /// Inode number
    pub ino: u32,
    /// Type of file
    pub ty: i16,
    /// Number of links to file
    pub nlink: i16,
    /// Size of file in bytes
    pub size: u32,
}
