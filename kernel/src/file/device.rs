//! Device majors.
//!
//! A device inode carries a major number indexing this fixed table of
//! read/write function pairs. The console registers itself as major 1.

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    memory::vm_user::{DstBuf, SrcBuf},
    param::NDEV,
    sync::SpinLock,
};

/// The console's major number.
pub const CONSOLE: i16 = 1;

#[derive(Clone, Copy)]
pub struct DevSw {
    pub read: fn(&Kernel, DstBuf<'_>) -> Result<usize>,
    pub write: fn(&Kernel, SrcBuf<'_>) -> Result<usize>,
}

pub struct Devices {
    table: SpinLock<[Option<DevSw>; NDEV]>,
}

impl Devices {
    pub fn new() -> Self {
        Self {
            table: SpinLock::new([None; NDEV]),
        }
    }

    pub fn register(&self, major: i16, dev: DevSw) {
        let mut table = self.table.lock();
        table[major as usize] = Some(dev);
    }

    fn get(&self, major: i16) -> Result<DevSw> {
        let table = self.table.lock();
        usize::try_from(major)
            .ok()
            .and_then(|m| table.get(m).copied().flatten())
            .ok_or(KernelError::NoDevice)
    }

    pub fn read(&self, k: &Kernel, major: i16, dst: DstBuf<'_>) -> Result<usize> {
        // Copy the entry out; the handler may block and must not be
        // called with the table lock held.
        let dev = self.get(major)?;
        (dev.read)(k, dst)
    }

    pub fn write(&self, k: &Kernel, major: i16, src: SrcBuf<'_>) -> Result<usize> {
        let dev = self.get(major)?;
        (dev.write)(k, src)
    }
}

impl Default for Devices {
    fn default() -> Self {
        Self::new()
    }
}
