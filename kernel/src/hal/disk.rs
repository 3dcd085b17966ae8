//! Block device backends.
//!
//! A backend is the platter: it moves one 512-byte sector at a time and
//! knows nothing about buffers, caching or the log. The IDE driver in
//! `fs::ide` owns the request queue and the completion interrupt.

use std::sync::{Arc, Mutex};

pub const SECTOR_SIZE: usize = 512;

pub trait DiskBackend: Send + Sync {
    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]);
    fn nsectors(&self) -> usize;
}

/// An in-memory disk.
///
/// Cloning shares the underlying sectors, so a test can keep a handle,
/// shut the kernel down (or "cut the power"), and mount a second kernel on
/// the same platter.
#[derive(Clone)]
pub struct MemDisk(Arc<MemDiskInner>);

struct MemDiskInner {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    /// Remaining writes to honor; when it reaches zero the power is out
    /// and further writes never hit the platter.
    write_budget: Mutex<Option<u64>>,
    writes_done: Mutex<u64>,
}

impl MemDisk {
    pub fn new(nsectors: usize) -> Self {
        Self(Arc::new(MemDiskInner {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; nsectors]),
            write_budget: Mutex::new(None),
            writes_done: Mutex::new(0),
        }))
    }

    /// Builds a disk from a raw image, padding the last partial sector.
    pub fn from_image(image: &[u8]) -> Self {
        let nsectors = image.len().div_ceil(SECTOR_SIZE);
        let disk = Self::new(nsectors);
        {
            let mut sectors = disk.0.sectors.lock().unwrap();
            for (i, chunk) in image.chunks(SECTOR_SIZE).enumerate() {
                sectors[i][..chunk.len()].copy_from_slice(chunk);
            }
        }
        disk
    }

    /// Copies the current platter contents out.
    pub fn snapshot(&self) -> Vec<u8> {
        let sectors = self.0.sectors.lock().unwrap();
        let mut out = Vec::with_capacity(sectors.len() * SECTOR_SIZE);
        for s in sectors.iter() {
            out.extend_from_slice(s);
        }
        out
    }

    /// Fault injection: after `n` more successful writes the power is cut
    /// and every later write is dropped on the floor.
    pub fn cut_power_after(&self, n: u64) {
        *self.0.write_budget.lock().unwrap() = Some(n);
    }

    pub fn restore_power(&self) {
        *self.0.write_budget.lock().unwrap() = None;
    }

    /// Total writes that have reached the platter.
    pub fn writes_done(&self) -> u64 {
        *self.0.writes_done.lock().unwrap()
    }
}

impl DiskBackend for MemDisk {
    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.0.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector]);
    }

    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        let mut budget = self.0.write_budget.lock().unwrap();
        if let Some(left) = budget.as_mut() {
            if *left == 0 {
                return;
            }
            *left -= 1;
        }
        drop(budget);
        let mut sectors = self.0.sectors.lock().unwrap();
        sectors[sector].copy_from_slice(buf);
        *self.0.writes_done.lock().unwrap() += 1;
    }

    fn nsectors(&self) -> usize {
        self.0.sectors.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trip() {
        let mut image = vec![0_u8; 3 * SECTOR_SIZE + 7];
        image[0] = 0xaa;
        image[3 * SECTOR_SIZE] = 0xbb;
        let disk = MemDisk::from_image(&image);
        assert_eq!(disk.nsectors(), 4);

        let mut buf = [0; SECTOR_SIZE];
        disk.read_sector(0, &mut buf);
        assert_eq!(buf[0], 0xaa);
        disk.read_sector(3, &mut buf);
        assert_eq!(buf[0], 0xbb);
    }

    #[test]
    fn power_cut_drops_writes() {
        let disk = MemDisk::new(4);
        let data = [0x11; SECTOR_SIZE];
        disk.cut_power_after(1);
        disk.write_sector(0, &data);
        disk.write_sector(1, &data);

        let mut buf = [0; SECTOR_SIZE];
        disk.read_sector(0, &mut buf);
        assert_eq!(buf[0], 0x11);
        disk.read_sector(1, &mut buf);
        assert_eq!(buf[0], 0);

        disk.restore_power();
        disk.write_sector(1, &data);
        disk.read_sector(1, &mut buf);
        assert_eq!(buf[0], 0x11);
    }
}
