//! Data-block allocator: one bit per block in the bitmap region.

use dataview::PodMethods as _;

use crate::{
    error::{KernelError, Result},
    fs::{
        bio::bread,
        log::Tx,
        repr::{BlockNo, BmapBlock, BPB},
    },
};

/// Zeros a block, through the log.
fn bzero(tx: &Tx<'_>, dev: u32, blockno: u32) {
    let k = tx.kernel();
    let mut buf = bread(k, dev, blockno);
    buf.bytes.fill(0);
    tx.write(&mut buf);
}

/// Allocates a zeroed disk block.
pub fn balloc(tx: &Tx<'_>, dev: u32) -> Result<BlockNo> {
    let k = tx.kernel();
    let sb = k.superblock();
    let size = sb.size as usize;

    for b0 in (0..size).step_by(BPB) {
        let mut buf = bread(k, dev, sb.bmap_block(b0).value());
        let found = (0..BPB)
            .take_while(|bi| b0 + bi < size)
            .find(|&bi| !buf.bytes.as_data_view().get::<BmapBlock>(0).bit(bi));
        let Some(bi) = found else {
            continue;
        };
        buf.bytes
            .as_data_view_mut()
            .get_mut::<BmapBlock>(0)
            .set_bit(bi); // mark block in use
        tx.write(&mut buf);
        drop(buf);

        let bn = (b0 + bi) as u32;
        bzero(tx, dev, bn);
        return Ok(BlockNo::new(bn));
    }
    kprintln!(k, "balloc: out of blocks");
    Err(KernelError::OutOfBlocks)
}

/// Frees a disk block.
pub fn bfree(tx: &Tx<'_>, dev: u32, b: BlockNo) {
    let k = tx.kernel();
    let sb = k.superblock();
    let mut buf = bread(k, dev, sb.bmap_block(b.as_index()).value());
    let bi = b.as_index() % BPB;
    let bits = buf.bytes.as_data_view_mut().get_mut::<BmapBlock>(0);
    assert!(bits.bit(bi), "freeing free block");
    bits.clear_bit(bi);
    tx.write(&mut buf);
}
