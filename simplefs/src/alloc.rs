use crate::cache::{BlockCache, BlockNo};
use crate::fs::{SFSError, BITMAP_START, BLOCK_BITS};
use fileblock::BlockStorage;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// Locates the bit tracking `bno`: the bitmap block holding it, the byte inside
/// that block and the mask selecting the bit.
pub(crate) fn bit_position(bno: BlockNo) -> (BlockNo, usize, u8) {
    let holder = BITMAP_START + bno / BLOCK_BITS;
    let within = bno % BLOCK_BITS;
    (holder, (within / 8) as usize, 1 << (within % 8))
}

/// Number of bitmap blocks needed to track `nblocks` blocks.
pub fn bitmap_blocks(nblocks: u32) -> u32 {
    nblocks.div_ceil(BLOCK_BITS)
}

/// The free block bitmap stored in blocks `[2, 2 + bitmap_blocks)`. Each bit maps
/// to one block on disk, 1 meaning free. A 4K bitmap block tracks up to
/// 4096 * 8 blocks.
///
/// The bitmap itself lives in the block cache; this type only knows the volume
/// geometry.
#[derive(Debug, Clone, Copy)]
pub struct Bitmap {
    nblocks: u32,
}

impl Bitmap {
    pub fn new(nblocks: u32) -> Self {
        Self { nblocks }
    }

    pub fn blocks(&self) -> u32 {
        bitmap_blocks(self.nblocks)
    }

    /// The first block that is neither the null block, the super block nor part
    /// of the bitmap.
    pub fn first_data_block(&self) -> BlockNo {
        BITMAP_START + self.blocks()
    }

    pub fn is_reserved(&self, bno: BlockNo) -> bool {
        bno < self.first_data_block()
    }

    /// Blocks outside the volume always read as used.
    pub fn get<T: BlockStorage>(&self, cache: &mut BlockCache<T>, bno: BlockNo) -> Result<State, SFSError> {
        if bno >= self.nblocks {
            return Ok(State::Used);
        }
        let (holder, byte, mask) = bit_position(bno);
        match cache.block(holder)?[byte] & mask {
            0 => Ok(State::Used),
            _ => Ok(State::Free),
        }
    }

    pub fn set<T: BlockStorage>(
        &self,
        cache: &mut BlockCache<T>,
        bno: BlockNo,
        state: State,
    ) -> Result<(), SFSError> {
        assert!(bno < self.nblocks, "block {} outside bitmap", bno);
        let (holder, byte, mask) = bit_position(bno);
        let block = cache.block_mut(holder)?;
        match state {
            State::Free => block[byte] |= mask,
            State::Used => block[byte] &= !mask,
        }
        Ok(())
    }

    /// First-fit scan from block 0 for a free bit.
    pub fn first_free<T: BlockStorage>(&self, cache: &mut BlockCache<T>) -> Result<Option<BlockNo>, SFSError> {
        for i in 0..self.blocks() {
            let block = cache.block(BITMAP_START + i)?;
            if let Some((byte, bits)) = block.iter().enumerate().find(|(_, &bits)| bits != 0) {
                let bno = i * BLOCK_BITS + byte as u32 * 8 + bits.trailing_zeros();
                return Ok(Some(bno).filter(|&bno| bno < self.nblocks));
            }
        }
        Ok(None)
    }

    pub fn count_used<T: BlockStorage>(&self, cache: &mut BlockCache<T>) -> Result<u32, SFSError> {
        let mut used = 0;
        for bno in 0..self.nblocks {
            if self.get(cache, bno)? == State::Used {
                used += 1;
            }
        }
        Ok(used)
    }

    /// Lays down a fresh bitmap: every block free except the reserved ones.
    pub fn format<T: BlockStorage>(&self, cache: &mut BlockCache<T>) -> Result<(), SFSError> {
        for i in 0..self.blocks() {
            cache.install_zeroed(BITMAP_START + i);
            cache.block_mut(BITMAP_START + i)?.fill(0xff);
        }
        for bno in 0..self.first_data_block() {
            self.set(cache, bno, State::Used)?;
        }
        Ok(())
    }

    /// Checks that all reserved blocks -- 0, 1, and the bitmap blocks themselves --
    /// are marked as in-use.
    pub fn check<T: BlockStorage>(&self, cache: &mut BlockCache<T>) -> Result<(), SFSError> {
        for bno in 0..self.first_data_block() {
            if self.get(cache, bno)? == State::Free {
                return Err(SFSError::Corrupt(format!("reserved block {} marked free", bno)));
            }
        }
        Ok(())
    }
}
