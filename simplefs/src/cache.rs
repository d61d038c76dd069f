//! Demand-loaded cache of disk blocks.
//!
//! Every block has a fixed address in the cache window (`block * BLOCK_SIZE`).
//! A block is read from the device the first time it is touched and stays
//! resident until it is explicitly evicted or discarded. Mutable access marks
//! a block dirty; nothing reaches the device until the block is flushed.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;

use fileblock::BlockStorage;
use log::trace;
use zerocopy::{AsBytes, FromBytes};

use crate::alloc::bit_position;
use crate::fs::{SFSError, BLOCK_SECTORS, BLOCK_SIZE};

/// The block number to access ranging from 0 (the reserved null block) to n - 1
/// (the last block) where n is number of blocks on the volume.
pub type BlockNo = u32;

pub type Block = [u8; BLOCK_SIZE];

/// A byte address inside the cache window.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskAddr(u64);

impl DiskAddr {
    pub fn block(self) -> BlockNo {
        (self.0 / BLOCK_SIZE as u64) as BlockNo
    }

    pub fn offset(self) -> usize {
        (self.0 % BLOCK_SIZE as u64) as usize
    }
}

impl Add<usize> for DiskAddr {
    type Output = DiskAddr;

    fn add(self, rhs: usize) -> DiskAddr {
        DiskAddr(self.0 + rhs as u64)
    }
}

impl fmt::Debug for DiskAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiskAddr({}+{:#x})", self.block(), self.offset())
    }
}

struct CachedBlock {
    data: Box<Block>,
    dirty: bool,
}

impl CachedBlock {
    fn zeroed() -> Self {
        Self {
            data: Box::new([0; BLOCK_SIZE]),
            dirty: true,
        }
    }
}

pub struct BlockCache<T: BlockStorage> {
    dev: T,
    blocks: BTreeMap<BlockNo, CachedBlock>,
    /// Known once the super block has been read.
    nblocks: Option<u32>,
    /// Set once the bitmap is trustworthy; every load is then checked against it.
    check_free: bool,
}

impl<T: BlockStorage> BlockCache<T> {
    pub fn new(dev: T) -> Self {
        Self {
            dev,
            blocks: BTreeMap::new(),
            nblocks: None,
            check_free: false,
        }
    }

    pub fn set_block_count(&mut self, nblocks: u32) {
        self.nblocks = Some(nblocks);
    }

    pub fn block_count(&self) -> Option<u32> {
        self.nblocks
    }

    pub fn enable_free_check(&mut self) {
        self.check_free = true;
    }

    /// Returns the cache address of a block.
    ///
    /// # Panics
    ///
    /// Block 0 is never addressed by the file system, and neither is any block
    /// past the end of the volume.
    pub fn addr_of(&self, bno: BlockNo) -> DiskAddr {
        if bno == 0 || self.nblocks.map_or(false, |n| bno >= n) {
            panic!("bad block number {:08x} in addr_of", bno);
        }
        DiskAddr(u64::from(bno) * BLOCK_SIZE as u64)
    }

    pub fn block(&mut self, bno: BlockNo) -> Result<&Block, SFSError> {
        Ok(&self.load(bno)?.data)
    }

    pub fn block_mut(&mut self, bno: BlockNo) -> Result<&mut Block, SFSError> {
        let cached = self.load(bno)?;
        cached.dirty = true;
        Ok(&mut cached.data)
    }

    /// Installs a zero-filled block without reading the device. Used for blocks
    /// that were just allocated and whose old contents are garbage.
    pub fn install_zeroed(&mut self, bno: BlockNo) {
        trace!("zero block {}", bno);
        self.blocks.insert(bno, CachedBlock::zeroed());
    }

    pub fn read_bytes(&mut self, addr: DiskAddr, buf: &mut [u8]) -> Result<(), SFSError> {
        let range = span(addr, buf.len())?;
        buf.copy_from_slice(&self.block(addr.block())?[range]);
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: DiskAddr, buf: &[u8]) -> Result<(), SFSError> {
        let range = span(addr, buf.len())?;
        self.block_mut(addr.block())?[range].copy_from_slice(buf);
        Ok(())
    }

    pub fn read_u32(&mut self, addr: DiskAddr) -> Result<u32, SFSError> {
        let mut raw = [0; 4];
        self.read_bytes(addr, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&mut self, addr: DiskAddr, value: u32) -> Result<(), SFSError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn read<V: FromBytes>(&mut self, addr: DiskAddr) -> Result<V, SFSError> {
        let range = span(addr, std::mem::size_of::<V>())?;
        let block = self.block(addr.block())?;
        V::read_from(&block[range]).ok_or_else(|| straddles(addr))
    }

    pub fn write<V: AsBytes>(&mut self, addr: DiskAddr, value: &V) -> Result<(), SFSError> {
        self.write_bytes(addr, value.as_bytes())
    }

    pub fn fill(&mut self, addr: DiskAddr, len: usize, byte: u8) -> Result<(), SFSError> {
        let range = span(addr, len)?;
        self.block_mut(addr.block())?[range].fill(byte);
        Ok(())
    }

    pub fn is_cached(&self, bno: BlockNo) -> bool {
        self.blocks.contains_key(&bno)
    }

    pub fn is_dirty(&self, bno: BlockNo) -> bool {
        self.blocks.get(&bno).map_or(false, |b| b.dirty)
    }

    pub fn cached_blocks(&self) -> Vec<BlockNo> {
        self.blocks.keys().copied().collect()
    }

    /// Flush the contents of the block containing `addr` out to disk if necessary.
    /// The address is rounded down to its block first, so any byte inside a block
    /// flushes the whole block. If the block is not cached or is not dirty, does
    /// nothing.
    pub fn flush(&mut self, addr: DiskAddr) -> Result<(), SFSError> {
        self.write_back(addr.block())
    }

    pub fn flush_all(&mut self) -> Result<(), SFSError> {
        for bno in self.cached_blocks() {
            self.write_back(bno)?;
        }
        Ok(())
    }

    /// Writes the block back if needed and releases its buffer.
    pub fn evict(&mut self, bno: BlockNo) -> Result<(), SFSError> {
        self.write_back(bno)?;
        self.blocks.remove(&bno);
        Ok(())
    }

    /// Drops a cached block without writing it back.
    pub fn discard(&mut self, bno: BlockNo) {
        self.blocks.remove(&bno);
    }

    pub fn sync_device(&mut self) -> Result<(), SFSError> {
        self.dev.sync_disk()?;
        Ok(())
    }

    pub fn device(&self) -> &T {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut T {
        &mut self.dev
    }

    pub fn into_device(self) -> T {
        self.dev
    }

    fn write_back(&mut self, bno: BlockNo) -> Result<(), SFSError> {
        let cached = match self.blocks.get_mut(&bno) {
            Some(cached) if cached.dirty => cached,
            _ => return Ok(()),
        };
        trace!("write back block {}", bno);
        self.dev
            .write_sectors(sector_of(bno), &cached.data[..], BLOCK_SECTORS)?;
        cached.dirty = false;
        Ok(())
    }

    fn load(&mut self, bno: BlockNo) -> Result<&mut CachedBlock, SFSError> {
        let fetched = if self.blocks.contains_key(&bno) {
            None
        } else {
            Some(self.fetch(bno)?)
        };
        let entry = self.blocks.entry(bno);
        Ok(match fetched {
            Some(cached) => entry.or_insert(cached),
            None => entry.or_insert_with(CachedBlock::zeroed),
        })
    }

    fn fetch(&mut self, bno: BlockNo) -> Result<CachedBlock, SFSError> {
        if let Some(n) = self.nblocks {
            if bno >= n {
                return Err(SFSError::Corrupt(format!("reading non-existent block {:08x}", bno)));
            }
        }

        let mut data = Box::new([0; BLOCK_SIZE]);
        self.dev
            .read_sectors(sector_of(bno), &mut data[..], BLOCK_SECTORS)?;
        trace!("loaded block {}", bno);

        // The check runs after the read because the block being loaded may be
        // the very bitmap block that holds its own bit.
        if self.check_free {
            let (holder, byte, mask) = bit_position(bno);
            let free = if holder == bno {
                data[byte] & mask != 0
            } else {
                self.load(holder)?.data[byte] & mask != 0
            };
            if free {
                return Err(SFSError::Corrupt(format!("reading free block {:08x}", bno)));
            }
        }

        Ok(CachedBlock { data, dirty: false })
    }
}

fn sector_of(bno: BlockNo) -> u64 {
    u64::from(bno) * BLOCK_SECTORS as u64
}

fn span(addr: DiskAddr, len: usize) -> Result<std::ops::Range<usize>, SFSError> {
    let start = addr.offset();
    if start + len > BLOCK_SIZE {
        return Err(straddles(addr));
    }
    Ok(start..start + len)
}

fn straddles(addr: DiskAddr) -> SFSError {
    SFSError::InvalidArgument(format!("access at {:?} crosses a block boundary", addr))
}
