use std::fmt;

use zerocopy::byteorder::{LittleEndian, I64, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::cache::{BlockNo, DiskAddr};
use crate::fs::BLOCK_SIZE;

pub const NODE_SIZE: usize = 256;
pub const NODES_PER_BLOCK: usize = BLOCK_SIZE / NODE_SIZE;
/// Maximum name length including the terminating NUL.
pub const MAX_NAME_LEN: usize = 128;
pub const N_DIRECT: usize = 10;
/// Block numbers held by the single indirect block.
pub const N_INDIRECT: usize = BLOCK_SIZE / 4;
pub const MAX_FILE_BLOCKS: usize = N_DIRECT + N_INDIRECT;
pub const MAX_FILE_SIZE: i64 = (MAX_FILE_BLOCKS * BLOCK_SIZE) as i64;

/// Byte offsets of the block pointers inside a record.
pub const DIRECT_OFFSET: usize = 144;
pub const INDIRECT_OFFSET: usize = DIRECT_OFFSET + 4 * N_DIRECT;

const FTYPE_REG: u32 = 0;
const FTYPE_DIR: u32 = 1;

/// an description of the type of file object pointed to by an Inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// a regular file
    RegularFile,
    /// a directory tree containing 0 or more regular files or directories
    Directory,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
/// One file record. Records live inline in their directory's data blocks, 16
/// to a block; the root record lives in the super block.
///
/// This structure __must be exactly 256 bytes.__
pub struct Inode {
    /// NUL terminated; an empty name marks a free slot.
    name: [u8; MAX_NAME_LEN],
    ftype: U32<LittleEndian>,
    reserved: U32<LittleEndian>,
    /// The total size of the file in bytes.
    size: I64<LittleEndian>,
    /// Pointers for the first data blocks that belong to the file.
    direct: [U32<LittleEndian>; N_DIRECT],
    /// Block holding pointers for the remaining data blocks, 0 if none.
    indirect: U32<LittleEndian>,
    padding: [u8; NODE_SIZE - INDIRECT_OFFSET - 4],
}

const _: () = assert!(std::mem::size_of::<Inode>() == NODE_SIZE);

impl Inode {
    pub fn new(name: &str, ftype: FileType) -> Self {
        let mut node = Self::new_zeroed();
        node.set_name(name);
        node.ftype.set(match ftype {
            FileType::RegularFile => FTYPE_REG,
            FileType::Directory => FTYPE_DIR,
        });
        node
    }

    pub fn root() -> Self {
        Self::new("/", FileType::Directory)
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(MAX_NAME_LEN);
        &self.name[..len]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    /// # Panics
    ///
    /// The name must leave room for the terminating NUL.
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        assert!(bytes.len() < MAX_NAME_LEN, "file name too long: {}", name);
        self.name = [0; MAX_NAME_LEN];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn is_free_slot(&self) -> bool {
        self.name[0] == 0
    }

    pub fn file_type(&self) -> FileType {
        match self.ftype.get() {
            FTYPE_DIR => FileType::Directory,
            _ => FileType::RegularFile,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn size(&self) -> i64 {
        self.size.get()
    }

    pub fn set_size(&mut self, size: i64) {
        self.size.set(size);
    }

    /// Number of blocks a file of this size spans.
    pub fn block_count(&self) -> u32 {
        blocks_for(self.size())
    }

    pub fn direct(&self, i: usize) -> BlockNo {
        self.direct[i].get()
    }

    pub fn indirect(&self) -> BlockNo {
        self.indirect.get()
    }

    pub fn set_indirect(&mut self, bno: BlockNo) {
        self.indirect.set(bno);
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direct: Vec<BlockNo> = (0..N_DIRECT).map(|i| self.direct(i)).collect();
        f.debug_struct("Inode")
            .field("name", &self.name())
            .field("type", &self.file_type())
            .field("size", &self.size())
            .field("direct", &direct)
            .field("indirect", &self.indirect())
            .finish()
    }
}

/// Blocks needed to hold `size` bytes.
pub fn blocks_for(size: i64) -> u32 {
    let size = size.max(0) as u64;
    ((size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64) as u32
}

/// Location of a file record in the cache window. Records never move while
/// their file exists, so this works as a stable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef(DiskAddr);

impl FileRef {
    pub(crate) fn at(addr: DiskAddr) -> Self {
        FileRef(addr)
    }

    pub fn addr(self) -> DiskAddr {
        self.0
    }

    pub(crate) fn direct_slot(self, i: usize) -> DiskAddr {
        debug_assert!(i < N_DIRECT);
        self.0 + (DIRECT_OFFSET + 4 * i)
    }
}

/// Read-only summary of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub name: String,
    pub size: i64,
    pub is_dir: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_records_pack_a_block() {
        assert_eq!(NODES_PER_BLOCK, 16);
        assert_eq!(BLOCK_SIZE % NODE_SIZE, 0);
    }

    #[test]
    fn record_layout_is_fixed() {
        let mut node = Inode::new("motd", FileType::Directory);
        node.set_size(0x0102_0304_0506);
        node.direct[1].set(0xaabb);
        node.set_indirect(0x77);

        let bytes = node.as_bytes();
        assert_eq!(&bytes[..5], b"motd\0");
        assert_eq!(&bytes[128..132], &1u32.to_le_bytes());
        assert_eq!(&bytes[136..144], &0x0102_0304_0506i64.to_le_bytes());
        assert_eq!(&bytes[DIRECT_OFFSET + 4..DIRECT_OFFSET + 8], &0xaabbu32.to_le_bytes());
        assert_eq!(&bytes[INDIRECT_OFFSET..INDIRECT_OFFSET + 4], &0x77u32.to_le_bytes());
        assert!(bytes[INDIRECT_OFFSET + 4..].iter().all(|&b| b == 0));

        let parsed = Inode::read_from(bytes).unwrap();
        assert_eq!(parsed.name(), "motd");
        assert!(parsed.is_dir());
        assert_eq!(parsed.direct(1), 0xaabb);
    }

    #[test]
    fn zeroed_record_is_a_free_slot() {
        let node = Inode::new_zeroed();
        assert!(node.is_free_slot());
        assert_eq!(node.file_type(), FileType::RegularFile);
        assert_eq!(node.block_count(), 0);
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(4096), 1);
        assert_eq!(blocks_for(4097), 2);
        assert_eq!(blocks_for(10000), 3);
    }

    #[test]
    #[should_panic(expected = "file name too long")]
    fn names_must_fit() {
        Inode::new(&"x".repeat(MAX_NAME_LEN), FileType::RegularFile);
    }
}
