use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::fs::SB_MAGIC;
use crate::node::Inode;

/// Byte offset of the root record inside the super block.
pub const ROOT_OFFSET: usize = 8;

/// The block (number 1, block 0 is left to the boot loader) storing information
/// critical for mounting the file system and verifying the underlying disk is
/// formatted correctly.
///
/// Written once by `format`. At runtime only the root record's own fields
/// change.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct SuperBlock {
    /// A 32-bit identifying constant.
    pub sb_magic: U32<LittleEndian>,
    /// Total blocks on the volume, including the reserved ones.
    pub blocks_count: U32<LittleEndian>,
    /// The root directory, stored inline.
    pub root: Inode,
}

const _: () = assert!(std::mem::size_of::<SuperBlock>() == ROOT_OFFSET + 256);

impl SuperBlock {
    pub fn new(blocks_count: u32) -> Self {
        Self {
            sb_magic: U32::new(SB_MAGIC),
            blocks_count: U32::new(blocks_count),
            root: Inode::root(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sb_magic.get() == SB_MAGIC
    }

    pub fn block_count(&self) -> u32 {
        self.blocks_count.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_encode_and_decode_superblocks() {
        let sb = SuperBlock::new(64);
        let encoded = sb.as_bytes();
        assert_eq!(&encoded[0..4], &SB_MAGIC.to_le_bytes());
        assert_eq!(&encoded[4..8], &64u32.to_le_bytes());
        assert_eq!(&encoded[ROOT_OFFSET..ROOT_OFFSET + 2], b"/\0");

        let parsed = SuperBlock::read_from(encoded).unwrap();
        assert!(parsed.is_valid());
        assert_eq!(parsed.block_count(), 64);
        assert!(parsed.root.is_dir());
        assert_eq!(parsed.root.name(), "/");
    }

    #[test]
    fn zero_buffer_has_invalid_magic() {
        let zero_buffer_with_right_size = vec![0; 4096];
        let parsed = SuperBlock::read_from_prefix(&zero_buffer_with_right_size[..]).unwrap();
        assert!(!parsed.is_valid());
    }

    #[test]
    fn short_buffer_does_not_parse() {
        let wrong_size_buffer = vec![0; 100];
        assert!(SuperBlock::read_from_prefix(&wrong_size_buffer[..]).is_none());
    }
}
