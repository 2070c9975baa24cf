//! On-disk format shared by the block cache and disk images
//!
//! Block 0 is reserved, block 1 holds the [`Superblock`], and the free-block
//! bitmap starts at block 2 with one bit per block (bit set = free).

use static_assertions::const_assert_eq;

use crate::addr::PAGE_SIZE;
use crate::kernel::SECTSIZE;

/// File system block size
pub const BLKSIZE: usize = PAGE_SIZE;
/// Sectors per block
pub const BLKSECTS: usize = BLKSIZE / SECTSIZE;
/// Bits per bitmap block
pub const BLKBITSIZE: usize = BLKSIZE * 8;
/// Superblock magic number
pub const FS_MAGIC: u32 = 0x4A05_30AE;
/// Block holding the superblock
pub const SUPER_BLOCKNO: u32 = 1;
/// First block of the free bitmap
pub const BITMAP_BLOCKNO: u32 = 2;

const_assert_eq!(BLKSIZE % SECTSIZE, 0);
const_assert_eq!(BLKSIZE, PAGE_SIZE);

/// File system superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number: FS_MAGIC
    pub magic: u32,
    /// Total number of blocks on disk
    pub nblocks: u32,
}

impl Superblock {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    /// Superblock for a disk of `nblocks` blocks.
    pub const fn new(nblocks: u32) -> Self {
        Self { magic: FS_MAGIC, nblocks }
    }

    /// Decode from the start of block 1.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            nblocks: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Encode for the start of block 1.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..].copy_from_slice(&self.nblocks.to_le_bytes());
        out
    }

    /// Number of blocks occupied by the free bitmap.
    pub fn bitmap_blocks(&self) -> u32 {
        (self.nblocks as usize).div_ceil(BLKBITSIZE) as u32
    }
}

/// Byte offset into the bitmap and bit mask for `blockno`.
#[inline]
pub const fn bitmap_position(blockno: u32) -> (usize, u8) {
    ((blockno / 8) as usize, 1u8 << (blockno % 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_encoding() {
        let sb = Superblock::new(1024);
        assert_eq!(Superblock::parse(&sb.to_bytes()), sb);
        assert_eq!(sb.bitmap_blocks(), 1);
        assert_eq!(Superblock::new(BLKBITSIZE as u32 + 1).bitmap_blocks(), 2);
    }

    #[test]
    fn test_bitmap_position() {
        assert_eq!(bitmap_position(0), (0, 0x01));
        assert_eq!(bitmap_position(13), (1, 0x20));
    }
}
