//! In-memory disk
//!
//! A sector array behind a spin lock, counting the sectors moved in each
//! direction so tests can tell cache hits from disk traffic.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use exo_api::fs::{BITMAP_BLOCKNO, SUPER_BLOCKNO, bitmap_position};
use exo_api::{BLKSECTS, BLKSIZE, BlockDevice, SECTSIZE, Superblock, SysError, SysResult};

/// RAM-backed [`BlockDevice`]
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sectors_read: AtomicUsize,
    sectors_written: AtomicUsize,
    failing: AtomicBool,
}

impl RamDisk {
    /// Zero-filled disk of `nblocks` blocks
    pub fn new(nblocks: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; nblocks as usize * BLKSIZE]),
            sectors_read: AtomicUsize::new(0),
            sectors_written: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Formatted disk of `nblocks` blocks: superblock at block 1 and a free
    /// bitmap in which every block starts allocated.
    pub fn mkfs(nblocks: u32) -> Self {
        let disk = Self::new(nblocks);
        let sb = Superblock::new(nblocks);
        {
            let mut data = disk.data.lock();
            let base = SUPER_BLOCKNO as usize * BLKSIZE;
            data[base..base + Superblock::SIZE].copy_from_slice(&sb.to_bytes());
        }
        for blockno in 0..nblocks {
            disk.set_bitmap_bit(blockno, false);
        }
        disk
    }

    /// Number of whole blocks on the disk
    pub fn nblocks(&self) -> u32 {
        (self.data.lock().len() / BLKSIZE) as u32
    }

    /// Mark `blockno` free in the bitmap.
    pub fn free_block(&self, blockno: u32) {
        self.set_bitmap_bit(blockno, true);
    }

    /// Mark `blockno` allocated in the bitmap.
    pub fn alloc_block(&self, blockno: u32) {
        self.set_bitmap_bit(blockno, false);
    }

    fn set_bitmap_bit(&self, blockno: u32, free: bool) {
        let (byte, mask) = bitmap_position(blockno);
        let mut data = self.data.lock();
        let at = BITMAP_BLOCKNO as usize * BLKSIZE + byte;
        if free {
            data[at] |= mask;
        } else {
            data[at] &= !mask;
        }
    }

    /// Contents of `blockno`, bypassing the counters.
    pub fn block(&self, blockno: u32) -> Vec<u8> {
        let start = blockno as usize * BLKSIZE;
        self.data.lock()[start..start + BLKSIZE].to_vec()
    }

    /// Overwrite the start of `blockno`, bypassing the counters.
    pub fn write_block(&self, blockno: u32, bytes: &[u8]) {
        let start = blockno as usize * BLKSIZE;
        self.data.lock()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Sectors transferred from disk so far
    pub fn sectors_read(&self) -> usize {
        self.sectors_read.load(Ordering::Relaxed)
    }

    /// Sectors transferred to disk so far
    pub fn sectors_written(&self) -> usize {
        self.sectors_written.load(Ordering::Relaxed)
    }

    /// Blocks read so far
    pub fn blocks_read(&self) -> usize {
        self.sectors_read() / BLKSECTS
    }

    /// Blocks written so far
    pub fn blocks_written(&self) -> usize {
        self.sectors_written() / BLKSECTS
    }

    /// Make every subsequent transfer fail with [`SysError::NoDisk`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn span(&self, secno: u32, len: usize, disk_len: usize) -> SysResult<(usize, usize)> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(SysError::NoDisk);
        }
        if len % SECTSIZE != 0 {
            return Err(SysError::Inval);
        }
        let start = secno as usize * SECTSIZE;
        match start.checked_add(len) {
            Some(end) if end <= disk_len => Ok((start, end)),
            _ => Err(SysError::Inval),
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_sectors(&self, secno: u32, buf: &mut [u8]) -> SysResult<()> {
        let data = self.data.lock();
        let (start, end) = self.span(secno, buf.len(), data.len())?;
        buf.copy_from_slice(&data[start..end]);
        self.sectors_read.fetch_add(buf.len() / SECTSIZE, Ordering::Relaxed);
        Ok(())
    }

    fn write_sectors(&self, secno: u32, buf: &[u8]) -> SysResult<()> {
        let mut data = self.data.lock();
        let (start, end) = self.span(secno, buf.len(), data.len())?;
        data[start..end].copy_from_slice(buf);
        self.sectors_written.fetch_add(buf.len() / SECTSIZE, Ordering::Relaxed);
        Ok(())
    }
}
