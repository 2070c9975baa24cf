//! Demand-paged block cache
//!
//! Disk block `b` lives at `diskmap + b * BLKSIZE`. Nothing is read up front:
//! the first access to a block faults, and the fault handler reads the block
//! into a fresh page. Writes mark the page dirty through the MMU and
//! [`BlockCache::flush_block`] writes it back. The number of resident pages is
//! bounded by `bc_max`; reaching the bound runs an eviction pass that writes
//! back or drops pages that have not been accessed.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use exo_api::fs::{BITMAP_BLOCKNO, FS_MAGIC, SUPER_BLOCKNO, bitmap_position};
use exo_api::{
    BLKSECTS, BLKSIZE, BlockDevice, Error, Kernel, PteFlags, Result, Superblock, SyscallContext,
    VirtAddr,
};

use crate::env::{Env, PgfaultHandler, UTrapframe};

/// What an eviction pass does with pages that were accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Leave them alone; the accessed bit is never cleared by the cache
    #[default]
    Sticky,
    /// Clear the accessed bit so the next pass may reclaim them
    SecondChance,
}

/// Block cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCacheConfig {
    /// Resident page count that triggers an eviction pass
    pub bc_max: usize,
    /// Treatment of accessed pages during eviction
    pub eviction: EvictionPolicy,
    /// Run [`BlockCache::check`] during [`BlockCache::init`]
    pub self_check: bool,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            bc_max: 1 << 16,
            eviction: EvictionPolicy::Sticky,
            self_check: true,
        }
    }
}

impl BlockCacheConfig {
    /// Replace the resident bound.
    pub fn with_bc_max(mut self, bc_max: usize) -> Self {
        self.bc_max = bc_max;
        self
    }

    /// Replace the eviction policy.
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Enable or disable the self-check on init.
    pub fn with_self_check(mut self, self_check: bool) -> Self {
        self.self_check = self_check;
        self
    }

    /// Verify that the configuration is usable
    pub fn verify(&self) -> core::result::Result<(), &'static str> {
        if self.bc_max < 2 {
            return Err("bc_max must leave room for at least two resident blocks");
        }
        Ok(())
    }
}

/// Cache activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BcStats {
    /// Blocks read from disk by the fault handler
    pub loads: usize,
    /// Blocks written back
    pub flushes: usize,
    /// Pages unmapped by eviction
    pub evictions: usize,
    /// Eviction passes run
    pub eviction_passes: usize,
}

struct BcState {
    resident: usize,
    nblocks: Option<u32>,
    bitmap_blocks: Option<u32>,
    stats: BcStats,
}

/// Block cache over a [`BlockDevice`], registered as the fault handler of one
/// environment.
pub struct BlockCache<D> {
    dev: D,
    config: BlockCacheConfig,
    state: Mutex<BcState>,
}

impl<D: BlockDevice + Send + Sync + 'static> BlockCache<D> {
    /// Create the cache and make it the fault handler of `env`.
    pub fn init<K: Kernel>(env: &Env<K>, dev: D, config: BlockCacheConfig) -> Result<Arc<Self>> {
        env.guard(config.verify().map_err(Error::InvalidConfig))?;
        let cache = Arc::new(Self {
            dev,
            config,
            state: Mutex::new(BcState {
                resident: 0,
                nblocks: None,
                bitmap_blocks: None,
                stats: BcStats::default(),
            }),
        });
        env.set_pgfault_handler(cache.clone())?;
        if config.self_check {
            cache.check(env)?;
        }
        mm_info!("[{}] block cache ready, bc_max {}", env.id(), config.bc_max);
        Ok(cache)
    }

    /// [`init`](Self::init) followed by loading the superblock and bitmap.
    pub fn mount<K: Kernel>(env: &Env<K>, dev: D, config: BlockCacheConfig) -> Result<Arc<Self>> {
        let cache = Self::init(env, dev, config)?;
        cache.load_super(env)?;
        cache.load_bitmap(env)?;
        Ok(cache)
    }
}

impl<D: BlockDevice> BlockCache<D> {
    /// Active configuration
    pub fn config(&self) -> &BlockCacheConfig {
        &self.config
    }

    /// Backing device
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Pages currently resident in the window
    pub fn resident(&self) -> usize {
        self.state.lock().resident
    }

    /// Snapshot of the activity counters
    pub fn stats(&self) -> BcStats {
        self.state.lock().stats
    }

    /// Block count from the superblock, once loaded
    pub fn nblocks(&self) -> Option<u32> {
        self.state.lock().nblocks
    }

    /// Virtual address of `blockno`.
    ///
    /// Block 0 is never valid. Once the superblock is loaded, so is anything
    /// past the end of the disk.
    pub fn diskaddr<K: Kernel>(&self, env: &Env<K>, blockno: u32) -> Result<VirtAddr> {
        env.guard(self.block_va(env, blockno))
    }

    fn block_va<K: Kernel>(&self, env: &Env<K>, blockno: u32) -> Result<VirtAddr> {
        let nblocks = self.state.lock().nblocks;
        let layout = env.layout();
        if blockno == 0 || nblocks.is_some_and(|n| blockno >= n) {
            return Err(Error::BadBlockNumber(blockno));
        }
        (blockno as usize)
            .checked_mul(BLKSIZE)
            .filter(|&offset| offset < layout.disksize)
            .and_then(|offset| layout.diskmap.checked_add(offset))
            .map(VirtAddr::new)
            .ok_or(Error::BadBlockNumber(blockno))
    }

    fn blockno_of<K: Kernel>(env: &Env<K>, va: VirtAddr) -> u32 {
        ((va.as_usize() - env.layout().diskmap) / BLKSIZE) as u32
    }

    /// Write the block containing `va` back if it is resident and dirty.
    pub fn flush_block<K: Kernel>(&self, env: &Env<K>, va: VirtAddr) -> Result<()> {
        env.guard(self.flush(env, va))
    }

    fn flush<K: Kernel>(&self, env: &Env<K>, va: VirtAddr) -> Result<()> {
        if !env.layout().in_disk_window(va) {
            return Err(Error::BadFlushAddress(va));
        }
        let page = va.page_round_down();
        if !env.is_mapped(page) || !env.is_dirty(page) {
            return Ok(());
        }
        let blockno = Self::blockno_of(env, page);
        let mut buf = vec![0u8; BLKSIZE];
        env.read(page, &mut buf)?;
        self.dev
            .write_sectors(blockno * BLKSECTS as u32, &buf)
            .context("ide_write")?;
        let perm = env.pte(page).syscall_perm();
        env.kernel()
            .page_map(env.id(), page, env.id(), page, perm)
            .context("sys_page_map")?;
        self.state.lock().stats.flushes += 1;
        mm_debug!("[{}] flushed block {}", env.id(), blockno);
        Ok(())
    }

    /// Flush `blockno` and drop its page from the cache.
    pub fn evict_block<K: Kernel>(&self, env: &Env<K>, blockno: u32) -> Result<()> {
        env.guard(self.block_va(env, blockno).and_then(|va| self.reclaim(env, va)))
    }

    fn reclaim<K: Kernel>(&self, env: &Env<K>, va: VirtAddr) -> Result<()> {
        self.flush(env, va)?;
        if env.is_mapped(va) {
            self.unmap(env, va)?;
        }
        Ok(())
    }

    fn unmap<K: Kernel>(&self, env: &Env<K>, va: VirtAddr) -> Result<()> {
        env.kernel()
            .page_unmap(env.id(), va)
            .context("sys_page_unmap")?;
        let mut state = self.state.lock();
        state.resident = state.resident.saturating_sub(1);
        state.stats.evictions += 1;
        Ok(())
    }

    /// One pass over the window: pages that were not accessed are written
    /// back if dirty and unmapped if clean. `loading` is the page whose fault
    /// triggered the pass; it is left alone so the fault resolves.
    ///
    /// The resident count is taken from the page table, so pages unmapped
    /// behind the cache's back stop counting at the next pass.
    fn evict<K: Kernel>(&self, env: &Env<K>, loading: VirtAddr) -> Result<()> {
        let layout = env.layout();
        let window = VirtAddr::new(layout.diskmap)..VirtAddr::new(layout.diskmap + layout.disksize);
        let candidates: Vec<VirtAddr> = env
            .present_pages(window)
            .into_iter()
            .map(|(va, _)| va)
            .collect();
        self.state.lock().resident = candidates.len();
        mm_debug!(
            "[{}] eviction pass over {} resident pages",
            env.id(),
            candidates.len()
        );

        for va in candidates {
            if va == loading {
                continue;
            }
            let pte = env.pte(va);
            if !pte.is_present() {
                continue;
            }
            if pte.is_accessed() {
                if self.config.eviction == EvictionPolicy::SecondChance {
                    self.age(env, va, pte)?;
                }
                continue;
            }
            if pte.is_dirty() {
                self.flush(env, va)?;
            } else {
                self.unmap(env, va)?;
            }
        }
        self.state.lock().stats.eviction_passes += 1;
        Ok(())
    }

    fn age<K: Kernel>(&self, env: &Env<K>, va: VirtAddr, pte: PteFlags) -> Result<()> {
        // Remapping clears the dirty bit too, so dirty pages are written back.
        if pte.is_dirty() {
            return self.flush(env, va);
        }
        env.kernel()
            .page_map(env.id(), va, env.id(), va, pte.syscall_perm())
            .context("sys_page_map")
    }

    /// Read and validate the superblock, enabling block number range checks.
    pub fn load_super<K: Kernel>(&self, env: &Env<K>) -> Result<Superblock> {
        env.guard(self.read_super(env))
    }

    fn read_super<K: Kernel>(&self, env: &Env<K>) -> Result<Superblock> {
        let va = self.block_va(env, SUPER_BLOCKNO)?;
        let mut bytes = [0u8; Superblock::SIZE];
        env.read(va, &mut bytes)?;
        let sb = Superblock::parse(&bytes);
        if sb.magic != FS_MAGIC {
            return Err(Error::BadSuperblock(sb.magic));
        }
        if sb.nblocks as usize > env.layout().disksize / BLKSIZE {
            return Err(Error::DiskTooLarge(sb.nblocks));
        }
        self.state.lock().nblocks = Some(sb.nblocks);
        mm_info!("[{}] superblock is good, {} blocks", env.id(), sb.nblocks);
        Ok(sb)
    }

    /// Locate and validate the free bitmap, enabling the free-block check on
    /// every load. Loads the superblock first if needed.
    pub fn load_bitmap<K: Kernel>(&self, env: &Env<K>) -> Result<()> {
        env.guard(self.read_bitmap(env))
    }

    fn read_bitmap<K: Kernel>(&self, env: &Env<K>) -> Result<()> {
        let nblocks = match self.nblocks() {
            Some(n) => n,
            None => self.read_super(env)?.nblocks,
        };
        let bitmap_blocks = Superblock::new(nblocks).bitmap_blocks();
        let reserved = (BITMAP_BLOCKNO + bitmap_blocks).min(nblocks);
        for blockno in 0..reserved {
            if self.bit_is_free(env, blockno)? {
                return Err(Error::BitmapInconsistent(blockno));
            }
        }
        self.state.lock().bitmap_blocks = Some(bitmap_blocks);
        mm_info!("[{}] bitmap is good, {} blocks", env.id(), bitmap_blocks);
        Ok(())
    }

    /// Whether the bitmap marks `blockno` free. Without a superblock, or for
    /// blocks past the end of the disk, nothing is free.
    pub fn block_is_free<K: Kernel>(&self, env: &Env<K>, blockno: u32) -> Result<bool> {
        match self.nblocks() {
            Some(n) if blockno < n => env.guard(self.bit_is_free(env, blockno)),
            _ => Ok(false),
        }
    }

    fn bit_is_free<K: Kernel>(&self, env: &Env<K>, blockno: u32) -> Result<bool> {
        let (byte, mask) = bitmap_position(blockno);
        let block = BITMAP_BLOCKNO + (byte / BLKSIZE) as u32;
        let va = self.block_va(env, block)?.add(byte % BLKSIZE);
        let mut bits = [0u8];
        env.read(va, &mut bits)?;
        Ok(bits[0] & mask != 0)
    }

    /// Exercise the cache on the superblock: modify, flush, drop, reload and
    /// restore it, leaving the disk as it was.
    pub fn check<K: Kernel>(&self, env: &Env<K>) -> Result<()> {
        env.guard(self.self_check(env))
    }

    fn self_check<K: Kernel>(&self, env: &Env<K>) -> Result<()> {
        const SMASH: &[u8] = b"OOPS!\n\0";

        let va = self.block_va(env, SUPER_BLOCKNO)?;
        let mut backup = vec![0u8; BLKSIZE];
        env.read(va, &mut backup)?;

        env.write(va, SMASH)?;
        self.flush(env, va)?;
        if !env.is_mapped(va) || env.is_dirty(va) {
            return Err(Error::SelfCheck("flushed block is not resident and clean"));
        }

        self.reclaim(env, va)?;
        if env.is_mapped(va) {
            return Err(Error::SelfCheck("evicted block is still mapped"));
        }

        let mut reread = vec![0u8; BLKSIZE];
        env.read(va, &mut reread)?;
        if reread[..SMASH.len()] != *SMASH || reread[SMASH.len()..] != backup[SMASH.len()..] {
            return Err(Error::SelfCheck("reloaded block does not match what was flushed"));
        }

        env.write(va, &backup)?;
        self.flush(env, va)?;
        mm_info!("[{}] block cache is good", env.id());
        Ok(())
    }
}

impl<K: Kernel, D: BlockDevice + Send + Sync> PgfaultHandler<K> for BlockCache<D> {
    fn handle(&self, env: &Env<K>, utf: &UTrapframe) -> Result<()> {
        let layout = env.layout();
        let addr = utf.fault_va;
        if !layout.in_disk_window(addr) {
            return Err(Error::FaultOutsideWindow {
                va: addr,
                eip: utf.eip,
                err: utf.err,
            });
        }

        let blockno = Self::blockno_of(env, addr);
        let nblocks = self.nblocks();
        if nblocks.is_some_and(|n| blockno >= n) {
            return Err(Error::NonexistentBlock(blockno));
        }

        let page = addr.page_round_down();
        let (kernel, id) = (env.kernel(), env.id());
        kernel
            .page_alloc(id, page, PteFlags::PUW)
            .context("sys_page_alloc")?;
        let mut buf = vec![0u8; BLKSIZE];
        self.dev
            .read_sectors(blockno * BLKSECTS as u32, &mut buf)
            .context("ide_read")?;
        env.write(page, &buf)?;
        kernel
            .page_map(id, page, id, page, env.pte(page).syscall_perm())
            .context("sys_page_map")?;

        let resident = {
            let mut state = self.state.lock();
            state.resident += 1;
            state.stats.loads += 1;
            state.resident
        };
        mm_debug!("[{}] loaded block {} ({} resident)", id, blockno, resident);
        if resident >= self.config.bc_max {
            self.evict(env, page)?;
        }

        let bitmap_loaded = self.state.lock().bitmap_blocks.is_some();
        if bitmap_loaded && self.bit_is_free(env, blockno)? {
            return Err(Error::FreeBlock(blockno));
        }
        Ok(())
    }
}
