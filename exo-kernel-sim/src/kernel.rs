//! Emulated page-mapping kernel
//!
//! Each environment owns a sparse two-level page table: entries are keyed by
//! page number and a per-directory-slot counter answers `pde_present`. Frames
//! are reference counted so that copy-on-write sharing and privatization can be
//! observed from tests. Argument checking mirrors what the mapping syscalls of
//! an exokernel accept: page-aligned user addresses, permissions that include
//! `PRESENT | USER` and nothing outside `PteFlags::SYSCALL`.

use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use exo_api::{
    EnvId, EnvStatus, Exofork, FaultErr, MemoryLayout, Mmu, PAGE_SIZE, PageFault, PageTableView,
    PteFlags, SysError, SysResult, Syscalls, Upcall, VirtAddr,
};

use crate::frame::{FrameNo, FrameTable};

/// First environment id handed out
const FIRST_ENV_ID: u32 = 0x1000;

/// Simulator configuration
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Address space layout enforced by the syscalls
    pub layout: MemoryLayout,
    /// Maximum number of frames in use at once (`None` = unbounded)
    pub max_frames: Option<usize>,
    /// Maximum number of live environments
    pub max_envs: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            layout: MemoryLayout::default(),
            max_frames: None,
            max_envs: 1024,
        }
    }
}

#[derive(Clone, Copy)]
struct Pte {
    frame: FrameNo,
    flags: PteFlags,
}

#[derive(Default)]
struct PageDirectory {
    ptes: HashMap<usize, Pte>,
    tables: HashMap<usize, usize>,
}

impl PageDirectory {
    fn get(&self, va: VirtAddr) -> Option<&Pte> {
        self.ptes.get(&va.page_number())
    }

    fn get_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        self.ptes.get_mut(&va.page_number())
    }

    fn insert(&mut self, va: VirtAddr, pte: Pte) -> Option<Pte> {
        let old = self.ptes.insert(va.page_number(), pte);
        if old.is_none() {
            *self.tables.entry(va.pdx()).or_insert(0) += 1;
        }
        old
    }

    fn remove(&mut self, va: VirtAddr) -> Option<Pte> {
        let old = self.ptes.remove(&va.page_number());
        if old.is_some() {
            if let Some(count) = self.tables.get_mut(&va.pdx()) {
                *count -= 1;
                if *count == 0 {
                    self.tables.remove(&va.pdx());
                }
            }
        }
        old
    }

    fn table_present(&self, va: VirtAddr) -> bool {
        self.tables.contains_key(&va.pdx())
    }

    fn drain(&mut self) -> Vec<Pte> {
        self.tables.clear();
        self.ptes.drain().map(|(_, pte)| pte).collect()
    }
}

struct SimEnv {
    status: EnvStatus,
    parent: Option<EnvId>,
    upcall: Option<Upcall>,
    pgdir: PageDirectory,
}

impl SimEnv {
    fn new(status: EnvStatus, parent: Option<EnvId>) -> Self {
        Self {
            status,
            parent,
            upcall: None,
            pgdir: PageDirectory::default(),
        }
    }
}

struct SimState {
    frames: FrameTable,
    envs: HashMap<EnvId, SimEnv>,
    next_id: u32,
}

impl SimState {
    fn live_env(&self, id: EnvId) -> SysResult<&SimEnv> {
        match self.envs.get(&id) {
            Some(env) if env.status.is_alive() => Ok(env),
            _ => Err(SysError::BadEnv),
        }
    }

    fn live_env_mut(&mut self, id: EnvId) -> SysResult<&mut SimEnv> {
        match self.envs.get_mut(&id) {
            Some(env) if env.status.is_alive() => Ok(env),
            _ => Err(SysError::BadEnv),
        }
    }

    fn live_count(&self) -> usize {
        self.envs.values().filter(|env| env.status.is_alive()).count()
    }

    fn create_env(&mut self, status: EnvStatus, parent: Option<EnvId>) -> EnvId {
        let id = EnvId(self.next_id);
        self.next_id += 1;
        self.envs.insert(id, SimEnv::new(status, parent));
        id
    }

    /// Install `frame` at `va`, releasing whatever was mapped there before.
    fn install(&mut self, env: EnvId, va: VirtAddr, frame: FrameNo, flags: PteFlags) -> SysResult<()> {
        let SimState { frames, envs, .. } = self;
        let target = match envs.get_mut(&env) {
            Some(target) if target.status.is_alive() => target,
            _ => return Err(SysError::BadEnv),
        };
        frames.incref(frame);
        if let Some(old) = target.pgdir.insert(va, Pte { frame, flags }) {
            frames.decref(old.frame);
        }
        Ok(())
    }
}

/// Host emulation of the exokernel's paging primitives
pub struct SimKernel {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimKernel {
    /// Create a simulator with the given configuration
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState {
                frames: FrameTable::new(config.max_frames),
                envs: HashMap::new(),
                next_id: FIRST_ENV_ID,
            }),
        }
    }

    /// Layout enforced by this simulator
    pub fn layout(&self) -> MemoryLayout {
        self.config.layout
    }

    /// Create a runnable root environment with one user stack page mapped.
    ///
    /// Fails with `Inval` when the configured layout does not verify.
    pub fn spawn(&self) -> SysResult<EnvId> {
        if let Err(_reason) = self.config.layout.verify() {
            #[cfg(feature = "log")]
            log::warn!("spawn: bad layout: {}", _reason);
            return Err(SysError::Inval);
        }
        let stack = self.config.layout.user_stack();
        let id = {
            let mut state = self.state.lock();
            if state.live_count() >= self.config.max_envs {
                return Err(SysError::NoFreeEnv);
            }
            state.create_env(EnvStatus::Runnable, None)
        };
        self.page_alloc(id, stack, PteFlags::PUW)?;
        Ok(id)
    }

    /// Number of frames currently referenced by any mapping
    pub fn frames_in_use(&self) -> usize {
        self.state.lock().frames.in_use()
    }

    /// Change the frame limit
    pub fn set_frame_limit(&self, limit: Option<usize>) {
        self.state.lock().frames.set_limit(limit);
    }

    /// Number of mappings referencing the frame behind `va` in `env`
    pub fn frame_refs(&self, env: EnvId, va: VirtAddr) -> usize {
        let state = self.state.lock();
        state
            .envs
            .get(&env)
            .and_then(|e| e.pgdir.get(va))
            .map_or(0, |pte| state.frames.refs(pte.frame))
    }

    /// Whether two mappings alias the same frame
    pub fn same_frame(&self, a: EnvId, a_va: VirtAddr, b: EnvId, b_va: VirtAddr) -> bool {
        let state = self.state.lock();
        let frame_of = |env: EnvId, va: VirtAddr| {
            state.envs.get(&env).and_then(|e| e.pgdir.get(va)).map(|pte| pte.frame)
        };
        match (frame_of(a, a_va), frame_of(b, b_va)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Number of pages mapped in `env`
    pub fn mapping_count(&self, env: EnvId) -> usize {
        self.state.lock().envs.get(&env).map_or(0, |e| e.pgdir.ptes.len())
    }

    /// Parent recorded by `exofork`
    pub fn parent_of(&self, env: EnvId) -> Option<EnvId> {
        self.state.lock().envs.get(&env).and_then(|e| e.parent)
    }

    /// Clear the accessed bit of the page containing `va`, as periodic aging would.
    pub fn clear_accessed(&self, env: EnvId, va: VirtAddr) {
        if let Some(pte) = self
            .state
            .lock()
            .envs
            .get_mut(&env)
            .and_then(|e| e.pgdir.get_mut(va.page_round_down()))
        {
            pte.flags.remove(PteFlags::ACCESSED);
        }
    }

    fn check_va(&self, va: VirtAddr) -> SysResult<()> {
        if !self.config.layout.is_user_address(va) || !va.is_page_aligned() {
            return Err(SysError::Inval);
        }
        Ok(())
    }

    fn check_perm(perm: PteFlags) -> SysResult<()> {
        if !perm.contains(PteFlags::PRESENT | PteFlags::USER) || !PteFlags::SYSCALL.contains(perm) {
            return Err(SysError::Inval);
        }
        Ok(())
    }

    /// Validate a user access and update accessed/dirty; returns the frame.
    fn translate(&self, state: &mut SimState, env: EnvId, va: VirtAddr, write: bool) -> Result<FrameNo, PageFault> {
        let mut err = FaultErr::USER;
        if write {
            err |= FaultErr::WRITE;
        }
        if !self.config.layout.is_user_address(va) {
            return Err(PageFault { va, err: err | FaultErr::PROTECTION });
        }
        let pte = state
            .envs
            .get_mut(&env)
            .filter(|e| e.status.is_alive())
            .and_then(|e| e.pgdir.get_mut(va))
            .ok_or(PageFault { va, err })?;
        if !pte.flags.contains(PteFlags::USER) || (write && !pte.flags.is_writable()) {
            return Err(PageFault { va, err: err | FaultErr::PROTECTION });
        }
        pte.flags.insert(PteFlags::ACCESSED);
        if write {
            pte.flags.insert(PteFlags::DIRTY);
        }
        Ok(pte.frame)
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl Syscalls for SimKernel {
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()> {
        self.check_va(va)?;
        Self::check_perm(perm)?;
        let mut state = self.state.lock();
        state.live_env(env)?;
        let frame = state.frames.alloc()?;
        state.install(env, va, frame, perm)
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.check_va(src_va)?;
        self.check_va(dst_va)?;
        Self::check_perm(perm)?;
        let mut state = self.state.lock();
        state.live_env(dst_env)?;
        let src = *state
            .live_env(src_env)?
            .pgdir
            .get(src_va)
            .ok_or(SysError::Inval)?;
        if perm.is_writable() && !src.flags.is_writable() {
            return Err(SysError::Inval);
        }
        state.install(dst_env, dst_va, src.frame, perm)
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        self.check_va(va)?;
        let mut state = self.state.lock();
        let old = state.live_env_mut(env)?.pgdir.remove(va);
        if let Some(old) = old {
            state.frames.decref(old.frame);
        }
        Ok(())
    }

    fn exofork(&self, parent: EnvId) -> SysResult<Exofork> {
        let mut state = self.state.lock();
        state.live_env(parent)?;
        if state.live_count() >= self.config.max_envs {
            return Err(SysError::NoFreeEnv);
        }
        let child = state.create_env(EnvStatus::NotRunnable, Some(parent));
        #[cfg(feature = "log")]
        log::trace!("exofork: {} -> {}", parent, child);
        Ok(Exofork::Parent(child))
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(SysError::Inval);
        }
        self.state.lock().live_env_mut(env)?.status = status;
        Ok(())
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Upcall) -> SysResult<()> {
        self.state.lock().live_env_mut(env)?.upcall = Some(upcall);
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        let mut state = self.state.lock();
        let released = {
            let target = state.live_env_mut(env)?;
            target.status = EnvStatus::Free;
            target.upcall = None;
            target.pgdir.drain()
        };
        for pte in released {
            state.frames.decref(pte.frame);
        }
        #[cfg(feature = "log")]
        log::trace!("env_destroy: {}", env);
        Ok(())
    }

    fn env_status(&self, env: EnvId) -> Option<EnvStatus> {
        self.state.lock().envs.get(&env).map(|e| e.status)
    }

    fn pgfault_upcall(&self, env: EnvId) -> Option<Upcall> {
        self.state.lock().envs.get(&env).and_then(|e| e.upcall)
    }
}

impl PageTableView for SimKernel {
    fn pde_present(&self, env: EnvId, va: VirtAddr) -> bool {
        self.state
            .lock()
            .envs
            .get(&env)
            .is_some_and(|e| e.pgdir.table_present(va))
    }

    fn pte(&self, env: EnvId, va: VirtAddr) -> PteFlags {
        self.state
            .lock()
            .envs
            .get(&env)
            .and_then(|e| e.pgdir.get(va.page_round_down()))
            .map_or(PteFlags::empty(), |pte| pte.flags)
    }
}

impl Mmu for SimKernel {
    fn load(&self, env: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), PageFault> {
        debug_assert!(va.page_offset() + buf.len() <= PAGE_SIZE);
        let mut state = self.state.lock();
        let frame = self.translate(&mut state, env, va.page_round_down(), false)?;
        let offset = va.page_offset();
        buf.copy_from_slice(&state.frames.data(frame)[offset..offset + buf.len()]);
        Ok(())
    }

    fn store(&self, env: EnvId, va: VirtAddr, data: &[u8]) -> Result<(), PageFault> {
        debug_assert!(va.page_offset() + data.len() <= PAGE_SIZE);
        let mut state = self.state.lock();
        let frame = self.translate(&mut state, env, va.page_round_down(), true)?;
        let offset = va.page_offset();
        state.frames.data_mut(frame)[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
