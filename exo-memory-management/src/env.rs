//! Environments and page fault dispatch
//!
//! An [`Env`] is the user-side handle of one address-space instance. All of its
//! memory accesses go through the kernel's [`Mmu`](exo_api::Mmu); when an
//! access faults, the fault is delivered to the single registered
//! [`PgfaultHandler`] on the exception stack and the access is retried once the
//! handler returns. Anything a handler cannot resolve terminates the
//! environment.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;
use static_assertions::const_assert;

use exo_api::{
    EnvId, Error, ErrorClass, FaultErr, Kernel, MemoryLayout, PAGE_SIZE, PT_SIZE, PageFault,
    PteFlags, Result, SyscallContext, VirtAddr,
};

/// Size of the trap frame pushed on the exception stack for each fault
pub const UTRAPFRAME_SIZE: usize = 52;

/// Deepest fault nesting the one-page exception stack can hold
pub const MAX_NESTED_FAULTS: usize = PAGE_SIZE / (UTRAPFRAME_SIZE + 4);

const_assert!(MAX_NESTED_FAULTS >= 2);

/// Fault handling limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultConfig {
    /// Consecutive resolutions of one access before it is declared a loop
    pub max_refaults: usize,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self { max_refaults: 16 }
    }
}

impl FaultConfig {
    /// Replace the refault limit.
    pub fn with_max_refaults(mut self, max_refaults: usize) -> Self {
        self.max_refaults = max_refaults;
        self
    }
}

/// What a handler learns about a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting address
    pub fault_va: VirtAddr,
    /// Error code
    pub err: FaultErr,
    /// Faulting instruction
    pub eip: usize,
}

/// A fault-resolution strategy
///
/// A handler either installs a mapping that lets the faulting access succeed
/// and returns `Ok`, or returns the error that terminates the environment.
pub trait PgfaultHandler<K: Kernel>: Send + Sync {
    /// Resolve one fault
    fn handle(&self, env: &Env<K>, utf: &UTrapframe) -> Result<()>;
}

/// Adapts a closure into a [`PgfaultHandler`]
pub struct FnHandler<F>(pub F);

impl<K, F> PgfaultHandler<K> for FnHandler<F>
where
    K: Kernel,
    F: Fn(&Env<K>, &UTrapframe) -> Result<()> + Send + Sync,
{
    fn handle(&self, env: &Env<K>, utf: &UTrapframe) -> Result<()> {
        (self.0)(env, utf)
    }
}

/// One present page and its permission bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    /// Page address
    pub va: VirtAddr,
    /// Entry bits
    pub perm: PteFlags,
}

impl fmt::Display for MappingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.va)?;
        let names = [
            (PteFlags::PRESENT, "P"),
            (PteFlags::WRITABLE, "W"),
            (PteFlags::USER, "U"),
            (PteFlags::ACCESSED, "A"),
            (PteFlags::DIRTY, "D"),
            (PteFlags::COW, "COW"),
        ];
        for (flag, name) in names {
            if self.perm.contains(flag) {
                write!(f, " {}", name)?;
            }
        }
        Ok(())
    }
}

/// User-side handle of one address-space instance
pub struct Env<K: Kernel> {
    kernel: Arc<K>,
    pub(crate) id: EnvId,
    layout: MemoryLayout,
    config: FaultConfig,
    handler: Mutex<Option<Arc<dyn PgfaultHandler<K>>>>,
    depth: AtomicUsize,
    ip: AtomicUsize,
}

impl<K: Kernel> Env<K> {
    /// Handle for `id` with no fault handler registered.
    pub fn new(kernel: Arc<K>, id: EnvId, layout: MemoryLayout) -> Self {
        Self {
            kernel,
            id,
            layout,
            config: FaultConfig::default(),
            handler: Mutex::new(None),
            depth: AtomicUsize::new(0),
            ip: AtomicUsize::new(0),
        }
    }

    /// Replace the fault handling limits.
    pub fn with_config(mut self, config: FaultConfig) -> Self {
        self.config = config;
        self
    }

    /// Handle for a child created by this environment. The child shares the
    /// registered handler, as it would after its memory was duplicated.
    pub fn inherit(&self, child: EnvId) -> Self {
        Self {
            kernel: Arc::clone(&self.kernel),
            id: child,
            layout: self.layout,
            config: self.config,
            handler: Mutex::new(self.handler.lock().clone()),
            depth: AtomicUsize::new(0),
            ip: AtomicUsize::new(0),
        }
    }

    /// Kernel id of this environment
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Kernel the environment runs on
    pub fn kernel(&self) -> &Arc<K> {
        &self.kernel
    }

    /// Address space layout
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Record the instruction pointer reported with subsequent faults.
    pub fn set_ip(&self, eip: usize) {
        self.ip.store(eip, Ordering::Relaxed);
    }

    /// Current fault nesting depth
    pub fn fault_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Install `handler` as the only fault-resolution strategy.
    ///
    /// The first registration checks the layout, allocates the exception
    /// stack and points the kernel at the upcall entry; later calls only swap
    /// the handler.
    pub fn set_pgfault_handler(&self, handler: Arc<dyn PgfaultHandler<K>>) -> Result<()> {
        let mut slot = self.handler.lock();
        if slot.is_none() {
            let setup = self
                .layout
                .verify()
                .map_err(Error::InvalidConfig)
                .and_then(|()| {
                    self.kernel
                        .page_alloc(self.id, self.layout.exception_stack(), PteFlags::PUW)
                        .context("sys_page_alloc")
                })
                .and_then(|()| {
                    self.kernel
                        .env_set_pgfault_upcall(self.id, self.layout.upcall())
                        .context("sys_env_set_pgfault_upcall")
                });
            self.guard(setup)?;
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Whether a handler is registered
    pub fn has_pgfault_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Read `buf.len()` bytes at `va`, resolving faults on the way.
    pub fn read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let mut at = va;
        for (offset, len) in split_by_page(va, buf.len()) {
            let piece = &mut buf[offset..offset + len];
            self.retry(at, |env| env.kernel.load(env.id, at, &mut *piece))?;
            at = at.add(len);
        }
        Ok(())
    }

    /// Write `data` at `va`, resolving faults on the way.
    pub fn write(&self, va: VirtAddr, data: &[u8]) -> Result<()> {
        let mut at = va;
        for (offset, len) in split_by_page(va, data.len()) {
            let piece = &data[offset..offset + len];
            self.retry(at, |env| env.kernel.store(env.id, at, piece))?;
            at = at.add(len);
        }
        Ok(())
    }

    /// Read a little-endian `u32` at `va`.
    pub fn read_u32(&self, va: VirtAddr) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read(va, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian `u32` at `va`.
    pub fn write_u32(&self, va: VirtAddr, value: u32) -> Result<()> {
        self.write(va, &value.to_le_bytes())
    }

    fn retry(
        &self,
        va: VirtAddr,
        mut access: impl FnMut(&Self) -> core::result::Result<(), PageFault>,
    ) -> Result<()> {
        let mut resolved = 0;
        loop {
            match access(self) {
                Ok(()) => return Ok(()),
                Err(_) if resolved == self.config.max_refaults => {
                    return Err(self.terminate(Error::FaultLoop(va)));
                }
                Err(fault) => {
                    self.dispatch(fault)?;
                    resolved += 1;
                }
            }
        }
    }

    /// Deliver `fault` to the registered handler.
    pub fn dispatch(&self, fault: PageFault) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::NotAlive(self.id));
        }
        let utf = UTrapframe {
            fault_va: fault.va,
            err: fault.err,
            eip: self.ip.load(Ordering::Relaxed),
        };
        mm_trace!(
            "[{}] page fault va {} err {:#x} depth {}",
            self.id,
            utf.fault_va,
            utf.err.bits(),
            self.fault_depth()
        );

        let unhandled = Error::UnhandledFault {
            va: utf.fault_va,
            eip: utf.eip,
            err: utf.err,
        };
        if self.kernel.pgfault_upcall(self.id) != Some(self.layout.upcall()) {
            return Err(self.terminate(unhandled));
        }
        let xstack = self.layout.exception_stack();
        if !self.kernel.pte(self.id, xstack).contains(PteFlags::PUW) {
            return Err(self.terminate(Error::ExceptionStackMissing(xstack)));
        }
        let Some(handler) = self.handler.lock().clone() else {
            return Err(self.terminate(unhandled));
        };

        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        let result = if depth > MAX_NESTED_FAULTS {
            Err(Error::ExceptionStackOverflow(depth))
        } else {
            handler.handle(self, &utf)
        };
        self.depth.fetch_sub(1, Ordering::Relaxed);
        self.guard(result)
    }

    /// Destroy this environment because of `cause`.
    ///
    /// Errors that already report a dead environment pass through unchanged.
    pub fn terminate(&self, cause: Error) -> Error {
        if cause.class() == ErrorClass::Terminal {
            return cause;
        }
        mm_error!("[{}] {}", self.id, cause);
        if let Err(_err) = self.kernel.env_destroy(self.id) {
            mm_warn!("[{}] env_destroy: {}", self.id, _err);
        }
        Error::Terminated {
            env: self.id,
            cause: Box::new(cause),
        }
    }

    /// Terminate on error.
    pub fn guard<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.terminate(err))
    }

    /// Whether the kernel still runs this environment
    pub fn is_alive(&self) -> bool {
        self.kernel.env_status(self.id).is_some_and(|s| s.is_alive())
    }

    /// Entry bits of the page containing `va` (empty when unmapped).
    pub fn pte(&self, va: VirtAddr) -> PteFlags {
        if !self.kernel.pde_present(self.id, va) {
            return PteFlags::empty();
        }
        self.kernel.pte(self.id, va)
    }

    /// Whether the page containing `va` is present
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.pte(va).is_present()
    }

    /// Whether the page containing `va` was written since it was last mapped
    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.pte(va).is_dirty()
    }

    /// Whether the page containing `va` is present and was touched since it
    /// was last mapped
    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        let pte = self.pte(va);
        pte.is_present() && pte.is_accessed()
    }

    /// Present pages in `range`, skipping page tables that do not exist.
    pub fn present_pages(&self, range: Range<VirtAddr>) -> Vec<(VirtAddr, PteFlags)> {
        let mut pages = Vec::new();
        let mut va = range.start.page_round_down();
        while va < range.end {
            if !self.kernel.pde_present(self.id, va) {
                va = VirtAddr::new((va.as_usize() & !(PT_SIZE - 1)) + PT_SIZE);
                continue;
            }
            let pte = self.kernel.pte(self.id, va);
            if pte.is_present() {
                pages.push((va, pte));
            }
            va = va.add(PAGE_SIZE);
        }
        pages
    }

    /// Dump of the present pages between `start` and `end`.
    pub fn mappings(&self, start: VirtAddr, end: VirtAddr) -> Vec<MappingInfo> {
        self.present_pages(start..end)
            .into_iter()
            .map(|(va, perm)| MappingInfo { va, perm })
            .collect()
    }
}

impl<K: Kernel> fmt::Debug for Env<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("depth", &self.fault_depth())
            .finish()
    }
}

/// Splits `[va, va + len)` into `(offset, len)` pieces that stay within a page.
fn split_by_page(va: VirtAddr, len: usize) -> impl Iterator<Item = (usize, usize)> {
    let mut offset = 0;
    let mut at = va.as_usize();
    core::iter::from_fn(move || {
        if offset >= len {
            return None;
        }
        let room = PAGE_SIZE - (at & (PAGE_SIZE - 1));
        let take = room.min(len - offset);
        let piece = (offset, take);
        offset += take;
        at += take;
        Some(piece)
    })
}
