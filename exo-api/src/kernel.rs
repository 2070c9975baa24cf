//! Kernel primitives consumed by user-level paging
//!
//! The kernel exposes raw mapping syscalls, a read-only view of each
//! environment's page table, and the MMU itself (every user load or store goes
//! through [`Mmu`], which maintains accessed/dirty bits and reports faults).
//! Policy lives entirely in user code.

use bitflags::bitflags;
use core::fmt;

use crate::addr::VirtAddr;
use crate::error::SysResult;
use crate::pte::PteFlags;

/// Identifier of an environment (address-space instance)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EnvId(pub u32);

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of an environment
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EnvStatus {
    /// Slot is unused or the environment was destroyed
    Free,
    /// Being torn down
    Dying,
    /// Ready to run
    Runnable,
    /// Currently running
    Running,
    /// Exists but must not be scheduled
    NotRunnable,
}

impl EnvStatus {
    /// Whether an environment with this status still owns an address space.
    pub const fn is_alive(self) -> bool {
        matches!(
            self,
            EnvStatus::Runnable | EnvStatus::Running | EnvStatus::NotRunnable
        )
    }
}

/// Outcome of `exofork`, seen from either side
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Exofork {
    /// Returned to the parent: the new, suspended child
    Parent(EnvId),
    /// Returned inside the child, carrying its own identifier
    Child(EnvId),
}

/// User-mode entry point the kernel transfers to on a page fault
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Upcall(pub VirtAddr);

bitflags! {
    /// Page fault error code
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultErr: u32 {
        /// Protection violation on a present page (clear: page not present)
        const PROTECTION = 0x1;
        /// Faulting access was a write
        const WRITE = 0x2;
        /// Fault happened in user mode
        const USER = 0x4;
    }
}

/// Kind of memory access
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Access {
    /// Load
    Read,
    /// Store
    Write,
}

impl FaultErr {
    /// Access kind encoded in the error code
    pub fn access(self) -> Access {
        if self.contains(FaultErr::WRITE) {
            Access::Write
        } else {
            Access::Read
        }
    }
}

/// A page fault raised by the MMU
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageFault {
    /// Faulting address
    pub va: VirtAddr,
    /// Error code
    pub err: FaultErr,
}

/// Mapping and environment-management syscalls
///
/// Every call names the environments it operates on explicitly; user code
/// passes its own id where the kernel would accept "self".
pub trait Syscalls {
    /// Allocate a zeroed frame and map it at `va` in `env` with `perm`,
    /// replacing any previous mapping.
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()>;

    /// Map the frame behind `src_va` in `src_env` at `dst_va` in `dst_env`.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()>;

    /// Unmap `va` in `env`. Unmapping an absent page succeeds silently.
    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()>;

    /// Create a new environment with an empty address space, not runnable.
    fn exofork(&self, parent: EnvId) -> SysResult<Exofork>;

    /// Set `env` runnable or not runnable.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    /// Install the page fault upcall for `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Upcall) -> SysResult<()>;

    /// Destroy `env`, releasing all its mappings.
    fn env_destroy(&self, env: EnvId) -> SysResult<()>;

    /// Current status, `None` if the id was never allocated.
    fn env_status(&self, env: EnvId) -> Option<EnvStatus>;

    /// Installed page fault upcall of `env`.
    fn pgfault_upcall(&self, env: EnvId) -> Option<Upcall>;
}

/// Read-only view of an environment's page table
pub trait PageTableView {
    /// Whether the page table covering `va` exists.
    fn pde_present(&self, env: EnvId, va: VirtAddr) -> bool;

    /// Entry for the page containing `va`; empty when unmapped.
    fn pte(&self, env: EnvId, va: VirtAddr) -> PteFlags;
}

/// User-mode memory accesses
///
/// Accesses never cross a page boundary. A successful access sets the
/// accessed bit, and a successful store also sets the dirty bit.
pub trait Mmu {
    /// Load `buf.len()` bytes from `va`.
    fn load(&self, env: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), PageFault>;

    /// Store `data` at `va`.
    fn store(&self, env: EnvId, va: VirtAddr, data: &[u8]) -> Result<(), PageFault>;
}

/// Everything user-level paging needs from the kernel
pub trait Kernel: Syscalls + PageTableView + Mmu {}

impl<T: Syscalls + PageTableView + Mmu> Kernel for T {}

/// Disk sector size
pub const SECTSIZE: usize = 512;

/// Sector-addressed storage
pub trait BlockDevice {
    /// Read `buf.len() / SECTSIZE` sectors starting at `secno`.
    fn read_sectors(&self, secno: u32, buf: &mut [u8]) -> SysResult<()>;

    /// Write `buf.len() / SECTSIZE` sectors starting at `secno`.
    fn write_sectors(&self, secno: u32, buf: &[u8]) -> SysResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_access_kind() {
        assert_eq!((FaultErr::WRITE | FaultErr::USER).access(), Access::Write);
        assert_eq!(FaultErr::USER.access(), Access::Read);
    }

    #[test]
    fn test_alive_statuses() {
        assert!(EnvStatus::NotRunnable.is_alive());
        assert!(!EnvStatus::Free.is_alive());
        assert!(!EnvStatus::Dying.is_alive());
    }
}
