//! EXO API
//!
//! Core types shared by the user-level paging crates: virtual addresses, page
//! table entry bits, the user address space layout, error types, and the traits
//! through which user code reaches the kernel and the disk.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod addr;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod layout;
pub mod pte;

pub use addr::{PAGE_SHIFT, PAGE_SIZE, PDX_SHIFT, PT_SIZE, VirtAddr, page_round_down, page_round_up};
pub use fs::{BLKSECTS, BLKSIZE, Superblock};
pub use error::{Error, ErrorClass, Result, SysError, SysResult, SyscallContext};
pub use kernel::{
    Access, BlockDevice, EnvId, EnvStatus, Exofork, FaultErr, Kernel, Mmu, PageFault,
    PageTableView, SECTSIZE, Syscalls, Upcall,
};
pub use layout::MemoryLayout;
pub use pte::PteFlags;
