//! EXO kernel simulator
//!
//! A host-side stand-in for the exokernel: [`SimKernel`] implements the
//! mapping syscalls, the page table view and the MMU over reference-counted
//! frames, and [`RamDisk`] provides sector storage. User-level paging code runs
//! against these unchanged.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

mod disk;
mod frame;
mod kernel;

pub use disk::RamDisk;
pub use frame::FrameNo;
pub use kernel::{SimConfig, SimKernel};
