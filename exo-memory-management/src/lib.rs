//! EXO Memory Management
//!
//! User-level paging policies for environments running on the exokernel:
//! fault dispatch onto the exception stack, a demand-paged write-back block
//! cache, and copy-on-write `fork`/`sfork`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// Re-export API types
pub use exo_api::*;

#[macro_use]
mod logging;

pub mod bc;
pub mod env;
pub mod fork;

// Re-export commonly used types and functions
pub use bc::{BcStats, BlockCache, BlockCacheConfig, EvictionPolicy};
pub use env::{
    Env, FaultConfig, FnHandler, MAX_NESTED_FAULTS, MappingInfo, PgfaultHandler, UTRAPFRAME_SIZE,
    UTrapframe,
};
pub use fork::{CowFaultHandler, Forked, duppage, fork, sfork};
