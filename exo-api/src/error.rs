//! Error handling for user-level paging
//!
//! Two layers of errors exist. [`SysError`] is what a kernel primitive or the
//! disk returns. [`Error`] is an unrecoverable outcome of the paging policies:
//! either a protocol violation detected by the policy itself, or a primitive
//! failure lifted with [`SyscallContext::context`]. Every [`Error`] raised while
//! an environment runs terminates that environment and is reported to the
//! caller wrapped in [`Error::Terminated`].

use alloc::boxed::Box;
use core::fmt;

use crate::addr::VirtAddr;
use crate::kernel::{EnvId, FaultErr};

/// Error codes returned by kernel primitives and the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Unspecified or unknown problem
    Unspecified,
    /// Environment doesn't exist or otherwise cannot be used
    BadEnv,
    /// Invalid parameter
    Inval,
    /// Request failed due to memory shortage
    NoMem,
    /// Attempt to create a new environment beyond the maximum allowed
    NoFreeEnv,
    /// Memory fault
    Fault,
    /// Disk I/O failed
    NoDisk,
}

impl SysError {
    /// Numeric code as returned across the syscall boundary (always negative).
    pub const fn code(self) -> i32 {
        match self {
            SysError::Unspecified => -1,
            SysError::BadEnv => -2,
            SysError::Inval => -3,
            SysError::NoMem => -4,
            SysError::NoFreeEnv => -5,
            SysError::Fault => -6,
            SysError::NoDisk => -9,
        }
    }

    /// Resource exhaustion rather than a programming error.
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, SysError::NoMem | SysError::NoFreeEnv)
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SysError::Unspecified => "unspecified error",
            SysError::BadEnv => "bad environment",
            SysError::Inval => "invalid parameter",
            SysError::NoMem => "out of memory",
            SysError::NoFreeEnv => "out of environments",
            SysError::Fault => "segmentation fault",
            SysError::NoDisk => "disk error",
        };
        f.write_str(msg)
    }
}

/// Result of a kernel primitive
pub type SysResult<T> = core::result::Result<T, SysError>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// An invariant of the paging protocol was violated
    Protocol,
    /// A kernel primitive or disk operation failed
    Primitive,
    /// The environment has been terminated
    Terminal,
}

/// Unrecoverable outcome of a paging policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fault delivered to the block cache outside its window
    FaultOutsideWindow {
        /// Faulting address
        va: VirtAddr,
        /// Faulting instruction
        eip: usize,
        /// Fault error code
        err: FaultErr,
    },
    /// Block number 0 or beyond the end of the disk
    BadBlockNumber(u32),
    /// Fault on a block beyond the end of the disk
    NonexistentBlock(u32),
    /// A block marked free in the bitmap was read in
    FreeBlock(u32),
    /// Flush requested outside the block cache window
    BadFlushAddress(VirtAddr),
    /// Superblock magic mismatch
    BadSuperblock(u32),
    /// Disk has more blocks than the window can hold
    DiskTooLarge(u32),
    /// A reserved block is marked free in the bitmap
    BitmapInconsistent(u32),
    /// Copy-on-write handler reached by a non-write fault
    NotWriteFault {
        /// Faulting address
        va: VirtAddr,
        /// Fault error code
        err: FaultErr,
    },
    /// Copy-on-write handler reached for a page that is not copy-on-write
    NotCopyOnWrite(VirtAddr),
    /// Fault with no registered handler or upcall
    UnhandledFault {
        /// Faulting address
        va: VirtAddr,
        /// Faulting instruction
        eip: usize,
        /// Fault error code
        err: FaultErr,
    },
    /// Exception stack page missing or not writable
    ExceptionStackMissing(VirtAddr),
    /// Nested faults exhausted the exception stack
    ExceptionStackOverflow(usize),
    /// The same access kept faulting after being resolved
    FaultLoop(VirtAddr),
    /// A kernel primitive failed
    Syscall {
        /// Name of the primitive
        op: &'static str,
        /// Error it returned
        err: SysError,
    },
    /// Operation on an environment that is no longer alive
    NotAlive(EnvId),
    /// A configuration failed validation
    InvalidConfig(&'static str),
    /// A runtime self-check found the cache misbehaving
    SelfCheck(&'static str),
    /// The environment was terminated because of `cause`
    Terminated {
        /// Terminated environment
        env: EnvId,
        /// Error that terminated it
        cause: Box<Error>,
    },
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Syscall { .. } => ErrorClass::Primitive,
            Error::NotAlive(_) | Error::Terminated { .. } => ErrorClass::Terminal,
            _ => ErrorClass::Protocol,
        }
    }

    /// Innermost error, looking through termination wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Terminated { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FaultOutsideWindow { va, eip, err } => write!(
                f,
                "page fault in FS: eip {:#010x}, va {}, err {:#06x}",
                eip,
                va,
                err.bits()
            ),
            Error::BadBlockNumber(b) => write!(f, "bad block number {:08x}", b),
            Error::NonexistentBlock(b) => write!(f, "reading non-existent block {:08x}", b),
            Error::FreeBlock(b) => write!(f, "reading free block {:08x}", b),
            Error::BadFlushAddress(va) => write!(f, "flush_block of bad va {}", va),
            Error::BadSuperblock(magic) => {
                write!(f, "bad file system magic number {:#010x}", magic)
            }
            Error::DiskTooLarge(n) => write!(f, "file system is too large ({} blocks)", n),
            Error::BitmapInconsistent(b) => write!(f, "reserved block {} marked free", b),
            Error::NotWriteFault { va, err } => {
                write!(f, "non-write fault at {} (err {:#06x})", va, err.bits())
            }
            Error::NotCopyOnWrite(va) => write!(f, "{} is not a copy on write page", va),
            Error::UnhandledFault { va, eip, err } => write!(
                f,
                "unhandled page fault va {} ip {:#010x} err {:#06x}",
                va,
                eip,
                err.bits()
            ),
            Error::ExceptionStackMissing(va) => {
                write!(f, "exception stack at {} not mapped writable", va)
            }
            Error::ExceptionStackOverflow(depth) => {
                write!(f, "exception stack overflow at fault depth {}", depth)
            }
            Error::FaultLoop(va) => write!(f, "fault at {} keeps recurring", va),
            Error::Syscall { op, err } => write!(f, "{}: {}", op, err),
            Error::NotAlive(env) => write!(f, "environment {} is not alive", env),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::SelfCheck(msg) => write!(f, "self-check failed: {}", msg),
            Error::Terminated { env, cause } => {
                write!(f, "environment {} terminated: {}", env, cause)
            }
        }
    }
}

/// Result type for paging policy operations
pub type Result<T> = core::result::Result<T, Error>;

/// Lifts primitive failures into [`Error::Syscall`]
pub trait SyscallContext<T> {
    /// Names the primitive that failed
    fn context(self, op: &'static str) -> Result<T>;
}

impl<T> SyscallContext<T> for SysResult<T> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|err| Error::Syscall { op, err })
    }
}
