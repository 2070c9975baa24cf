//! User address space layout
//!
//! Centralizes the fixed user-visible regions that the paging policies rely on:
//! the top of user memory, the two user stacks, the scratch page used while
//! privatizing copy-on-write pages, and the block cache window.
//!
//! ```text
//!   utop, uxstacktop ->  +------------------------------+
//!                        |   user exception stack       |  one page, never COW
//!                        +------------------------------+
//!                        |   empty guard page           |
//!   ustacktop       ->   +------------------------------+
//!                        |   normal user stack          |
//!                        +------------------------------+
//!                        :                              :
//!   diskmap+disksize ->  +------------------------------+
//!                        |   block cache window         |  one page per block
//!   diskmap         ->   +------------------------------+
//!                        :                              :
//!                        |   pftemp scratch page        |
//!                        :                              :
//!   0               ->   +------------------------------+
//! ```

use static_assertions::const_assert;

use crate::addr::{PAGE_SIZE, PT_SIZE, VirtAddr};

/// Default top of user-accessible memory.
pub const UTOP: usize = 0xEEC0_0000;
/// Default top of the one-page user exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Default top of the normal user stack (one guard page below the exception stack).
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Default start of user program text; the upcall trampoline lives here.
pub const UTEXT: usize = 2 * PT_SIZE;
/// Default scratch region used by user-level paging code.
pub const UTEMP: usize = PT_SIZE;
/// Default scratch page used while privatizing copy-on-write pages.
pub const PFTEMP: usize = UTEMP + PT_SIZE - PAGE_SIZE;
/// Default start of the block cache window.
pub const DISKMAP: usize = 0x1000_0000;
/// Default size of the block cache window (3GB).
pub const DISKSIZE: usize = 0xC000_0000;

const_assert!(DISKMAP + DISKSIZE <= UTOP);
const_assert!(PFTEMP < DISKMAP);
const_assert!(USTACKTOP % PAGE_SIZE == 0);
const_assert!(DISKMAP % PT_SIZE == 0);

/// Memory layout configuration for one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Maximum user address (exclusive)
    pub utop: usize,

    /// Top of the user exception stack
    pub uxstacktop: usize,

    /// Top of the normal user stack
    pub ustacktop: usize,

    /// Scratch page for copy-on-write privatization
    pub pftemp: usize,

    /// Block cache window base
    pub diskmap: usize,

    /// Block cache window size (bytes)
    pub disksize: usize,

    /// Entry point the kernel transfers to on a user page fault
    pub upcall_entry: usize,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            utop: UTOP,
            uxstacktop: UXSTACKTOP,
            ustacktop: USTACKTOP,
            pftemp: PFTEMP,
            diskmap: DISKMAP,
            disksize: DISKSIZE,
            upcall_entry: UTEXT,
        }
    }
}

impl MemoryLayout {
    /// Replace the block cache window.
    pub fn with_disk_window(mut self, diskmap: usize, disksize: usize) -> Self {
        self.diskmap = diskmap;
        self.disksize = disksize;
        self
    }

    /// Replace the scratch page address.
    pub fn with_pftemp(mut self, pftemp: usize) -> Self {
        self.pftemp = pftemp;
        self
    }

    /// Page holding the user exception stack.
    #[inline]
    pub fn exception_stack(&self) -> VirtAddr {
        VirtAddr::new(self.uxstacktop - PAGE_SIZE)
    }

    /// Topmost page of the normal user stack.
    #[inline]
    pub fn user_stack(&self) -> VirtAddr {
        VirtAddr::new(self.ustacktop - PAGE_SIZE)
    }

    /// Scratch page for copy-on-write privatization.
    #[inline]
    pub fn pftemp(&self) -> VirtAddr {
        VirtAddr::new(self.pftemp)
    }

    /// Kernel upcall entry point.
    #[inline]
    pub fn upcall(&self) -> crate::kernel::Upcall {
        crate::kernel::Upcall(VirtAddr::new(self.upcall_entry))
    }

    /// Check if an address is in user space
    #[inline]
    pub fn is_user_address(&self, addr: VirtAddr) -> bool {
        addr.0 < self.utop
    }

    /// Check if an address lies inside the block cache window
    #[inline]
    pub fn in_disk_window(&self, addr: VirtAddr) -> bool {
        addr.0 >= self.diskmap && addr.0 < self.diskmap + self.disksize
    }

    /// Verify that the layout is usable (aligned, inside user space, no overlaps)
    pub fn verify(&self) -> Result<(), &'static str> {
        let aligned = [
            self.utop,
            self.uxstacktop,
            self.ustacktop,
            self.pftemp,
            self.diskmap,
            self.disksize,
        ];
        if aligned.iter().any(|a| a % PAGE_SIZE != 0) {
            return Err("Layout addresses must be page aligned");
        }
        if self.uxstacktop > self.utop {
            return Err("Exception stack lies above user top");
        }
        if self.ustacktop >= self.uxstacktop {
            return Err("User stack overlaps exception stack");
        }
        let window_end = match self.diskmap.checked_add(self.disksize) {
            Some(end) if self.disksize != 0 => end,
            _ => return Err("Block cache window is empty or wraps"),
        };
        if window_end > self.ustacktop.saturating_sub(PAGE_SIZE) {
            return Err("Block cache window overlaps user stack");
        }
        if self.pftemp >= self.diskmap && self.pftemp < window_end {
            return Err("Scratch page lies inside the block cache window");
        }
        Ok(())
    }
}
