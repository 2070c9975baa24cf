//! Page table entry permission bits
//!
//! The bit positions follow the x86 two-level page table format. The three
//! `AVAIL` bits are left to user code; bit 11 marks copy-on-write mappings.

use bitflags::bitflags;

bitflags! {
    /// Flags of a page table entry as seen through the read-only page table view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Page is present and backed by a frame
        const PRESENT = 0x001;
        /// Page is writable
        const WRITABLE = 0x002;
        /// Page is accessible from user mode
        const USER = 0x004;
        /// Set by the MMU on any access
        const ACCESSED = 0x020;
        /// Set by the MMU on a write
        const DIRTY = 0x040;
        /// Bits available to user software
        const AVAIL = 0xE00;
        /// Copy-on-write marker (one of the AVAIL bits)
        const COW = 0x800;
    }
}

impl PteFlags {
    /// Bits that may be passed to the mapping syscalls. Accessed and dirty are
    /// hardware-maintained and always start cleared on a fresh mapping.
    pub const SYSCALL: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::AVAIL.bits()
            | PteFlags::PRESENT.bits()
            | PteFlags::WRITABLE.bits()
            | PteFlags::USER.bits(),
    );

    /// Present, user and writable.
    pub const PUW: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::PRESENT.bits() | PteFlags::USER.bits() | PteFlags::WRITABLE.bits(),
    );

    /// Present and user, read-only.
    pub const PU: PteFlags =
        PteFlags::from_bits_truncate(PteFlags::PRESENT.bits() | PteFlags::USER.bits());

    /// Present, user and copy-on-write.
    pub const PU_COW: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::PRESENT.bits() | PteFlags::USER.bits() | PteFlags::COW.bits(),
    );

    /// Present bit set
    #[inline]
    pub fn is_present(self) -> bool {
        self.contains(PteFlags::PRESENT)
    }

    /// Writable bit set
    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(PteFlags::WRITABLE)
    }

    /// Set by the MMU on a store
    #[inline]
    pub fn is_dirty(self) -> bool {
        self.contains(PteFlags::DIRTY)
    }

    /// Set by the MMU on any access
    #[inline]
    pub fn is_accessed(self) -> bool {
        self.contains(PteFlags::ACCESSED)
    }

    /// Marked copy-on-write
    #[inline]
    pub fn is_cow(self) -> bool {
        self.contains(PteFlags::COW)
    }

    /// Strips the hardware-maintained bits, leaving what a remap may carry.
    #[inline]
    pub fn syscall_perm(self) -> PteFlags {
        self & PteFlags::SYSCALL
    }
}
