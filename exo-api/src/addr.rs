//! Virtual addresses and page arithmetic

use core::fmt;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;
/// Bytes mapped by one page directory entry (one page table of 1024 entries)
pub const PT_SIZE: usize = PAGE_SIZE * 1024;
/// Shift of the page directory index
pub const PDX_SHIFT: usize = 22;

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A virtual address in the address space of one environment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the page number for this virtual address.
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the page directory index covering this address.
    pub const fn pdx(self) -> usize {
        self.0 >> PDX_SHIFT
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down the virtual address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Rounds up the virtual address to the next page boundary.
    pub const fn page_round_up(self) -> Self {
        Self(page_round_up(self.0))
    }

    /// Returns the first address of page number `pn`.
    pub const fn from_page_number(pn: usize) -> Self {
        Self(pn << PAGE_SHIFT)
    }

    /// Adds a byte offset.
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let va = VirtAddr::new(0x1000_0123);
        assert_eq!(va.page_round_down(), VirtAddr::new(0x1000_0000));
        assert_eq!(va.page_round_up(), VirtAddr::new(0x1000_1000));
        assert_eq!(va.page_offset(), 0x123);
        assert!(!va.is_page_aligned());
        assert!(VirtAddr::new(0x2000).is_page_aligned());
    }

    #[test]
    fn test_page_and_directory_index() {
        let va = VirtAddr::new(0x0040_3000);
        assert_eq!(va.page_number(), 0x403);
        assert_eq!(va.pdx(), 1);
        assert_eq!(VirtAddr::from_page_number(0x403), va);
    }
}
