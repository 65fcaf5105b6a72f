//! Utilities to help walk an Intel page table

use crate::addrs::{PhysAddr, VirtAddr};

/// Various flags corresponding to a page table entry.
#[derive(Debug, Copy, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct EntryFlags {
    /// Set if this entry is present
    present: bool,

    /// Set if this entry is writable
    writable: bool,

    /// Set if this entry can be accessed from Ring 3
    user_permitted: bool,

    /// Set if this entry is for an extended page size (For example, 1GB or 2MB)
    page_size: bool,

    /// Set if execution is disabled for this entry
    execute_disable: bool,
}

impl EntryFlags {
    /// Returns `true` if the `present` bit is set in the [`EntryFlags`]
    pub fn present(&self) -> bool {
        self.present
    }

    /// Returns `true` if the `page_size` bit is set in the [`EntryFlags`]
    pub fn page_size(&self) -> bool {
        self.page_size
    }

    /// Returns `true` if the `writable` bit is set in the [`EntryFlags`]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Returns `true` if the `user_permitted` bit is set in the [`EntryFlags`]
    pub fn user(&self) -> bool {
        self.user_permitted
    }

    /// Returns `true` if the `execute_disable` bit is not set in the [`EntryFlags`]
    pub fn executable(&self) -> bool {
        !self.execute_disable
    }
}

impl From<Entry> for EntryFlags {
    #[inline]
    fn from(entry: Entry) -> Self {
        Self {
            present: entry.0 & (1 << 0) > 0,
            writable: entry.0 & (1 << 1) > 0,
            user_permitted: entry.0 & (1 << 2) > 0,
            page_size: entry.0 & (1 << 7) > 0,
            execute_disable: entry.0 & (1 << 63) > 0,
        }
    }
}

impl From<u64> for Entry {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

/// A page table entry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(pub u64);

impl Entry {
    /// Get the [`EntryFlags`] for this [`Entry`]
    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from(self)
    }

    /// Get the [`PhysAddr`] address for this [`Entry`]
    #[inline]
    pub fn address(self) -> PhysAddr {
        PhysAddr(self.0 & 0x000f_ffff_ffff_f000)
    }

    /// Get the frame address of a large page mapped by this [`Entry`]. Bit 12 is the PAT
    /// bit for large pages and is not part of the address.
    #[inline]
    pub fn large_page_address(self, page_size: PageSize) -> PhysAddr {
        PhysAddr(self.0 & 0x000f_ffff_ffff_f000 & !(page_size.bytes() - 1))
    }

    /// Get the frame address of a legacy 4 MiB page. Bits 13..=20 hold bits 32..=39 of
    /// the physical address.
    #[inline]
    pub fn legacy_large_page_address(self) -> PhysAddr {
        let low = self.0 & 0xffc0_0000;
        let high = (self.0 >> 13) & 0xff;
        PhysAddr(low | (high << 32))
    }
}

/// The size of the memory containing the translated address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageSize {
    /// A page with 1 gigabyte (1GiB)
    Size1G,

    /// A page with 4 megabytes (4MiB), only with legacy 32-bit paging
    Size4M,

    /// A page with 2 megabytes (2MiB)
    Size2M,

    /// A page with 4 kilobytes (4KiB)
    Size4K,
}

impl PageSize {
    /// Number of bytes covered by a page of this size
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size1G => 1024 * 1024 * 1024,
            PageSize::Size4M => 4 * 1024 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4K => 4 * 1024,
        }
    }
}

/// The paging mode the guest is executing with
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PagingMode {
    /// `CR0.PG` is clear, virtual addresses are physical addresses
    Disabled,

    /// 32-bit two level paging (`CR4.PAE` clear)
    Legacy,

    /// 32-bit PAE three level paging
    Pae,

    /// 4-level paging (`EFER.LMA` set)
    Long,
}

impl PagingMode {
    /// `CR0.PG`
    const CR0_PG: u64 = 1 << 31;

    /// `CR4.PAE`
    const CR4_PAE: u64 = 1 << 5;

    /// `EFER.LMA`
    const EFER_LMA: u64 = 1 << 10;

    /// Determine the paging mode from the control registers
    #[must_use]
    pub const fn from_registers(cr0: u64, cr4: u64, efer: u64) -> PagingMode {
        if cr0 & Self::CR0_PG == 0 {
            PagingMode::Disabled
        } else if efer & Self::EFER_LMA != 0 {
            PagingMode::Long
        } else if cr4 & Self::CR4_PAE != 0 {
            PagingMode::Pae
        } else {
            PagingMode::Legacy
        }
    }
}

/// The result of a virtual address translation containing the page size and physical
/// address
#[derive(Debug, Clone)]
pub struct Translation {
    /// The virtual address for this translation
    virt_addr: VirtAddr,

    /// The physical address of the translation
    phys_addr: PhysAddr,

    /// The size of the translation page
    page_size: PageSize,

    /// Physical addresses of each page table entry read during the walk
    entries: Vec<(PhysAddr, Entry)>,
}

impl Translation {
    /// Create a new [`Translation`] for the [`VirtAddr`]
    pub(crate) fn new(
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        page_size: PageSize,
        entries: Vec<(PhysAddr, Entry)>,
    ) -> Self {
        Self {
            virt_addr,
            phys_addr,
            page_size,
            entries,
        }
    }

    /// Get the [`VirtAddr`] that was translated
    pub fn virt_addr(&self) -> VirtAddr {
        self.virt_addr
    }

    /// Get the [`PhysAddr`] for this translation
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// Get the size of the page backing this translation
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Get the intermediate entries (and the physical address they were read from)
    pub fn entries(&self) -> &[(PhysAddr, Entry)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_flags() {
        let entry = Entry(0x8000_0000_0000_3087);
        let flags = entry.flags();
        assert!(flags.present());
        assert!(flags.writable());
        assert!(flags.user());
        assert!(flags.page_size());
        assert!(!flags.executable());
        assert_eq!(entry.address(), PhysAddr(0x3000));
    }

    #[test]
    fn large_page_addresses() {
        let entry = Entry(0x0000_0000_4020_1083);
        assert_eq!(entry.large_page_address(PageSize::Size2M), PhysAddr(0x4020_0000));
        assert_eq!(entry.large_page_address(PageSize::Size1G), PhysAddr(0x4000_0000));

        // 4 MiB page at 0x1_0040_0000
        let legacy = Entry(0x0040_0000 | (1 << 13) | 0x83);
        assert_eq!(legacy.legacy_large_page_address(), PhysAddr(0x1_0040_0000));
    }

    #[test]
    fn paging_modes() {
        assert_eq!(PagingMode::from_registers(0x11, 0, 0), PagingMode::Disabled);
        assert_eq!(
            PagingMode::from_registers(0x8000_0011, 0, 0),
            PagingMode::Legacy
        );
        assert_eq!(
            PagingMode::from_registers(0x8000_0011, 0x20, 0),
            PagingMode::Pae
        );
        assert_eq!(
            PagingMode::from_registers(0x8005_0033, 0x6f8, 0xd01),
            PagingMode::Long
        );
    }
}
