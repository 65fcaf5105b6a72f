//! Guest address newtypes

use serde::{Deserialize, Serialize};

/// Size of a guest page
pub const PAGE_SIZE: u64 = 0x1000;

/// A guest physical address
#[repr(transparent)]
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Return a [`PhysAddr`] `offset` byte away from `self`
    ///
    /// Example:
    ///
    /// ```
    /// # use snaptrace::PhysAddr;
    /// let page = PhysAddr(0xdead_0000);
    /// let entry = page.offset(0x1234);
    /// assert!(entry.0 == 0xdead_1234);
    /// ```
    #[must_use]
    pub const fn offset(self, offset: u64) -> PhysAddr {
        PhysAddr(self.0 + offset)
    }

    /// Return the page that contains this [`PhysAddr`]
    ///
    /// Example:
    ///
    /// ```
    /// # use snaptrace::PhysAddr;
    /// let addr = PhysAddr(0xdead_1234);
    /// let page = addr.page();
    /// assert!(page.0 == 0xdead_1000);
    /// ```
    #[must_use]
    pub const fn page(self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// Offset of this address inside its page
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl std::ops::Deref for PhysAddr {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A guest virtual address
#[repr(transparent)]
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Hash,
)]
pub struct VirtAddr(pub u64);

impl From<u64> for VirtAddr {
    fn from(val: u64) -> VirtAddr {
        VirtAddr(val)
    }
}

impl VirtAddr {
    /// Return a [`VirtAddr`] `offset` byte away from `self`
    #[must_use]
    pub const fn offset(self, offset: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(offset))
    }

    /// Get the 4 page table indexes that this [`VirtAddr`] corresponds maps with when
    /// translating via a 4-level page table
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_indexes(self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1ff) as usize,
            ((self.0 >> 30) & 0x1ff) as usize,
            ((self.0 >> 21) & 0x1ff) as usize,
            ((self.0 >> 12) & 0x1ff) as usize,
        ]
    }

    /// Get the 2 page table indexes used by legacy 32-bit paging
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn legacy_table_indexes(self) -> [usize; 2] {
        [((self.0 >> 22) & 0x3ff) as usize, ((self.0 >> 12) & 0x3ff) as usize]
    }

    /// Return the page that contains this [`VirtAddr`]
    #[must_use]
    pub const fn page(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }
}

impl std::ops::Deref for VirtAddr {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::str::FromStr for VirtAddr {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_u64(s).map(VirtAddr)
    }
}

/// A guest page table root
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// Physical address of the top level page table
    #[must_use]
    pub const fn table(self) -> PhysAddr {
        PhysAddr(self.0 & 0x000f_ffff_ffff_f000)
    }
}

impl std::ops::Deref for Cr3 {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Parse a `0x` prefixed hex number, falling back to decimal
///
/// # Errors
///
/// * The string is neither valid hex (with `0x`) nor decimal
pub fn parse_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.trim().replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    }
}
