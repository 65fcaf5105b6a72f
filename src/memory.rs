//! Sparse, page granular guest physical memory
//!
//! All guest physical memory lives in one anonymous host mapping reserved for the whole
//! guest physical address space. Only explicitly allocated regions are considered mapped:
//! the hypervisor backend registers exactly those ranges with KVM so every other guest
//! physical access exits to the host.

use anyhow::{ensure, Result};
use iced_x86::{Decoder, DecoderOptions, FastFormatter, Instruction};

use crate::addrs::{Cr3, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::page_table::{Entry, PageSize, PagingMode, Translation};

use std::collections::{BTreeMap, BTreeSet};

/// Custom errors [`PhysicalMemory`] can throw
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Failed to reserve the host mapping backing guest memory
    #[error("Failed to mmap {0:#x} bytes of guest memory: {1}")]
    Mmap(u64, nix::errno::Errno),

    /// The access is not contained in a single allocated region
    #[error("OutOfBounds_{0:#x}_{1:#x}")]
    OutOfBounds(u64, u64),

    /// The requested region overlaps an already allocated region
    #[error("Region {0:#x}..{1:#x} overlaps an allocated region")]
    Overlap(u64, u64),

    /// The requested region is outside of the reserved guest memory
    #[error("Region {0:#x}..{1:#x} exceeds the guest memory size {2:#x}")]
    ExceedsGuestMemory(u64, u64, u64),

    /// Zero sized allocation
    #[error("Attempted to allocate zero bytes at {0:#x}")]
    EmptyAllocation(u64),

    /// A page supplied for a fault was not exactly one page long
    #[error("Page for {0:#x} is {1:#x} bytes, expected 0x1000")]
    InvalidPageSize(u64, usize),

    /// A page table page needed for a translation is not mapped
    #[error("MissingPage_{0:#x}")]
    MissingPage(u64),

    /// A page table entry needed for a translation is not present
    #[error("{0} entry for {1:#x} is not present")]
    NotPresent(&'static str, u64),

    /// No valid instruction could be decoded
    #[error("InvalidInstruction_{0:#x}")]
    InvalidInstruction(u64),
}

/// The page table root and paging mode used to translate guest virtual addresses
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    /// Page table root
    pub cr3: Cr3,

    /// Paging mode of the guest
    pub mode: PagingMode,
}

impl AddressSpace {
    /// An [`AddressSpace`] where virtual addresses are physical addresses
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            cr3: Cr3(0),
            mode: PagingMode::Disabled,
        }
    }
}

/// An allocated guest physical region
#[derive(Debug)]
struct Region {
    /// Size of the region in bytes, page aligned
    size: u64,

    /// Contents of the region at the last checkpoint
    baseline: Vec<u8>,
}

/// Sparse guest physical memory with dirty page tracking
pub struct PhysicalMemory {
    /// Address of the host mapping
    memory_backing: u64,

    /// Size of the host mapping
    size: u64,

    /// Allocated regions keyed by their base address
    regions: BTreeMap<PhysAddr, Region>,

    /// Pages written since the last checkpoint or restore
    dirty_pages: BTreeSet<PhysAddr>,
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.memory_backing as *mut libc::c_void, self.size as usize);
        }
    }
}

impl std::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("memory_backing", &format_args!("{:#x}", self.memory_backing))
            .field("size", &format_args!("{:#x}", self.size))
            .field("regions", &self.regions.len())
            .field("dirty_pages", &self.dirty_pages.len())
            .finish()
    }
}

impl PhysicalMemory {
    /// Reserve `size` bytes of guest physical address space. Nothing is mapped until
    /// [`PhysicalMemory::allocate`] is called.
    ///
    /// # Errors
    ///
    /// * `mmap` of the host backing failed
    pub fn new(size: u64) -> Result<Self> {
        let size = round_up(size);
        ensure!(size > 0, Error::EmptyAllocation(0));

        let mem_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                usize::try_from(size)?,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if mem_ptr == libc::MAP_FAILED {
            return Err(Error::Mmap(size, nix::errno::Errno::last()).into());
        }

        log::debug!(
            "Reserved guest memory backing: {:#x}..{:#x}",
            mem_ptr as u64,
            mem_ptr as u64 + size
        );

        Ok(Self {
            memory_backing: mem_ptr as u64,
            size,
            regions: BTreeMap::new(),
            dirty_pages: BTreeSet::new(),
        })
    }

    /// Get the underlying backing address
    #[must_use]
    pub fn backing(&self) -> u64 {
        self.memory_backing
    }

    /// Get the size of the reserved guest physical address space
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host address of the given guest physical address
    #[must_use]
    pub fn host_address(&self, phys_addr: PhysAddr) -> u64 {
        self.memory_backing + phys_addr.0
    }

    /// Iterate over the `(base, size)` of every allocated region
    pub fn regions(&self) -> impl Iterator<Item = (PhysAddr, u64)> + '_ {
        self.regions.iter().map(|(base, region)| (*base, region.size))
    }

    /// Allocate the region `[base, base + size)`, rounded out to page boundaries.
    /// Returns the page aligned base of the new region.
    ///
    /// # Errors
    ///
    /// * `size` is zero
    /// * The region is outside of the reserved guest memory
    /// * The region overlaps an existing region
    pub fn allocate(&mut self, base: PhysAddr, size: u64) -> Result<PhysAddr> {
        ensure!(size > 0, Error::EmptyAllocation(base.0));

        let start = base.page();
        let end = base
            .0
            .checked_add(size)
            .map(round_up)
            .ok_or(Error::ExceedsGuestMemory(base.0, u64::MAX, self.size))?;

        ensure!(
            end <= self.size,
            Error::ExceedsGuestMemory(start.0, end, self.size)
        );

        // The closest region starting before `end` is the only candidate for overlap
        if let Some((other, region)) = self.regions.range(..PhysAddr(end)).next_back() {
            ensure!(
                other.0 + region.size <= start.0,
                Error::Overlap(start.0, end)
            );
        }

        let size = end - start.0;

        // Capture the current contents as the baseline of the region
        let mut baseline = vec![0_u8; usize::try_from(size)?];
        self.copy_out(start, &mut baseline);

        self.regions.insert(start, Region { size, baseline });

        log::debug!("Allocated guest physical region {:#x}..{end:#x}", start.0);

        Ok(start)
    }

    /// Returns `true` if `phys_addr` is inside an allocated region
    #[must_use]
    pub fn is_mapped(&self, phys_addr: PhysAddr) -> bool {
        self.containing_region(phys_addr, 1).is_some()
    }

    /// Get the base of the region fully containing `[phys_addr, phys_addr + len)`
    fn containing_region(&self, phys_addr: PhysAddr, len: u64) -> Option<PhysAddr> {
        let end = phys_addr.0.checked_add(len)?;
        let (base, region) = self.regions.range(..=phys_addr).next_back()?;

        (end <= base.0 + region.size).then_some(*base)
    }

    /// Read bytes from the [`PhysAddr`] into the given `buf`
    ///
    /// # Errors
    ///
    /// * The range is not fully contained in one allocated region
    pub fn read(&self, phys_addr: PhysAddr, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        ensure!(
            self.containing_region(phys_addr, len).is_some(),
            Error::OutOfBounds(phys_addr.0, len)
        );

        self.copy_out(phys_addr, buf);
        Ok(())
    }

    /// Read `size` bytes from the [`PhysAddr`]
    ///
    /// # Errors
    ///
    /// * The range is not fully contained in one allocated region
    pub fn read_bytes(&self, phys_addr: PhysAddr, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; size];
        self.read(phys_addr, &mut buf)?;
        Ok(buf)
    }

    /// Read a `T` from the given guest [`PhysAddr`]
    ///
    /// # Errors
    ///
    /// * The range is not fully contained in one allocated region
    pub fn read_phys<T: Copy>(&self, phys_addr: PhysAddr) -> Result<T> {
        let len = std::mem::size_of::<T>() as u64;
        ensure!(
            self.containing_region(phys_addr, len).is_some(),
            Error::OutOfBounds(phys_addr.0, len)
        );

        let memory_addr = self.host_address(phys_addr);

        // SAFETY: the range was checked to be inside an allocated region of the backing
        Ok(unsafe { std::ptr::read_unaligned(memory_addr as *const T) })
    }

    /// Write `bytes` to the [`PhysAddr`], marking every touched page dirty
    ///
    /// # Errors
    ///
    /// * The range is not fully contained in one allocated region
    pub fn write(&mut self, phys_addr: PhysAddr, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        ensure!(
            self.containing_region(phys_addr, len).is_some(),
            Error::OutOfBounds(phys_addr.0, len)
        );

        self.copy_in(phys_addr, bytes);

        let mut page = phys_addr.page();
        while page.0 < phys_addr.0 + len {
            self.dirty_pages.insert(page);
            page = page.offset(PAGE_SIZE);
        }

        Ok(())
    }

    /// Map a page supplied by a snapshot. The page becomes part of the restore baseline
    /// and is not dirty.
    ///
    /// # Errors
    ///
    /// * `data` is not exactly one page
    /// * The page is already mapped or outside of guest memory
    pub fn load_page(&mut self, phys_addr: PhysAddr, data: &[u8]) -> Result<PhysAddr> {
        let page = phys_addr.page();
        ensure!(
            data.len() as u64 == PAGE_SIZE,
            Error::InvalidPageSize(page.0, data.len())
        );

        self.allocate(page, PAGE_SIZE)?;
        self.copy_in(page, data);

        if let Some(region) = self.regions.get_mut(&page) {
            region.baseline.copy_from_slice(data);
        }

        Ok(page)
    }

    /// Mark the page containing `phys_addr` as dirty. Used for writes performed by the
    /// guest behind our back.
    pub fn mark_dirty(&mut self, phys_addr: PhysAddr) {
        if self.is_mapped(phys_addr) {
            self.dirty_pages.insert(phys_addr.page());
        }
    }

    /// Pages written since the last checkpoint or restore
    #[must_use]
    pub fn dirty_pages(&self) -> &BTreeSet<PhysAddr> {
        &self.dirty_pages
    }

    /// Make the current contents of every region the restore baseline
    pub fn checkpoint(&mut self) {
        let memory_backing = self.memory_backing;

        for (base, region) in &mut self.regions {
            // SAFETY: every region lies inside the backing
            let current = unsafe {
                std::slice::from_raw_parts(
                    (memory_backing + base.0) as *const u8,
                    region.baseline.len(),
                )
            };
            region.baseline.copy_from_slice(current);
        }

        self.dirty_pages.clear();
    }

    /// Rewrite every dirty page with its baseline contents. Returns the number of pages
    /// restored.
    pub fn restore(&mut self) -> usize {
        let dirty_pages = std::mem::take(&mut self.dirty_pages);
        let mut restored = 0;

        for page in dirty_pages {
            let Some((base, region)) = self.regions.range(..=page).next_back() else {
                continue;
            };

            let offset = page.0 - base.0;
            if offset >= region.size {
                continue;
            }

            #[allow(clippy::cast_possible_truncation)]
            let offset = offset as usize;
            let clean = &region.baseline[offset..offset + PAGE_SIZE as usize];

            // SAFETY: the page is inside a region which lies inside the backing
            unsafe {
                std::ptr::copy_nonoverlapping(
                    clean.as_ptr(),
                    (self.memory_backing + page.0) as *mut u8,
                    clean.len(),
                );
            }

            restored += 1;
        }

        restored
    }

    /// Copy out of the backing without bounds checks against the regions
    fn copy_out(&self, phys_addr: PhysAddr, buf: &mut [u8]) {
        // SAFETY: callers only pass ranges inside the reserved backing
        let bytes = unsafe {
            std::slice::from_raw_parts(self.host_address(phys_addr) as *const u8, buf.len())
        };
        buf.copy_from_slice(bytes);
    }

    /// Copy into the backing without bounds checks against the regions
    fn copy_in(&mut self, phys_addr: PhysAddr, bytes: &[u8]) {
        // SAFETY: callers only pass ranges inside the reserved backing
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.host_address(phys_addr) as *mut u8,
                bytes.len(),
            );
        }
    }

    /// Read a page table entry of `size` bytes, reporting unmapped table pages
    fn read_entry(&self, entry_addr: PhysAddr, wide: bool) -> Result<Entry, Error> {
        if !self.is_mapped(entry_addr) {
            return Err(Error::MissingPage(entry_addr.page().0));
        }

        let raw = if wide {
            self.read_phys::<u64>(entry_addr)
        } else {
            self.read_phys::<u32>(entry_addr).map(u64::from)
        };

        raw.map(Entry).map_err(|_| Error::MissingPage(entry_addr.page().0))
    }

    /// Translate `virt_addr` by walking the guest page tables in `space`
    ///
    /// # Errors
    ///
    /// * [`Error::MissingPage`] if a page table page is not mapped
    /// * [`Error::NotPresent`] if an entry along the walk is not present
    pub fn translate(&self, virt_addr: VirtAddr, space: AddressSpace) -> Result<Translation, Error> {
        match space.mode {
            PagingMode::Disabled => Ok(Translation::new(
                virt_addr,
                PhysAddr(virt_addr.0),
                PageSize::Size4K,
                Vec::new(),
            )),
            PagingMode::Long => self.translate_long(virt_addr, space.cr3),
            PagingMode::Pae => self.translate_pae(virt_addr, space.cr3),
            PagingMode::Legacy => self.translate_legacy(virt_addr, space.cr3),
        }
    }

    /// 4-level walk
    fn translate_long(&self, virt_addr: VirtAddr, cr3: Cr3) -> Result<Translation, Error> {
        /// Names of each level for error reporting
        const LEVELS: [&str; 4] = ["PML4E", "PDPTE", "PDE", "PTE"];

        let mut table = cr3.table();
        let mut entries = Vec::with_capacity(4);

        for (level, index) in virt_addr.table_indexes().iter().enumerate() {
            let entry_addr = table.offset(*index as u64 * 8);
            let entry = self.read_entry(entry_addr, true)?;
            entries.push((entry_addr, entry));

            let flags = entry.flags();
            if !flags.present() {
                return Err(Error::NotPresent(LEVELS[level], virt_addr.0));
            }

            let page_size = match level {
                1 if flags.page_size() => Some(PageSize::Size1G),
                2 if flags.page_size() => Some(PageSize::Size2M),
                3 => Some(PageSize::Size4K),
                _ => None,
            };

            if let Some(page_size) = page_size {
                let frame = if page_size == PageSize::Size4K {
                    entry.address()
                } else {
                    entry.large_page_address(page_size)
                };

                let offset = virt_addr.0 & (page_size.bytes() - 1);
                return Ok(Translation::new(
                    virt_addr,
                    frame.offset(offset),
                    page_size,
                    entries,
                ));
            }

            table = entry.address();
        }

        Err(Error::NotPresent(LEVELS[3], virt_addr.0))
    }

    /// 3-level PAE walk
    fn translate_pae(&self, virt_addr: VirtAddr, cr3: Cr3) -> Result<Translation, Error> {
        let mut entries = Vec::with_capacity(3);

        let pdpt = PhysAddr(cr3.0 & 0xffff_ffe0);
        let entry_addr = pdpt.offset(((virt_addr.0 >> 30) & 0x3) * 8);
        let pdpte = self.read_entry(entry_addr, true)?;
        entries.push((entry_addr, pdpte));
        if !pdpte.flags().present() {
            return Err(Error::NotPresent("PDPTE", virt_addr.0));
        }

        let entry_addr = pdpte.address().offset(((virt_addr.0 >> 21) & 0x1ff) * 8);
        let pde = self.read_entry(entry_addr, true)?;
        entries.push((entry_addr, pde));
        if !pde.flags().present() {
            return Err(Error::NotPresent("PDE", virt_addr.0));
        }

        if pde.flags().page_size() {
            let offset = virt_addr.0 & (PageSize::Size2M.bytes() - 1);
            return Ok(Translation::new(
                virt_addr,
                pde.large_page_address(PageSize::Size2M).offset(offset),
                PageSize::Size2M,
                entries,
            ));
        }

        let entry_addr = pde.address().offset(((virt_addr.0 >> 12) & 0x1ff) * 8);
        let pte = self.read_entry(entry_addr, true)?;
        entries.push((entry_addr, pte));
        if !pte.flags().present() {
            return Err(Error::NotPresent("PTE", virt_addr.0));
        }

        Ok(Translation::new(
            virt_addr,
            pte.address().offset(virt_addr.0 & (PAGE_SIZE - 1)),
            PageSize::Size4K,
            entries,
        ))
    }

    /// 2-level 32-bit walk
    fn translate_legacy(&self, virt_addr: VirtAddr, cr3: Cr3) -> Result<Translation, Error> {
        let [pd_index, pt_index] = virt_addr.legacy_table_indexes();
        let mut entries = Vec::with_capacity(2);

        let entry_addr = PhysAddr(cr3.0 & 0xffff_f000).offset(pd_index as u64 * 4);
        let pde = self.read_entry(entry_addr, false)?;
        entries.push((entry_addr, pde));
        if !pde.flags().present() {
            return Err(Error::NotPresent("PDE", virt_addr.0));
        }

        if pde.flags().page_size() {
            let offset = virt_addr.0 & (PageSize::Size4M.bytes() - 1);
            return Ok(Translation::new(
                virt_addr,
                pde.legacy_large_page_address().offset(offset),
                PageSize::Size4M,
                entries,
            ));
        }

        let entry_addr = PhysAddr(pde.0 & 0xffff_f000).offset(pt_index as u64 * 4);
        let pte = self.read_entry(entry_addr, false)?;
        entries.push((entry_addr, pte));
        if !pte.flags().present() {
            return Err(Error::NotPresent("PTE", virt_addr.0));
        }

        Ok(Translation::new(
            virt_addr,
            PhysAddr(pte.0 & 0xffff_f000).offset(virt_addr.0 & (PAGE_SIZE - 1)),
            PageSize::Size4K,
            entries,
        ))
    }

    /// Read `buf.len()` bytes starting at the [`VirtAddr`], translating each page
    ///
    /// # Errors
    ///
    /// * A page along the range does not translate
    /// * A translated page is not mapped
    pub fn read_virtual(
        &self,
        virt_addr: VirtAddr,
        space: AddressSpace,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut offset = 0;

        while offset < buf.len() {
            let curr = virt_addr.offset(offset as u64);
            let phys_addr = self.translate(curr, space)?.phys_addr();

            #[allow(clippy::cast_possible_truncation)]
            let in_page = (PAGE_SIZE - (curr.0 & (PAGE_SIZE - 1))) as usize;
            let len = in_page.min(buf.len() - offset);

            self.read(phys_addr, &mut buf[offset..offset + len])?;
            offset += len;
        }

        Ok(())
    }

    /// Write `bytes` starting at the [`VirtAddr`], translating each page. Written pages are
    /// marked dirty.
    ///
    /// # Errors
    ///
    /// * A page along the range does not translate
    /// * A translated page is not mapped
    pub fn write_virtual(
        &mut self,
        virt_addr: VirtAddr,
        space: AddressSpace,
        bytes: &[u8],
    ) -> Result<()> {
        let mut offset = 0;

        while offset < bytes.len() {
            let curr = virt_addr.offset(offset as u64);
            let phys_addr = self.translate(curr, space)?.phys_addr();

            #[allow(clippy::cast_possible_truncation)]
            let in_page = (PAGE_SIZE - (curr.0 & (PAGE_SIZE - 1))) as usize;
            let len = in_page.min(bytes.len() - offset);

            self.write(phys_addr, &bytes[offset..offset + len])?;
            offset += len;
        }

        Ok(())
    }

    /// Decode the instruction at the given [`VirtAddr`]
    ///
    /// # Errors
    ///
    /// * The first byte of the instruction can't be read
    /// * The bytes do not decode to a valid instruction
    pub fn instruction_at(
        &self,
        virt_addr: VirtAddr,
        space: AddressSpace,
        bitness: u32,
    ) -> Result<Instruction> {
        let mut bytes = [0_u8; 0x10];

        // Only the bytes up to the end of the page are required, the rest may live on a
        // page that isn't mapped yet
        #[allow(clippy::cast_possible_truncation)]
        let first = ((PAGE_SIZE - (virt_addr.0 & (PAGE_SIZE - 1))) as usize).min(bytes.len());
        self.read_virtual(virt_addr, space, &mut bytes[..first])?;
        if first < bytes.len()
            && self
                .read_virtual(virt_addr.offset(first as u64), space, &mut bytes[first..])
                .is_err()
        {
            log::debug!("Instruction at {:#x} straddles an unmapped page", virt_addr.0);
        }

        let mut decoder = Decoder::with_ip(bitness, &bytes, virt_addr.0, DecoderOptions::NONE);
        let instr = decoder.decode();
        ensure!(!instr.is_invalid(), Error::InvalidInstruction(virt_addr.0));

        Ok(instr)
    }

    /// Format the instruction at the given [`VirtAddr`] as `0x<rip>: <instruction>`. The
    /// instruction is `???` if it can't be decoded.
    #[must_use]
    pub fn instruction_string_at(
        &self,
        virt_addr: VirtAddr,
        space: AddressSpace,
        bitness: u32,
    ) -> String {
        let Ok(instr) = self.instruction_at(virt_addr, space, bitness) else {
            return format!("0x{:016X}: ???", virt_addr.0);
        };

        let mut output = String::new();

        let mut formatter = FastFormatter::new();
        formatter.options_mut().set_uppercase_hex(false);
        formatter.options_mut().set_use_hex_prefix(true);
        formatter.options_mut().set_always_show_memory_size(true);
        formatter
            .options_mut()
            .set_space_after_operand_separator(true);
        formatter.options_mut().set_rip_relative_addresses(true);
        formatter.format(&instr, &mut output);

        format!("0x{:016X}: {output}", virt_addr.0)
    }
}

/// Round `val` up to the next page boundary
const fn round_up(val: u64) -> u64 {
    (val + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> PhysicalMemory {
        PhysicalMemory::new(16 * 1024 * 1024).unwrap()
    }

    fn mem_error(err: &anyhow::Error) -> &Error {
        err.downcast_ref::<Error>().expect("memory error")
    }

    #[test]
    fn allocate_rounds_to_pages() {
        let mut memory = memory();
        let base = memory.allocate(PhysAddr(0x1234), 0x10).unwrap();
        assert_eq!(base, PhysAddr(0x1000));
        assert_eq!(memory.regions().collect::<Vec<_>>(), [(PhysAddr(0x1000), 0x1000)]);

        let base = memory.allocate(PhysAddr(0x2ff0), 0x20).unwrap();
        assert_eq!(base, PhysAddr(0x2000));
        assert_eq!(
            memory.regions().last(),
            Some((PhysAddr(0x2000), 0x2000))
        );
    }

    #[test]
    fn overlapping_allocations_fail() {
        let mut memory = memory();
        memory.allocate(PhysAddr(0x4000), 0x2000).unwrap();

        for (base, size) in [(0x4000, 0x1000), (0x3000, 0x2000), (0x5fff, 1), (0x0, 0x10000)] {
            let err = memory.allocate(PhysAddr(base), size).unwrap_err();
            assert!(matches!(mem_error(&err), Error::Overlap(..)), "{base:#x}");
        }

        // Adjacent regions are fine
        memory.allocate(PhysAddr(0x3000), 0x1000).unwrap();
        memory.allocate(PhysAddr(0x6000), 0x1000).unwrap();
        assert_eq!(memory.regions().count(), 3);

        let err = memory.allocate(PhysAddr(0x7000), 0).unwrap_err();
        assert_eq!(mem_error(&err), &Error::EmptyAllocation(0x7000));

        let err = memory.allocate(PhysAddr(0x100_0000), 0x1000).unwrap_err();
        assert!(matches!(mem_error(&err), Error::ExceedsGuestMemory(..)));
    }

    #[test]
    fn read_after_write() {
        let mut memory = memory();
        memory.allocate(PhysAddr(0x1000), 0x1000).unwrap();

        memory.write(PhysAddr(0x1000), b"\x01\x02\x03\x04").unwrap();
        assert_eq!(memory.read_bytes(PhysAddr(0x1000), 4).unwrap(), [1, 2, 3, 4]);

        memory.write(PhysAddr(0x1400), b"\x05\x06\x07\x08").unwrap();
        assert_eq!(memory.read_bytes(PhysAddr(0x1400), 4).unwrap(), [5, 6, 7, 8]);
        assert_eq!(memory.read_phys::<u32>(PhysAddr(0x1400)).unwrap(), 0x0807_0605);
    }

    #[test]
    fn unmapped_accesses_fail() {
        let mut memory = memory();

        let err = memory.read_bytes(PhysAddr(0x1000), 4).unwrap_err();
        assert_eq!(mem_error(&err), &Error::OutOfBounds(0x1000, 4));
        assert!(memory.write(PhysAddr(0x1000), &[0; 4]).is_err());

        // Crossing from one region into unmapped memory also fails
        memory.allocate(PhysAddr(0x1000), 0x1000).unwrap();
        assert!(memory.read_bytes(PhysAddr(0x1ffe), 4).is_err());
        assert!(memory.write(PhysAddr(0x1ffe), &[0; 4]).is_err());

        // As does crossing into an adjacent but distinct region
        memory.allocate(PhysAddr(0x2000), 0x1000).unwrap();
        assert!(memory.read_bytes(PhysAddr(0x1ffe), 4).is_err());
    }

    #[test]
    fn restore_rewrites_dirty_pages() {
        let mut memory = memory();
        memory.allocate(PhysAddr(0x1000), 0x3000).unwrap();
        memory.write(PhysAddr(0x1000), b"base").unwrap();
        memory.checkpoint();
        assert!(memory.dirty_pages().is_empty());

        memory.write(PhysAddr(0x1000), b"AAAA").unwrap();
        memory.write(PhysAddr(0x2ffe), b"BBBB").unwrap();
        assert_eq!(memory.dirty_pages().len(), 3);

        assert_eq!(memory.restore(), 3);
        assert_eq!(memory.read_bytes(PhysAddr(0x1000), 4).unwrap(), b"base");
        assert_eq!(memory.read_bytes(PhysAddr(0x2ffe), 4).unwrap(), [0; 4]);

        // Nothing was written since, nothing to restore
        assert_eq!(memory.restore(), 0);
    }

    #[test]
    fn loaded_pages_are_baseline() {
        let mut memory = memory();
        let page = vec![0x41_u8; PAGE_SIZE as usize];

        assert_eq!(memory.load_page(PhysAddr(0x5123), &page).unwrap(), PhysAddr(0x5000));
        assert!(memory.dirty_pages().is_empty());

        memory.write(PhysAddr(0x5010), b"zz").unwrap();
        assert_eq!(memory.restore(), 1);
        assert_eq!(memory.read_bytes(PhysAddr(0x5010), 2).unwrap(), b"AA");

        let err = memory.load_page(PhysAddr(0x6000), &page[..10]).unwrap_err();
        assert_eq!(mem_error(&err), &Error::InvalidPageSize(0x6000, 10));
        assert!(memory.load_page(PhysAddr(0x5000), &page).is_err());
    }

    /// Build a 4-level mapping of `virt` to `phys` with tables at 0x10000..
    fn map_long(memory: &mut PhysicalMemory, virt: u64, phys: u64) -> Cr3 {
        let tables = [0x10000_u64, 0x11000, 0x12000, 0x13000];
        for table in tables {
            memory.allocate(PhysAddr(table), 0x1000).unwrap();
        }

        let indexes = VirtAddr(virt).table_indexes();
        for level in 0..3 {
            let entry = tables[level + 1] | 0x3;
            memory
                .write(
                    PhysAddr(tables[level] + indexes[level] as u64 * 8),
                    &entry.to_le_bytes(),
                )
                .unwrap();
        }
        memory
            .write(
                PhysAddr(tables[3] + indexes[3] as u64 * 8),
                &(phys | 0x3).to_le_bytes(),
            )
            .unwrap();

        Cr3(tables[0])
    }

    #[test]
    fn translate_long_mode() {
        let mut memory = memory();
        let cr3 = map_long(&mut memory, 0xffff_8000_0040_2000, 0x20000);
        let space = AddressSpace {
            cr3,
            mode: PagingMode::Long,
        };

        let translation = memory
            .translate(VirtAddr(0xffff_8000_0040_2123), space)
            .unwrap();
        assert_eq!(translation.phys_addr(), PhysAddr(0x20123));
        assert_eq!(translation.page_size(), PageSize::Size4K);
        assert_eq!(translation.entries().len(), 4);

        // Different PML4 index lands on an empty entry
        let err = memory
            .translate(VirtAddr(0x0000_7fff_0000_0000), space)
            .unwrap_err();
        assert_eq!(err, Error::NotPresent("PML4E", 0x0000_7fff_0000_0000));

        // Virtual accesses require the final page to be mapped
        let mut buf = [0_u8; 4];
        assert!(memory
            .read_virtual(VirtAddr(0xffff_8000_0040_2000), space, &mut buf)
            .is_err());
        memory.allocate(PhysAddr(0x20000), 0x1000).unwrap();
        memory
            .write_virtual(VirtAddr(0xffff_8000_0040_2ffe), space, b"hi")
            .unwrap();
        assert_eq!(memory.read_bytes(PhysAddr(0x20ffe), 2).unwrap(), b"hi");
        assert!(memory.dirty_pages().contains(&PhysAddr(0x20000)));
    }

    #[test]
    fn translate_reports_missing_tables() {
        let mut memory = memory();
        memory.allocate(PhysAddr(0x10000), 0x1000).unwrap();
        memory
            .write(PhysAddr(0x10000), &(0x55000_u64 | 0x3).to_le_bytes())
            .unwrap();

        let space = AddressSpace {
            cr3: Cr3(0x10000),
            mode: PagingMode::Long,
        };
        let err = memory.translate(VirtAddr(0x1000), space).unwrap_err();
        assert_eq!(err, Error::MissingPage(0x55000));

        let space = AddressSpace {
            cr3: Cr3(0x90000),
            mode: PagingMode::Long,
        };
        let err = memory.translate(VirtAddr(0x1000), space).unwrap_err();
        assert_eq!(err, Error::MissingPage(0x90000));
    }

    #[test]
    fn translate_large_pages() {
        let mut memory = memory();
        memory.allocate(PhysAddr(0x10000), 0x2000).unwrap();

        // PML4[0] -> PDPT at 0x11000, PDPT[1] is a 1 GiB page, PDPT[0] -> PD
        memory.write(PhysAddr(0x10000), &0x11003_u64.to_le_bytes()).unwrap();
        memory
            .write(PhysAddr(0x11008), &(0x8000_0000_u64 | 0x83).to_le_bytes())
            .unwrap();

        let space = AddressSpace {
            cr3: Cr3(0x10000),
            mode: PagingMode::Long,
        };
        let translation = memory.translate(VirtAddr(0x4012_3456), space).unwrap();
        assert_eq!(translation.page_size(), PageSize::Size1G);
        assert_eq!(translation.phys_addr(), PhysAddr(0x8012_3456));

        // Legacy paging with a 4 MiB page covering 0x0040_0000
        memory.write(PhysAddr(0x10004), &0x0080_0083_u32.to_le_bytes()).unwrap();
        let space = AddressSpace {
            cr3: Cr3(0x10000),
            mode: PagingMode::Legacy,
        };
        let translation = memory.translate(VirtAddr(0x0041_2345), space).unwrap();
        assert_eq!(translation.page_size(), PageSize::Size4M);
        assert_eq!(translation.phys_addr(), PhysAddr(0x0081_2345));
    }

    #[test]
    fn identity_and_instructions() {
        let mut memory = memory();
        memory.allocate(PhysAddr(0x1000), 0x1000).unwrap();

        // mov eax, 0xdeadbeef ; hlt
        memory
            .write(PhysAddr(0x1ff9), &[0xb8, 0xef, 0xbe, 0xad, 0xde, 0xf4])
            .unwrap();

        let space = AddressSpace::identity();
        let text = memory.instruction_string_at(VirtAddr(0x1ff9), space, 64);
        assert_eq!(text, "0x0000000000001FF9: mov eax, 0xdeadbeef");

        let text = memory.instruction_string_at(VirtAddr(0x4000), space, 64);
        assert_eq!(text, "0x0000000000004000: ???");
    }
}
