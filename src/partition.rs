//! A [`Partition`]: one virtual processor and the guest physical memory it executes
//! against

use anyhow::Result;

use crate::addrs::{PhysAddr, PAGE_SIZE};
use crate::exit::ExitRecord;
use crate::memory::PhysicalMemory;
use crate::regs::{Register, RegisterState, SegmentRegister, TableRegister};
use crate::vcpu::{KvmProcessor, VirtualProcessor};

use std::time::Duration;

/// Default size of the guest physical address space: 8 GiB
pub const DEFAULT_MEMORY_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Default period of the timer kicking the guest out of execution
pub const DEFAULT_KICK_INTERVAL: Duration = Duration::from_millis(100);

/// One virtual processor together with the [`PhysicalMemory`] it executes against.
///
/// Lifecycle: create, configure registers and memory, [`Partition::run`] until the
/// caller is done, drop.
#[derive(Debug)]
pub struct Partition<P: VirtualProcessor = KvmProcessor> {
    /// The processor executing guest code
    processor: P,

    /// Guest physical memory
    memory: PhysicalMemory,
}

impl Partition<KvmProcessor> {
    /// Create a KVM backed partition reserving `memory_size` bytes of guest physical
    /// address space
    ///
    /// # Errors
    ///
    /// * KVM is not available
    /// * Reserving the guest memory failed
    pub fn create(memory_size: u64, kick_interval: Duration) -> Result<Self> {
        let memory = PhysicalMemory::new(memory_size)?;
        let processor = KvmProcessor::new(kick_interval)?;
        Ok(Self::with_processor(processor, memory))
    }
}

impl<P: VirtualProcessor> Partition<P> {
    /// Assemble a partition from an existing processor and memory. Regions already
    /// allocated in `memory` must have been mapped into `processor` by the caller.
    pub fn with_processor(processor: P, memory: PhysicalMemory) -> Self {
        Self { processor, memory }
    }

    /// Guest physical memory
    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Guest physical memory. Allocations must go through [`Partition::allocate`] so the
    /// processor sees them.
    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    /// The virtual processor
    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// The virtual processor
    pub fn processor_mut(&mut self) -> &mut P {
        &mut self.processor
    }

    /// Full register state
    ///
    /// # Errors
    ///
    /// * The processor failed to read its registers
    pub fn state(&mut self) -> Result<RegisterState> {
        self.processor.state()
    }

    /// Replace the full register state. Any access the guest left pending at the last
    /// exit is finished first so it can't clobber the new state.
    ///
    /// # Errors
    ///
    /// * Completing the pending access failed
    /// * The processor rejected the registers
    pub fn set_state(&mut self, state: &RegisterState) -> Result<()> {
        self.processor.complete_pending(&mut self.memory)?;
        self.processor.set_state(state)
    }

    /// Read one register
    ///
    /// # Errors
    ///
    /// * The processor failed to read its registers
    pub fn get_reg(&mut self, reg: Register) -> Result<u64> {
        Ok(self.state()?.get(reg))
    }

    /// Write one register
    ///
    /// # Errors
    ///
    /// * Reading or writing the register state failed
    pub fn set_reg(&mut self, reg: Register, val: u64) -> Result<()> {
        let mut state = self.state()?;
        state.set(reg, val);
        self.set_state(&state)
    }

    /// Set the base and limit of the GDT or IDT
    ///
    /// # Errors
    ///
    /// * Reading or writing the register state failed
    pub fn set_table_reg(&mut self, which: TableRegister, base: u64, limit: u16) -> Result<()> {
        let mut state = self.state()?;
        state.set_table(which, base, limit);
        self.set_state(&state)
    }

    /// Load a segment register with consistent access rights
    ///
    /// # Errors
    ///
    /// * Reading or writing the register state failed
    pub fn set_segment_reg(
        &mut self,
        which: SegmentRegister,
        base: u64,
        limit: u32,
        is_code: bool,
        is_long: bool,
        selector: u16,
    ) -> Result<()> {
        let mut state = self.state()?;
        state.set_segment(which, base, limit, is_code, is_long, selector);
        self.set_state(&state)
    }

    /// Allocate `[base, base + size)` and make it accessible to the guest. Returns the page
    /// aligned base.
    ///
    /// # Errors
    ///
    /// * The region overlaps an existing region or exceeds guest memory
    /// * The processor could not map the region
    pub fn allocate(&mut self, base: PhysAddr, size: u64) -> Result<PhysAddr> {
        let start = self.memory.allocate(base, size)?;

        // Mapped size is the rounded size of the new region
        let mapped = self
            .memory
            .regions()
            .find(|(region, _)| *region == start)
            .map_or(size, |(_, size)| size);

        self.processor.map_region(&mut self.memory, start, mapped)?;
        Ok(start)
    }

    /// Map one page supplied by a snapshot. The page becomes part of the restore
    /// baseline.
    ///
    /// # Errors
    ///
    /// * `data` is not one page or the page is already mapped
    /// * The processor could not map the page
    pub fn map_page(&mut self, phys_addr: PhysAddr, data: &[u8]) -> Result<PhysAddr> {
        let page = self.memory.load_page(phys_addr, data)?;
        self.processor.map_region(&mut self.memory, page, PAGE_SIZE)?;
        Ok(page)
    }

    /// Read `size` bytes of guest physical memory
    ///
    /// # Errors
    ///
    /// * The range is not inside one allocated region
    pub fn read_physical(&self, phys_addr: PhysAddr, size: usize) -> Result<Vec<u8>> {
        self.memory.read_bytes(phys_addr, size)
    }

    /// Write guest physical memory
    ///
    /// # Errors
    ///
    /// * The range is not inside one allocated region
    pub fn write_physical(&mut self, phys_addr: PhysAddr, bytes: &[u8]) -> Result<()> {
        self.memory.write(phys_addr, bytes)
    }

    /// Enable or disable single stepping
    ///
    /// # Errors
    ///
    /// * The processor rejected the configuration
    pub fn set_single_step(&mut self, enabled: bool) -> Result<()> {
        self.processor.set_single_step(enabled)
    }

    /// Arm execution breakpoints at the given linear addresses
    ///
    /// # Errors
    ///
    /// * Too many addresses for the processor
    pub fn set_breakpoints(&mut self, addresses: &[u64]) -> Result<()> {
        self.processor.set_breakpoints(addresses)
    }

    /// Execute the guest until the next exit
    ///
    /// # Errors
    ///
    /// * Host level failure of the processor
    pub fn run(&mut self) -> Result<ExitRecord> {
        self.processor.run(&mut self.memory)
    }

    /// Make the current memory contents the baseline for [`Partition::restore`]
    ///
    /// # Errors
    ///
    /// * Collecting the pages written by the guest failed
    pub fn checkpoint(&mut self) -> Result<()> {
        self.processor.complete_pending(&mut self.memory)?;
        self.processor.sync_dirty_pages(&mut self.memory)?;
        self.memory.checkpoint();
        Ok(())
    }

    /// Rewrite every page written since the last checkpoint, by the host or the guest.
    /// Returns the number of pages restored.
    ///
    /// # Errors
    ///
    /// * Collecting the pages written by the guest failed
    pub fn restore(&mut self) -> Result<usize> {
        self.processor.complete_pending(&mut self.memory)?;
        self.processor.sync_dirty_pages(&mut self.memory)?;
        Ok(self.memory.restore())
    }
}
