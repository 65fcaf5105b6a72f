//! The [`Emulator`]: register and memory access by name over a [`Partition`] plus the bare
//! [`Emulator::run`] primitive

use anyhow::Result;

use crate::addrs::PhysAddr;
use crate::exit::ExitRecord;
use crate::partition::{Partition, DEFAULT_KICK_INTERVAL, DEFAULT_MEMORY_SIZE};
use crate::regs::{Register, RegisterState, SegmentRegister, TableRegister};
use crate::vcpu::{KvmProcessor, VirtualProcessor};

/// A [`Partition`] addressed with register names and raw physical addresses
#[derive(Debug)]
pub struct Emulator<P: VirtualProcessor = KvmProcessor> {
    /// The underlying partition
    partition: Partition<P>,
}

impl Emulator<KvmProcessor> {
    /// Create a KVM backed emulator with the default guest memory size
    ///
    /// # Errors
    ///
    /// * KVM is not available or the partition could not be created
    pub fn new() -> Result<Self> {
        Self::with_memory_size(DEFAULT_MEMORY_SIZE)
    }

    /// Create a KVM backed emulator reserving `memory_size` bytes of guest physical
    /// address space
    ///
    /// # Errors
    ///
    /// * KVM is not available or the partition could not be created
    pub fn with_memory_size(memory_size: u64) -> Result<Self> {
        let partition = Partition::create(memory_size, DEFAULT_KICK_INTERVAL)?;
        Ok(Self::from_partition(partition))
    }
}

impl<P: VirtualProcessor> Emulator<P> {
    /// Wrap an existing partition
    pub fn from_partition(partition: Partition<P>) -> Self {
        Self { partition }
    }

    /// The underlying partition
    pub fn partition(&mut self) -> &mut Partition<P> {
        &mut self.partition
    }

    /// Consume the emulator, returning the partition
    pub fn into_partition(self) -> Partition<P> {
        self.partition
    }

    /// Read the register called `name`
    ///
    /// # Errors
    ///
    /// * `name` is not a known register
    pub fn get_reg(&mut self, name: &str) -> Result<u64> {
        let reg: Register = name.parse()?;
        self.partition.get_reg(reg)
    }

    /// Write the register called `name`
    ///
    /// # Errors
    ///
    /// * `name` is not a known register
    /// * The processor rejected the new state
    pub fn set_reg(&mut self, name: &str, value: u64) -> Result<()> {
        let reg: Register = name.parse()?;
        self.partition.set_reg(reg, value)
    }

    /// Set `gdt` or `idt`
    ///
    /// # Errors
    ///
    /// * `name` is not a descriptor table register
    pub fn set_table_reg(&mut self, name: &str, base: u64, limit: u16) -> Result<()> {
        let which: TableRegister = name.parse()?;
        self.partition.set_table_reg(which, base, limit)
    }

    /// Load one of `cs`, `ss`, `ds`, `es`, `fs` or `gs`
    ///
    /// # Errors
    ///
    /// * `name` is not a segment register
    pub fn set_segment_reg(
        &mut self,
        name: &str,
        base: u64,
        limit: u32,
        is_code: bool,
        is_long: bool,
        selector: u16,
    ) -> Result<()> {
        let which: SegmentRegister = name.parse()?;
        self.partition
            .set_segment_reg(which, base, limit, is_code, is_long, selector)
    }

    /// Full register state
    ///
    /// # Errors
    ///
    /// * The processor failed to read its registers
    pub fn state(&mut self) -> Result<RegisterState> {
        self.partition.state()
    }

    /// Replace the full register state
    ///
    /// # Errors
    ///
    /// * The processor rejected the registers
    pub fn set_state(&mut self, state: &RegisterState) -> Result<()> {
        self.partition.set_state(state)
    }

    /// Allocate guest physical memory. Returns the page aligned base.
    ///
    /// # Errors
    ///
    /// * The range overlaps an allocated region or exceeds guest memory
    pub fn allocate_physical_memory(&mut self, base: u64, size: u64) -> Result<u64> {
        Ok(self.partition.allocate(PhysAddr(base), size)?.0)
    }

    /// Read `size` bytes of guest physical memory
    ///
    /// # Errors
    ///
    /// * The range is not inside one allocated region
    pub fn read_physical_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.partition.read_physical(PhysAddr(address), size)
    }

    /// Write guest physical memory
    ///
    /// # Errors
    ///
    /// * The range is not inside one allocated region
    pub fn write_physical_memory(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        self.partition.write_physical(PhysAddr(address), bytes)
    }

    /// Execute the guest until the next exit
    ///
    /// # Errors
    ///
    /// * Host level failure of the processor
    pub fn run(&mut self) -> Result<ExitRecord> {
        self.partition.run()
    }
}
