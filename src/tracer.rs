//! Tracing a snapshot: drives a [`Partition`] exit by exit, supplying missing pages from a
//! [`PageFetcher`] and recording coverage until the trace reaches a terminal [`Status`]

use anyhow::{Context as _, Result};
use iced_x86::{InstructionInfoFactory, OpAccess};
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::addrs::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::exit::{Exception, ExitReason, ExitRecord, MemoryAccessType, OtherExit};
use crate::memory::{self, AddressSpace};
use crate::page_table::PagingMode;
use crate::partition::Partition;
use crate::regs::{Context, RegisterState, Segment};
use crate::snapshot::PageFetcher;
use crate::vcpu::{KvmProcessor, VirtualProcessor};

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Consecutive kicks without progress tolerated when no duration bound is set
const MAX_INTERRUPTIONS: u32 = 10;

/// Exception vectors detected at their guest handlers when the processor does not
/// intercept them. `#DB`, NMI and `#BP` are never delivered to the guest.
const HANDLED_VECTORS: std::ops::Range<u8> = 0..32;

/// Custom errors the tracer can throw
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Unknown coverage mode name
    #[error("Invalid coverage mode: {0}. Expected no, hit or instrs")]
    InvalidCoverageMode(String),
}

/// What a trace records at each instruction boundary
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageMode {
    /// Record nothing. The guest runs freely between breakpoints.
    No,

    /// Record the first execution of every address
    #[default]
    Hit,

    /// Record every executed instruction
    Instrs,
}

impl FromStr for CoverageMode {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "no" => Ok(CoverageMode::No),
            "hit" => Ok(CoverageMode::Hit),
            "instrs" => Ok(CoverageMode::Instrs),
            _ => Err(Error::InvalidCoverageMode(input.to_string())),
        }
    }
}

impl std::fmt::Display for CoverageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoverageMode::No => "no",
            CoverageMode::Hit => "hit",
            CoverageMode::Instrs => "instrs",
        };
        write!(f, "{name}")
    }
}

/// Terminal state of a trace
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The return address or the instruction limit was reached
    Success,

    /// The guest needed a page the snapshot refused or reached an excluded address
    ForbiddenAddress,

    /// The duration bound elapsed
    Timeout,

    /// The guest raised an exception it was not expected to raise
    Crash,

    /// The guest stopped in a way the tracer can't continue from
    Error,
}

impl Status {
    /// Returns `true` for the statuses a fuzzer records as crashes
    #[must_use]
    pub fn is_crash(self) -> bool {
        matches!(self, Status::Crash | Status::ForbiddenAddress)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Parameters of one [`Tracer::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceParams {
    /// What to record at each instruction boundary
    pub coverage: CoverageMode,

    /// Stop with [`Status::Success`] after this many instructions. `0` is unbounded.
    /// A limit single steps the guest even with [`CoverageMode::No`].
    pub limit: u64,

    /// Attach the general purpose registers to each coverage entry
    pub save_context: bool,

    /// Record the disassembly of each executed instruction, single stepping the guest
    /// whatever the coverage mode
    pub save_instructions: bool,

    /// Reaching any of these addresses stops with [`Status::ForbiddenAddress`]
    pub excluded_addresses: IndexMap<String, u64>,

    /// Reaching this address stops with [`Status::Success`]
    pub return_address: u64,

    /// Stop with [`Status::Timeout`] once this much time has elapsed. Zero is unbounded.
    pub max_duration: Duration,
}

/// One recorded instruction boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageEntry {
    /// Address of the instruction
    pub address: u64,

    /// Registers before the instruction executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

/// Outcome of one [`Tracer::run`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResult {
    /// Recorded instruction boundaries
    coverage: Vec<CoverageEntry>,

    /// Every reached address in order of first hit
    unique: IndexSet<u64>,

    /// Disassembly of executed instructions
    instructions: Vec<String>,

    /// How the trace ended
    status: Status,

    /// Wall clock time of the trace
    elapsed: Duration,

    /// Vector of the exception that crashed the guest
    #[serde(default)]
    exception: Option<u8>,
}

impl TraceResult {
    /// An empty result. The status is overwritten when the trace stops.
    fn new() -> Self {
        Self {
            coverage: Vec::new(),
            unique: IndexSet::new(),
            instructions: Vec::new(),
            status: Status::Error,
            elapsed: Duration::ZERO,
            exception: None,
        }
    }

    /// Recorded coverage entries
    #[must_use]
    pub fn coverage(&self) -> &[CoverageEntry] {
        &self.coverage
    }

    /// Unique reached addresses in order of first hit
    #[must_use]
    pub fn unique_addresses(&self) -> &IndexSet<u64> {
        &self.unique
    }

    /// Disassembly of the executed instructions
    #[must_use]
    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    /// How the trace ended
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Wall clock time of the trace
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Vector of the exception behind a [`Status::Crash`], if known
    #[must_use]
    pub fn exception(&self) -> Option<u8> {
        self.exception
    }

    /// Write the result as pretty printed JSON
    ///
    /// # Errors
    ///
    /// * The file can't be written
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("Failed to write trace {path:?}"))?;
        Ok(())
    }

    /// Read a result written by [`TraceResult::save`]
    ///
    /// # Errors
    ///
    /// * The file can't be read or is not a saved trace
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read trace {path:?}"))?;
        serde_json::from_str(&data).with_context(|| format!("Invalid trace file {path:?}"))
    }
}

/// Result of making a virtual address accessible
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Resolution {
    /// Every page was already mapped
    Present,

    /// At least one page was fetched and mapped
    Supplied,

    /// The fetcher declined a page
    Refused,

    /// The guest page tables do not map the address
    NotPresent,
}

impl Resolution {
    /// Combine the resolutions of two addresses of one instruction
    fn merge(self, other: Resolution) -> Resolution {
        match (self, other) {
            (Resolution::Refused, _) | (_, Resolution::Refused) => Resolution::Refused,
            (Resolution::Supplied, _) | (_, Resolution::Supplied) => Resolution::Supplied,
            (Resolution::NotPresent, _) | (_, Resolution::NotPresent) => Resolution::NotPresent,
            _ => Resolution::Present,
        }
    }
}

/// Per run bookkeeping of the exit state machine
struct TraceState<'a> {
    /// Parameters of the run
    params: &'a TraceParams,

    /// Result being built
    result: TraceResult,

    /// The processor stops after every instruction
    stepping: bool,

    /// Executed instructions
    steps: u64,

    /// Guest exception handler entry points and their vector
    handlers: BTreeMap<u64, u8>,

    /// Excluded addresses for quick lookup
    excluded: FxHashSet<u64>,

    /// Consecutive interrupted exits
    interruptions: u32,

    /// Start of the run
    start: Instant,
}

impl TraceState<'_> {
    /// Stop the run with `status`
    fn stop(&mut self, status: Status) -> Option<Status> {
        self.result.status = status;
        Some(status)
    }

    /// Stop the run with [`Status::Crash`] caused by `vector`
    fn crash(&mut self, vector: u8) -> Option<Status> {
        self.result.exception = Some(vector);
        self.stop(Status::Crash)
    }

    /// The duration bound has elapsed
    fn timed_out(&self) -> bool {
        !self.params.max_duration.is_zero() && self.start.elapsed() >= self.params.max_duration
    }
}

/// Drives a [`Partition`] through a snapshot, fetching guest pages on demand
#[derive(Debug)]
pub struct Tracer<F: PageFetcher, P: VirtualProcessor = KvmProcessor> {
    /// The partition executing the snapshot
    partition: Partition<P>,

    /// Source of pages the guest touches
    fetcher: F,

    /// Pages supplied for instruction fetches
    code_pages: u64,

    /// Pages supplied for data accesses and page tables
    data_pages: u64,
}

impl<F: PageFetcher> Tracer<F, KvmProcessor> {
    /// Create a tracer on a fresh KVM partition
    ///
    /// # Errors
    ///
    /// * The KVM partition could not be created
    pub fn create(fetcher: F, memory_size: u64, kick_interval: Duration) -> Result<Self> {
        let partition = Partition::create(memory_size, kick_interval)?;
        Ok(Self::new(partition, fetcher))
    }
}

impl<F: PageFetcher, P: VirtualProcessor> Tracer<F, P> {
    /// Create a tracer over an existing partition
    pub fn new(partition: Partition<P>, fetcher: F) -> Self {
        Self {
            partition,
            fetcher,
            code_pages: 0,
            data_pages: 0,
        }
    }

    /// The traced partition
    pub fn partition(&self) -> &Partition<P> {
        &self.partition
    }

    /// The traced partition
    pub fn partition_mut(&mut self) -> &mut Partition<P> {
        &mut self.partition
    }

    /// Load the register state a trace starts from
    ///
    /// # Errors
    ///
    /// * The processor rejected the registers
    pub fn set_initial_context(&mut self, context: &RegisterState) -> Result<()> {
        self.partition.set_state(context)
    }

    /// Rewrite every page dirtied since the pages were supplied. Returns the number of
    /// restored pages.
    ///
    /// # Errors
    ///
    /// * Collecting the pages written by the guest failed
    pub fn restore_snapshot(&mut self) -> Result<usize> {
        self.partition.restore()
    }

    /// Number of pages supplied for instruction fetches
    pub fn code_pages(&self) -> u64 {
        self.code_pages
    }

    /// Number of pages supplied for data accesses and page tables
    pub fn data_pages(&self) -> u64 {
        self.data_pages
    }

    /// Current page table root
    ///
    /// # Errors
    ///
    /// * The processor failed to read its registers
    pub fn cr3(&mut self) -> Result<u64> {
        Ok(self.partition.state()?.cr3)
    }

    /// Read guest virtual memory in the current address space, fetching missing pages
    ///
    /// # Errors
    ///
    /// * A page is refused by the snapshot or not mapped by the guest
    pub fn read_virtual(&mut self, virt_addr: u64, size: usize) -> Result<Vec<u8>> {
        let space = self.partition.state()?.address_space();
        self.resolve_range(virt_addr, size, space)?;

        let mut buf = vec![0_u8; size];
        self.partition
            .memory()
            .read_virtual(VirtAddr(virt_addr), space, &mut buf)?;
        Ok(buf)
    }

    /// Write guest virtual memory in the current address space, fetching missing pages.
    /// Written pages are reverted by [`Tracer::restore_snapshot`].
    ///
    /// # Errors
    ///
    /// * A page is refused by the snapshot or not mapped by the guest
    pub fn write_virtual(&mut self, virt_addr: u64, bytes: &[u8]) -> Result<()> {
        let space = self.partition.state()?.address_space();
        self.resolve_range(virt_addr, bytes.len(), space)?;

        self.partition
            .memory_mut()
            .write_virtual(VirtAddr(virt_addr), space, bytes)
    }

    /// Make every page of `[virt_addr, virt_addr + size)` available
    fn resolve_range(&mut self, virt_addr: u64, size: usize, space: AddressSpace) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let last = virt_addr.wrapping_add(size as u64 - 1);
        let mut page = VirtAddr(virt_addr).page().0;
        loop {
            let addr = page.max(virt_addr);
            match self.ensure_virtual(addr, space, false)? {
                Resolution::Refused => anyhow::bail!("Snapshot refused the page of {addr:#x}"),
                Resolution::NotPresent => anyhow::bail!("{addr:#x} is not mapped by the guest"),
                Resolution::Present | Resolution::Supplied => {}
            }

            if page >= VirtAddr(last).page().0 {
                break;
            }
            page += PAGE_SIZE;
        }

        Ok(())
    }

    /// Fetch the page containing `gpa` and map it. Returns `false` if the fetcher
    /// declined.
    fn fetch_page(&mut self, gpa: u64, gva: u64, code: bool) -> Result<bool> {
        let Some(data) = self.fetcher.fetch(gpa, gva)? else {
            log::debug!("Snapshot declined page {gpa:#x} (gva {gva:#x})");
            return Ok(false);
        };

        self.partition.map_page(PhysAddr(gpa), &data)?;

        if code {
            self.code_pages += 1;
        } else {
            self.data_pages += 1;
        }

        log::debug!("Mapped {} page {:#x}", if code { "code" } else { "data" }, gpa);

        Ok(true)
    }

    /// Make the page behind `gva` and the page tables leading to it available
    fn ensure_virtual(&mut self, gva: u64, space: AddressSpace, code: bool) -> Result<Resolution> {
        let mut supplied = false;

        loop {
            match self.partition.memory().translate(VirtAddr(gva), space) {
                Ok(translation) => {
                    let phys_addr = translation.phys_addr();
                    if self.partition.memory().is_mapped(phys_addr) {
                        return Ok(if supplied {
                            Resolution::Supplied
                        } else {
                            Resolution::Present
                        });
                    }

                    return Ok(if self.fetch_page(phys_addr.0, gva, code)? {
                        Resolution::Supplied
                    } else {
                        Resolution::Refused
                    });
                }
                Err(memory::Error::MissingPage(table)) => {
                    // Page table pages have no virtual address of their own
                    if !self.fetch_page(table, 0, false)? {
                        return Ok(Resolution::Refused);
                    }
                    supplied = true;
                }
                Err(_) => return Ok(Resolution::NotPresent),
            }
        }
    }

    /// Make the pages the instruction at `rip` touches available: the instruction bytes,
    /// every memory operand and the page tables leading to them
    fn prefetch_instruction(&mut self, state: &RegisterState) -> Result<Resolution> {
        let space = state.address_space();
        let bitness = state.bitness();

        let mut res = self.ensure_virtual(state.rip, space, true)?;
        if matches!(res, Resolution::Refused | Resolution::NotPresent) {
            return Ok(res);
        }

        let Ok(mut instr) =
            self.partition
                .memory()
                .instruction_at(VirtAddr(state.rip), space, bitness)
        else {
            return Ok(res);
        };

        // Instruction straddling into the next page
        let last_byte = state.rip.wrapping_add(instr.len() as u64 - 1);
        if VirtAddr(last_byte).page() != VirtAddr(state.rip).page() {
            res = res.merge(self.ensure_virtual(last_byte, space, true)?);
            if res == Resolution::Refused {
                return Ok(res);
            }

            if let Ok(full) =
                self.partition
                    .memory()
                    .instruction_at(VirtAddr(state.rip), space, bitness)
            {
                instr = full;
            }
        }

        let mut factory = InstructionInfoFactory::new();
        let mut operands = Vec::new();
        for mem in factory.info(&instr).used_memory() {
            if mem.access() == OpAccess::NoMemAccess {
                continue;
            }

            let Some(addr) = mem.virtual_address(0, |reg, _, _| state.iced_reg(reg)) else {
                continue;
            };

            let size = (mem.memory_size().size() as u64).max(1);
            operands.push(addr);
            operands.push(addr.wrapping_add(size - 1));
        }

        for addr in operands {
            res = res.merge(self.ensure_virtual(addr, space, false)?);
            if res == Resolution::Refused {
                break;
            }
        }

        Ok(res)
    }

    /// Read the guest IDT and collect the entry points of the exception handlers
    fn exception_handlers(&mut self, state: &RegisterState) -> Result<BTreeMap<u64, u8>> {
        let mut handlers = BTreeMap::new();

        let long_mode = state.paging_mode() == PagingMode::Long;
        let protected = state.cr0 & 1 != 0;
        if !protected {
            return Ok(handlers);
        }

        let entry_size: u64 = if long_mode { 16 } else { 8 };
        let count = ((u64::from(state.idtl) + 1) / entry_size).min(u64::from(HANDLED_VECTORS.end));
        if count == 0 {
            return Ok(handlers);
        }

        let space = state.address_space();
        if let Err(err) = self.resolve_range(state.idtr, (count * entry_size) as usize, space) {
            log::warn!("Guest IDT unavailable, exceptions are not detected: {err}");
            return Ok(handlers);
        }

        let mut idt = vec![0_u8; (count * entry_size) as usize];
        self.partition
            .memory()
            .read_virtual(VirtAddr(state.idtr), space, &mut idt)?;

        // The page fault handler wins when handlers are shared
        let mut vectors: Vec<u8> = HANDLED_VECTORS.take(count as usize).collect();
        vectors.sort_by_key(|vector| *vector != Exception::PageFault as u8);

        for vector in vectors {
            if matches!(vector, 1..=3) {
                continue;
            }

            let entry = &idt[usize::from(vector) * entry_size as usize..][..entry_size as usize];
            let word = |offset: usize| u64::from(u16::from_le_bytes([entry[offset], entry[offset + 1]]));

            // Present bit of the gate
            if entry[5] & 0x80 == 0 {
                continue;
            }

            let mut handler = word(0) | word(6) << 16;
            if long_mode {
                handler |= u64::from(u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]))
                    << 32;
            }

            handlers.entry(handler).or_insert(vector);
        }

        log::debug!("Detecting {} guest exception handlers", handlers.len());

        Ok(handlers)
    }

    /// Unwind the frame the processor pushed when delivering a page fault so that the
    /// faulting instruction executes again. Returns `false` if the frame can't be read.
    fn unwind_page_fault(&mut self, state: &RegisterState) -> Result<bool> {
        let space = state.address_space();
        let memory = self.partition.memory();
        let mut new_state = state.clone();

        let (rip, cs, rflags, rsp, ss) = if state.cs.long() {
            let mut frame = [0_u8; 48];
            if memory.read_virtual(VirtAddr(state.rsp), space, &mut frame).is_err() {
                return Ok(false);
            }

            let qword = |index: usize| {
                let mut bytes = [0_u8; 8];
                bytes.copy_from_slice(&frame[index * 8..][..8]);
                u64::from_le_bytes(bytes)
            };

            // [error code] [rip] [cs] [rflags] [rsp] [ss]
            (qword(1), qword(2), qword(3), qword(4), Some(qword(5)))
        } else {
            let mut frame = [0_u8; 24];
            if memory.read_virtual(VirtAddr(state.rsp), space, &mut frame).is_err() {
                return Ok(false);
            }

            let dword = |index: usize| {
                let mut bytes = [0_u8; 4];
                bytes.copy_from_slice(&frame[index * 4..][..4]);
                u64::from(u32::from_le_bytes(bytes))
            };

            // [error code] [eip] [cs] [eflags], plus [esp] [ss] on a privilege change
            let cs = dword(2);
            if cs & 3 == u64::from(state.cs.selector & 3) {
                (dword(1), cs, dword(3), state.rsp + 16, None)
            } else {
                (dword(1), cs, dword(3), dword(4), Some(dword(5)))
            }
        };

        new_state.rip = rip;
        new_state.rflags = rflags;
        new_state.rsp = rsp;

        #[allow(clippy::cast_possible_truncation)]
        let cs = cs as u16;
        if cs != state.cs.selector {
            new_state.cs = self.gdt_segment(state, cs)?.unwrap_or(state.cs);
        }

        if let Some(ss) = ss {
            #[allow(clippy::cast_possible_truncation)]
            let ss = ss as u16;
            if ss != state.ss.selector {
                new_state.ss = match self.gdt_segment(state, ss)? {
                    Some(segment) => segment,
                    None => Segment {
                        selector: ss,
                        ..state.ss
                    },
                };
            }
        }

        log::debug!(
            "Unwound page fault for {:#x}, resuming at {:#x}",
            state.cr2,
            new_state.rip
        );

        self.partition.set_state(&new_state)?;
        Ok(true)
    }

    /// Load the GDT descriptor for `selector`. Null selectors and unreadable descriptors
    /// give `None`.
    fn gdt_segment(&self, state: &RegisterState, selector: u16) -> Result<Option<Segment>> {
        let index = u64::from(selector & !7);
        if index == 0 || index + 7 > u64::from(state.gdtl) {
            return Ok(None);
        }

        let mut raw = [0_u8; 8];
        let res = self.partition.memory().read_virtual(
            VirtAddr(state.gdtr + index),
            state.address_space(),
            &mut raw,
        );

        Ok(res
            .ok()
            .map(|_| Segment::from_descriptor(selector, u64::from_le_bytes(raw))))
    }

    /// The guest reached the start of an instruction. Returns the terminal status if the
    /// trace stops here.
    fn on_boundary(&mut self, trace: &mut TraceState, rip: u64) -> Result<Option<Status>> {
        let params = trace.params;

        let needs_state = params.save_context
            || trace.handlers.contains_key(&rip)
            || (trace.stepping
                && (params.save_instructions || !self.partition.processor().reports_page_walk_faults()));

        let state = if needs_state {
            Some(self.partition.state()?)
        } else {
            None
        };

        // Entry of a guest exception handler: the guest faulted
        if let (Some(vector), Some(state)) = (trace.handlers.get(&rip).copied(), &state) {
            if vector != Exception::PageFault as u8 {
                log::debug!("Guest exception {vector} handled at {rip:#x}");
                return Ok(trace.crash(vector));
            }

            match self.ensure_virtual(state.cr2, state.address_space(), false)? {
                Resolution::Supplied if self.unwind_page_fault(state)? => return Ok(None),
                Resolution::Refused => return Ok(trace.stop(Status::ForbiddenAddress)),
                _ => {
                    log::debug!("Guest page fault at {:#x}", state.cr2);
                    return Ok(trace.crash(vector));
                }
            }
        }

        if params.coverage != CoverageMode::No {
            let first_hit = trace.result.unique.insert(rip);
            if first_hit || params.coverage == CoverageMode::Instrs {
                trace.result.coverage.push(CoverageEntry {
                    address: rip,
                    context: state.as_ref().filter(|_| params.save_context).map(Context::from),
                });
            }
        }

        if rip == params.return_address {
            return Ok(trace.stop(Status::Success));
        }

        if trace.excluded.contains(&rip) {
            log::debug!("Reached excluded address {rip:#x}");
            return Ok(trace.stop(Status::ForbiddenAddress));
        }

        if params.limit > 0 && trace.steps >= params.limit {
            return Ok(trace.stop(Status::Success));
        }

        if let Some(state) = state.as_ref().filter(|_| trace.stepping) {
            let prefetch = params.save_instructions
                || !self.partition.processor().reports_page_walk_faults();

            if prefetch && self.prefetch_instruction(state)? == Resolution::Refused {
                return Ok(trace.stop(Status::ForbiddenAddress));
            }

            if params.save_instructions {
                let instr = self.partition.memory().instruction_string_at(
                    VirtAddr(rip),
                    state.address_space(),
                    state.bitness(),
                );
                trace.result.instructions.push(instr);
            }
        }

        Ok(None)
    }

    /// Handle one exit. Returns the terminal status if the trace stops.
    fn handle_exit(&mut self, trace: &mut TraceState, exit: ExitRecord) -> Result<Option<Status>> {
        if !matches!(exit.reason, ExitReason::Other(OtherExit::Interrupted)) {
            trace.interruptions = 0;
        }

        match exit.reason {
            ExitReason::Exception { exception_type: 1 } => {
                let handler_entry = trace.handlers.contains_key(&exit.rip);
                if trace.stepping && !handler_entry {
                    trace.steps += 1;
                }

                self.on_boundary(trace, exit.rip)
            }
            ExitReason::Exception { exception_type } => {
                if exit.rip == trace.params.return_address {
                    return Ok(trace.stop(Status::Success));
                }

                if trace.excluded.contains(&exit.rip) {
                    return Ok(trace.stop(Status::ForbiddenAddress));
                }

                log::debug!("Guest exception {exception_type} at {:#x}", exit.rip);
                Ok(trace.crash(exception_type))
            }
            ExitReason::MemoryAccess { gpa, gva, access } => {
                if self.partition.memory().is_mapped(PhysAddr(gpa)) {
                    log::warn!("Memory access exit on mapped page {gpa:#x}");
                    return Ok(trace.stop(Status::Error));
                }

                if self.fetch_page(gpa, gva, access == MemoryAccessType::Execute)? {
                    Ok(None)
                } else {
                    Ok(trace.stop(Status::ForbiddenAddress))
                }
            }
            ExitReason::Halt => {
                log::debug!("Guest halted at {:#x}", exit.rip);
                Ok(trace.stop(Status::Error))
            }
            ExitReason::Other(OtherExit::Shutdown) => {
                log::debug!("Guest triple faulted at {:#x}", exit.rip);
                Ok(trace.stop(Status::Crash))
            }
            ExitReason::Other(OtherExit::Interrupted) => {
                trace.interruptions += 1;
                if trace.params.max_duration.is_zero() && trace.interruptions > MAX_INTERRUPTIONS {
                    log::debug!("Guest made no progress for {} kicks", trace.interruptions);
                    return Ok(trace.stop(Status::Timeout));
                }

                Ok(None)
            }
            ExitReason::Other(OtherExit::InternalError) => {
                let state = self.partition.state()?;
                match self.prefetch_instruction(&state)? {
                    Resolution::Supplied => Ok(None),
                    Resolution::Refused => Ok(trace.stop(Status::ForbiddenAddress)),
                    Resolution::Present | Resolution::NotPresent => {
                        log::warn!("Unresolvable internal error at {:#x}", exit.rip);
                        Ok(trace.stop(Status::Error))
                    }
                }
            }
            ExitReason::Other(other) => {
                log::warn!("Unhandled exit {other:?} at {:#x}", exit.rip);
                Ok(trace.stop(Status::Error))
            }
        }
    }

    /// Trace from the current register state until a terminal [`Status`]
    ///
    /// Guest behavior never raises: missing pages, exceptions and hangs are reported in
    /// the [`TraceResult`] status.
    ///
    /// # Errors
    ///
    /// * Host level failures of the processor or the page fetcher
    /// * The fetcher supplied a page that is not exactly one page long
    pub fn run(&mut self, params: &TraceParams) -> Result<TraceResult> {
        // Counting instructions and recording them both need every boundary
        let stepping =
            params.coverage != CoverageMode::No || params.limit > 0 || params.save_instructions;
        let state = self.partition.state()?;

        let mut trace = TraceState {
            params,
            result: TraceResult::new(),
            stepping,
            steps: 0,
            handlers: BTreeMap::new(),
            excluded: params.excluded_addresses.values().copied().collect(),
            interruptions: 0,
            start: Instant::now(),
        };

        if !self.partition.processor().intercepts_exceptions() {
            trace.handlers = self.exception_handlers(&state)?;
        }

        // Hardware breakpoints in priority order
        let max_breakpoints = self.partition.processor().max_breakpoints();
        let mut breakpoints = Vec::with_capacity(max_breakpoints);
        if params.return_address != 0 {
            breakpoints.push(params.return_address);
        }

        let pf_handler = trace
            .handlers
            .iter()
            .find(|(_, vector)| **vector == Exception::PageFault as u8)
            .map(|(addr, _)| *addr);
        if let Some(addr) = pf_handler.filter(|addr| !breakpoints.contains(addr)) {
            breakpoints.push(addr);
        }

        for addr in params.excluded_addresses.values() {
            if breakpoints.len() >= max_breakpoints {
                break;
            }
            if !breakpoints.contains(addr) {
                breakpoints.push(*addr);
            }
        }
        breakpoints.truncate(max_breakpoints);

        self.partition.set_breakpoints(&breakpoints)?;
        self.partition.set_single_step(stepping)?;

        log::debug!(
            "Tracing from {:#x} ({} coverage, {} breakpoints)",
            state.rip,
            params.coverage,
            breakpoints.len()
        );

        let mut status = self.on_boundary(&mut trace, state.rip)?;

        while status.is_none() {
            let exit = self.partition.run()?;
            status = self.handle_exit(&mut trace, exit)?;

            if status.is_none() && trace.timed_out() {
                status = trace.stop(Status::Timeout);
            }
        }

        let mut result = trace.result;
        result.elapsed = trace.start.elapsed();

        log::debug!(
            "Trace ended with {} after {} instructions, {} unique addresses",
            result.status,
            trace.steps,
            result.unique.len()
        );

        Ok(result)
    }
}
