//! Virtual processors: the [`VirtualProcessor`] backend interface and its KVM
//! implementation, [`KvmProcessor`]

use anyhow::{ensure, Context, Result};

use kvm_bindings::{
    kvm_guest_debug, kvm_guest_debug_arch, kvm_msr_entry, kvm_regs, kvm_sregs,
    kvm_userspace_memory_region, Msrs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP,
    KVM_GUESTDBG_USE_HW_BP, KVM_GUESTDBG_USE_SW_BP, KVM_MAX_CPUID_ENTRIES,
    KVM_MEM_LOG_DIRTY_PAGES,
};
use kvm_ioctls::{Kvm, SyncReg, VcpuExit, VcpuFd, VmFd};

use crate::addrs::{PhysAddr, PAGE_SIZE};
use crate::exit::{ExitReason, ExitRecord, MemoryAccessType, OtherExit};
use crate::kvm;
use crate::memory::PhysicalMemory;
use crate::msr::Msr;
use crate::regs::{RegisterState, Segment};
use crate::timer::KickTimer;

use std::collections::BTreeMap;
use std::time::Duration;

/// Address of the three pages KVM reserves for the real mode TSS
pub const TSS_BASE: u64 = 0xfffb_d000;

/// Number of hardware execution breakpoints
pub const HW_BREAKPOINTS: usize = 4;

/// Custom errors the KVM backend can throw
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `/dev/kvm` could not be opened
    #[error("KVM is not available: {0}")]
    KvmUnavailable(kvm_ioctls::Error),

    /// `KVM_RUN` failed for a reason other than a signal
    #[error("Failed to execute the vCPU: {0}")]
    Run(kvm_ioctls::Error),

    /// Every KVM memory slot is in use
    #[error("No free KVM memory slot for {0:#x}..{1:#x}")]
    OutOfSlots(u64, u64),

    /// The region overlaps an already registered slot
    #[error("Region {0:#x}..{1:#x} overlaps a registered memory slot")]
    SlotOverlap(u64, u64),

    /// More hardware breakpoints requested than debug registers exist
    #[error("{0} breakpoints requested, only {HW_BREAKPOINTS} are available")]
    TooManyBreakpoints(usize),

    /// Failed to create MSR entries
    #[error("Failed to create MSR entries")]
    CreateMsrEntries,

    /// KVM did not process every requested MSR
    #[error("KVM processed {0} of {1} MSRs")]
    MsrCount(usize, usize),

    /// The register state was written while an access of the guest is still pending
    #[error("Register state written while a guest memory access is pending")]
    PendingAccess,
}

/// A hardware virtualized processor and the interface the [`Partition`] drives.
///
/// [`Partition`]: crate::Partition
pub trait VirtualProcessor {
    /// Get the full register state
    ///
    /// # Errors
    ///
    /// * The backend failed to read the registers
    fn state(&mut self) -> Result<RegisterState>;

    /// Replace the full register state. Callers must have called
    /// [`VirtualProcessor::complete_pending`] since the last [`VirtualProcessor::run`].
    ///
    /// # Errors
    ///
    /// * The backend rejected the registers
    fn set_state(&mut self, state: &RegisterState) -> Result<()>;

    /// Make the allocated region `[base, base + size)` of `memory` accessible to the
    /// guest
    ///
    /// # Errors
    ///
    /// * The backend could not map the region
    fn map_region(&mut self, memory: &mut PhysicalMemory, base: PhysAddr, size: u64)
        -> Result<()>;

    /// Enable or disable single stepping. While enabled, every executed instruction
    /// exits with [`Exception::Debug`](crate::Exception::Debug).
    ///
    /// # Errors
    ///
    /// * The backend rejected the debug configuration
    fn set_single_step(&mut self, enabled: bool) -> Result<()>;

    /// Exit with [`Exception::Debug`](crate::Exception::Debug) before executing any of
    /// the given linear addresses
    ///
    /// # Errors
    ///
    /// * More than [`VirtualProcessor::max_breakpoints`] addresses
    fn set_breakpoints(&mut self, addresses: &[u64]) -> Result<()>;

    /// Maximum number of addresses accepted by [`VirtualProcessor::set_breakpoints`]
    fn max_breakpoints(&self) -> usize;

    /// Execute the guest until the next exit
    ///
    /// # Errors
    ///
    /// * A host level failure of the backend. Everything the guest does is an exit.
    fn run(&mut self, memory: &mut PhysicalMemory) -> Result<ExitRecord>;

    /// Finish an access of the guest left pending by the last exit without executing
    /// further guest code
    ///
    /// # Errors
    ///
    /// * The backend failed to complete the access
    fn complete_pending(&mut self, _memory: &mut PhysicalMemory) -> Result<()> {
        Ok(())
    }

    /// Mark every page the guest wrote since the last call as dirty in `memory`.
    /// Returns the number of pages found.
    ///
    /// # Errors
    ///
    /// * The backend failed to report its dirty pages
    fn sync_dirty_pages(&mut self, memory: &mut PhysicalMemory) -> Result<usize>;

    /// Returns `true` if a page walk through unmapped page tables is reported as a
    /// [`ExitReason::MemoryAccess`]. Otherwise the tracer must supply the pages an
    /// instruction needs before executing it.
    fn reports_page_walk_faults(&self) -> bool {
        true
    }

    /// Returns `true` if every guest exception is reported as an
    /// [`ExitReason::Exception`]. Otherwise exceptions other than `#DB` and `#BP` are
    /// delivered to the guest and must be detected at their handlers.
    fn intercepts_exceptions(&self) -> bool {
        true
    }
}

/// A registered KVM memory slot
#[derive(Debug, Copy, Clone)]
struct MemorySlot {
    /// KVM slot id
    id: u32,

    /// Size of the slot in bytes
    size: u64,
}

/// An MMIO or port access of the guest that KVM completes on the next `KVM_RUN`
#[derive(Debug)]
enum PendingAccess {
    /// The guest reads `len` bytes of `gpa`. `data` points into the `kvm_run` page of
    /// the vCPU where KVM picks up the value.
    Read { gpa: u64, data: *mut u8, len: usize },

    /// The guest wrote `data` to `gpa`
    Write { gpa: u64, data: Vec<u8> },

    /// Port I/O, nothing to transfer
    Io,
}

/// A single vCPU KVM virtual machine
pub struct KvmProcessor {
    /// The VM holding the memory slots
    vm: VmFd,

    /// The only vCPU of the VM
    vcpu: VcpuFd,

    /// Registered memory slots keyed by guest physical base
    slots: BTreeMap<u64, MemorySlot>,

    /// Slot ids released by coalescing
    free_slots: Vec<u32>,

    /// Next never used slot id
    next_slot: u32,

    /// Number of memory slots supported by KVM
    max_slots: usize,

    /// General purpose registers as of the last exit
    regs: kvm_regs,

    /// Special registers as of the last exit
    sregs: kvm_sregs,

    /// Currently single stepping
    single_step: bool,

    /// Armed hardware breakpoints
    breakpoints: Vec<u64>,

    /// Access to complete before the guest runs again
    pending: Option<PendingAccess>,

    /// Kicks the vCPU out of long running guest code
    timer: KickTimer,
}

impl std::fmt::Debug for KvmProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmProcessor")
            .field("slots", &self.slots.len())
            .field("rip", &format_args!("{:#x}", self.regs.rip))
            .field("single_step", &self.single_step)
            .field("breakpoints", &self.breakpoints)
            .field("pending", &self.pending)
            .finish()
    }
}

impl KvmProcessor {
    /// Returns `true` if `/dev/kvm` can be opened
    #[must_use]
    pub fn is_available() -> bool {
        Kvm::new().is_ok()
    }

    /// Create a VM with one vCPU. `kick_interval` is the period of the timer that
    /// interrupts guest execution.
    ///
    /// # Errors
    ///
    /// * KVM is not available or lacks a required capability
    /// * Any of the VM or vCPU setup ioctls failed
    pub fn new(kick_interval: Duration) -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::KvmUnavailable)?;
        kvm::sanity_check_kvm(&kvm)?;

        let vm = kvm.create_vm().context("Failed to create VM")?;
        kvm::enable_manual_dirty_log_protect(&vm)
            .context("Failed to enable manual dirty log protect")?;

        // Without an in-kernel irqchip `hlt` exits to userspace
        vm.set_tss_address(usize::try_from(TSS_BASE)?)?;

        let vcpu = vm.create_vcpu(0).context("Failed to create vCPU")?;

        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .context("Failed to get supported CPUIDs")?;
        vcpu.set_cpuid2(&cpuid).context("Failed to set CPUIDs")?;

        let regs = vcpu.get_regs()?;
        let sregs = vcpu.get_sregs()?;

        let mut processor = Self {
            vm,
            vcpu,
            slots: BTreeMap::new(),
            free_slots: Vec::new(),
            next_slot: 0,
            max_slots: kvm.get_nr_memslots(),
            regs,
            sregs,
            single_step: false,
            breakpoints: Vec::new(),
            pending: None,
            timer: KickTimer::start(kick_interval)?,
        };

        processor.apply_guest_debug()?;

        log::info!(
            "Created KVM vCPU ({} memory slots available)",
            processor.max_slots
        );

        Ok(processor)
    }

    /// Write the single step and breakpoint configuration to KVM
    fn apply_guest_debug(&mut self) -> Result<()> {
        let mut control = KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_SW_BP;
        if self.single_step {
            control |= KVM_GUESTDBG_SINGLESTEP;
        }

        // DR7 bit 10 is reserved to 1
        let mut debugreg = [0, 0, 0, 0, 0, 0, 0, 0x400];
        if !self.breakpoints.is_empty() {
            control |= KVM_GUESTDBG_USE_HW_BP;
        }

        for (index, addr) in self.breakpoints.iter().enumerate() {
            // Local enable, execute condition, one byte length
            debugreg[index] = *addr;
            debugreg[7] |= 1 << (index * 2);
        }

        let debug_struct = kvm_guest_debug {
            control,
            pad: 0,
            arch: kvm_guest_debug_arch { debugreg },
        };

        self.vcpu
            .set_guest_debug(&debug_struct)
            .context("Failed to set guest debug mode")?;

        Ok(())
    }

    /// Register `[base, base + size)` as memory slot `id`. A zero `size` deletes the slot.
    fn set_slot(&self, memory: &PhysicalMemory, id: u32, base: u64, size: u64) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot: id,
            guest_phys_addr: base,
            memory_size: size,
            userspace_addr: memory.host_address(PhysAddr(base)),
            flags: KVM_MEM_LOG_DIRTY_PAGES,
        };

        // Safe because the backing of `memory` outlives the VM: both are owned by the
        // same partition and the slot only covers the reserved mapping
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .with_context(|| format!("Failed to set memory slot {id} at {base:#x}"))?;
        }

        Ok(())
    }

    /// Move the dirty bits of one slot into `memory`
    fn harvest_slot(&self, memory: &mut PhysicalMemory, base: u64, slot: MemorySlot) -> Result<usize> {
        let pages = slot.size / PAGE_SIZE;
        let mut bitmap = vec![0_u64; kvm::bitmap_words(pages)];

        kvm::get_dirty_log(&self.vm, slot.id, &mut bitmap)?;

        let mut found = 0;
        for (word_index, word) in bitmap.iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                let bit = u64::from(bits.trailing_zeros());
                bits &= bits - 1;

                let page = word_index as u64 * 64 + bit;
                memory.mark_dirty(PhysAddr(base + page * PAGE_SIZE));
                found += 1;
            }
        }

        if found > 0 {
            kvm::clear_dirty_log(&self.vm, slot.id, pages, &mut bitmap)?;
        }

        Ok(found)
    }

    /// Transfer the data of the pending access between the guest and `memory`
    fn transfer_pending(&mut self, memory: &mut PhysicalMemory) {
        match self.pending.take() {
            Some(PendingAccess::Read { gpa, data, len }) => {
                let mut bytes = vec![0_u8; len];
                if memory.read(PhysAddr(gpa), &mut bytes).is_err() {
                    log::debug!("Pending read of unmapped {gpa:#x} completes with zeros");
                }

                // SAFETY: `data` points into the `kvm_run` mapping of `self.vcpu`, which
                // lives as long as the vCPU. KVM reported `len` bytes there.
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, len);
                }
            }
            Some(PendingAccess::Write { gpa, data }) => {
                if memory.write(PhysAddr(gpa), &data).is_err() {
                    log::debug!("Pending write to unmapped {gpa:#x} dropped");
                }
            }
            Some(PendingAccess::Io) | None => {}
        }
    }

    /// Refresh the register cache from the `kvm_run` sync area
    fn refresh_registers(&mut self) {
        let sync = self.vcpu.sync_regs();
        self.regs = sync.regs;
        self.sregs = sync.sregs;
    }

    /// Read the synchronized MSRs
    fn get_msrs(&self) -> Result<Vec<kvm_msr_entry>> {
        let entries = Msr::SYNCED.map(|msr| kvm_msr_entry {
            index: msr.into(),
            ..kvm_msr_entry::default()
        });

        let mut msrs = Msrs::from_entries(&entries).map_err(|_| Error::CreateMsrEntries)?;
        let read = self.vcpu.get_msrs(&mut msrs)?;
        ensure!(read == entries.len(), Error::MsrCount(read, entries.len()));

        Ok(msrs.as_slice().to_vec())
    }

    /// Write the synchronized MSRs
    fn set_msrs(&self, state: &RegisterState) -> Result<()> {
        let entries = Msr::SYNCED.map(|msr| {
            let data = match msr {
                Msr::Ia32SysenterCs => state.sysenter_cs,
                Msr::Ia32SysenterEsp => state.sysenter_esp,
                Msr::Ia32SysenterEip => state.sysenter_eip,
                Msr::Ia32Star => state.star,
                Msr::Ia32Lstar => state.lstar,
                Msr::Ia32Cstar => state.cstar,
                Msr::Ia32Fmask => state.sfmask,
                Msr::Ia32KernelGsBase => state.kernel_gs_base,
                _ => 0,
            };

            kvm_msr_entry {
                index: msr.into(),
                data,
                ..kvm_msr_entry::default()
            }
        });

        let msrs = Msrs::from_entries(&entries).map_err(|_| Error::CreateMsrEntries)?;
        let written = self.vcpu.set_msrs(&msrs)?;
        ensure!(
            written == entries.len(),
            Error::MsrCount(written, entries.len())
        );

        Ok(())
    }
}

impl VirtualProcessor for KvmProcessor {
    fn state(&mut self) -> Result<RegisterState> {
        let regs = &self.regs;
        let sregs = &self.sregs;

        let mut state = RegisterState {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.rflags,
            cr0: sregs.cr0,
            cr2: sregs.cr2,
            cr3: sregs.cr3,
            cr4: sregs.cr4,
            cr8: sregs.cr8,
            efer: sregs.efer,
            apic_base: sregs.apic_base,
            gdtr: sregs.gdt.base,
            gdtl: sregs.gdt.limit,
            idtr: sregs.idt.base,
            idtl: sregs.idt.limit,
            cs: Segment::from(&sregs.cs),
            ss: Segment::from(&sregs.ss),
            ds: Segment::from(&sregs.ds),
            es: Segment::from(&sregs.es),
            fs: Segment::from(&sregs.fs),
            gs: Segment::from(&sregs.gs),
            fs_base: sregs.fs.base,
            gs_base: sregs.gs.base,
            ..RegisterState::default()
        };

        for entry in self.get_msrs()? {
            match Msr::try_from(entry.index) {
                Ok(Msr::Ia32SysenterCs) => state.sysenter_cs = entry.data,
                Ok(Msr::Ia32SysenterEsp) => state.sysenter_esp = entry.data,
                Ok(Msr::Ia32SysenterEip) => state.sysenter_eip = entry.data,
                Ok(Msr::Ia32Star) => state.star = entry.data,
                Ok(Msr::Ia32Lstar) => state.lstar = entry.data,
                Ok(Msr::Ia32Cstar) => state.cstar = entry.data,
                Ok(Msr::Ia32Fmask) => state.sfmask = entry.data,
                Ok(Msr::Ia32KernelGsBase) => state.kernel_gs_base = entry.data,
                _ => {}
            }
        }

        Ok(state)
    }

    fn set_state(&mut self, state: &RegisterState) -> Result<()> {
        ensure!(self.pending.is_none(), Error::PendingAccess);

        let regs = kvm_regs {
            rax: state.rax,
            rbx: state.rbx,
            rcx: state.rcx,
            rdx: state.rdx,
            rsi: state.rsi,
            rdi: state.rdi,
            rsp: state.rsp,
            rbp: state.rbp,
            r8: state.r8,
            r9: state.r9,
            r10: state.r10,
            r11: state.r11,
            r12: state.r12,
            r13: state.r13,
            r14: state.r14,
            r15: state.r15,
            rip: state.rip,
            // Bit 1 of RFLAGS is reserved to 1
            rflags: state.rflags | 2,
        };

        // Start from the current special registers to keep TR, LDT and the pending
        // interrupt bitmap
        let mut sregs = self.sregs;
        sregs.cs = (&state.cs).into();
        sregs.ss = (&state.ss).into();
        sregs.ds = (&state.ds).into();
        sregs.es = (&state.es).into();
        sregs.fs = (&state.fs).into();
        sregs.gs = (&state.gs).into();
        sregs.fs.base = state.fs_base;
        sregs.gs.base = state.gs_base;
        sregs.gdt.base = state.gdtr;
        sregs.gdt.limit = state.gdtl;
        sregs.idt.base = state.idtr;
        sregs.idt.limit = state.idtl;
        sregs.cr0 = state.cr0;
        sregs.cr2 = state.cr2;
        sregs.cr3 = state.cr3;
        sregs.cr4 = state.cr4;
        sregs.cr8 = state.cr8;
        sregs.efer = state.efer;
        sregs.apic_base = state.apic_base;

        self.vcpu.set_sregs(&sregs).context("Failed to set sregs")?;
        self.vcpu.set_regs(&regs).context("Failed to set regs")?;
        self.set_msrs(state)?;

        self.regs = regs;
        self.sregs = sregs;

        Ok(())
    }

    fn map_region(
        &mut self,
        memory: &mut PhysicalMemory,
        base: PhysAddr,
        size: u64,
    ) -> Result<()> {
        let mut start = base.0;
        let mut end = base.0 + size;

        ensure!(
            self.slots.range(start..end).next().is_none(),
            Error::SlotOverlap(start, end)
        );

        // Coalesce with a slot ending at `start` and one beginning at `end`
        let mut merged = Vec::new();
        if let Some((&prev, slot)) = self.slots.range(..start).next_back() {
            ensure!(prev + slot.size <= start, Error::SlotOverlap(start, end));
            if prev + slot.size == start {
                merged.push(prev);
                start = prev;
            }
        }

        if let Some(next) = self.slots.get(&end) {
            merged.push(end);
            end += next.size;
        }

        for slot_base in merged {
            let Some(slot) = self.slots.remove(&slot_base) else {
                continue;
            };

            // The dirty log of a slot is lost with it
            self.harvest_slot(memory, slot_base, slot)?;
            self.set_slot(memory, slot.id, slot_base, 0)?;
            self.free_slots.push(slot.id);
        }

        let id = match self.free_slots.pop() {
            Some(id) => id,
            None => {
                ensure!(
                    (self.next_slot as usize) < self.max_slots,
                    Error::OutOfSlots(start, end)
                );
                self.next_slot += 1;
                self.next_slot - 1
            }
        };

        self.set_slot(memory, id, start, end - start)?;
        self.slots.insert(
            start,
            MemorySlot {
                id,
                size: end - start,
            },
        );

        log::debug!("Memory slot {id}: {start:#x}..{end:#x}");

        Ok(())
    }

    fn set_single_step(&mut self, enabled: bool) -> Result<()> {
        if self.single_step != enabled {
            self.single_step = enabled;
            self.apply_guest_debug()?;
        }

        Ok(())
    }

    fn set_breakpoints(&mut self, addresses: &[u64]) -> Result<()> {
        ensure!(
            addresses.len() <= HW_BREAKPOINTS,
            Error::TooManyBreakpoints(addresses.len())
        );

        if self.breakpoints != addresses {
            self.breakpoints = addresses.to_vec();
            self.apply_guest_debug()?;
        }

        Ok(())
    }

    fn max_breakpoints(&self) -> usize {
        HW_BREAKPOINTS
    }

    fn run(&mut self, memory: &mut PhysicalMemory) -> Result<ExitRecord> {
        self.transfer_pending(memory);

        self.vcpu.set_sync_valid_reg(SyncReg::Register);
        self.vcpu.set_sync_valid_reg(SyncReg::SystemRegister);

        let mut pending = None;

        let reason = match self.vcpu.run() {
            Ok(VcpuExit::MmioRead(gpa, data)) => {
                pending = Some(PendingAccess::Read {
                    gpa,
                    data: data.as_mut_ptr(),
                    len: data.len(),
                });

                ExitReason::MemoryAccess {
                    gpa,
                    gva: 0,
                    access: MemoryAccessType::Read,
                }
            }
            Ok(VcpuExit::MmioWrite(gpa, data)) => {
                pending = Some(PendingAccess::Write {
                    gpa,
                    data: data.to_vec(),
                });

                ExitReason::MemoryAccess {
                    gpa,
                    gva: 0,
                    access: MemoryAccessType::Write,
                }
            }
            Ok(VcpuExit::Debug(debug)) => ExitReason::Exception {
                exception_type: u8::try_from(debug.exception)?,
            },
            Ok(VcpuExit::Hlt) => ExitReason::Halt,
            Ok(VcpuExit::Shutdown) => ExitReason::Other(OtherExit::Shutdown),
            Ok(VcpuExit::IoIn(port, _)) => {
                pending = Some(PendingAccess::Io);
                ExitReason::Other(OtherExit::IoIn(port))
            }
            Ok(VcpuExit::IoOut(port, _)) => {
                pending = Some(PendingAccess::Io);
                ExitReason::Other(OtherExit::IoOut(port))
            }
            Ok(VcpuExit::InternalError) => ExitReason::Other(OtherExit::InternalError),
            Ok(VcpuExit::FailEntry(reason, _cpu)) => {
                ExitReason::Other(OtherExit::FailEntry(reason))
            }
            Ok(exit) => {
                log::warn!("Unhandled vmexit: {exit:?}");
                ExitReason::Other(OtherExit::Unknown)
            }
            // When the guest is kicked out by the timer, run() returns EINTR
            Err(err) if err.errno() == libc::EINTR => {
                log::trace!(
                    "Kicked every {:?}, {} kicks so far",
                    self.timer.interval(),
                    crate::timer::kicks()
                );
                ExitReason::Other(OtherExit::Interrupted)
            }
            Err(err) => return Err(Error::Run(err).into()),
        };

        self.pending = pending;
        self.refresh_registers();

        let exit = ExitRecord::new(reason, self.regs.rip);
        log::debug!("vmexit: {exit}");

        Ok(exit)
    }

    fn complete_pending(&mut self, memory: &mut PhysicalMemory) -> Result<()> {
        if self.pending.is_none() {
            return Ok(());
        }

        self.transfer_pending(memory);

        // KVM finishes the pending access before it checks `immediate_exit`, so this run
        // returns EINTR without executing guest code
        self.vcpu.set_kvm_immediate_exit(1);
        let res = self.vcpu.run();
        let res = match res {
            Err(err) if err.errno() == libc::EINTR => Ok(()),
            Err(err) => Err(Error::Run(err)),
            Ok(exit) => {
                log::warn!("Unexpected vmexit while completing an access: {exit:?}");
                Ok(())
            }
        };
        self.vcpu.set_kvm_immediate_exit(0);
        res?;

        self.refresh_registers();

        Ok(())
    }

    fn sync_dirty_pages(&mut self, memory: &mut PhysicalMemory) -> Result<usize> {
        let mut found = 0;

        for (base, slot) in &self.slots {
            found += self.harvest_slot(memory, *base, *slot)?;
        }

        Ok(found)
    }

    fn reports_page_walk_faults(&self) -> bool {
        false
    }

    fn intercepts_exceptions(&self) -> bool {
        false
    }
}
