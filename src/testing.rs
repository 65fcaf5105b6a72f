//! A scripted [`VirtualProcessor`] for unit tests.
//!
//! It interprets a handful of 64-bit instructions against identity mapped
//! [`PhysicalMemory`] and reports exits the way a hypervisor would: unmapped code and data
//! pages as memory accesses, `hlt` as a halt, `int3`/`ud2` as exceptions and anything it
//! can't execute as an internal error.

use anyhow::{ensure, Result};
use iced_x86::{Code, Instruction, OpKind, Register as IcedRegister};
use x86_64::registers::rflags::RFlags;

use crate::addrs::{PhysAddr, VirtAddr};
use crate::exit::{ExitReason, ExitRecord, MemoryAccessType, OtherExit};
use crate::memory::{AddressSpace, PhysicalMemory};
use crate::regs::{DescriptorType, RegisterState, Segment};
use crate::vcpu::VirtualProcessor;

/// Outcome of executing one instruction
enum Step {
    /// Continue with the next instruction
    Next,

    /// Stop with the given exit
    Exit(ExitReason),
}

/// Interpreter standing in for a hardware virtualized processor
#[derive(Debug)]
pub(crate) struct ScriptedProcessor {
    /// Register file
    state: RegisterState,

    /// Regions made accessible through [`VirtualProcessor::map_region`]
    mapped: Vec<(u64, u64)>,

    /// Single stepping enabled
    single_step: bool,

    /// Armed breakpoints
    breakpoints: Vec<u64>,

    /// Report [`OtherExit::Interrupted`] after this many instructions in one run
    interrupt_after: Option<u64>,
}

impl ScriptedProcessor {
    /// A processor in 64-bit mode with paging disabled
    pub(crate) fn new() -> Self {
        let mut state = RegisterState {
            rflags: 2,
            ..RegisterState::default()
        };
        state.cs = Segment::new(DescriptorType::Code, 0, 0xffff_ffff, true, 0x10);
        state.ss = Segment::new(DescriptorType::Data, 0, 0xffff_ffff, false, 0x18);

        Self {
            state,
            mapped: Vec::new(),
            single_step: false,
            breakpoints: Vec::new(),
            interrupt_after: None,
        }
    }

    /// Report an interruption after `count` instructions of one run
    pub(crate) fn interrupt_after(mut self, count: u64) -> Self {
        self.interrupt_after = Some(count);
        self
    }

    /// Regions mapped so far
    pub(crate) fn mapped(&self) -> &[(u64, u64)] {
        &self.mapped
    }

    /// Resolve the memory operand of `instr`
    fn memory_operand(&self, instr: &Instruction) -> Option<u64> {
        let operand = (0..instr.op_count()).find(|op| instr.op_kind(*op) == OpKind::Memory)?;
        instr.virtual_address(operand, 0, |reg, _, _| self.state.iced_reg(reg))
    }

    /// Value of a 64-bit general purpose register
    fn gpr_mut(&mut self, reg: IcedRegister) -> Option<&mut u64> {
        let state = &mut self.state;
        let gpr = match reg {
            IcedRegister::RAX => &mut state.rax,
            IcedRegister::RBX => &mut state.rbx,
            IcedRegister::RCX => &mut state.rcx,
            IcedRegister::RDX => &mut state.rdx,
            IcedRegister::RSI => &mut state.rsi,
            IcedRegister::RDI => &mut state.rdi,
            IcedRegister::R8 => &mut state.r8,
            IcedRegister::R9 => &mut state.r9,
            _ => return None,
        };

        Some(gpr)
    }

    /// Set or clear the zero flag
    fn set_zero_flag(&mut self, zero: bool) {
        let mut rflags = RFlags::from_bits_truncate(self.state.rflags);
        rflags.set(RFlags::ZERO_FLAG, zero);
        self.state.rflags = rflags.bits();
    }

    /// Returns `true` if the zero flag is set
    fn zero_flag(&self) -> bool {
        RFlags::from_bits_truncate(self.state.rflags).contains(RFlags::ZERO_FLAG)
    }

    /// Execute `instr`, reporting faults without side effects
    fn execute(&mut self, memory: &mut PhysicalMemory, instr: &Instruction) -> Step {
        let data_fault = |addr: u64, access| {
            Step::Exit(ExitReason::MemoryAccess {
                gpa: addr,
                gva: addr,
                access,
            })
        };

        let next = instr.next_ip();

        match instr.code() {
            Code::Nopd | Code::Nopq | Code::Nopw => {}
            Code::Hlt => {
                self.state.rip = next;
                return Step::Exit(ExitReason::Halt);
            }
            Code::Int3 => return Step::Exit(ExitReason::Exception { exception_type: 3 }),
            Code::Ud2 => return Step::Exit(ExitReason::Exception { exception_type: 6 }),
            Code::Jmp_rel8_64 | Code::Jmp_rel32_64 => {
                self.state.rip = instr.near_branch_target();
                return Step::Next;
            }
            Code::Je_rel8_64 | Code::Je_rel32_64 | Code::Jne_rel8_64 | Code::Jne_rel32_64 => {
                let want_zero = matches!(instr.code(), Code::Je_rel8_64 | Code::Je_rel32_64);
                self.state.rip = if self.zero_flag() == want_zero {
                    instr.near_branch_target()
                } else {
                    next
                };
                return Step::Next;
            }
            Code::Cmp_rm8_imm8 => {
                let Some(addr) = self.memory_operand(instr) else {
                    return Step::Exit(ExitReason::Other(OtherExit::InternalError));
                };

                let mut byte = [0_u8];
                if memory.read(PhysAddr(addr), &mut byte).is_err() {
                    return data_fault(addr, MemoryAccessType::Read);
                }

                self.set_zero_flag(byte[0] == instr.immediate8());
            }
            Code::Mov_r64_imm64 | Code::Mov_rm64_imm32 if instr.op0_kind() == OpKind::Register => {
                let value = instr.immediate(1);
                match self.gpr_mut(instr.op0_register()) {
                    Some(reg) => *reg = value,
                    None => return Step::Exit(ExitReason::Other(OtherExit::InternalError)),
                }
            }
            Code::Mov_rm8_imm8 | Code::Mov_rm32_imm32 | Code::Mov_rm64_imm32 => {
                let Some(addr) = self.memory_operand(instr) else {
                    return Step::Exit(ExitReason::Other(OtherExit::InternalError));
                };

                let value = instr.immediate(1).to_le_bytes();
                let size = instr.memory_size().size();
                if memory.write(PhysAddr(addr), &value[..size]).is_err() {
                    return data_fault(addr, MemoryAccessType::Write);
                }
            }
            Code::Mov_r64_rm64 => {
                let Some(addr) = self.memory_operand(instr) else {
                    return Step::Exit(ExitReason::Other(OtherExit::InternalError));
                };

                let Ok(value) = memory.read_phys::<u64>(PhysAddr(addr)) else {
                    return data_fault(addr, MemoryAccessType::Read);
                };

                match self.gpr_mut(instr.op0_register()) {
                    Some(reg) => *reg = value,
                    None => return Step::Exit(ExitReason::Other(OtherExit::InternalError)),
                }
            }
            Code::Inc_rm64 if instr.op0_kind() == OpKind::Register => {
                match self.gpr_mut(instr.op0_register()) {
                    Some(reg) => *reg = reg.wrapping_add(1),
                    None => return Step::Exit(ExitReason::Other(OtherExit::InternalError)),
                }
            }
            _ => return Step::Exit(ExitReason::Other(OtherExit::InternalError)),
        }

        self.state.rip = next;
        Step::Next
    }
}

impl VirtualProcessor for ScriptedProcessor {
    fn state(&mut self) -> Result<RegisterState> {
        Ok(self.state.clone())
    }

    fn set_state(&mut self, state: &RegisterState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }

    fn map_region(
        &mut self,
        _memory: &mut PhysicalMemory,
        base: PhysAddr,
        size: u64,
    ) -> Result<()> {
        self.mapped.push((base.0, size));
        Ok(())
    }

    fn set_single_step(&mut self, enabled: bool) -> Result<()> {
        self.single_step = enabled;
        Ok(())
    }

    fn set_breakpoints(&mut self, addresses: &[u64]) -> Result<()> {
        ensure!(addresses.len() <= self.max_breakpoints(), "too many breakpoints");
        self.breakpoints = addresses.to_vec();
        Ok(())
    }

    fn max_breakpoints(&self) -> usize {
        4
    }

    fn run(&mut self, memory: &mut PhysicalMemory) -> Result<ExitRecord> {
        let mut executed = 0;

        loop {
            let rip = self.state.rip;

            // Like the resume flag, a breakpoint does not fire for the first instruction
            if executed > 0 && self.breakpoints.contains(&rip) {
                return Ok(ExitRecord::new(ExitReason::Exception { exception_type: 1 }, rip));
            }

            if self.interrupt_after == Some(executed) {
                return Ok(ExitRecord::new(
                    ExitReason::Other(OtherExit::Interrupted),
                    rip,
                ));
            }

            if !memory.is_mapped(PhysAddr(rip)) {
                let reason = ExitReason::MemoryAccess {
                    gpa: rip,
                    gva: rip,
                    access: MemoryAccessType::Execute,
                };
                return Ok(ExitRecord::new(reason, rip));
            }

            let Ok(instr) = memory.instruction_at(VirtAddr(rip), AddressSpace::identity(), 64)
            else {
                return Ok(ExitRecord::new(
                    ExitReason::Other(OtherExit::InternalError),
                    rip,
                ));
            };

            match self.execute(memory, &instr) {
                Step::Next => {}
                Step::Exit(reason) => return Ok(ExitRecord::new(reason, self.state.rip)),
            }

            executed += 1;

            if self.single_step {
                return Ok(ExitRecord::new(
                    ExitReason::Exception { exception_type: 1 },
                    self.state.rip,
                ));
            }
        }
    }

    fn sync_dirty_pages(&mut self, _memory: &mut PhysicalMemory) -> Result<usize> {
        // Every write goes through `PhysicalMemory` which tracks it already
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Map `code` at 0x1000 and return the processor and memory
    fn setup(code: &[u8]) -> (ScriptedProcessor, PhysicalMemory) {
        let mut memory = PhysicalMemory::new(0x10_0000).unwrap();
        let mut page = vec![0xcc; 0x1000];
        page[..code.len()].copy_from_slice(code);
        memory.load_page(PhysAddr(0x1000), &page).unwrap();

        let mut processor = ScriptedProcessor::new();
        processor.state.rip = 0x1000;
        (processor, memory)
    }

    #[test]
    fn runs_until_halt() {
        // mov rax, 0xdeadbeef; nop; hlt
        let (mut cpu, mut memory) =
            setup(&[0x48, 0xc7, 0xc0, 0xef, 0xbe, 0xad, 0xde, 0x90, 0xf4]);

        let exit = cpu.run(&mut memory).unwrap();
        assert!(exit.is_halt());
        assert_eq!(exit.rip, 0x1009);
        assert_eq!(cpu.state.rax, 0xffff_ffff_dead_beef);
    }

    #[test]
    fn single_steps_and_faults() {
        // mov byte [0x8000], 0x41; nop
        let (mut cpu, mut memory) = setup(&[0xc6, 0x04, 0x25, 0x00, 0x80, 0x00, 0x00, 0x41, 0x90]);
        cpu.set_single_step(true).unwrap();

        let exit = cpu.run(&mut memory).unwrap();
        assert_eq!(exit.physical_address(), Some(0x8000));
        assert_eq!(exit.access_type(), Some(MemoryAccessType::Write));
        assert_eq!(exit.rip, 0x1000);

        memory.load_page(PhysAddr(0x8000), &[0; 0x1000]).unwrap();
        let exit = cpu.run(&mut memory).unwrap();
        assert_eq!(exit.exception_type(), Some(1));
        assert_eq!(exit.rip, 0x1008);
        assert_eq!(memory.read_bytes(PhysAddr(0x8000), 1).unwrap(), [0x41]);
    }

    #[test]
    fn breakpoints_and_exceptions() {
        // nop; nop; ud2
        let (mut cpu, mut memory) = setup(&[0x90, 0x90, 0x0f, 0x0b]);
        cpu.set_breakpoints(&[0x1001]).unwrap();

        let exit = cpu.run(&mut memory).unwrap();
        assert_eq!((exit.exception_type(), exit.rip), (Some(1), 0x1001));

        let exit = cpu.run(&mut memory).unwrap();
        assert_eq!((exit.exception_type(), exit.rip), (Some(6), 0x1002));
    }
}
