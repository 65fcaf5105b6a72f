//! Register identifiers and the full register state of a virtual processor

use serde::{Deserialize, Serialize};

use crate::addrs::Cr3;
use crate::memory::AddressSpace;
use crate::page_table::PagingMode;
pub use crate::segment::{DescriptorType, Segment};

mod x86;

/// Errors raised while naming registers
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The name does not identify a register
    #[error("InvalidRegister_{0}")]
    InvalidRegister(String),

    /// The name does not identify a segment register
    #[error("InvalidSegmentRegister_{0}")]
    InvalidSegmentRegister(String),

    /// The name does not identify a descriptor table register
    #[error("InvalidTableRegister_{0}")]
    InvalidTableRegister(String),
}

/// Declare the [`Register`] enum along with its name mapping and state accessors
macro_rules! registers {
    ($($variant:ident => $name:literal, $field:ident;)*) => {
        /// Registers addressable by name
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Register {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )*
        }

        impl Register {
            /// Every addressable register
            pub const ALL: &'static [Register] = &[$(Register::$variant),*];

            /// Lower case name of the register
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Register::$variant => $name,)*
                }
            }
        }

        impl std::str::FromStr for Register {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok(Register::$variant),)*
                    _ => Err(Error::InvalidRegister(s.to_string())),
                }
            }
        }

        impl RegisterState {
            /// Read the given [`Register`]
            #[must_use]
            pub fn get(&self, reg: Register) -> u64 {
                match reg {
                    $(Register::$variant => self.$field,)*
                }
            }

            /// Write the given [`Register`]
            pub fn set(&mut self, reg: Register, val: u64) {
                match reg {
                    $(Register::$variant => self.$field = val,)*
                }
            }
        }
    };
}

registers! {
    Rax => "rax", rax;
    Rbx => "rbx", rbx;
    Rcx => "rcx", rcx;
    Rdx => "rdx", rdx;
    Rsi => "rsi", rsi;
    Rdi => "rdi", rdi;
    Rsp => "rsp", rsp;
    Rbp => "rbp", rbp;
    R8 => "r8", r8;
    R9 => "r9", r9;
    R10 => "r10", r10;
    R11 => "r11", r11;
    R12 => "r12", r12;
    R13 => "r13", r13;
    R14 => "r14", r14;
    R15 => "r15", r15;
    Rip => "rip", rip;
    Rflags => "rflags", rflags;
    Cr0 => "cr0", cr0;
    Cr2 => "cr2", cr2;
    Cr3 => "cr3", cr3;
    Cr4 => "cr4", cr4;
    Cr8 => "cr8", cr8;
    Efer => "efer", efer;
    Star => "star", star;
    Lstar => "lstar", lstar;
    Cstar => "cstar", cstar;
    Sfmask => "sfmask", sfmask;
    SysenterCs => "sysenter_cs", sysenter_cs;
    SysenterEsp => "sysenter_esp", sysenter_esp;
    SysenterEip => "sysenter_eip", sysenter_eip;
    KernelGsBase => "kernel_gs_base", kernel_gs_base;
    FsBase => "fs_base", fs_base;
    GsBase => "gs_base", gs_base;
    ApicBase => "apic_base", apic_base;
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Segment registers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentRegister {
    /// Code segment
    Cs,
    /// Stack segment
    Ss,
    /// Data segment
    Ds,
    /// Extra segment
    Es,
    /// `fs`
    Fs,
    /// `gs`
    Gs,
}

impl std::str::FromStr for SegmentRegister {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cs" => Ok(SegmentRegister::Cs),
            "ss" => Ok(SegmentRegister::Ss),
            "ds" => Ok(SegmentRegister::Ds),
            "es" => Ok(SegmentRegister::Es),
            "fs" => Ok(SegmentRegister::Fs),
            "gs" => Ok(SegmentRegister::Gs),
            _ => Err(Error::InvalidSegmentRegister(s.to_string())),
        }
    }
}

/// Descriptor table registers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableRegister {
    /// Global descriptor table
    Gdt,
    /// Interrupt descriptor table
    Idt,
}

impl std::str::FromStr for TableRegister {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gdt" | "gdtr" => Ok(TableRegister::Gdt),
            "idt" | "idtr" => Ok(TableRegister::Idt),
            _ => Err(Error::InvalidTableRegister(s.to_string())),
        }
    }
}

/// Default `IA32_APIC_BASE`: enabled, bootstrap processor, default base
const fn default_apic_base() -> u64 {
    0xfee0_0900
}

/// Full register state of one virtual processor. This is also the JSON initial context
/// format of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RegisterState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
    pub cr0: u64,
    #[serde(default)]
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,

    /// GDT base
    pub gdtr: u64,

    /// GDT limit
    pub gdtl: u16,

    /// IDT base
    pub idtr: u64,

    /// IDT limit
    pub idtl: u16,

    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,

    /// Base of `fs`. Takes precedence over `fs.base` when loaded into a processor.
    pub fs_base: u64,

    /// Base of `gs`. Takes precedence over `gs.base` when loaded into a processor.
    pub gs_base: u64,

    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    #[serde(default)]
    pub sfmask: u64,
    #[serde(default = "default_apic_base")]
    pub apic_base: u64,
}

impl RegisterState {
    /// Get the [`Segment`] for the given segment register
    #[must_use]
    pub fn segment(&self, which: SegmentRegister) -> &Segment {
        match which {
            SegmentRegister::Cs => &self.cs,
            SegmentRegister::Ss => &self.ss,
            SegmentRegister::Ds => &self.ds,
            SegmentRegister::Es => &self.es,
            SegmentRegister::Fs => &self.fs,
            SegmentRegister::Gs => &self.gs,
        }
    }

    /// Get the mutable [`Segment`] for the given segment register
    pub fn segment_mut(&mut self, which: SegmentRegister) -> &mut Segment {
        match which {
            SegmentRegister::Cs => &mut self.cs,
            SegmentRegister::Ss => &mut self.ss,
            SegmentRegister::Ds => &mut self.ds,
            SegmentRegister::Es => &mut self.es,
            SegmentRegister::Fs => &mut self.fs,
            SegmentRegister::Gs => &mut self.gs,
        }
    }

    /// Set the base and limit of a descriptor table register
    pub fn set_table(&mut self, which: TableRegister, base: u64, limit: u16) {
        match which {
            TableRegister::Gdt => {
                self.gdtr = base;
                self.gdtl = limit;
            }
            TableRegister::Idt => {
                self.idtr = base;
                self.idtl = limit;
            }
        }
    }

    /// Set a segment register with flags consistent with the requested code/data and
    /// long mode settings
    pub fn set_segment(
        &mut self,
        which: SegmentRegister,
        base: u64,
        limit: u32,
        is_code: bool,
        is_long: bool,
        selector: u16,
    ) {
        let type_ = if is_code {
            DescriptorType::Code
        } else {
            DescriptorType::Data
        };

        *self.segment_mut(which) = Segment::new(type_, base, limit, is_long, selector);

        match which {
            SegmentRegister::Fs => self.fs_base = base,
            SegmentRegister::Gs => self.gs_base = base,
            _ => {}
        }
    }

    /// Page table root
    #[must_use]
    pub fn cr3(&self) -> Cr3 {
        Cr3(self.cr3)
    }

    /// Paging mode derived from the control registers
    #[must_use]
    pub fn paging_mode(&self) -> PagingMode {
        PagingMode::from_registers(self.cr0, self.cr4, self.efer)
    }

    /// The [`AddressSpace`] used to translate guest virtual addresses
    #[must_use]
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace {
            cr3: self.cr3(),
            mode: self.paging_mode(),
        }
    }

    /// Bitness of the code currently executing
    #[must_use]
    pub fn bitness(&self) -> u32 {
        self.cs.bitness()
    }
}

/// General purpose registers, `rip` and `rflags` captured at one point of a trace
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Context {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl From<&RegisterState> for Context {
    fn from(state: &RegisterState) -> Self {
        Self {
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
            rflags: state.rflags,
            rip: state.rip,
        }
    }
}
