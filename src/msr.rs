//! Provides the [`Msr`] enum
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Model specific registers carried in a register state
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Msr {
    /// Time Stamp Counter
    Ia32TimeStampCounter = 0x10,

    /// APIC Base
    ApicBase = 0x1b,

    /// CS Register Target for CPL 0 Code (R/W)
    Ia32SysenterCs = 0x174,

    /// Stack pointer for CPL 0 stack
    Ia32SysenterEsp = 0x175,

    /// CPL 0 code entry point (R/W)
    Ia32SysenterEip = 0x176,

    /// Page attribute table
    Ia32Pat = 0x277,

    /// Extended feature Enables
    Ia32Efer = 0xc000_0080,

    /// System Call Target Address (R/W)
    Ia32Star = 0xc000_0081,

    /// IA-32e Mode System Call Target Address (R/W)
    ///
    /// Target RIP for the called procedure when SYSCALL is executed in 64-bit mode.
    Ia32Lstar = 0xc000_0082,

    /// IA-32e Mode System Call Target Address (R/W)
    ///
    /// Not used, as the SYSCALL instruction is not recognized in compatibility mode.
    Ia32Cstar = 0xc000_0083,

    /// System Call Flag Mask (R/W)
    Ia32Fmask = 0xc000_0084,

    /// Map of BASE address of FS (R/W)
    Ia32FsBase = 0xc000_0100,

    /// Map of BASE address of GS (R/W)
    Ia32GsBase = 0xc000_0101,

    /// Swap Target of BASE Address of GS (R/W)
    Ia32KernelGsBase = 0xc000_0102,
}

impl Msr {
    /// MSRs synchronized between a register state and the vCPU. `EFER` is carried in the
    /// special registers instead, as are the `APIC` base and the `FS`/`GS` bases.
    pub const SYNCED: [Msr; 8] = [
        Msr::Ia32SysenterCs,
        Msr::Ia32SysenterEsp,
        Msr::Ia32SysenterEip,
        Msr::Ia32Star,
        Msr::Ia32Lstar,
        Msr::Ia32Cstar,
        Msr::Ia32Fmask,
        Msr::Ia32KernelGsBase,
    ];
}
