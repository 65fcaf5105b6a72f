//! Exit records returned by a single [`run`](crate::VirtualProcessor::run) of a virtual
//! processor

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Kind of memory access that caused a [`ExitReason::MemoryAccess`] exit
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryAccessType {
    /// Data read
    Read,

    /// Data write
    Write,

    /// Instruction fetch
    Execute,
}

/// x86 exception vectors
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Exception {
    /// #DE
    DivideError = 0,

    /// #DB, used for single step and hardware breakpoints
    Debug = 1,

    /// Non maskable interrupt
    Nmi = 2,

    /// #BP, raised by `int3`
    Breakpoint = 3,

    /// #OF
    Overflow = 4,

    /// #BR
    BoundRangeExceeded = 5,

    /// #UD
    InvalidOpcode = 6,

    /// #NM
    DeviceNotAvailable = 7,

    /// #DF
    DoubleFault = 8,

    /// Reserved on modern processors
    CoprocessorSegmentOverrun = 9,

    /// #TS
    InvalidTss = 10,

    /// #NP
    SegmentNotPresent = 11,

    /// #SS
    StackSegmentFault = 12,

    /// #GP
    GeneralProtection = 13,

    /// #PF
    PageFault = 14,

    /// #MF
    FloatingPoint = 16,

    /// #AC
    AlignmentCheck = 17,

    /// #MC
    MachineCheck = 18,

    /// #XM
    SimdFloatingPoint = 19,

    /// #VE
    Virtualization = 20,

    /// #CP
    ControlProtection = 21,
}

impl Exception {
    /// Returns `true` if the processor pushes an error code when delivering this vector
    #[must_use]
    pub fn has_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackSegmentFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
                | Exception::ControlProtection
        )
    }
}

/// Exits that are neither memory faults, exceptions nor halts
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtherExit {
    /// Triple fault
    Shutdown,

    /// `in` from the given port
    IoIn(u16),

    /// `out` to the given port
    IoOut(u16),

    /// The hypervisor could not emulate the current instruction. This is how instruction
    /// fetches and page walks through unmapped physical memory are reported.
    InternalError,

    /// VM entry failed with the given hardware reason
    FailEntry(u64),

    /// The run was interrupted by a signal before the guest exited on its own
    Interrupted,

    /// Anything else
    Unknown,
}

/// Why the virtual processor stopped
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// The guest touched a physical page that is not mapped
    MemoryAccess {
        /// Faulting guest physical address
        gpa: u64,

        /// Faulting guest virtual address, `0` when none is associated with the access
        gva: u64,

        /// Kind of access
        access: MemoryAccessType,
    },

    /// A CPU exception was intercepted
    Exception {
        /// Exception vector
        exception_type: u8,
    },

    /// The guest executed `hlt`
    Halt,

    /// Any other exit
    Other(OtherExit),
}

/// One exit from [`VirtualProcessor::run`](crate::VirtualProcessor::run)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    /// Reason of the exit
    pub reason: ExitReason,

    /// Instruction pointer at the time of the exit
    pub rip: u64,
}

impl ExitRecord {
    /// Create an [`ExitRecord`]
    #[must_use]
    pub const fn new(reason: ExitReason, rip: u64) -> Self {
        Self { reason, rip }
    }

    /// Faulting guest physical address of a memory access exit
    #[must_use]
    pub fn physical_address(&self) -> Option<u64> {
        match self.reason {
            ExitReason::MemoryAccess { gpa, .. } => Some(gpa),
            _ => None,
        }
    }

    /// Faulting guest virtual address of a memory access exit. A zero address is
    /// treated as "no virtual address associated".
    #[must_use]
    pub fn virtual_address(&self) -> Option<u64> {
        match self.reason {
            ExitReason::MemoryAccess { gva, .. } if gva != 0 => Some(gva),
            _ => None,
        }
    }

    /// Kind of access of a memory access exit
    #[must_use]
    pub fn access_type(&self) -> Option<MemoryAccessType> {
        match self.reason {
            ExitReason::MemoryAccess { access, .. } => Some(access),
            _ => None,
        }
    }

    /// Vector of an exception exit
    #[must_use]
    pub fn exception_type(&self) -> Option<u8> {
        match self.reason {
            ExitReason::Exception { exception_type } => Some(exception_type),
            _ => None,
        }
    }

    /// Decoded vector of an exception exit, `None` for reserved vectors
    #[must_use]
    pub fn exception(&self) -> Option<Exception> {
        self.exception_type()
            .and_then(|vector| Exception::try_from(vector).ok())
    }

    /// Returns `true` for a `hlt` exit
    #[must_use]
    pub fn is_halt(&self) -> bool {
        matches!(self.reason, ExitReason::Halt)
    }
}

impl std::fmt::Display for ExitRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            ExitReason::MemoryAccess { gpa, gva, access } => write!(
                f,
                "MemoryAccess({access:?}) gpa {gpa:#x} gva {gva:#x} @ {:#x}",
                self.rip
            ),
            ExitReason::Exception { exception_type } => match self.exception() {
                Some(exception) => write!(f, "Exception({exception:?}) @ {:#x}", self.rip),
                None => write!(f, "Exception({exception_type}) @ {:#x}", self.rip),
            },
            ExitReason::Halt => write!(f, "Halt @ {:#x}", self.rip),
            ExitReason::Other(other) => write!(f, "{other:?} @ {:#x}", self.rip),
        }
    }
}
