//! # Snaptrace
//!
//! Trace and fuzz x86-64 execution snapshots in KVM
//!
//! Snaptrace loads the register state of a snapshot into a KVM virtual processor and lets
//! the guest pull its physical memory from the snapshot one page at a time, as it touches
//! it. Each execution can be single stepped to record coverage, and the memory written
//! by the guest is rolled back to the snapshot between executions so the same snapshot
//! can be fuzzed.
//!
//! ## Roadmap of the repo:
//!
//! * [`PhysicalMemory`] - Sparse guest physical memory with dirty page tracking, page
//!   table walks and instruction decoding
//! * [`VirtualProcessor`] - A virtual processor backend. [`KvmProcessor`] is the KVM
//!   implementation.
//! * [`Partition`] - A guest: one [`PhysicalMemory`] and one [`VirtualProcessor`]
//! * [`Emulator`] - Register access by name and raw physical memory access
//! * [`Tracer`] - Runs a [`Partition`] to a terminal [`Status`], fetching missing pages
//!   from a [`PageFetcher`] and recording coverage
//! * [`Fuzzer`] - Mutates an input buffer of the guest and runs the [`Tracer`] on it,
//!   keeping inputs that reach new code and inputs that crash the guest
//!
//! # Example:
//!
//! ```no_run
//! use snaptrace::{CoverageMode, DumpSnapshot, RegisterState, TraceParams, Tracer};
//! # fn main() -> anyhow::Result<()> {
//! # let context = RegisterState::default();
//! let snapshot = DumpSnapshot::open("./snapshot/physmem")?;
//! let mut tracer = Tracer::create(
//!     snapshot,
//!     snaptrace::partition::DEFAULT_MEMORY_SIZE,
//!     snaptrace::partition::DEFAULT_KICK_INTERVAL,
//! )?;
//! tracer.set_initial_context(&context)?;
//!
//! let result = tracer.run(&TraceParams {
//!     coverage: CoverageMode::Hit,
//!     return_address: 0x7ff6_1234_5678,
//!     ..TraceParams::default()
//! })?;
//! println!("{} with {} unique addresses", result.status(), result.unique_addresses().len());
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

use anyhow::Result;
use clap::Parser;

pub use anyhow;

pub mod addrs;
pub use addrs::{Cr3, PhysAddr, VirtAddr};

pub mod page_table;
pub use page_table::{PageSize, PagingMode, Translation};

pub mod memory;
pub use memory::{AddressSpace, PhysicalMemory};

pub mod regs;
pub use regs::{Context, Register, RegisterState, SegmentRegister, TableRegister};

mod segment;
pub use segment::{DescriptorType, Privilege, Segment};

mod msr;

pub mod exit;
pub use exit::{Exception, ExitReason, ExitRecord, MemoryAccessType};

mod kvm;
mod timer;

pub mod vcpu;
pub use vcpu::{KvmProcessor, VirtualProcessor};

pub mod partition;
pub use partition::Partition;

pub mod emulator;
pub use emulator::Emulator;

pub mod snapshot;
pub use snapshot::{DumpSnapshot, PageCache, PageFetcher};

pub mod tracer;
pub use tracer::{CoverageEntry, CoverageMode, Status, TraceParams, TraceResult, Tracer};

pub mod rng;
pub use rng::Rng;

pub mod mutators;
pub use mutators::{ByteMutator, Mutator};

pub mod fuzzer;
pub use fuzzer::{FuzzParams, FuzzReport, Fuzzer, StopReason};

pub mod stats;
pub use stats::FuzzStats;

pub mod config;
pub use config::Config;

pub mod cmdline;
pub use cmdline::{CommandLineArgs, ProjectState, SubCommand};

mod commands;
pub mod utils;

#[cfg(test)]
mod testing;

/// Parse the command line and execute the requested command
///
/// # Errors
///
/// * The project directory is incomplete
/// * The executed command failed
pub fn snaptrace_main() -> Result<()> {
    // Parse the command line arguments
    let args = CommandLineArgs::parse();

    // Init the logger to, at minimum, info level
    let mut log_level = args.verbosity.log_level_filter();
    if matches!(
        log_level,
        log::LevelFilter::Off | log::LevelFilter::Warn | log::LevelFilter::Error
    ) {
        log_level = log::LevelFilter::Info;
    }

    env_logger::Builder::new().filter_level(log_level).init();

    // Get the snapshot state from the given project directory
    let project_state = cmdline::get_project_state(&args.project)?;

    match args.command {
        SubCommand::Trace(args) => commands::trace::run(&project_state, &args),
        SubCommand::Fuzz(args) => commands::fuzz::run(&project_state, &args),
        SubCommand::Translate(args) => commands::translate::run(&project_state, &args),
    }
}

/// Import the most used snaptrace types
/// ```
/// use snaptrace::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        anyhow,
        anyhow::Result,
        snaptrace_main, CoverageMode, DumpSnapshot, Emulator, FuzzParams, Fuzzer, Mutator,
        PageFetcher, Partition, RegisterState, Rng, Status, TraceParams, TraceResult, Tracer,
        VirtAddr,
    };
}
