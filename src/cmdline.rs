//! Command line arguments and the project directory they point to

use anyhow::{Context as _, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::addrs::parse_u64;
use crate::config::Config;
use crate::regs::RegisterState;
use crate::tracer::CoverageMode;

/// Number of seconds in a minute
const SECONDS_IN_MINUTE: u64 = 60;

/// Number of seconds in an hour
const SECONDS_IN_HOUR: u64 = 60 * 60;

/// Register state of the snapshot
pub const CONTEXT_FILE: &str = "context.json";

/// Raw physical memory dump of the snapshot
pub const PHYSMEM_FILE: &str = "physmem";

/// Errors while reading the command line or the project directory
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Register state (`context.json`) missing from the project dir
    #[error("Register state (context.json) missing from project dir")]
    RegisterStateMissing,

    /// Physical memory (`physmem`) missing from the project dir
    #[error("Physical memory (physmem) missing from project dir")]
    PhysicalMemoryMissing,

    /// Unknown timeout format given
    #[error("Unknown timeout format given. Valid types: [0-9]+(ns|us|ms|s|m|h)")]
    InvalidTimeoutFormat(String),

    /// Fuzzing needs an address to stop at
    #[error("No return address in context.json")]
    MissingReturnAddress,
}

/// Contents of `context.json`: the register state plus where the traced code returns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Initial register state
    #[serde(flatten)]
    pub regs: RegisterState,

    /// Reaching this address ends a trace successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_address: Option<u64>,
}

/// The files associated with the snapshot state
#[derive(Debug)]
pub struct ProjectState {
    /// The path to this project
    pub(crate) path: PathBuf,

    /// Parsed `context.json`
    pub(crate) context: ProjectContext,

    /// Path to the physical memory dump of the snapshot
    pub(crate) physical_memory: PathBuf,

    /// The configuration settings for this project
    pub(crate) config: Config,
}

impl ProjectState {
    /// The project directory
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Trace and fuzz a KVM snapshot
#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct CommandLineArgs {
    /// Path to the directory containing `context.json`, `physmem` and an optional
    /// `config.toml`
    #[clap(short, long, default_value = "./snapshot", global = true)]
    pub(crate) project: PathBuf,

    /// Verbosity to print information messages
    #[clap(flatten)]
    pub(crate) verbosity: clap_verbosity_flag::Verbosity,

    /// Command to execute
    #[clap(subcommand)]
    pub(crate) command: SubCommand,
}

/// Subcommands available for the command line
#[derive(Parser, Debug)]
pub enum SubCommand {
    /// Trace one execution of the snapshot
    Trace(Trace),

    /// Fuzz an input buffer of the snapshot
    Fuzz(Fuzz),

    /// Translate a virtual address with the page tables of the snapshot
    Translate(Translate),
}

/// Trace subcommand
#[derive(Parser, Debug)]
pub struct Trace {
    /// What to record for each instruction: no, hit or instrs
    #[clap(short, long)]
    pub(crate) coverage: Option<CoverageMode>,

    /// Stop after this many instructions
    #[clap(short, long)]
    pub(crate) limit: Option<u64>,

    /// Save the registers at each instruction
    #[clap(long)]
    pub(crate) save_context: bool,

    /// Save the disassembly of each instruction
    #[clap(long)]
    pub(crate) save_instructions: bool,

    /// Maximum duration of the trace. [0-9]+(ns|us|ms|s|m|h)
    #[clap(long, value_parser = parse_timeout)]
    pub(crate) timeout: Option<Duration>,

    /// Where to write the trace. Defaults to `<project>/traces/trace.json`
    #[clap(short, long)]
    pub(crate) output: Option<PathBuf>,
}

/// Fuzz subcommand
#[derive(Parser, Debug)]
pub struct Fuzz {
    /// Stop after this many iterations
    #[clap(long)]
    pub(crate) max_iterations: Option<u64>,

    /// Stop after this much time. [0-9]+(ns|us|ms|s|m|h)
    #[clap(long, value_parser = parse_timeout)]
    pub(crate) max_time: Option<Duration>,

    /// Guest virtual address of the input buffer
    #[clap(short, long, value_parser = parse_address)]
    pub(crate) input: u64,

    /// Size of the input buffer in bytes
    #[clap(short = 's', long)]
    pub(crate) input_size: usize,

    /// Stop after the first crash is found
    #[clap(long)]
    pub(crate) stop_on_crash: bool,

    /// Time between two stats reports. [0-9]+(ns|us|ms|s|m|h)
    #[clap(long, value_parser = parse_timeout)]
    pub(crate) display_delay: Option<Duration>,

    /// Seed of the mutation rng, for reproducible sessions
    #[clap(long)]
    pub(crate) seed: Option<u64>,
}

/// Translate subcommand
#[derive(Parser, Debug)]
pub struct Translate {
    /// Virtual address to translate
    #[clap(value_parser = parse_address)]
    pub(crate) address: u64,

    /// Page table root to use instead of the one of the snapshot
    #[clap(long, value_parser = parse_address)]
    pub(crate) cr3: Option<u64>,
}

/// Get the [`ProjectState`] from the given project directory
///
/// # Errors
///
/// * `context.json` or `physmem` is missing
/// * `context.json` or `config.toml` failed to parse
pub fn get_project_state(dir: &Path) -> Result<ProjectState> {
    let context_path = dir.join(CONTEXT_FILE);
    if !context_path.exists() {
        return Err(Error::RegisterStateMissing.into());
    }

    let physical_memory = dir.join(PHYSMEM_FILE);
    if !physical_memory.exists() {
        return Err(Error::PhysicalMemoryMissing.into());
    }

    let data = std::fs::read_to_string(&context_path)
        .with_context(|| format!("Failed to read {context_path:?}"))?;
    let context: ProjectContext = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse {context_path:?}"))?;

    let config = Config::load(dir)?;

    log::info!(
        "Loaded project {dir:?}: rip {:#x}, cr3 {:#x}",
        context.regs.rip,
        context.regs.cr3
    );

    Ok(ProjectState {
        path: dir.to_path_buf(),
        context,
        physical_memory,
        config,
    })
}

/// Parse an address given as `0x` prefixed hex or decimal
///
/// # Errors
///
/// * `input` is not a number
pub fn parse_address(input: &str) -> anyhow::Result<u64> {
    Ok(parse_u64(input)?)
}

/// Parse a duration of the form `[0-9]+(ns|us|ms|s|m|h)`
///
/// # Errors
///
/// * The number or the unit is invalid
pub fn parse_timeout(input: &str) -> anyhow::Result<Duration> {
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let number = number
        .parse::<u64>()
        .map_err(|_| Error::InvalidTimeoutFormat(input.to_string()))?;

    let invalid = || Error::InvalidTimeoutFormat(input.to_string());
    let res = match unit.to_ascii_lowercase().as_str() {
        "ns" => Duration::from_nanos(number),
        "us" => Duration::from_micros(number),
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number.checked_mul(SECONDS_IN_MINUTE).ok_or_else(invalid)?),
        "h" => Duration::from_secs(number.checked_mul(SECONDS_IN_HOUR).ok_or_else(invalid)?),
        _ => return Err(invalid().into()),
    };

    Ok(res)
}
