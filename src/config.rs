//! Configuration settings of a snapshot project, read from `<project>/config.toml`

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::path::Path;
use std::time::Duration;

use crate::fuzzer::FuzzParams;
use crate::tracer::{CoverageMode, TraceParams};
use crate::addrs::parse_u64;

/// Name of the configuration file in a project directory
pub const CONFIG_FILE: &str = "config.toml";

/// Configuration settings of a snapshot project
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Guest settings
    #[serde(default)]
    pub guest: Guest,

    /// KVM backend settings
    #[serde(default)]
    pub kvm: Kvm,

    /// Defaults of the `trace` command and of each fuzzing execution
    #[serde(default)]
    pub trace: Trace,

    /// Defaults of the `fuzz` command
    #[serde(default)]
    pub fuzz: Fuzz,
}

/// Guest settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Guest {
    /// Guest physical address space reserved for the snapshot
    #[serde(default = "default_memory_size")]
    pub memory_size: u64,
}

/// KVM backend settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Kvm {
    /// Interval, in milliseconds, of the timer kicking a running guest back to the host
    #[serde(default = "default_kick_interval")]
    pub kick_interval: u64,
}

/// Trace settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Trace {
    /// Coverage recorded at each instruction
    #[serde(default)]
    pub coverage: CoverageMode,

    /// Maximum number of traced instructions. `0` is unbounded.
    #[serde(default)]
    pub limit: u64,

    /// Save the registers at each instruction
    #[serde(default)]
    pub save_context: bool,

    /// Save the disassembly of each instruction
    #[serde(default)]
    pub save_instructions: bool,

    /// Maximum duration of one trace, in seconds. `0` is unbounded.
    #[serde(default = "default_max_duration")]
    pub max_duration: u64,

    /// Addresses that stop a trace with a forbidden address, such as crash handlers.
    /// Values are integers or `0x` prefixed strings, as TOML integers stop at
    /// `i64::MAX`.
    #[serde(default, deserialize_with = "deserialize_addresses")]
    pub excluded_addresses: IndexMap<String, u64>,
}

/// Fuzz settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Fuzz {
    /// Maximum number of iterations. `0` is unbounded.
    #[serde(default)]
    pub max_iterations: u64,

    /// Maximum duration of the session, in seconds. `0` is unbounded.
    #[serde(default)]
    pub max_time: u64,

    /// Stop at the first crash
    #[serde(default)]
    pub stop_on_crash: bool,

    /// Seconds between two stats reports
    #[serde(default = "default_display_delay")]
    pub display_delay: u64,

    /// Seed of the mutation rng
    #[serde(default)]
    pub seed: Option<u64>,
}

/// An address written as a TOML integer or as a string
#[derive(Deserialize)]
#[serde(untagged)]
enum AddressValue {
    /// Plain integer
    Int(u64),

    /// Hex or decimal string
    Str(String),
}

fn deserialize_addresses<'de, D>(deserializer: D) -> Result<IndexMap<String, u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = IndexMap::<String, AddressValue>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, value)| {
            let addr = match value {
                AddressValue::Int(addr) => addr,
                AddressValue::Str(addr) => parse_u64(&addr).map_err(serde::de::Error::custom)?,
            };
            Ok((name, addr))
        })
        .collect()
}

const fn default_memory_size() -> u64 {
    8 * 1024 * 1024 * 1024
}

const fn default_kick_interval() -> u64 {
    100
}

const fn default_max_duration() -> u64 {
    60
}

const fn default_display_delay() -> u64 {
    1
}

impl Default for Guest {
    fn default() -> Self {
        Self {
            memory_size: default_memory_size(),
        }
    }
}

impl Default for Kvm {
    fn default() -> Self {
        Self {
            kick_interval: default_kick_interval(),
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            coverage: CoverageMode::default(),
            limit: 0,
            save_context: false,
            save_instructions: false,
            max_duration: default_max_duration(),
            excluded_addresses: IndexMap::new(),
        }
    }
}

impl Default for Fuzz {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            max_time: 0,
            stop_on_crash: false,
            display_delay: default_display_delay(),
            seed: None,
        }
    }
}

impl Config {
    /// Read `config.toml` from `project_dir`. A missing file gives the default config.
    ///
    /// # Errors
    ///
    /// * The file exists but can't be read or parsed
    pub fn load(project_dir: impl AsRef<Path>) -> Result<Self> {
        let path = project_dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            log::debug!("No {path:?}, using the default config");
            return Ok(Self::default());
        }

        let data =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {path:?}"))?;
        toml::from_str(&data).with_context(|| format!("Failed to parse {path:?}"))
    }

    /// Interval of the KVM kick timer
    #[must_use]
    pub fn kick_interval(&self) -> Duration {
        Duration::from_millis(self.kvm.kick_interval)
    }

    /// Trace parameters ending at `return_address`
    #[must_use]
    pub fn trace_params(&self, return_address: u64) -> TraceParams {
        TraceParams {
            coverage: self.trace.coverage,
            limit: self.trace.limit,
            save_context: self.trace.save_context,
            save_instructions: self.trace.save_instructions,
            excluded_addresses: self.trace.excluded_addresses.clone(),
            return_address,
            max_duration: Duration::from_secs(self.trace.max_duration),
        }
    }

    /// Fuzz parameters for the `input_size` bytes at `input`
    #[must_use]
    pub fn fuzz_params(&self, input: u64, input_size: usize) -> FuzzParams {
        FuzzParams {
            max_iterations: self.fuzz.max_iterations,
            max_time: Duration::from_secs(self.fuzz.max_time),
            input,
            input_size,
            stop_on_crash: self.fuzz.stop_on_crash,
            display_delay: Duration::from_secs(self.fuzz.display_delay),
            seed: self.fuzz.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = std::env::temp_dir().join(format!("snaptrace_noconfig_{}", std::process::id()));
        let config = Config::load(&dir).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.guest.memory_size, 8 << 30);
        assert_eq!(config.kick_interval(), Duration::from_millis(100));
        assert_eq!(config.trace.coverage, CoverageMode::Hit);
    }

    #[test]
    fn partial_file() {
        let dir = std::env::temp_dir().join(format!("snaptrace_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE),
            r#"
[trace]
coverage = "instrs"
limit = 1000

[trace.excluded_addresses]
KeBugCheckEx = "0xfffff80002a7e590"
panic = 0x401000

[fuzz]
seed = 1234
"#,
        )
        .unwrap();

        let config = Config::load(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(config.guest, Guest::default());
        assert_eq!(config.fuzz.display_delay, 1);

        let params = config.trace_params(0x1337);
        assert_eq!(params.coverage, CoverageMode::Instrs);
        assert_eq!(params.limit, 1000);
        assert_eq!(params.return_address, 0x1337);
        assert_eq!(params.max_duration, Duration::from_secs(60));
        assert_eq!(params.excluded_addresses["KeBugCheckEx"], 0xffff_f800_02a7_e590);
        assert_eq!(params.excluded_addresses["panic"], 0x40_1000);

        let params = config.fuzz_params(0x8000, 16);
        assert_eq!(params.seed, Some(1234));
        assert_eq!((params.input, params.input_size), (0x8000, 16));
    }
}
