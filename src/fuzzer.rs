//! The mutate, run, evaluate loop over a [`Tracer`]
//!
//! Layout of the working directory:
//!
//! ```text
//! <workdir>/corpus/<hash>.bin     inputs that reached new code
//! <workdir>/crashes/<key>.bin     input of a crashing run
//! <workdir>/crashes/<key>.json    where the input goes in the guest
//! ```

use anyhow::{Context as _, Result};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_hex::{CompactPfx, SerHex};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mutators::{ByteMutator, Mutator};
use crate::regs::RegisterState;
use crate::rng::Rng;
use crate::snapshot::PageFetcher;
use crate::stats::{FuzzStats, StatsReporter};
use crate::tracer::{Status, TraceParams, TraceResult, Tracer};
use crate::utils::hexdigest;
use crate::vcpu::VirtualProcessor;

/// Number of trailing coverage addresses identifying a crash
const CRASH_KEY_ADDRESSES: usize = 16;

/// Errors raised by the fuzzer
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The unmodified snapshot must reach its return address
    #[error("first execution failed with status {0}")]
    FirstExecutionFailed(Status),

    /// `input_size` is zero
    #[error("input size must not be zero")]
    EmptyInput,
}

/// Parameters of one [`Fuzzer::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzParams {
    /// Stop after this many mutated executions. `0` is unbounded.
    pub max_iterations: u64,

    /// Stop once this much time has elapsed. Zero is unbounded.
    pub max_time: Duration,

    /// Guest virtual address of the input buffer
    pub input: u64,

    /// Size of the input buffer in bytes
    pub input_size: usize,

    /// Stop at the first crashing execution
    pub stop_on_crash: bool,

    /// Time between two stats reports. Zero disables reporting.
    pub display_delay: Duration,

    /// Seed of the mutation rng. Seeded from `rdtsc` if absent.
    pub seed: Option<u64>,
}

/// The sidecar written next to each crashing input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashParams {
    /// Guest virtual address of the input buffer
    #[serde(with = "SerHex::<CompactPfx>")]
    pub input: u64,

    /// Size of the input buffer in bytes
    pub input_size: usize,
}

impl From<&FuzzParams> for CrashParams {
    fn from(params: &FuzzParams) -> Self {
        Self {
            input: params.input,
            input_size: params.input_size,
        }
    }
}

/// Why a fuzzing session ended
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// `max_iterations` executions were performed
    MaxIterations,

    /// `max_time` elapsed
    MaxTime,

    /// An execution crashed and `stop_on_crash` was set
    Crash,
}

/// Summary of a finished [`Fuzzer::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzReport {
    /// Final counters
    pub stats: FuzzStats,

    /// Why the session ended
    pub stop_reason: StopReason,

    /// The input of the last execution
    pub last_input: Vec<u8>,
}

/// Inputs found so far and the addresses they reached
#[derive(Debug, Default)]
struct Corpus {
    /// Every accepted input
    inputs: Vec<Vec<u8>>,

    /// Inputs waiting to be mutated
    worklist: Vec<Vec<u8>>,

    /// Every address reached by any execution
    coverage: FxHashSet<u64>,
}

impl Corpus {
    /// Add the addresses of `trace`. Returns the number of addresses never seen before.
    fn merge_coverage(&mut self, trace: &TraceResult) -> u64 {
        trace
            .unique_addresses()
            .iter()
            .filter(|addr| self.coverage.insert(**addr))
            .count() as u64
    }

    /// Next input to mutate, refilling the worklist from the corpus once it drains
    fn next_input(&mut self) -> Option<Vec<u8>> {
        if self.worklist.is_empty() {
            self.worklist.extend(self.inputs.iter().rev().cloned());
        }

        self.worklist.pop()
    }
}

/// Key identifying a crash: the status, the exception and the last addresses of the
/// trace
#[must_use]
pub fn crash_key(trace: &TraceResult) -> String {
    let coverage = trace.coverage();
    let tail: Vec<u64> = coverage[coverage.len().saturating_sub(CRASH_KEY_ADDRESSES)..]
        .iter()
        .map(|entry| entry.address)
        .collect();

    hexdigest(&(trace.status(), trace.exception(), tail))
}

/// Resize `input` to `size` bytes, zero padding short inputs
fn fit_input(mut input: Vec<u8>, size: usize) -> Vec<u8> {
    input.resize(size, 0);
    input
}

/// Drives a [`Tracer`] with mutated inputs
#[derive(Debug)]
pub struct Fuzzer<M: Mutator = ByteMutator> {
    /// Root of the `corpus` and `crashes` directories
    workdir: PathBuf,

    /// Mutation policy
    mutator: M,
}

impl Fuzzer<ByteMutator> {
    /// Create a fuzzer using [`ByteMutator`], creating the working directories if needed
    ///
    /// # Errors
    ///
    /// * The `corpus` or `crashes` directory could not be created
    pub fn new(workdir: impl AsRef<Path>) -> Result<Self> {
        Self::with_mutator(workdir, ByteMutator::default())
    }
}

impl<M: Mutator> Fuzzer<M> {
    /// Create a fuzzer with a custom mutation policy, creating the working directories
    /// if needed
    ///
    /// # Errors
    ///
    /// * The `corpus` or `crashes` directory could not be created
    pub fn with_mutator(workdir: impl AsRef<Path>, mutator: M) -> Result<Self> {
        let workdir = workdir.as_ref().to_path_buf();

        for dir in ["corpus", "crashes"] {
            let path = workdir.join(dir);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {path:?}"))?;
        }

        Ok(Self { workdir, mutator })
    }

    /// Directory of inputs that reached new code
    pub fn corpus_dir(&self) -> PathBuf {
        self.workdir.join("corpus")
    }

    /// Directory of crashing inputs
    pub fn crash_dir(&self) -> PathBuf {
        self.workdir.join("crashes")
    }

    /// Read every `.bin` file of the corpus directory, resized to `input_size`
    fn load_corpus(&self, input_size: usize) -> Result<Vec<Vec<u8>>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(self.corpus_dir())? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "bin") {
                paths.push(path);
            }
        }

        // Directory order is not stable
        paths.sort();

        paths
            .iter()
            .map(|path| {
                let data = std::fs::read(path).with_context(|| format!("Failed to read {path:?}"))?;
                Ok(fit_input(data, input_size))
            })
            .collect()
    }

    /// Accept `input` into the corpus, writing it to disk once
    fn save_to_corpus(&self, corpus: &mut Corpus, input: &[u8]) -> Result<()> {
        let path = self.corpus_dir().join(format!("{}.bin", hexdigest(input)));
        if !path.exists() {
            std::fs::write(&path, input).with_context(|| format!("Failed to write {path:?}"))?;
        }

        corpus.inputs.push(input.to_vec());
        Ok(())
    }

    /// Write a crashing input and its sidecar unless its key was already seen. Returns
    /// `true` for a new crash.
    fn save_crash(&self, params: &FuzzParams, trace: &TraceResult, input: &[u8]) -> Result<bool> {
        let key = crash_key(trace);
        let path = self.crash_dir().join(format!("{key}.bin"));
        if path.exists() {
            return Ok(false);
        }

        log::info!("New crash ({}), saving input to {path:?}", trace.status());
        std::fs::write(&path, input).with_context(|| format!("Failed to write {path:?}"))?;

        let sidecar = serde_json::to_vec_pretty(&CrashParams::from(params))?;
        let path = self.crash_dir().join(format!("{key}.json"));
        std::fs::write(&path, sidecar).with_context(|| format!("Failed to write {path:?}"))?;

        Ok(true)
    }

    /// Fuzz the input buffer of the snapshot loaded in `tracer`
    ///
    /// Each iteration restores `context` and the snapshot memory, writes a mutated input
    /// at `params.input` and traces with `trace_params`. Crashing inputs are written to
    /// the `crashes` directory and inputs reaching new addresses to the `corpus`
    /// directory.
    ///
    /// # Errors
    ///
    /// * The unmodified snapshot does not end in [`Status::Success`]
    /// * The input buffer could not be read or written in the guest
    /// * Host level tracer failures or I/O errors in the working directory
    pub fn run<F: PageFetcher, P: VirtualProcessor>(
        &mut self,
        tracer: &mut Tracer<F, P>,
        context: &RegisterState,
        trace_params: &TraceParams,
        params: &FuzzParams,
    ) -> Result<FuzzReport> {
        if params.input_size == 0 {
            return Err(Error::EmptyInput.into());
        }

        let mut rng = params.seed.map_or_else(Rng::from_rdtsc, Rng::from_seed);
        let mut reporter = StatsReporter::new(params.display_delay);
        let mut stats = FuzzStats::default();
        let mut corpus = Corpus {
            worklist: self.load_corpus(params.input_size)?,
            ..Corpus::default()
        };
        corpus.worklist.reverse();
        log::info!("Loaded {} input(s) from {:?}", corpus.worklist.len(), self.corpus_dir());

        // The untouched snapshot maps its pages and gives the baseline coverage
        tracer.set_initial_context(context)?;
        let trace = tracer.run(trace_params)?;
        if trace.status() != Status::Success {
            return Err(Error::FirstExecutionFailed(trace.status()).into());
        }

        tracer.restore_snapshot()?;
        tracer.set_initial_context(context)?;
        let seed_input = tracer
            .read_virtual(params.input, params.input_size)
            .context("Failed to read the input buffer")?;

        stats.new_coverage += corpus.merge_coverage(&trace);
        self.save_to_corpus(&mut corpus, &seed_input)?;
        log::info!(
            "First execution reached {} addresses, fuzzing {} bytes at {:#x}",
            corpus.coverage.len(),
            params.input_size,
            params.input
        );

        let (stop_reason, last_input) = loop {
            tracer.set_initial_context(context)?;
            tracer.restore_snapshot()?;

            // The seed input is always part of the corpus
            let mut input = corpus
                .next_input()
                .unwrap_or_else(|| seed_input.clone());
            let mutations = self.mutator.mutate(&mut input, &corpus.inputs, &mut rng);
            log::trace!("Mutations: {mutations:?}");

            tracer
                .write_virtual(params.input, &input)
                .context("Failed to write the fuzz input")?;

            let trace = tracer.run(trace_params)?;
            stats.iterations += 1;

            let new = corpus.merge_coverage(&trace);
            stats.new_coverage += new;

            let status = trace.status();
            if status.is_crash() {
                stats.crashes += 1;
                if self.save_crash(params, &trace, &input)? {
                    stats.unique_crashes += 1;
                }
            } else if status == Status::Success && new > 0 {
                log::info!("Discovered {new} new address(es), adding input to the corpus");
                self.save_to_corpus(&mut corpus, &input)?;
            } else if status == Status::Error {
                log::warn!("Execution ended with an error at iteration {}", stats.iterations);
            }

            stats.coverage = corpus.coverage.len() as u64;
            stats.code_pages = tracer.code_pages();
            stats.data_pages = tracer.data_pages();
            stats.corpus_size = corpus.inputs.len() as u64;
            reporter.update(&mut stats);

            if status.is_crash() && params.stop_on_crash {
                break (StopReason::Crash, input);
            }

            if params.max_iterations != 0 && stats.iterations >= params.max_iterations {
                break (StopReason::MaxIterations, input);
            }

            if !params.max_time.is_zero() && reporter.elapsed() >= params.max_time {
                break (StopReason::MaxTime, input);
            }
        };

        stats.coverage = corpus.coverage.len() as u64;
        stats.corpus_size = corpus.inputs.len() as u64;
        stats.elapsed = reporter.elapsed();

        log::info!(
            "Fuzzing stopped ({stop_reason:?}) after {:?} and {} iteration(s)",
            stats.elapsed,
            stats.iterations
        );

        Ok(FuzzReport {
            stats,
            stop_reason,
            last_input,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PhysicalMemory;
    use crate::partition::Partition;
    use crate::snapshot::PageCache;
    use crate::testing::ScriptedProcessor;
    use crate::tracer::CoverageMode;

    /// Crash only for inputs starting with `AB`:
    ///
    /// ```text
    /// 0x1000: cmp byte [0x8000], 0x41
    /// 0x1008: jne 0x101a
    /// 0x100a: cmp byte [0x8001], 0x42
    /// 0x1012: jne 0x101a
    /// 0x1014: ud2
    /// 0x1016: nop (x4)
    /// 0x101a: hlt
    /// ```
    const CHECK: &[u8] = &[
        0x80, 0x3c, 0x25, 0x00, 0x80, 0x00, 0x00, 0x41, // cmp
        0x75, 0x10, // jne
        0x80, 0x3c, 0x25, 0x01, 0x80, 0x00, 0x00, 0x42, // cmp
        0x75, 0x06, // jne
        0x0f, 0x0b, // ud2
        0x90, 0x90, 0x90, 0x90, // nop
        0xf4, // hlt
    ];

    /// Writes the next scripted input, leaving the input alone once the script is done
    struct Script(Vec<[u8; 4]>);

    impl Mutator for Script {
        fn mutate(&mut self, input: &mut [u8], _corpus: &[Vec<u8>], _rng: &mut Rng) -> Vec<String> {
            if self.0.is_empty() {
                return Vec::new();
            }

            let next = self.0.remove(0);
            input.copy_from_slice(&next);
            vec!["Script".to_string()]
        }
    }

    fn workdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("snaptrace_fuzz_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn setup(rip: u64) -> (Tracer<PageCache, ScriptedProcessor>, RegisterState) {
        let mut snapshot = PageCache::new();
        snapshot.insert(0x1000, CHECK);
        snapshot.insert(0x8000, &[0; 0x1000]);

        let memory = PhysicalMemory::new(0x10_0000).unwrap();
        let mut tracer = Tracer::new(
            Partition::with_processor(ScriptedProcessor::new(), memory),
            snapshot,
        );

        let mut context = tracer.partition_mut().state().unwrap();
        context.rip = rip;
        (tracer, context)
    }

    fn trace_params() -> TraceParams {
        TraceParams {
            coverage: CoverageMode::Hit,
            return_address: 0x101a,
            ..TraceParams::default()
        }
    }

    fn fuzz_params(max_iterations: u64, stop_on_crash: bool) -> FuzzParams {
        FuzzParams {
            max_iterations,
            input: 0x8000,
            input_size: 4,
            stop_on_crash,
            seed: Some(0x5eed),
            ..FuzzParams::default()
        }
    }

    fn files(dir: &Path, extension: &str) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().unwrap() == extension)
            .collect();
        files.sort();
        files
    }

    #[test]
    fn same_seed_same_input() {
        let run = |name| {
            let dir = workdir(name);
            let (mut tracer, context) = setup(0x1000);
            let report = Fuzzer::new(&dir)
                .unwrap()
                .run(&mut tracer, &context, &trace_params(), &fuzz_params(1, false))
                .unwrap();
            std::fs::remove_dir_all(&dir).unwrap();
            report
        };

        let first = run("seed_a");
        let second = run("seed_b");
        assert_eq!(first.last_input, second.last_input);
        assert_eq!(first.last_input.len(), 4);
        assert_eq!(first.stop_reason, StopReason::MaxIterations);
        assert_eq!(first.stats.iterations, 1);
    }

    #[test]
    fn new_coverage_then_crash() {
        let dir = workdir("progress");
        let (mut tracer, context) = setup(0x1000);

        let script = Script(vec![*b"A\0\0\0", *b"A\0\0\0", *b"AB\0\0"]);
        let mut fuzzer = Fuzzer::with_mutator(&dir, script).unwrap();
        let report = fuzzer
            .run(&mut tracer, &context, &trace_params(), &fuzz_params(10, true))
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Crash);
        assert_eq!(report.last_input, b"AB\0\0");
        assert_eq!(report.stats.iterations, 3);
        assert_eq!((report.stats.crashes, report.stats.unique_crashes), (1, 1));

        // Seed, then `A`. The repeated `A` adds nothing.
        assert_eq!(report.stats.corpus_size, 2);
        assert_eq!(files(&fuzzer.corpus_dir(), "bin").len(), 2);

        // 0x1000 0x1008 0x101a, then 0x100a 0x1012, then 0x1014
        assert_eq!(report.stats.coverage, 6);
        assert_eq!(report.stats.code_pages, 1);
        assert_eq!(report.stats.data_pages, 1);

        let crashes = files(&fuzzer.crash_dir(), "bin");
        assert_eq!(crashes.len(), 1);
        assert_eq!(std::fs::read(&crashes[0]).unwrap(), b"AB\0\0");

        let sidecar = std::fs::read(crashes[0].with_extension("json")).unwrap();
        let sidecar: CrashParams = serde_json::from_slice(&sidecar).unwrap();
        assert_eq!(sidecar, CrashParams { input: 0x8000, input_size: 4 });

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn crash_keys_are_written_once() {
        let dir = workdir("dedup");
        let (mut tracer, context) = setup(0x1000);

        let script = Script(vec![*b"AB\0\0", *b"AB\x01\0", *b"AB\x02\0"]);
        let mut fuzzer = Fuzzer::with_mutator(&dir, script).unwrap();
        let report = fuzzer
            .run(&mut tracer, &context, &trace_params(), &fuzz_params(3, false))
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::MaxIterations);
        assert_eq!((report.stats.crashes, report.stats.unique_crashes), (3, 1));

        // The first input of the crash is kept
        let crashes = files(&fuzzer.crash_dir(), "bin");
        assert_eq!(crashes.len(), 1);
        assert_eq!(std::fs::read(&crashes[0]).unwrap(), b"AB\0\0");
        assert_eq!(files(&fuzzer.crash_dir(), "json").len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corpus_files_are_fuzzed_first() {
        let dir = workdir("corpus");
        let mut fuzzer = Fuzzer::with_mutator(&dir, Script(Vec::new())).unwrap();

        // Short inputs are zero padded to the input size
        std::fs::write(fuzzer.corpus_dir().join("crash.bin"), b"AB").unwrap();
        std::fs::write(fuzzer.corpus_dir().join("notes.txt"), b"AB").unwrap();

        let (mut tracer, context) = setup(0x1000);
        let report = fuzzer
            .run(&mut tracer, &context, &trace_params(), &fuzz_params(0, true))
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Crash);
        assert_eq!(report.last_input, b"AB\0\0");
        assert_eq!(report.stats.iterations, 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn time_bound() {
        let dir = workdir("time");
        let (mut tracer, context) = setup(0x1000);

        // The seed input never crashes and is never mutated
        let mut fuzzer = Fuzzer::with_mutator(&dir, Script(Vec::new())).unwrap();
        let params = FuzzParams {
            max_time: Duration::from_millis(50),
            ..fuzz_params(0, true)
        };
        let report = fuzzer
            .run(&mut tracer, &context, &trace_params(), &params)
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::MaxTime);
        assert!(report.stats.iterations >= 1);
        assert!(report.stats.elapsed >= params.max_time);
        assert_eq!(report.stats.crashes, 0);
        assert_eq!(report.last_input, [0; 4]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn first_execution_must_succeed() {
        let dir = workdir("first");

        // Start on the ud2
        let (mut tracer, context) = setup(0x1014);
        let err = Fuzzer::new(&dir)
            .unwrap()
            .run(&mut tracer, &context, &trace_params(), &fuzz_params(1, false))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::FirstExecutionFailed(Status::Crash))
        );

        let (mut tracer, context) = setup(0x1000);
        let mut params = fuzz_params(1, false);
        params.input_size = 0;
        let err = Fuzzer::new(&dir)
            .unwrap()
            .run(&mut tracer, &context, &trace_params(), &params)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::EmptyInput));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
