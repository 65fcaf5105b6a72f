//! Executing the `fuzz` command

use anyhow::Result;

use crate::cmdline::{self, Error, ProjectState};
use crate::fuzzer::Fuzzer;
use crate::snapshot::DumpSnapshot;
use crate::tracer::Tracer;
use crate::utils::pretty_size;

/// Fuzz the input buffer of the snapshot with the project directory as working directory
///
/// # Errors
///
/// * `context.json` has no return address
/// * The physical memory dump can't be opened or KVM is unavailable
/// * The first execution of the snapshot fails or host level failures while fuzzing
pub fn run(project_state: &ProjectState, args: &cmdline::Fuzz) -> Result<()> {
    let ProjectState {
        path,
        context,
        physical_memory,
        config,
    } = project_state;

    let Some(return_address) = context.return_address else {
        return Err(Error::MissingReturnAddress.into());
    };
    let trace_params = config.trace_params(return_address);

    let mut params = config.fuzz_params(args.input, args.input_size);
    if let Some(max_iterations) = args.max_iterations {
        params.max_iterations = max_iterations;
    }
    if let Some(max_time) = args.max_time {
        params.max_time = max_time;
    }
    if let Some(display_delay) = args.display_delay {
        params.display_delay = display_delay;
    }
    if args.seed.is_some() {
        params.seed = args.seed;
    }
    params.stop_on_crash |= args.stop_on_crash;

    let snapshot = DumpSnapshot::open(physical_memory)?;
    let mut tracer = Tracer::create(snapshot, config.guest.memory_size, config.kick_interval())?;

    let mut fuzzer = Fuzzer::new(path)?;
    let report = fuzzer.run(&mut tracer, &context.regs, &trace_params, &params)?;

    let stats = &report.stats;
    println!("Stopped:      {:?}", report.stop_reason);
    println!("Iterations:   {}", stats.iterations);
    println!("Coverage:     {}", stats.coverage);
    println!("Corpus:       {}", stats.corpus_size);
    println!("Crashes:      {} ({} unique)", stats.crashes, stats.unique_crashes);
    println!(
        "Memory:       code {} data {}",
        pretty_size(stats.code_pages * crate::addrs::PAGE_SIZE),
        pretty_size(stats.data_pages * crate::addrs::PAGE_SIZE)
    );
    println!("Elapsed:      {:?}", stats.elapsed);

    Ok(())
}
