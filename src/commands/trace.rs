//! Executing the `trace` command

use anyhow::{Context, Result};

use crate::cmdline::{self, ProjectState};
use crate::snapshot::DumpSnapshot;
use crate::tracer::Tracer;

/// Trace one execution of the snapshot and save the result
///
/// # Errors
///
/// * The physical memory dump can't be opened or KVM is unavailable
/// * Host level failures during the trace
/// * The trace could not be written
pub fn run(project_state: &ProjectState, args: &cmdline::Trace) -> Result<()> {
    let ProjectState {
        path,
        context,
        physical_memory,
        config,
    } = project_state;

    let mut params = config.trace_params(context.return_address.unwrap_or(0));
    if let Some(coverage) = args.coverage {
        params.coverage = coverage;
    }
    if let Some(limit) = args.limit {
        params.limit = limit;
    }
    if let Some(timeout) = args.timeout {
        params.max_duration = timeout;
    }
    params.save_context |= args.save_context;
    params.save_instructions |= args.save_instructions;

    if params.return_address == 0 && params.limit == 0 {
        log::warn!("No return address and no limit: the trace only stops on a fault or timeout");
    }

    let snapshot = DumpSnapshot::open(physical_memory)?;
    let mut tracer = Tracer::create(snapshot, config.guest.memory_size, config.kick_interval())?;
    tracer.set_initial_context(&context.regs)?;

    let result = tracer.run(&params)?;

    println!("Status:           {}", result.status());
    if let Some(vector) = result.exception() {
        println!("Exception:        {vector}");
    }
    println!("Coverage entries: {}", result.coverage().len());
    println!("Unique addresses: {}", result.unique_addresses().len());
    println!("Code pages:       {}", tracer.code_pages());
    println!("Data pages:       {}", tracer.data_pages());
    println!("Elapsed:          {:?}", result.elapsed());

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| path.join("traces").join("trace.json"));
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {parent:?}"))?;
    }

    result.save(&output)?;
    log::info!("Trace written to {output:?}");

    Ok(())
}
