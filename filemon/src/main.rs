//! # filemon - Main Entry Point
//!
//! Supports two operational modes:
//! - **Run** (`filemon run`): attach to the kernel and stream events (root)
//! - **Simulate** (`filemon simulate`): drive the in-process pipeline

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use clap::Parser;
use log::{info, warn};
use std::io::{self, BufWriter};
use std::time::{Duration, Instant};

use filemon::cli::{Args, Command, RunArgs, SimulateArgs};
use filemon::config::{MonitorConfig, SimulationConfig};
use filemon::domain::Pid;
use filemon::monitor::{
    attach_unlink, attach_write_tracepoints, configure_filter, display_statistics,
    display_summary, init_ebpf_logger, load_ebpf_program, print_counter_diagnostics,
    EventProcessor,
};
use filemon::preflight::run_preflight_checks;
use filemon::simulate::run_simulation;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("invalid configuration") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Run(ref run_args) => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
            runtime.block_on(run_monitor(run_args, args.quiet))
        }
        Command::Simulate(ref sim_args) => simulate(sim_args, args.quiet),
    }
}

fn simulate(args: &SimulateArgs, quiet: bool) -> Result<()> {
    let config = SimulationConfig::from_args(args)?;
    let stdout = io::stdout().lock();
    let mut processor = EventProcessor::new(BufWriter::new(stdout), config.json);

    let started = Instant::now();
    let report = run_simulation(&config, &mut processor)?;

    if !quiet {
        display_summary(
            "simulation finished",
            started.elapsed().as_secs_f64(),
            processor.event_count,
            processor.degraded_count,
        );
        display_statistics(&report.counters, report.orphans);
    }
    Ok(())
}

async fn run_monitor(args: &RunArgs, quiet: bool) -> Result<()> {
    let config = MonitorConfig::from_args(args)?;

    // Run pre-flight checks before anything else
    run_preflight_checks(&config)?;

    if !quiet {
        println!("filemon v{}", env!("CARGO_PKG_VERSION"));
        match config.target {
            Some(pid) => println!("target: {pid}"),
            None => println!("target: all processes"),
        }
        println!("ring: {} bytes (~{} records)", config.ring_bytes, config.ring_records());
    }

    // ── Load eBPF and attach ────────────────────────────────────────────
    let mut bpf = load_ebpf_program(&config)?;
    init_ebpf_logger(&mut bpf);

    configure_filter(&mut bpf, config.target, Pid(std::process::id()))?;
    let mode = attach_unlink(&mut bpf, config.mode)?;
    if config.writes {
        attach_write_tracepoints(&mut bpf)?;
    }

    if !quiet {
        println!("mode: {mode}");
    }

    let mut ring_buf = RingBuf::try_from(bpf.take_map("EVENTS").context("map not found")?)?;

    let stdout = io::stdout().lock();
    let mut processor = EventProcessor::new(BufWriter::new(stdout), config.json);

    // Status tracking
    let mut last_status_time = Instant::now();

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();

    // Track why we exited the loop
    let mut exit_reason = "interrupted";

    // Main event processing loop
    loop {
        if let Some(limit) = config.duration {
            if started.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        if processor.event_count == 0 && last_status_time.elapsed() > Duration::from_secs(10) {
            info!("Still waiting for events... (no events received yet)");
            last_status_time = Instant::now();
        }

        // Process all available events
        while let Some(item) = ring_buf.next() {
            processor.process_bytes(&item)?;
        }
        processor.flush()?;

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    // Drain whatever arrived after the last poll
    while let Some(item) = ring_buf.next() {
        processor.process_bytes(&item)?;
    }
    processor.flush()?;

    if !quiet {
        display_summary(
            exit_reason,
            started.elapsed().as_secs_f64(),
            processor.event_count,
            processor.degraded_count,
        );
        if let Err(e) = print_counter_diagnostics(&bpf) {
            warn!("Could not read counters: {e}");
        }
    }

    Ok(())
}
