//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled kernel programs with the configured map sizes and
//! attaches them to their hook points.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load bytecode, sizing the ring and in-flight maps
//! - [`configure_filter()`] - Write the target and own PID into `CONFIG`
//! - [`attach_unlink()`] - Attach `do_unlinkat` observation per [`ProbeMode`]
//! - [`attach_write_tracepoints()`] - Attach `sys_{enter,exit}_write`
//!
//! ## Attachment Points
//!
//! - **Fexit**: `do_unlinkat` (combined observation, needs BTF)
//! - **Kprobe / Kretprobe**: `do_unlinkat` (paired observation)
//! - **Tracepoint**: `syscalls/sys_enter_write`, `syscalls/sys_exit_write`

use anyhow::{Context, Result};
use aya::{
    include_bytes_aligned,
    maps::HashMap,
    programs::{FExit, KProbe, TracePoint},
    Btf, Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use filemon_common::{CONFIG_SELF_PID, CONFIG_TARGET_PID};
use log::{info, warn};

use crate::config::MonitorConfig;
use crate::domain::{MonitorError, Pid, ProbeMode};

/// Kernel function observed for deletions
pub const UNLINK_SYMBOL: &str = "do_unlinkat";

/// Load the eBPF program binary, sized per `config`
///
/// Always uses the release build: debug builds pull in formatting code the
/// BPF linker rejects.
///
/// # Errors
/// Returns an error if the eBPF program binary cannot be loaded
pub fn load_ebpf_program(config: &MonitorConfig) -> Result<Ebpf> {
    let bpf = EbpfLoader::new()
        .set_max_entries("EVENTS", config.ring_bytes)
        .set_max_entries("INFLIGHT_UNLINK", config.table_entries)
        .set_max_entries("INFLIGHT_WRITE", config.table_entries)
        .load(include_bytes_aligned!("../../../target/bpfel-unknown-none/release/filemon"))
        .map_err(|e| MonitorError::EbpfLoadFailed(e.to_string()))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Write the PID filter into the `CONFIG` map
///
/// # Errors
/// Returns an error if the `CONFIG` map is missing or cannot be written
pub fn configure_filter(bpf: &mut Ebpf, target: Option<Pid>, own: Pid) -> Result<()> {
    let mut config_map: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map_mut("CONFIG").ok_or(MonitorError::MapNotFound("CONFIG"))?)?;
    config_map.insert(CONFIG_TARGET_PID, target.map_or(0, |p| u64::from(p.0)), 0)?;
    config_map.insert(CONFIG_SELF_PID, u64::from(own.0), 0)?;
    match target {
        Some(pid) => info!("✓ Set target PID: {pid}"),
        None => info!("✓ Monitoring all processes"),
    }
    Ok(())
}

/// Attach deletion monitoring. Returns the mode actually in effect
/// (never [`ProbeMode::Auto`]).
///
/// # Errors
/// Returns an error if the requested mode cannot be attached (for `auto`:
/// if neither mode can)
pub fn attach_unlink(bpf: &mut Ebpf, mode: ProbeMode) -> Result<ProbeMode> {
    match mode {
        ProbeMode::Combined => {
            attach_fexit(bpf)?;
            Ok(ProbeMode::Combined)
        }
        ProbeMode::Paired => {
            attach_kprobes(bpf)?;
            Ok(ProbeMode::Paired)
        }
        ProbeMode::Auto => match attach_fexit(bpf) {
            Ok(()) => Ok(ProbeMode::Combined),
            Err(e) => {
                warn!("⚠️  fexit unavailable ({e:#}), falling back to kprobe/kretprobe");
                attach_kprobes(bpf)?;
                Ok(ProbeMode::Paired)
            }
        },
    }
}

fn attach_fexit(bpf: &mut Ebpf) -> Result<()> {
    let btf = Btf::from_sys_fs().context("Kernel BTF not available")?;
    let program: &mut FExit = bpf
        .program_mut("unlink_fexit")
        .ok_or(MonitorError::ProgramNotFound("unlink_fexit"))?
        .try_into()?;
    program.load(UNLINK_SYMBOL, &btf)?;
    program.attach().map_err(|e| MonitorError::AttachFailed {
        program: "unlink_fexit",
        target: UNLINK_SYMBOL.to_string(),
        error: e.to_string(),
    })?;
    info!("✓ Attached fexit: {UNLINK_SYMBOL}");
    Ok(())
}

fn attach_kprobes(bpf: &mut Ebpf) -> Result<()> {
    for name in ["unlink_entry", "unlink_exit"] {
        let program: &mut KProbe =
            bpf.program_mut(name).ok_or(MonitorError::ProgramNotFound(name))?.try_into()?;
        program.load()?;
        program.attach(UNLINK_SYMBOL, 0).map_err(|e| MonitorError::AttachFailed {
            program: name,
            target: UNLINK_SYMBOL.to_string(),
            error: e.to_string(),
        })?;
        info!("✓ Attached {name}: {UNLINK_SYMBOL}");
    }
    Ok(())
}

/// Attach the `write(2)` tracepoint pair
///
/// # Errors
/// Returns an error if either tracepoint cannot be loaded or attached
pub fn attach_write_tracepoints(bpf: &mut Ebpf) -> Result<()> {
    for (name, event) in [("write_enter", "sys_enter_write"), ("write_exit", "sys_exit_write")] {
        let program: &mut TracePoint =
            bpf.program_mut(name).ok_or(MonitorError::ProgramNotFound(name))?.try_into()?;
        program.load()?;
        program.attach("syscalls", event).map_err(|e| MonitorError::AttachFailed {
            program: name,
            target: format!("syscalls/{event}"),
            error: e.to_string(),
        })?;
        info!("✓ Attached tracepoint: syscalls/{event}");
    }
    Ok(())
}
