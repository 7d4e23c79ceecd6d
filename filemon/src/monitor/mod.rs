//! Live monitoring modules
//!
//! Glue between the kernel programs and the terminal:
//! - eBPF program loading and attachment
//! - Ring buffer record decoding and output
//! - Counter diagnostics

pub mod diagnostics;
pub mod ebpf_setup;
pub mod event_display;
pub mod event_processor;

// Re-export common types
pub use diagnostics::{count_orphans, print_counter_diagnostics, read_counters};
pub use ebpf_setup::{
    attach_unlink, attach_write_tracepoints, configure_filter, init_ebpf_logger,
    load_ebpf_program,
};
pub use event_display::{display_statistics, display_summary, format_event};
pub use event_processor::{decode, EventProcessor, FileRecord};
