//! # filemon - eBPF-based File Operation Monitor
//!
//! filemon reports file deletions (and optionally `write(2)` calls) as they
//! happen, attributing each to the process that made it. Kernel programs
//! capture each operation's arguments and outcome and deliver one fixed-size
//! record per completed call through a ring buffer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Any process on the system                   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ unlink / write
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • Fexit: do_unlinkat (combined observation)                    │
//! │  • Kprobe/Kretprobe: do_unlinkat (paired observation)           │
//! │  • Tracepoints: sys_enter_write / sys_exit_write                │
//! │                                                                 │
//! │  entry ──put──▶ INFLIGHT_* ──take──▶ exit ──reserve/commit──┐   │
//! └─────────────────────────────────────────────────────────────┼───┘
//!                                                  EVENTS ring  │
//!                                                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     filemon (This Crate)                        │
//! │   monitor::ebpf_setup ─▶ ring buffer poll ─▶ EventProcessor     │
//! │                                               (text / JSON)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`monitor`]: eBPF program loading, attachment, record decoding, output
//!   and counter diagnostics
//! - [`correlation`]: in-process [`CorrelationTable`](correlation::CorrelationTable),
//!   the bounded entry→exit store with BPF hash map semantics
//! - [`channel`]: in-process [`EventChannel`](channel::EventChannel), the
//!   bounded reservation/commit transport with BPF ring buffer semantics
//! - [`simulate`]: drives the shared correlation harness over the two
//!   in-process structures with synthetic concurrent calls
//! - [`cli`] / [`config`]: argument parsing and validated sizing
//! - [`domain`]: domain types and errors
//! - [`preflight`]: privilege, kernel and BTF checks
//!
//! The entry/exit state machine itself lives in `filemon_common::harness`
//! and is shared verbatim by the kernel programs and the simulator.
//!
//! ## Degradation
//!
//! Nothing on the kernel side blocks or retries. A full in-flight map makes
//! the matching exit report an empty subject; a full ring buffer drops the
//! record. Both are counted and printed when the session ends.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Every deletion on the system
//! sudo filemon run
//!
//! # Deletions and writes of one process, as JSON lines
//! sudo filemon run --pid 1234 --writes --json
//!
//! # No privileges: exercise the pipeline in-process
//! filemon simulate --threads 8 --orphan-every 10
//! ```

pub mod channel;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod domain;
pub mod monitor;
pub mod preflight;
pub mod simulate;
