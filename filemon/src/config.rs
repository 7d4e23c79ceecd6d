//! Validated runtime configuration
//!
//! Built from parsed CLI arguments. Sizing is fixed here, before anything is
//! loaded: neither the kernel maps nor the in-process structures are resized
//! afterwards.

use std::time::Duration;

use filemon_common::{PidFilter, FILE_EVENT_SIZE};

use crate::channel::slot_size;
use crate::cli::{RunArgs, SimulateArgs};
use crate::domain::{MonitorError, Pid, ProbeMode};

/// Kernel ring buffers must be a power-of-two multiple of the page size
pub const PAGE_SIZE: u32 = 4096;

/// Configuration of a live monitoring session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub target: Option<Pid>,
    pub mode: ProbeMode,
    pub writes: bool,
    pub json: bool,
    pub duration: Option<Duration>,
    pub ring_bytes: u32,
    pub table_entries: u32,
}

impl MonitorConfig {
    /// # Errors
    /// [`MonitorError::InvalidConfig`] when a sizing flag is out of range.
    pub fn from_args(args: &RunArgs) -> Result<Self, MonitorError> {
        let ring_bytes = round_ring_bytes(args.ring_bytes)?;
        if args.table_entries == 0 {
            return Err(MonitorError::InvalidConfig("--table-entries must be at least 1".into()));
        }
        if args.pid == Some(0) {
            return Err(MonitorError::InvalidConfig("--pid 0 is not a process".into()));
        }

        Ok(Self {
            target: args.pid.map(Pid),
            mode: args.mode,
            writes: args.writes,
            json: args.json,
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            ring_bytes,
            table_entries: args.table_entries,
        })
    }

    /// Records the ring holds before a stalled consumer starts losing events
    #[must_use]
    pub fn ring_records(&self) -> usize {
        self.ring_bytes as usize / slot_size(FILE_EVENT_SIZE)
    }
}

/// Round up to the next power-of-two multiple of the page size, as the
/// kernel requires for ring buffer maps.
fn round_ring_bytes(bytes: u32) -> Result<u32, MonitorError> {
    bytes.max(PAGE_SIZE).checked_next_power_of_two().ok_or_else(|| {
        MonitorError::InvalidConfig(format!("--ring-bytes {bytes} is too large"))
    })
}

/// Configuration of an in-process simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    pub threads: usize,
    pub calls_per_thread: usize,
    pub nesting: usize,
    pub orphan_every: usize,
    pub table_entries: usize,
    pub ring_records: usize,
    pub filter: PidFilter,
    pub writes: bool,
    pub json: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            calls_per_thread: 64,
            nesting: 2,
            orphan_every: 0,
            table_entries: 1024,
            ring_records: 256,
            filter: PidFilter::disabled(),
            writes: false,
            json: false,
        }
    }
}

impl SimulationConfig {
    /// # Errors
    /// [`MonitorError::InvalidConfig`] when a count is zero.
    pub fn from_args(args: &SimulateArgs) -> Result<Self, MonitorError> {
        for (flag, value) in [
            ("--threads", args.threads),
            ("--nesting", args.nesting),
            ("--table-entries", args.table_entries),
            ("--ring-records", args.ring_records),
        ] {
            if value == 0 {
                return Err(MonitorError::InvalidConfig(format!("{flag} must be at least 1")));
            }
        }

        Ok(Self {
            threads: args.threads,
            calls_per_thread: args.calls,
            nesting: args.nesting,
            orphan_every: args.orphan_every,
            table_entries: args.table_entries,
            ring_records: args.ring_records,
            filter: PidFilter::new(args.pid.unwrap_or(0), 0),
            writes: args.writes,
            json: args.json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{DEFAULT_RING_BYTES, DEFAULT_TABLE_ENTRIES};

    fn run_args() -> RunArgs {
        RunArgs {
            pid: None,
            mode: ProbeMode::Auto,
            writes: false,
            json: false,
            duration: 0,
            ring_bytes: DEFAULT_RING_BYTES,
            table_entries: DEFAULT_TABLE_ENTRIES,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::from_args(&run_args()).unwrap();
        assert_eq!(config.duration, None);
        assert_eq!(config.target, None);
        assert_eq!(config.ring_records(), 885);
    }

    #[test]
    fn test_ring_bytes_rounded_to_page_power_of_two() {
        for (requested, effective) in
            [(0, 4096), (1024, 4096), (4096 + 8, 8192), (100_000, 131_072), (8192, 8192)]
        {
            let args = RunArgs { ring_bytes: requested, ..run_args() };
            assert_eq!(MonitorConfig::from_args(&args).unwrap().ring_bytes, effective);
        }

        let args = RunArgs { ring_bytes: u32::MAX, ..run_args() };
        assert!(MonitorConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_zero_table_entries_rejected() {
        let args = RunArgs { table_entries: 0, ..run_args() };
        let err = MonitorConfig::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("--table-entries"));
    }

    #[test]
    fn test_duration_and_pid() {
        let args = RunArgs { duration: 5, pid: Some(42), ..run_args() };
        let config = MonitorConfig::from_args(&args).unwrap();
        assert_eq!(config.duration, Some(Duration::from_secs(5)));
        assert_eq!(config.target, Some(Pid(42)));
    }
}
