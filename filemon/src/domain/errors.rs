//! Structured error types for filemon
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to load eBPF program: {0}")]
    EbpfLoadFailed(String),

    #[error("Program {0} not found in eBPF object")]
    ProgramNotFound(&'static str),

    #[error("Map {0} not found in eBPF object")]
    MapNotFound(&'static str),

    #[error("Failed to attach {program} to {target}: {error}")]
    AttachFailed { program: &'static str, target: String, error: String },

    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel capacity {bytes} bytes is invalid: {reason}")]
    InvalidCapacity { bytes: usize, reason: &'static str },

    #[error("Record of {len} bytes exceeds channel limit of {max} bytes")]
    RecordTooLarge { len: usize, max: usize },

    #[error("No space left in channel")]
    Full,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("Correlation table capacity must be at least 1")]
    ZeroCapacity,

    #[error("Correlation table full ({capacity} entries)")]
    Full { capacity: usize },

    #[error("Correlation table slot contended, insert abandoned")]
    Contended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_error_display() {
        let err = MonitorError::ProcessNotFound(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 not found");
    }

    #[test]
    fn test_attach_error() {
        let err = MonitorError::AttachFailed {
            program: "unlink_fexit",
            target: "do_unlinkat".to_string(),
            error: "no BTF".to_string(),
        };
        assert!(err.to_string().contains("unlink_fexit"));
        assert!(err.to_string().contains("do_unlinkat"));
    }

    #[test]
    fn test_channel_error_display() {
        let err = ChannelError::RecordTooLarge { len: 4096, max: 1024 };
        assert_eq!(err.to_string(), "Record of 4096 bytes exceeds channel limit of 1024 bytes");
    }
}
