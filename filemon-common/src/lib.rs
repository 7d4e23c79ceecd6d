//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the wire record, correlation keys and configuration constants shared
//! between the kernel-side programs and userspace. All types use `#[repr(C)]`
//! with explicit padding so their byte image is identical on both sides of the
//! ring buffer.
//!
//! ## Key Types
//!
//! - [`FileEvent`] - Completed operation record passed via ring buffer
//! - [`CallKey`] - Identity of one in-flight invocation
//! - [`WriteArgs`] - Context captured when a `write` call begins
//! - [`Counter`] - Per-CPU degradation counters
//!
//! The entry/exit state machine that produces [`FileEvent`]s lives in
//! [`harness`] so the kernel programs and the in-process simulator run the
//! exact same logic.

#![cfg_attr(not(test), no_std)]

pub mod harness;

pub use harness::{
    Capture, CapacityExceeded, CorrelationMap, Correlator, EntryOutcome, EventSink,
    ExitOutcome, Operation, PidFilter, ProbeSite, ReadFault, ReservationDenied, Task, Telemetry,
    Unlink, Write,
};

use bytemuck::{Pod, Zeroable};

// ============================================================================
// Record Geometry
// ============================================================================

/// Length of the kernel's `task_struct::comm` (including NUL)
pub const TASK_COMM_LEN: usize = 16;

/// Maximum captured subject length (including NUL)
///
/// Paths longer than this are truncated by the bounds-checked string read.
pub const SUBJECT_LEN: usize = 256;

/// Captured subject for path-based operations, NUL-padded
pub type Subject = [u8; SUBJECT_LEN];

// ============================================================================
// Operation Kinds
// ============================================================================

/// File deletion (`do_unlinkat`)
pub const OP_UNLINK: u16 = 1;

/// `write(2)` system call
pub const OP_WRITE: u16 = 2;

/// Set on records whose exit found no matching entry (subject unknown)
pub const FLAG_DEGRADED: u16 = 1 << 0;

/// Set on records produced by a combined observation point (no correlation)
pub const FLAG_COMBINED: u16 = 1 << 1;

// ============================================================================
// Configuration Keys (`CONFIG` map)
// ============================================================================

/// PID (TGID) to monitor; 0 monitors every process
pub const CONFIG_TARGET_PID: u32 = 0;

/// PID of the monitor itself, never reported (avoids feedback on its own writes)
pub const CONFIG_SELF_PID: u32 = 1;

// ============================================================================
// Counters (`COUNTERS` per-CPU array)
// ============================================================================

/// Degradation counters, indexed into the `COUNTERS` per-CPU array
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Record committed to the channel (matched or degraded)
    Emitted = 0,
    /// Exit found no entry; record emitted without a subject
    LookupMiss = 1,
    /// Entry discarded because the in-flight table was full
    CapacityExceeded = 2,
    /// Record dropped because the channel had no room
    ReservationDenied = 3,
    /// Bounds-checked read of the subject failed at capture time
    ReadFault = 4,
}

/// Number of slots in the `COUNTERS` map
pub const COUNTER_SLOTS: u32 = 5;

impl Counter {
    /// All counters in slot order
    pub const ALL: [Counter; COUNTER_SLOTS as usize] = [
        Counter::Emitted,
        Counter::LookupMiss,
        Counter::CapacityExceeded,
        Counter::ReservationDenied,
        Counter::ReadFault,
    ];

    /// Map slot index
    #[must_use]
    pub const fn slot(self) -> u32 {
        self as u32
    }

    /// Short name used in diagnostics output
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Counter::Emitted => "emitted",
            Counter::LookupMiss => "lookup_miss",
            Counter::CapacityExceeded => "capacity_exceeded",
            Counter::ReservationDenied => "reservation_denied",
            Counter::ReadFault => "read_fault",
        }
    }
}

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Identity of one in-flight invocation
///
/// `pid_tgid` alone collides for recursive or re-entrant calls by the same
/// thread, so it is paired with a value that is stable only for the duration
/// of one call: the caller's stack pointer for kprobes, the syscall number for
/// syscall tracepoints.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct CallKey {
    /// `bpf_get_current_pid_tgid()`: TGID in the upper half, TID in the lower
    pub pid_tgid: u64,

    /// Invocation-scoped disambiguator
    pub disambiguator: u64,
}

impl CallKey {
    #[must_use]
    pub const fn new(pid_tgid: u64, disambiguator: u64) -> Self {
        Self { pid_tgid, disambiguator }
    }

    /// Thread ID half of the key
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn tid(&self) -> u32 {
        self.pid_tgid as u32
    }
}

/// Arguments captured when a `write(2)` call begins
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct WriteArgs {
    /// File descriptor being written to
    pub fd: u64,

    /// Requested byte count
    pub count: u64,
}

/// Event sent from eBPF to userspace via ring buffer
///
/// One record per completed operation. Every field has a fixed width; the
/// subject is NUL-padded and all-zero when unknown.
///
/// **Memory Layout**: `#[repr(C)]`, no implicit padding (288 bytes)
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct FileEvent {
    /// Process ID (TGID in Linux terms)
    pub pid: u32,

    /// Operation kind (`OP_UNLINK`, `OP_WRITE`)
    pub op: u16,

    /// `FLAG_DEGRADED` | `FLAG_COMBINED`
    pub flags: u16,

    /// Command name of the calling task, NUL-padded
    pub comm: [u8; TASK_COMM_LEN],

    /// Operation subject (path, or a rendered descriptor), NUL-padded
    pub subject: Subject,

    /// Return value of the operation; negative values are `-errno`
    pub ret: i64,
}

/// Serialized size of a [`FileEvent`]
pub const FILE_EVENT_SIZE: usize = core::mem::size_of::<FileEvent>();

const _: () = assert!(FILE_EVENT_SIZE == 288);
const _: () = assert!(FILE_EVENT_SIZE % 8 == 0);

impl FileEvent {
    /// Whether the exit handler found no captured context for this record
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.flags & FLAG_DEGRADED != 0
    }

    /// Comm bytes up to the first NUL
    #[must_use]
    pub fn comm_bytes(&self) -> &[u8] {
        until_nul(&self.comm)
    }

    /// Subject bytes up to the first NUL (empty when unknown)
    #[must_use]
    pub fn subject_bytes(&self) -> &[u8] {
        until_nul(&self.subject)
    }
}

// ============================================================================
// Fixed-width Text Helpers
// ============================================================================

/// Bytes of a NUL-padded buffer before the first NUL
#[must_use]
pub fn until_nul(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// Copy `src` into `dst`, truncating so that at least one trailing NUL remains,
/// and zero the rest. Returns the number of bytes copied.
pub fn copy_truncated(dst: &mut [u8], src: &[u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let src = until_nul(src);
    let len = src.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&src[..len]);
    for b in &mut dst[len..] {
        *b = 0;
    }
    len
}

/// Append `value` in decimal to `dst` at `at`. Returns the new cursor, or
/// `dst.len()` if the digits did not fit.
pub fn put_decimal(dst: &mut [u8], at: usize, value: u64) -> usize {
    let mut digits = [0u8; 20];
    let mut n = value;
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        count += 1;
        n /= 10;
        if n == 0 || count == digits.len() {
            break;
        }
    }
    if at + count > dst.len() {
        return dst.len();
    }
    for i in 0..count {
        dst[at + i] = digits[count - 1 - i];
    }
    at + count
}

/// Append raw bytes to `dst` at `at`, truncating at the end of `dst`.
pub fn put_bytes(dst: &mut [u8], at: usize, src: &[u8]) -> usize {
    let room = dst.len().saturating_sub(at);
    let len = src.len().min(room);
    dst[at..at + len].copy_from_slice(&src[..len]);
    at + len
}

#[cfg(feature = "user")]
use aya::Pod as AyaPod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl AyaPod for FileEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl AyaPod for CallKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl AyaPod for WriteArgs {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_truncated_keeps_trailing_nul() {
        let mut dst = [0xffu8; 8];
        let copied = copy_truncated(&mut dst, b"/tmp/abcdefgh");
        assert_eq!(copied, 7);
        assert_eq!(&dst, b"/tmp/ab\0");
    }

    #[test]
    fn test_copy_truncated_stops_at_source_nul() {
        let mut dst = [0xffu8; 8];
        copy_truncated(&mut dst, b"ab\0cd");
        assert_eq!(&dst, b"ab\0\0\0\0\0\0");
    }

    #[test]
    fn test_put_decimal() {
        let mut buf = [0u8; 16];
        let at = put_bytes(&mut buf, 0, b"fd=");
        let at = put_decimal(&mut buf, at, 1024);
        assert_eq!(&buf[..at], b"fd=1024");

        let at = put_decimal(&mut buf, 0, 0);
        assert_eq!(&buf[..at], b"0");
    }

    #[test]
    fn test_put_decimal_overflow_leaves_buffer() {
        let mut buf = [0u8; 4];
        assert_eq!(put_decimal(&mut buf, 2, 12_345), 4);
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_event_text_accessors() {
        let mut event = FileEvent::zeroed();
        copy_truncated(&mut event.comm, b"rm");
        assert_eq!(event.comm_bytes(), b"rm");
        assert!(event.subject_bytes().is_empty());
        assert!(!event.is_degraded());
        event.flags = FLAG_DEGRADED;
        assert!(event.is_degraded());
    }

    #[test]
    fn test_call_key_tid() {
        let key = CallKey::new((42u64 << 32) | 7, 0xdead_beef);
        assert_eq!(key.tid(), 7);
    }
}
