//! # Event Processing
//!
//! Decodes records drained from the ring buffer (kernel) or the in-process
//! channel (simulator) and writes them out, one line per event.
//!
//! ## Output Modes
//!
//! - **Text**: `PID: <pid>, CMD: <comm>, FILE: <path>, RET: <ret>`
//! - **JSON** (`--json`): one [`FileRecord`] object per line
//!
//! Records that are too short or carry an unknown operation kind are counted
//! and skipped; the consumer never assumes a zero drop rate.

use std::io::{self, Write};

use filemon_common::{FileEvent, FILE_EVENT_SIZE, FLAG_COMBINED};
use log::warn;
use serde::Serialize;

use super::event_display::format_event;
use crate::domain::OpKind;

/// Decode one raw record. `None` if `bytes` is not exactly one [`FileEvent`].
#[must_use]
pub fn decode(bytes: &[u8]) -> Option<FileEvent> {
    if bytes.len() != FILE_EVENT_SIZE {
        return None;
    }
    bytemuck::try_pod_read_unaligned(bytes).ok()
}

/// Owned, printable form of a [`FileEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub pid: u32,
    pub op: &'static str,
    pub comm: String,
    /// `None` when the subject is unknown (degraded record)
    pub subject: Option<String>,
    pub ret: i64,
    pub degraded: bool,
    pub combined: bool,
}

impl FileRecord {
    /// `None` for an unknown operation kind
    #[must_use]
    pub fn from_event(event: &FileEvent) -> Option<Self> {
        let op = OpKind::from_wire(event.op)?;
        let subject = event.subject_bytes();
        Some(Self {
            pid: event.pid,
            op: op.label(),
            comm: String::from_utf8_lossy(event.comm_bytes()).into_owned(),
            subject: (!subject.is_empty()).then(|| String::from_utf8_lossy(subject).into_owned()),
            ret: event.ret,
            degraded: event.is_degraded(),
            combined: event.flags & FLAG_COMBINED != 0,
        })
    }
}

/// Encapsulates event output and per-session tallies
pub struct EventProcessor<W: Write> {
    out: W,
    json: bool,

    pub event_count: usize,
    /// Records emitted without a subject
    pub degraded_count: usize,
    /// Records skipped as malformed
    pub malformed_count: usize,
}

impl<W: Write> EventProcessor<W> {
    #[must_use]
    pub fn new(out: W, json: bool) -> Self {
        Self { out, json, event_count: 0, degraded_count: 0, malformed_count: 0 }
    }

    /// Decode and print one raw record.
    ///
    /// # Errors
    /// Returns an error if writing to the output fails.
    pub fn process_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        match decode(bytes) {
            Some(event) => self.process(&event),
            None => {
                warn!("Received malformed event ({} bytes)", bytes.len());
                self.malformed_count += 1;
                Ok(())
            }
        }
    }

    /// Print one decoded record.
    ///
    /// # Errors
    /// Returns an error if writing to the output fails.
    pub fn process(&mut self, event: &FileEvent) -> io::Result<()> {
        let Some(record) = FileRecord::from_event(event) else {
            warn!("Received event with unknown op {}", event.op);
            self.malformed_count += 1;
            return Ok(());
        };

        self.event_count += 1;
        if record.degraded {
            self.degraded_count += 1;
        }

        if self.json {
            serde_json::to_writer(&mut self.out, &record)?;
            writeln!(self.out)
        } else {
            writeln!(self.out, "{}", format_event(&record))
        }
    }

    /// # Errors
    /// Returns an error if flushing the output fails.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
