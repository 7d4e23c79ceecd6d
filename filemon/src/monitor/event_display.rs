use crate::domain::CounterSnapshot;
use crate::monitor::event_processor::FileRecord;

/// Placeholder for an empty (unknown) subject
pub const UNKNOWN_SUBJECT: &str = "<unknown>";

/// Format one record as a single output line
#[must_use]
pub fn format_event(record: &FileRecord) -> String {
    let label = if record.op == "write" { "WRITE" } else { "FILE" };
    let subject = record.subject.as_deref().unwrap_or(UNKNOWN_SUBJECT);
    format!(
        "PID: {}, CMD: {}, {label}: {subject}, RET: {}",
        record.pid, record.comm, record.ret
    )
}

/// Display counter totals and resident orphans
pub fn display_statistics(counters: &CounterSnapshot, orphans: usize) {
    eprintln!("stats: {counters}, orphans={orphans}");
}

/// Display the end-of-session summary line
pub fn display_summary(reason: &str, elapsed_secs: f64, events: usize, degraded: usize) {
    eprintln!("\n{reason}: {elapsed_secs:.1}s, {events} events ({degraded} without subject)");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(op: &'static str, subject: Option<&str>) -> FileRecord {
        FileRecord {
            pid: 3,
            op,
            comm: "sh".into(),
            subject: subject.map(Into::into),
            ret: -13,
            degraded: subject.is_none(),
            combined: false,
        }
    }

    #[test]
    fn test_format_unknown_subject() {
        assert_eq!(
            format_event(&record("unlink", None)),
            "PID: 3, CMD: sh, FILE: <unknown>, RET: -13"
        );
    }

    #[test]
    fn test_format_write() {
        assert_eq!(
            format_event(&record("write", Some("fd=1 len=4"))),
            "PID: 3, CMD: sh, WRITE: fd=1 len=4, RET: -13"
        );
    }
}
