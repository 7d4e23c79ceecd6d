//! # Correlation Harness
//!
//! The entry/exit state machine shared by every instrumented operation. A
//! [`Correlator`] is parameterized by the in-flight table, the event sink and
//! the counters it reports to; each call is parameterized by the
//! [`Operation`] being observed and the [`ProbeSite`] it fires at.
//!
//! ```text
//! NotStarted ──entry──▶ capture into scratch ──put──▶ InFlight
//! InFlight   ──exit───▶ take ──hit──▶ Completed
//!                            └─miss─▶ Completed-Degraded (empty subject)
//! ```
//!
//! Handlers never fail: a rejected insert, a lookup miss and a denied
//! reservation each degrade or drop the record and bump a [`Counter`]. No
//! path allocates, blocks, or loops without a bound, so the same code runs
//! inside eBPF programs and in the userspace simulator.

use bytemuck::Zeroable;

use crate::{
    copy_truncated, put_bytes, put_decimal, CallKey, Counter, FileEvent, Subject, WriteArgs,
    FLAG_COMBINED, FLAG_DEGRADED, OP_UNLINK, OP_WRITE, SUBJECT_LEN, TASK_COMM_LEN,
};

// ============================================================================
// Failure Markers
// ============================================================================

/// Insert rejected: the table is full and the key is not resident
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded;

/// No room left in the event channel for another record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationDenied;

/// Bounds-checked read of the observed task's memory failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFault;

// ============================================================================
// Collaborator Seams
// ============================================================================

/// Task running the instrumented operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub pid: u32,
    pub tid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

/// One firing of an instrumentation point
pub trait ProbeSite {
    /// Calling task
    fn task(&self) -> Task;

    /// Key matching this invocation's entry to its exit
    fn call_key(&self) -> CallKey;

    /// Return value of the operation. Only meaningful at exit and combined
    /// observation points.
    fn return_code(&self) -> i64;
}

/// Bounded key→value store bridging entry and exit
///
/// Implementations must make each call atomic per key and must not take a
/// table-wide lock.
pub trait CorrelationMap<K, V> {
    /// Insert or overwrite the entry for `key`.
    ///
    /// # Errors
    /// [`CapacityExceeded`] when the table is full and `key` is not resident.
    fn put(&self, key: &K, value: &V) -> Result<(), CapacityExceeded>;

    /// Remove the entry for `key`, handing its value (if any) to `f` first.
    fn take_with<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R;
}

/// Non-blocking record transport
pub trait EventSink {
    /// Reserve room for one record, let `fill` write every field, then commit.
    ///
    /// # Errors
    /// [`ReservationDenied`] when the channel has no room; `fill` is not called.
    fn emit_with<R>(&self, fill: impl FnOnce(&mut FileEvent) -> R)
        -> Result<R, ReservationDenied>;
}

/// Degradation counters
pub trait Telemetry {
    fn bump(&self, counter: Counter);
}

impl<K, V, M: CorrelationMap<K, V> + ?Sized> CorrelationMap<K, V> for &M {
    fn put(&self, key: &K, value: &V) -> Result<(), CapacityExceeded> {
        (**self).put(key, value)
    }

    fn take_with<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        (**self).take_with(key, f)
    }
}

impl<S: EventSink + ?Sized> EventSink for &S {
    fn emit_with<R>(
        &self,
        fill: impl FnOnce(&mut FileEvent) -> R,
    ) -> Result<R, ReservationDenied> {
        (**self).emit_with(fill)
    }
}

impl<T: Telemetry + ?Sized> Telemetry for &T {
    fn bump(&self, counter: Counter) {
        (**self).bump(counter);
    }
}

/// Counters disabled
impl Telemetry for () {
    fn bump(&self, _counter: Counter) {}
}

// ============================================================================
// Operations
// ============================================================================

/// An instrumented operation: what is captured at entry and how it is
/// rendered into the record's subject.
pub trait Operation {
    /// Operation kind written to [`FileEvent::op`]
    const KIND: u16;

    /// Context staged at entry. Fixed-size plain data, copied by value.
    type Captured: Copy + Zeroable;

    /// Render captured context into the subject field. Must write all
    /// `SUBJECT_LEN` bytes.
    fn assemble(captured: &Self::Captured, subject: &mut Subject);
}

/// Site-specific capture of an operation's entry context
///
/// Implementations read the observed task's memory only through a
/// bounds-checked read primitive, never by dereferencing its pointers.
pub trait Capture<Op: Operation>: ProbeSite {
    /// Fill `scratch` from this site.
    ///
    /// # Errors
    /// [`ReadFault`] when the observed memory could not be read; `scratch`
    /// may then be partially written.
    fn capture(&self, scratch: &mut Op::Captured) -> Result<(), ReadFault>;
}

/// File deletion; captures the path being unlinked
pub struct Unlink;

impl Operation for Unlink {
    const KIND: u16 = OP_UNLINK;
    type Captured = Subject;

    fn assemble(captured: &Subject, subject: &mut Subject) {
        *subject = *captured;
    }
}

/// `write(2)`; captures the descriptor and requested length
pub struct Write;

impl Operation for Write {
    const KIND: u16 = OP_WRITE;
    type Captured = WriteArgs;

    fn assemble(captured: &WriteArgs, subject: &mut Subject) {
        *subject = [0; SUBJECT_LEN];
        let at = put_bytes(subject, 0, b"fd=");
        let at = put_decimal(subject, at, captured.fd);
        let at = put_bytes(subject, at, b" len=");
        let at = put_decimal(subject, at, captured.count);
        // keep the terminating NUL
        if at == SUBJECT_LEN {
            subject[SUBJECT_LEN - 1] = 0;
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Optional PID filter plus self-exclusion
///
/// Checked before any capture or lookup so rejected calls cost one compare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PidFilter {
    target: u32,
    ignore: u32,
}

impl PidFilter {
    /// Admit every process
    #[must_use]
    pub const fn disabled() -> Self {
        Self { target: 0, ignore: 0 }
    }

    /// Admit only `target` (0 admits all), never `ignore` (0 ignores none)
    #[must_use]
    pub const fn new(target: u32, ignore: u32) -> Self {
        Self { target, ignore }
    }

    #[must_use]
    pub const fn admits(self, pid: u32) -> bool {
        (self.target == 0 || self.target == pid) && (self.ignore == 0 || self.ignore != pid)
    }
}

/// Result of an entry-side firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// PID filter rejected the call; nothing was captured
    Filtered,
    /// Context staged in the table under the call key
    InFlight,
    /// Table full; the matching exit will degrade
    Rejected,
}

/// Result of an exit-side (or combined) firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// PID filter rejected the call
    Filtered,
    /// Record emitted with the captured subject
    Completed,
    /// Record emitted without a subject (no matching entry)
    CompletedDegraded,
    /// Channel full; record dropped
    Dropped,
}

/// Entry/exit correlator over one in-flight table
pub struct Correlator<M, S, T> {
    table: M,
    sink: S,
    telemetry: T,
    filter: PidFilter,
}

impl<M, S, T> Correlator<M, S, T>
where
    S: EventSink,
    T: Telemetry,
{
    pub const fn new(table: M, sink: S, telemetry: T, filter: PidFilter) -> Self {
        Self { table, sink, telemetry, filter }
    }

    /// Entry side: stage context in local scratch, then store it under the
    /// call key.
    #[inline(always)]
    pub fn on_entry<Op, Site>(&self, site: &Site) -> EntryOutcome
    where
        Op: Operation,
        Site: Capture<Op>,
        M: CorrelationMap<CallKey, Op::Captured>,
    {
        let task = site.task();
        if !self.filter.admits(task.pid) {
            return EntryOutcome::Filtered;
        }

        let mut scratch = Op::Captured::zeroed();
        if site.capture(&mut scratch).is_err() {
            // A faulted read may leave a partial copy; store nothing rather than garbage.
            scratch = Op::Captured::zeroed();
            self.telemetry.bump(Counter::ReadFault);
        }

        match self.table.put(&site.call_key(), &scratch) {
            Ok(()) => EntryOutcome::InFlight,
            Err(CapacityExceeded) => {
                self.telemetry.bump(Counter::CapacityExceeded);
                EntryOutcome::Rejected
            }
        }
    }

    /// Exit side: claim the staged context (if any) and emit the record.
    ///
    /// The table entry is removed on every path, including a denied
    /// reservation, so a dropped record never leaves an orphan behind.
    #[inline(always)]
    pub fn on_exit<Op, Site>(&self, site: &Site) -> ExitOutcome
    where
        Op: Operation,
        Site: ProbeSite,
        M: CorrelationMap<CallKey, Op::Captured>,
    {
        let task = site.task();
        if !self.filter.admits(task.pid) {
            return ExitOutcome::Filtered;
        }

        let key = site.call_key();
        let ret = site.return_code();

        let emitted = self.sink.emit_with(|event| {
            self.table.take_with(&key, |captured| {
                stamp(event, &task, Op::KIND, ret);
                match captured {
                    Some(captured) => {
                        Op::assemble(captured, &mut event.subject);
                        true
                    }
                    None => {
                        event.flags |= FLAG_DEGRADED;
                        event.subject = [0; SUBJECT_LEN];
                        false
                    }
                }
            })
        });

        match emitted {
            Ok(true) => {
                self.telemetry.bump(Counter::Emitted);
                ExitOutcome::Completed
            }
            Ok(false) => {
                self.telemetry.bump(Counter::LookupMiss);
                self.telemetry.bump(Counter::Emitted);
                ExitOutcome::CompletedDegraded
            }
            Err(ReservationDenied) => {
                self.table.take_with(&key, |_| ());
                self.telemetry.bump(Counter::ReservationDenied);
                ExitOutcome::Dropped
            }
        }
    }

    /// Combined observation point: both sides are visible at once, so the
    /// record is assembled and emitted directly without touching the table.
    #[inline(always)]
    pub fn on_complete<Op, Site>(&self, site: &Site) -> ExitOutcome
    where
        Op: Operation,
        Site: Capture<Op>,
    {
        let task = site.task();
        if !self.filter.admits(task.pid) {
            return ExitOutcome::Filtered;
        }

        let ret = site.return_code();
        let mut scratch = Op::Captured::zeroed();
        let captured = site.capture(&mut scratch).is_ok();
        if !captured {
            self.telemetry.bump(Counter::ReadFault);
        }

        let emitted = self.sink.emit_with(|event| {
            stamp(event, &task, Op::KIND, ret);
            event.flags |= FLAG_COMBINED;
            if captured {
                Op::assemble(&scratch, &mut event.subject);
            } else {
                event.flags |= FLAG_DEGRADED;
                event.subject = [0; SUBJECT_LEN];
            }
        });

        match emitted {
            Ok(()) => {
                self.telemetry.bump(Counter::Emitted);
                if captured {
                    ExitOutcome::Completed
                } else {
                    ExitOutcome::CompletedDegraded
                }
            }
            Err(ReservationDenied) => {
                self.telemetry.bump(Counter::ReservationDenied);
                ExitOutcome::Dropped
            }
        }
    }
}

/// Write the actor, kind and outcome fields. Reserved channel memory is not
/// zeroed, so every field is assigned.
#[inline(always)]
fn stamp(event: &mut FileEvent, task: &Task, kind: u16, ret: i64) {
    event.pid = task.pid;
    event.op = kind;
    event.flags = 0;
    copy_truncated(&mut event.comm, &task.comm);
    event.ret = ret;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};

    // Single-threaded stand-ins; the concurrent structures live in `filemon`.

    struct VecTable {
        capacity: usize,
        entries: RefCell<Vec<(CallKey, Subject)>>,
    }

    impl CorrelationMap<CallKey, Subject> for VecTable {
        fn put(&self, key: &CallKey, value: &Subject) -> Result<(), CapacityExceeded> {
            let mut entries = self.entries.borrow_mut();
            if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
                slot.1 = *value;
                return Ok(());
            }
            if entries.len() == self.capacity {
                return Err(CapacityExceeded);
            }
            entries.push((*key, *value));
            Ok(())
        }

        fn take_with<R>(&self, key: &CallKey, f: impl FnOnce(Option<&Subject>) -> R) -> R {
            let mut entries = self.entries.borrow_mut();
            let pos = entries.iter().position(|(k, _)| k == key);
            let value = pos.map(|i| entries.swap_remove(i).1);
            f(value.as_ref())
        }
    }

    struct VecSink {
        room: Cell<usize>,
        events: RefCell<Vec<FileEvent>>,
    }

    impl EventSink for VecSink {
        fn emit_with<R>(
            &self,
            fill: impl FnOnce(&mut FileEvent) -> R,
        ) -> Result<R, ReservationDenied> {
            if self.room.get() == 0 {
                return Err(ReservationDenied);
            }
            self.room.set(self.room.get() - 1);
            // garbage, like unzeroed ring memory
            let mut event = FileEvent::zeroed();
            event.flags = 0xffff;
            event.subject = [0xaa; SUBJECT_LEN];
            let r = fill(&mut event);
            self.events.borrow_mut().push(event);
            Ok(r)
        }
    }

    #[derive(Default)]
    struct Tally(RefCell<Vec<Counter>>);

    impl Telemetry for Tally {
        fn bump(&self, counter: Counter) {
            self.0.borrow_mut().push(counter);
        }
    }

    struct Site {
        pid: u32,
        key: CallKey,
        ret: i64,
        path: Option<&'static [u8]>,
    }

    impl ProbeSite for Site {
        fn task(&self) -> Task {
            let mut comm = [0; TASK_COMM_LEN];
            copy_truncated(&mut comm, b"rm");
            Task { pid: self.pid, tid: self.key.tid(), comm }
        }

        fn call_key(&self) -> CallKey {
            self.key
        }

        fn return_code(&self) -> i64 {
            self.ret
        }
    }

    impl Capture<Unlink> for Site {
        fn capture(&self, scratch: &mut Subject) -> Result<(), ReadFault> {
            let path = self.path.ok_or(ReadFault)?;
            copy_truncated(scratch, path);
            Ok(())
        }
    }

    fn site(pid: u32, sp: u64, ret: i64, path: Option<&'static [u8]>) -> Site {
        Site { pid, key: CallKey::new((u64::from(pid) << 32) | u64::from(pid), sp), ret, path }
    }

    fn fixture(capacity: usize, room: usize) -> (VecTable, VecSink, Tally) {
        (
            VecTable { capacity, entries: RefCell::new(Vec::new()) },
            VecSink { room: Cell::new(room), events: RefCell::new(Vec::new()) },
            Tally::default(),
        )
    }

    #[test]
    fn test_matched_pair_carries_subject() {
        let (table, sink, tally) = fixture(4, 4);
        let c = Correlator::new(&table, &sink, &tally, PidFilter::disabled());

        assert_eq!(c.on_entry::<Unlink, _>(&site(42, 1, 0, Some(b"/tmp/a"))), EntryOutcome::InFlight);
        assert_eq!(c.on_exit::<Unlink, _>(&site(42, 1, 0, None)), ExitOutcome::Completed);

        let events = sink.events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pid, 42);
        assert_eq!(events[0].subject_bytes(), b"/tmp/a");
        assert_eq!(events[0].comm_bytes(), b"rm");
        assert_eq!(events[0].flags, 0);
        assert_eq!(events[0].op, OP_UNLINK);
        assert!(table.entries.borrow().is_empty());
    }

    #[test]
    fn test_unmatched_exit_degrades() {
        let (table, sink, tally) = fixture(4, 4);
        let c = Correlator::new(&table, &sink, &tally, PidFilter::disabled());

        assert_eq!(c.on_exit::<Unlink, _>(&site(7, 9, -2, None)), ExitOutcome::CompletedDegraded);
        let events = sink.events.borrow();
        assert!(events[0].is_degraded());
        assert!(events[0].subject_bytes().is_empty());
        assert_eq!(events[0].ret, -2);
        assert_eq!(*tally.0.borrow(), vec![Counter::LookupMiss, Counter::Emitted]);
    }

    #[test]
    fn test_denied_reservation_still_clears_entry() {
        let (table, sink, tally) = fixture(4, 0);
        let c = Correlator::new(&table, &sink, &tally, PidFilter::disabled());

        c.on_entry::<Unlink, _>(&site(1, 1, 0, Some(b"/x")));
        assert_eq!(c.on_exit::<Unlink, _>(&site(1, 1, 0, None)), ExitOutcome::Dropped);
        assert!(table.entries.borrow().is_empty());
        assert_eq!(*tally.0.borrow(), vec![Counter::ReservationDenied]);
    }

    #[test]
    fn test_filter_rejects_before_capture() {
        let (table, sink, tally) = fixture(4, 4);
        let c = Correlator::new(&table, &sink, &tally, PidFilter::new(100, 0));

        assert_eq!(c.on_entry::<Unlink, _>(&site(1, 1, 0, Some(b"/x"))), EntryOutcome::Filtered);
        assert_eq!(c.on_exit::<Unlink, _>(&site(1, 1, 0, None)), ExitOutcome::Filtered);
        assert!(table.entries.borrow().is_empty());
        assert!(sink.events.borrow().is_empty());
        assert!(tally.0.borrow().is_empty());
    }

    #[test]
    fn test_read_fault_stores_empty_subject() {
        let (table, sink, tally) = fixture(4, 4);
        let c = Correlator::new(&table, &sink, &tally, PidFilter::disabled());

        assert_eq!(c.on_entry::<Unlink, _>(&site(3, 1, 0, None)), EntryOutcome::InFlight);
        assert_eq!(c.on_exit::<Unlink, _>(&site(3, 1, 0, None)), ExitOutcome::Completed);
        assert!(sink.events.borrow()[0].subject_bytes().is_empty());
        assert_eq!(tally.0.borrow()[0], Counter::ReadFault);
    }

    #[test]
    fn test_combined_skips_table() {
        let (table, sink, tally) = fixture(0, 4);
        let c = Correlator::new(&table, &sink, &tally, PidFilter::disabled());

        assert_eq!(c.on_complete::<Unlink, _>(&site(5, 0, 0, Some(b"/y"))), ExitOutcome::Completed);
        let events = sink.events.borrow();
        assert_eq!(events[0].subject_bytes(), b"/y");
        assert_eq!(events[0].flags, FLAG_COMBINED);
    }

    #[test]
    fn test_pid_filter() {
        assert!(PidFilter::disabled().admits(1));
        assert!(PidFilter::new(5, 0).admits(5));
        assert!(!PidFilter::new(5, 0).admits(6));
        assert!(!PidFilter::new(0, 9).admits(9));
        assert!(PidFilter::new(0, 9).admits(10));
    }

    #[test]
    fn test_write_subject_rendering() {
        let mut subject = [0xffu8; SUBJECT_LEN];
        Write::assemble(&WriteArgs { fd: 3, count: 128 }, &mut subject);
        assert_eq!(crate::until_nul(&subject), b"fd=3 len=128");
        assert!(subject[12..].iter().all(|&b| b == 0));
    }
}
