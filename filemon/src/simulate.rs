//! # In-Process Simulation
//!
//! Runs the same [`Correlator`] the kernel programs use, over the in-process
//! [`CorrelationTable`] and [`EventChannel`], with synthetic threads standing
//! in for instrumented tasks. Needs no privileges, which makes it the test
//! bed for the correlation and delivery guarantees.
//!
//! Each simulated thread issues nested calls: the outer invocation's entry
//! fires, then the inner one's, and the exits unwind innermost first. The
//! invocations differ only in their stack pointer, so the call key's
//! disambiguator is what keeps them apart.

use std::io::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use filemon_common::{
    copy_truncated, CallKey, Capture, Correlator, Counter, EntryOutcome, ExitOutcome, PidFilter,
    ProbeSite, ReadFault, Subject, Task, Telemetry, Unlink, Write, WriteArgs, COUNTER_SLOTS,
    FILE_EVENT_SIZE, TASK_COMM_LEN,
};
use log::debug;

use crate::channel::{EventChannel, Producer};
use crate::config::SimulationConfig;
use crate::correlation::CorrelationTable;
use crate::domain::{CounterSnapshot, TableError};
use crate::monitor::EventProcessor;

/// `-ENOENT`, reported by simulated unlinks of missing files
pub const ENOENT: i64 = -2;

/// Stack distance between nested simulated frames
const FRAME_SIZE: u64 = 0x100;

/// Base stack pointer of every simulated thread
const STACK_TOP: u64 = 0x7fff_ffff_f000;

// ============================================================================
// Simulated Probe Sites
// ============================================================================

/// One simulated firing of an instrumentation point
#[derive(Debug, Clone, Copy)]
pub struct SimCall<'a> {
    pub task: Task,
    pub key: CallKey,
    pub ret: i64,
    /// Path visible at entry; `None` simulates a faulting read
    pub path: Option<&'a [u8]>,
    pub write: WriteArgs,
}

impl<'a> SimCall<'a> {
    /// A call by thread `tid` of process `pid` at stack pointer `sp`
    #[must_use]
    pub fn new(pid: u32, tid: u32, comm: &str, sp: u64) -> Self {
        let mut name = [0u8; TASK_COMM_LEN];
        copy_truncated(&mut name, comm.as_bytes());
        Self {
            task: Task { pid, tid, comm: name },
            key: CallKey::new((u64::from(pid) << 32) | u64::from(tid), sp),
            ret: 0,
            path: None,
            write: WriteArgs::default(),
        }
    }

    #[must_use]
    pub fn path(mut self, path: &'a [u8]) -> Self {
        self.path = Some(path);
        self
    }

    #[must_use]
    pub fn writing(mut self, fd: u64, count: u64) -> Self {
        self.write = WriteArgs { fd, count };
        self
    }

    #[must_use]
    pub fn returning(mut self, ret: i64) -> Self {
        self.ret = ret;
        self
    }
}

impl ProbeSite for SimCall<'_> {
    fn task(&self) -> Task {
        self.task
    }

    fn call_key(&self) -> CallKey {
        self.key
    }

    fn return_code(&self) -> i64 {
        self.ret
    }
}

impl Capture<Unlink> for SimCall<'_> {
    fn capture(&self, scratch: &mut Subject) -> Result<(), ReadFault> {
        let path = self.path.ok_or(ReadFault)?;
        copy_truncated(scratch, path);
        Ok(())
    }
}

impl Capture<Write> for SimCall<'_> {
    fn capture(&self, scratch: &mut WriteArgs) -> Result<(), ReadFault> {
        *scratch = self.write;
        Ok(())
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Thread-safe [`Counter`] totals
#[derive(Default)]
pub struct AtomicCounters([AtomicU64; COUNTER_SLOTS as usize]);

impl AtomicCounters {
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let mut snapshot = CounterSnapshot::default();
        for counter in Counter::ALL {
            snapshot.set(counter, self.0[counter.slot() as usize].load(Ordering::Relaxed));
        }
        snapshot
    }
}

impl Telemetry for AtomicCounters {
    fn bump(&self, counter: Counter) {
        self.0[counter.slot() as usize].fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Both in-flight tables, the producer half of the channel and the counters:
/// the userspace equivalent of the kernel programs' maps.
pub struct Pipeline {
    unlinks: CorrelationTable<CallKey, Subject>,
    writes: CorrelationTable<CallKey, WriteArgs>,
    producer: Producer,
    counters: AtomicCounters,
    filter: PidFilter,
}

impl Pipeline {
    /// # Errors
    /// [`TableError::ZeroCapacity`] when `table_entries` is 0.
    pub fn new(
        table_entries: usize,
        producer: Producer,
        filter: PidFilter,
    ) -> Result<Self, TableError> {
        Ok(Self {
            unlinks: CorrelationTable::with_capacity(table_entries)?,
            writes: CorrelationTable::with_capacity(table_entries)?,
            producer,
            counters: AtomicCounters::default(),
            filter,
        })
    }

    fn correlate<'p, V>(
        &'p self,
        table: &'p CorrelationTable<CallKey, V>,
    ) -> Correlator<&'p CorrelationTable<CallKey, V>, &'p Producer, &'p AtomicCounters> {
        Correlator::new(table, &self.producer, &self.counters, self.filter)
    }

    pub fn unlink_entry(&self, call: &SimCall<'_>) -> EntryOutcome {
        self.correlate(&self.unlinks).on_entry::<Unlink, _>(call)
    }

    pub fn unlink_exit(&self, call: &SimCall<'_>) -> ExitOutcome {
        self.correlate(&self.unlinks).on_exit::<Unlink, _>(call)
    }

    /// Combined observation: no table involved
    pub fn unlink_complete(&self, call: &SimCall<'_>) -> ExitOutcome {
        self.correlate(&self.unlinks).on_complete::<Unlink, _>(call)
    }

    pub fn write_entry(&self, call: &SimCall<'_>) -> EntryOutcome {
        self.correlate(&self.writes).on_entry::<Write, _>(call)
    }

    pub fn write_exit(&self, call: &SimCall<'_>) -> ExitOutcome {
        self.correlate(&self.writes).on_exit::<Write, _>(call)
    }

    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Entries still waiting for an exit (orphans once the run is over)
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.unlinks.len() + self.writes.len()
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Outcome of [`run_simulation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationReport {
    pub counters: CounterSnapshot,
    /// Records the consumer received
    pub delivered: usize,
    /// Reservations the channel refused
    pub dropped: u64,
    /// Entries left without an exit
    pub orphans: usize,
}

/// Run `config.threads` simulated threads against one pipeline while the
/// calling thread drains the channel into `processor`.
///
/// # Errors
/// Returns an error if the pipeline cannot be built or `processor` fails to
/// write.
pub fn run_simulation<W: std::io::Write>(
    config: &SimulationConfig,
    processor: &mut EventProcessor<W>,
) -> anyhow::Result<SimulationReport> {
    let (producer, mut consumer) =
        EventChannel::for_records(FILE_EVENT_SIZE, config.ring_records)?.split();
    let pipeline = Pipeline::new(config.table_entries, producer, config.filter)?;
    let finished = AtomicUsize::new(0);
    let mut delivered = 0;

    std::thread::scope(|scope| -> anyhow::Result<()> {
        for index in 0..config.threads {
            let pipeline = &pipeline;
            let finished = &finished;
            scope.spawn(move || {
                simulate_thread(pipeline, config, index);
                finished.fetch_add(1, Ordering::Release);
            });
        }

        loop {
            let done = finished.load(Ordering::Acquire) == config.threads;
            let mut failed = None;
            delivered += consumer.drain_events(|event| {
                if failed.is_none() {
                    failed = processor.process(&event).err();
                }
            });
            if let Some(err) = failed {
                return Err(err.into());
            }
            if done {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    })?;

    processor.flush()?;

    let report = SimulationReport {
        counters: pipeline.counters(),
        delivered,
        dropped: consumer.dropped(),
        orphans: pipeline.in_flight(),
    };
    debug!("simulation finished: {report:?}");
    Ok(report)
}

fn simulate_thread(pipeline: &Pipeline, config: &SimulationConfig, index: usize) {
    #[allow(clippy::cast_possible_truncation)]
    let pid = 1000 + index as u32;
    let comm = format!("sim-{index}");
    let mut path = Vec::with_capacity(64);

    for call in 0..config.calls_per_thread {
        let orphaned = config.orphan_every != 0 && (call + 1) % config.orphan_every == 0;

        // Entries: outermost frame first, each nested frame deeper in the stack.
        for depth in 0..config.nesting {
            let sp = STACK_TOP - depth as u64 * FRAME_SIZE;
            path.clear();
            let _ = write!(path, "/tmp/filemon-sim/{index}/{call}.{depth}");
            pipeline.unlink_entry(&SimCall::new(pid, pid, &comm, sp).path(&path));
        }

        if config.writes {
            let len = path.len() as u64;
            let write = SimCall::new(pid, pid, &comm, 1).writing(1, len);
            pipeline.write_entry(&write);
            pipeline.write_exit(&write.returning(i64::try_from(len).unwrap_or(i64::MAX)));
        }

        if orphaned {
            // Exits lost (e.g. the probe was detached mid-call); a stray exit
            // with no entry degrades instead.
            let stray = SimCall::new(pid, pid, &comm, STACK_TOP + FRAME_SIZE).returning(ENOENT);
            pipeline.unlink_exit(&stray);
            continue;
        }

        // Exits unwind innermost first.
        for depth in (0..config.nesting).rev() {
            let sp = STACK_TOP - depth as u64 * FRAME_SIZE;
            let ret = if depth == 0 { 0 } else { ENOENT };
            pipeline.unlink_exit(&SimCall::new(pid, pid, &comm, sp).returning(ret));
        }
    }
}
