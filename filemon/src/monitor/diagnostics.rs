use anyhow::Result;
use aya::maps::{HashMap, PerCpuArray};
use aya::Ebpf;
use filemon_common::{CallKey, Counter, Subject, WriteArgs};

use crate::domain::{CounterSnapshot, MonitorError};

/// Sum the per-CPU `COUNTERS` map
///
/// # Errors
/// Returns an error if the `COUNTERS` map cannot be accessed
pub fn read_counters(bpf: &Ebpf) -> Result<CounterSnapshot> {
    let counters: PerCpuArray<_, u64> =
        PerCpuArray::try_from(bpf.map("COUNTERS").ok_or(MonitorError::MapNotFound("COUNTERS"))?)?;

    let mut snapshot = CounterSnapshot::default();
    for counter in Counter::ALL {
        let per_cpu = counters.get(&counter.slot(), 0)?;
        snapshot.set(counter, per_cpu.iter().sum());
    }
    Ok(snapshot)
}

/// Entries still resident in the in-flight maps (entries with no exit yet)
///
/// # Errors
/// Returns an error if either in-flight map cannot be accessed
pub fn count_orphans(bpf: &Ebpf) -> Result<usize> {
    let unlinks: HashMap<_, CallKey, Subject> = HashMap::try_from(
        bpf.map("INFLIGHT_UNLINK").ok_or(MonitorError::MapNotFound("INFLIGHT_UNLINK"))?,
    )?;
    let writes: HashMap<_, CallKey, WriteArgs> = HashMap::try_from(
        bpf.map("INFLIGHT_WRITE").ok_or(MonitorError::MapNotFound("INFLIGHT_WRITE"))?,
    )?;
    Ok(unlinks.keys().filter_map(Result::ok).count()
        + writes.keys().filter_map(Result::ok).count())
}

/// Print counter diagnostics
///
/// This displays how records fared on their way to userspace:
/// - How many were emitted (with or without a subject)
/// - How many exits found no entry
/// - How many entries were refused by a full in-flight map
/// - How many records were dropped by a full ring buffer
///
/// # Errors
/// Returns an error if the eBPF diagnostic maps cannot be accessed
pub fn print_counter_diagnostics(bpf: &Ebpf) -> Result<()> {
    let counters = read_counters(bpf)?;
    let orphans = count_orphans(bpf)?;

    println!("\n🔍 Counter diagnostics:");
    for (counter, value) in counters.iter() {
        println!("   - {}: {value}", counter.name());
    }
    println!("   - in-flight orphans: {orphans}");
    if counters.get(Counter::ReservationDenied) > 0 {
        println!("   ⚠️  Ring buffer overflowed; consider a larger --ring-bytes");
    }
    if counters.get(Counter::CapacityExceeded) > 0 {
        println!("   ⚠️  In-flight map filled up; consider a larger --table-entries");
    }

    Ok(())
}
