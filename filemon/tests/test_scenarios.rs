use filemon::channel::{Consumer, EventChannel};
use filemon::simulate::{Pipeline, SimCall, ENOENT};
use filemon_common::{
    Counter, EntryOutcome, ExitOutcome, FileEvent, PidFilter, FILE_EVENT_SIZE, FLAG_COMBINED,
    OP_UNLINK, OP_WRITE,
};
use proptest::prelude::*;

fn pipeline(table_entries: usize, ring_records: usize, filter: PidFilter) -> (Pipeline, Consumer) {
    let (producer, consumer) =
        EventChannel::for_records(FILE_EVENT_SIZE, ring_records).unwrap().split();
    (Pipeline::new(table_entries, producer, filter).unwrap(), consumer)
}

fn drain(consumer: &mut Consumer) -> Vec<FileEvent> {
    let mut events = Vec::new();
    consumer.drain_events(|e| events.push(e));
    events
}

#[test]
fn test_scenario_a_matched_pair() {
    let (pipeline, mut consumer) = pipeline(16, 16, PidFilter::disabled());
    let k1 = SimCall::new(42, 42, "rm", 0x1000);

    assert_eq!(pipeline.unlink_entry(&k1.path(b"/tmp/a")), EntryOutcome::InFlight);
    assert_eq!(pipeline.unlink_exit(&k1.returning(0)), ExitOutcome::Completed);

    let events = drain(&mut consumer);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pid, 42);
    assert_eq!(events[0].op, OP_UNLINK);
    assert_eq!(events[0].subject_bytes(), b"/tmp/a");
    assert_eq!(events[0].ret, 0);
    assert!(!events[0].is_degraded());
}

#[test]
fn test_scenario_b_exit_without_entry() {
    let (pipeline, mut consumer) = pipeline(16, 16, PidFilter::disabled());
    let k2 = SimCall::new(77, 78, "unlink", 0x2000).returning(ENOENT);

    assert_eq!(pipeline.unlink_exit(&k2), ExitOutcome::CompletedDegraded);

    let events = drain(&mut consumer);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pid, 77);
    assert_eq!(events[0].comm_bytes(), b"unlink");
    assert!(events[0].subject_bytes().is_empty());
    assert_eq!(events[0].ret, ENOENT);
    assert!(events[0].is_degraded());
    assert_eq!(pipeline.counters().get(Counter::LookupMiss), 1);
}

#[test]
fn test_scenario_c_interleaved_calls() {
    let (pipeline, mut consumer) = pipeline(16, 16, PidFilter::disabled());
    let k1 = SimCall::new(5, 5, "a", 0x1000).path(b"/one");
    let k2 = SimCall::new(5, 6, "b", 0x1000).path(b"/two");

    pipeline.unlink_entry(&k1);
    pipeline.unlink_entry(&k2);
    pipeline.unlink_exit(&k2.returning(-13));
    pipeline.unlink_exit(&k1.returning(0));

    let events = drain(&mut consumer);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].subject_bytes(), b"/two");
    assert_eq!(events[0].ret, -13);
    assert_eq!(events[1].subject_bytes(), b"/one");
    assert_eq!(events[1].ret, 0);
    assert_eq!(pipeline.in_flight(), 0);
}

#[test]
fn test_scenario_d_full_table_rejects_new_key() {
    const N: usize = 4;
    let (pipeline, mut consumer) = pipeline(N, 16, PidFilter::disabled());
    let paths: Vec<Vec<u8>> = (0..N).map(|i| format!("/orphan/{i}").into_bytes()).collect();

    // N orphans: entries whose exits have not fired
    for (i, path) in paths.iter().enumerate() {
        let call = SimCall::new(1, 1, "t", 0x1000 + i as u64 * 0x100).path(path);
        assert_eq!(pipeline.unlink_entry(&call), EntryOutcome::InFlight);
    }

    let new = SimCall::new(2, 2, "t", 0x9000);
    assert_eq!(pipeline.unlink_entry(&new.path(b"/new")), EntryOutcome::Rejected);
    assert_eq!(pipeline.unlink_exit(&new), ExitOutcome::CompletedDegraded);
    assert_eq!(pipeline.counters().get(Counter::CapacityExceeded), 1);

    // Pre-existing entries were neither evicted nor corrupted
    for i in 0..N {
        let call = SimCall::new(1, 1, "t", 0x1000 + i as u64 * 0x100);
        assert_eq!(pipeline.unlink_exit(&call), ExitOutcome::Completed);
    }

    let events = drain(&mut consumer);
    assert!(events[0].is_degraded());
    for (event, path) in events[1..].iter().zip(&paths) {
        assert_eq!(event.subject_bytes(), path.as_slice());
    }
}

#[test]
fn test_overwrite_on_key_reuse_reclaims_orphan() {
    let (pipeline, mut consumer) = pipeline(1, 4, PidFilter::disabled());
    let call = SimCall::new(3, 3, "t", 0x1000);

    pipeline.unlink_entry(&call.path(b"/stale"));
    assert_eq!(pipeline.unlink_entry(&call.path(b"/fresh")), EntryOutcome::InFlight);
    pipeline.unlink_exit(&call);

    assert_eq!(drain(&mut consumer)[0].subject_bytes(), b"/fresh");
    assert_eq!(pipeline.in_flight(), 0);
}

#[test]
fn test_combined_observation_needs_no_entry() {
    let (pipeline, mut consumer) = pipeline(1, 4, PidFilter::disabled());
    let call = SimCall::new(8, 8, "rm", 0).path(b"/tmp/gone").returning(0);

    assert_eq!(pipeline.unlink_complete(&call), ExitOutcome::Completed);
    assert_eq!(pipeline.in_flight(), 0);

    let events = drain(&mut consumer);
    assert_eq!(events[0].subject_bytes(), b"/tmp/gone");
    assert_eq!(events[0].flags, FLAG_COMBINED);
}

#[test]
fn test_combined_read_fault_degrades() {
    let (pipeline, mut consumer) = pipeline(1, 4, PidFilter::disabled());
    let call = SimCall::new(8, 8, "rm", 0).returning(-1);

    assert_eq!(pipeline.unlink_complete(&call), ExitOutcome::CompletedDegraded);
    let events = drain(&mut consumer);
    assert!(events[0].is_degraded());
    assert_eq!(pipeline.counters().get(Counter::ReadFault), 1);
}

#[test]
fn test_write_monitor() {
    let (pipeline, mut consumer) = pipeline(4, 4, PidFilter::disabled());
    let call = SimCall::new(11, 12, "echo", 1).writing(1, 5);

    pipeline.write_entry(&call);
    pipeline.write_exit(&call.returning(5));

    let events = drain(&mut consumer);
    assert_eq!(events[0].op, OP_WRITE);
    assert_eq!(events[0].subject_bytes(), b"fd=1 len=5");
    assert_eq!(events[0].ret, 5);
}

#[test]
fn test_pid_filter_skips_other_processes() {
    let (pipeline, mut consumer) = pipeline(4, 4, PidFilter::new(42, 0));
    let other = SimCall::new(7, 7, "x", 1).path(b"/x");
    let target = SimCall::new(42, 43, "y", 1).path(b"/y");

    assert_eq!(pipeline.unlink_entry(&other), EntryOutcome::Filtered);
    assert_eq!(pipeline.unlink_exit(&other), ExitOutcome::Filtered);
    pipeline.unlink_entry(&target);
    pipeline.unlink_exit(&target);

    let events = drain(&mut consumer);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pid, 42);
    assert_eq!(pipeline.in_flight(), 0);
}

#[test]
fn test_full_channel_drops_and_clears_entry() {
    let (pipeline, mut consumer) = pipeline(4, 1, PidFilter::disabled());
    let first = SimCall::new(1, 1, "t", 1).path(b"/first");
    let second = SimCall::new(1, 1, "t", 2).path(b"/second");

    pipeline.unlink_entry(&first);
    pipeline.unlink_entry(&second);
    assert_eq!(pipeline.unlink_exit(&first), ExitOutcome::Completed);
    assert_eq!(pipeline.unlink_exit(&second), ExitOutcome::Dropped);
    assert_eq!(pipeline.in_flight(), 0);
    assert_eq!(consumer.dropped(), 1);

    let events = drain(&mut consumer);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject_bytes(), b"/first");
}

#[test]
fn test_more_in_flight_than_capacity_across_threads() {
    const N: usize = 32;
    const THREADS: u32 = 8;
    const PER_THREAD: u64 = 16;
    let (pipeline, mut consumer) = pipeline(N, 1024, PidFilter::disabled());

    let accepted: Vec<Vec<u64>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pipeline = &pipeline;
                s.spawn(move || {
                    let mut accepted = Vec::new();
                    for sp in 0..PER_THREAD {
                        let path = format!("/t{t}/{sp}");
                        let call = SimCall::new(100 + t, 100 + t, "w", sp).path(path.as_bytes());
                        if pipeline.unlink_entry(&call) == EntryOutcome::InFlight {
                            accepted.push(sp);
                        }
                    }
                    accepted
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let total: usize = accepted.iter().map(Vec::len).sum();
    assert_eq!(total, N);
    assert_eq!(pipeline.in_flight(), N);

    for t in 0..THREADS {
        for sp in 0..PER_THREAD {
            pipeline.unlink_exit(&SimCall::new(100 + t, 100 + t, "w", sp));
        }
    }

    let events = drain(&mut consumer);
    assert_eq!(events.len(), (u64::from(THREADS) * PER_THREAD) as usize);
    for event in &events {
        if event.is_degraded() {
            continue;
        }
        // Every matched record carries its own call's path
        let t = event.pid - 100;
        let subject = String::from_utf8(event.subject_bytes().to_vec()).unwrap();
        assert!(subject.starts_with(&format!("/t{t}/")), "{subject} for pid {}", event.pid);
    }
    assert_eq!(events.iter().filter(|e| !e.is_degraded()).count(), N);
}

proptest! {
    #[test]
    fn prop_matched_pair_carries_captured_subject(
        path in "/[a-z0-9/._-]{0,300}",
        pid in 1u32..100_000,
        sp in any::<u64>(),
        ret in any::<i64>(),
    ) {
        let (pipeline, mut consumer) = pipeline(4, 4, PidFilter::disabled());
        let call = SimCall::new(pid, pid, "p", sp).path(path.as_bytes());

        pipeline.unlink_entry(&call);
        pipeline.unlink_exit(&call.returning(ret));

        let events = drain(&mut consumer);
        prop_assert_eq!(events.len(), 1);
        // Truncated to the subject field, keeping the trailing NUL
        let expected = &path.as_bytes()[..path.len().min(255)];
        prop_assert_eq!(events[0].subject_bytes(), expected);
        prop_assert_eq!(events[0].ret, ret);
        prop_assert_eq!(events[0].pid, pid);
    }
}
