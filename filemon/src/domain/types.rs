//! Domain types providing compile-time safety and self-documentation
//!
//! Newtypes keep a target PID from being confused with a raw config word and
//! give the decoded operation kinds and counter totals names of their own.

use clap::ValueEnum;
use filemon_common::{Counter, COUNTER_SLOTS, OP_UNLINK, OP_WRITE};
use std::fmt;

/// Process ID (TGID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Decoded [`filemon_common::FileEvent::op`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Unlink,
    Write,
}

impl OpKind {
    /// Decode the wire value; unknown kinds yield `None`
    #[must_use]
    pub const fn from_wire(op: u16) -> Option<Self> {
        match op {
            OP_UNLINK => Some(OpKind::Unlink),
            OP_WRITE => Some(OpKind::Write),
            _ => None,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            OpKind::Unlink => "unlink",
            OpKind::Write => "write",
        }
    }
}

/// How `do_unlinkat` is observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProbeMode {
    /// Try fexit, fall back to kprobe/kretprobe if it cannot attach
    #[default]
    Auto,
    /// kprobe + kretprobe correlated through the in-flight table
    Paired,
    /// fexit only (arguments and return value in one program)
    Combined,
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeMode::Auto => "auto",
            ProbeMode::Paired => "paired",
            ProbeMode::Combined => "combined",
        };
        f.write_str(name)
    }
}

/// Totals of every [`Counter`], summed across CPUs (or threads)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot([u64; COUNTER_SLOTS as usize]);

impl CounterSnapshot {
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.0[counter.slot() as usize]
    }

    pub fn set(&mut self, counter: Counter, value: u64) {
        self.0[counter.slot() as usize] = value;
    }

    /// Records that never reached the consumer or reached it degraded
    #[must_use]
    pub fn degraded_or_lost(&self) -> u64 {
        self.get(Counter::LookupMiss) + self.get(Counter::ReservationDenied)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        Counter::ALL.iter().map(|&c| (c, self.get(c)))
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (counter, value) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={value}", counter.name())?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_kind_from_wire() {
        assert_eq!(OpKind::from_wire(OP_UNLINK), Some(OpKind::Unlink));
        assert_eq!(OpKind::from_wire(OP_WRITE), Some(OpKind::Write));
        assert_eq!(OpKind::from_wire(0), None);
    }

    #[test]
    fn test_snapshot_display() {
        let mut snapshot = CounterSnapshot::default();
        snapshot.set(Counter::Emitted, 3);
        snapshot.set(Counter::LookupMiss, 1);
        assert_eq!(
            snapshot.to_string(),
            "emitted=3, lookup_miss=1, capacity_exceeded=0, reservation_denied=0, read_fault=0"
        );
        assert_eq!(snapshot.degraded_or_lost(), 1);
    }
}
