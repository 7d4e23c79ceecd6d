//! # Correlation Table
//!
//! Fixed-capacity open-addressing map bridging entry and exit handlers,
//! mirroring the semantics of a preallocated BPF hash map:
//!
//! - **put**: insert or overwrite; rejected when full and the key is new
//! - **take**: look up and remove in one step
//! - **no resize**: every slot is allocated up front
//!
//! Each slot has its own lock, held only while that slot is inspected or
//! written. There is no table-wide lock, so handlers on different keys never
//! serialize on each other. Per-key atomicity relies on one key never being
//! written by two threads at once, which holds for call keys (a key names
//! one invocation on one thread).

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};

use filemon_common::{CapacityExceeded, CorrelationMap};
use parking_lot::Mutex;

use crate::domain::TableError;

/// Attempts at claiming a free slot before `put` gives up
const PUT_ATTEMPTS: usize = 8;

enum Slot<K, V> {
    Empty,
    Occupied(K, V),
    /// Tombstone: keeps probe chains intact after a `take`
    Vacated,
}

/// Bounded key → value store with per-slot locking
pub struct CorrelationTable<K, V> {
    slots: Box<[Mutex<Slot<K, V>>]>,
    mask: usize,
    capacity: usize,
    resident: AtomicUsize,
    hasher: RandomState,
}

impl<K, V> CorrelationTable<K, V>
where
    K: Eq + Hash + Copy,
    V: Copy,
{
    /// Create a table holding at most `capacity` entries.
    ///
    /// # Errors
    /// [`TableError::ZeroCapacity`] when `capacity` is 0.
    pub fn with_capacity(capacity: usize) -> Result<Self, TableError> {
        if capacity == 0 {
            return Err(TableError::ZeroCapacity);
        }
        // Twice the entry bound keeps probe chains short and guarantees a
        // free slot exists whenever `resident < capacity`.
        let slot_count = capacity.saturating_mul(2).next_power_of_two();
        let slots = (0..slot_count).map(|_| Mutex::new(Slot::Empty)).collect();
        Ok(Self {
            slots,
            mask: slot_count - 1,
            capacity,
            resident: AtomicUsize::new(0),
            hasher: RandomState::new(),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn probe(&self, key: &K) -> impl Iterator<Item = usize> + '_ {
        let start = self.hasher.hash_one(key) as usize;
        (0..self.slots.len()).map(move |i| (start + i) & self.mask)
    }

    /// Insert or overwrite the value for `key`.
    ///
    /// # Errors
    /// - [`TableError::Full`] when `capacity` entries are resident and `key`
    ///   is not one of them
    /// - [`TableError::Contended`] when every free slot found was claimed by
    ///   another thread first, [`PUT_ATTEMPTS`] times in a row
    pub fn put(&self, key: K, value: V) -> Result<(), TableError> {
        for _ in 0..PUT_ATTEMPTS {
            let mut free = None;
            for index in self.probe(&key) {
                let mut slot = self.slots[index].lock();
                match &mut *slot {
                    Slot::Occupied(k, v) if *k == key => {
                        *v = value;
                        return Ok(());
                    }
                    Slot::Occupied(..) => {}
                    Slot::Vacated => {
                        free.get_or_insert(index);
                    }
                    Slot::Empty => {
                        free.get_or_insert(index);
                        break;
                    }
                }
            }

            let Some(index) = free else {
                return Err(TableError::Full { capacity: self.capacity });
            };
            self.resident
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.capacity).then_some(n + 1)
                })
                .map_err(|_| TableError::Full { capacity: self.capacity })?;

            let mut slot = self.slots[index].lock();
            if matches!(*slot, Slot::Empty | Slot::Vacated) {
                *slot = Slot::Occupied(key, value);
                return Ok(());
            }
            drop(slot);
            self.resident.fetch_sub(1, Ordering::AcqRel);
        }
        Err(TableError::Contended)
    }

    /// Remove the entry for `key`, returning its value.
    pub fn take(&self, key: &K) -> Option<V> {
        for index in self.probe(key) {
            let mut slot = self.slots[index].lock();
            match &*slot {
                Slot::Occupied(k, v) if k == key => {
                    let value = *v;
                    *slot = Slot::Vacated;
                    drop(slot);
                    self.resident.fetch_sub(1, Ordering::AcqRel);
                    return Some(value);
                }
                Slot::Empty => return None,
                _ => {}
            }
        }
        None
    }

    /// Whether `key` is resident (diagnostics only; racy under concurrency)
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        for index in self.probe(key) {
            match &*self.slots[index].lock() {
                Slot::Occupied(k, _) if k == key => return true,
                Slot::Empty => return false,
                _ => {}
            }
        }
        false
    }
}

impl<K, V> CorrelationMap<K, V> for CorrelationTable<K, V>
where
    K: Eq + Hash + Copy,
    V: Copy,
{
    fn put(&self, key: &K, value: &V) -> Result<(), CapacityExceeded> {
        CorrelationTable::put(self, *key, *value).map_err(|_| CapacityExceeded)
    }

    fn take_with<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        let value = self.take(key);
        f(value.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            CorrelationTable::<u64, u64>::with_capacity(0).err(),
            Some(TableError::ZeroCapacity)
        );
    }

    #[test]
    fn test_put_take() {
        let table = CorrelationTable::with_capacity(4).unwrap();
        table.put(1u64, 10u64).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(&1), Some(10));
        assert_eq!(table.take(&1), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_overwrite_is_last_writer_wins() {
        let table = CorrelationTable::with_capacity(1).unwrap();
        table.put(7u64, 1u64).unwrap();
        table.put(7, 2).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(&7), Some(2));
    }

    #[test]
    fn test_full_table_rejects_new_key_but_updates_resident() {
        let table = CorrelationTable::with_capacity(2).unwrap();
        table.put(1u64, 1u64).unwrap();
        table.put(2, 2).unwrap();
        assert_eq!(table.put(3, 3), Err(TableError::Full { capacity: 2 }));
        table.put(2, 20).unwrap();
        assert_eq!(table.take(&1), Some(1));
        assert_eq!(table.take(&2), Some(20));
        assert_eq!(table.take(&3), None);
    }

    #[test]
    fn test_tombstones_keep_chains_and_get_reused() {
        let table = CorrelationTable::with_capacity(3).unwrap();
        for round in 0..100u64 {
            table.put(round, round).unwrap();
            table.put(round + 1000, round).unwrap();
            assert!(table.contains(&(round + 1000)));
            assert_eq!(table.take(&round), Some(round));
            assert_eq!(table.take(&(round + 1000)), Some(round));
        }
        assert!(table.is_empty());
    }
}
