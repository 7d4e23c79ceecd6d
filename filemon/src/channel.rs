//! # Event Channel
//!
//! Bounded multi-producer, single-consumer byte channel with the same
//! contract as the kernel's BPF ring buffer, for use in-process by the
//! simulator and tests.
//!
//! ## Layout
//!
//! Storage is an array of 64-bit words addressed by a monotonically growing
//! byte position (modulo capacity, so wraparound is invisible to callers).
//! Each record is an 8-byte header followed by its payload rounded up to 8
//! bytes:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │ header: COMMIT|DISCARD|len   │ payload (len bytes, padded)  │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! - **Reserve**: CAS on `producer_pos`, bounded attempts, fails fast when the
//!   unconsumed span plus the new record would exceed capacity
//! - **Commit**: payload stores are relaxed; the header store is `Release`
//! - **Consume**: the header load is `Acquire`; the consumer stops at the
//!   first uncommitted header, so records surface in reservation order even
//!   when later ones commit first
//! - **Free**: the consumer zeroes a record's words before advancing
//!   `consumer_pos`, so a fresh reservation always starts from a zero header
//!
//! A full channel refuses new reservations. Records already committed are
//! never overwritten, torn, or reordered; the overflow is what gets lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Zeroable;
use filemon_common::{EventSink, FileEvent, ReservationDenied, FILE_EVENT_SIZE};

use crate::domain::ChannelError;

// ============================================================================
// Constants
// ============================================================================

/// Record header size in bytes
pub const HEADER_SIZE: usize = 8;

const WORD: usize = 8;
const COMMIT_BIT: u64 = 1 << 63;
const DISCARD_BIT: u64 = 1 << 62;
const LEN_MASK: u64 = 0xffff_ffff;

/// CAS retries before a contended `reserve` gives up
pub const MAX_RESERVE_ATTEMPTS: usize = 64;

/// Bytes one record of `len` payload bytes occupies, header included
#[must_use]
pub const fn slot_size(len: usize) -> usize {
    HEADER_SIZE + len.div_ceil(WORD) * WORD
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    words: Box<[AtomicU64]>,
    producer_pos: AtomicU64,
    consumer_pos: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn capacity(&self) -> u64 {
        (self.words.len() * WORD) as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn word(&self, pos: u64, offset_words: usize) -> &AtomicU64 {
        let index = (pos / WORD as u64) as usize + offset_words;
        &self.words[index % self.words.len()]
    }
}

/// Bounded reservation-based event channel
///
/// Construct, then [`split`](EventChannel::split) into a cloneable
/// [`Producer`] and the unique [`Consumer`].
pub struct EventChannel {
    shared: Arc<Shared>,
}

impl EventChannel {
    /// Create a channel holding `bytes` of records and headers.
    ///
    /// # Errors
    /// [`ChannelError::InvalidCapacity`] unless `bytes` is a non-zero multiple
    /// of 8 large enough for one non-empty record.
    pub fn with_capacity(bytes: usize) -> Result<Self, ChannelError> {
        if bytes % WORD != 0 {
            return Err(ChannelError::InvalidCapacity { bytes, reason: "not a multiple of 8" });
        }
        if bytes < slot_size(1) {
            return Err(ChannelError::InvalidCapacity { bytes, reason: "smaller than one record" });
        }
        let words = (0..bytes / WORD).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            shared: Arc::new(Shared {
                words,
                producer_pos: AtomicU64::new(0),
                consumer_pos: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        })
    }

    /// Size the channel as `burst` slots of `record_size`-byte records.
    ///
    /// # Errors
    /// [`ChannelError::InvalidCapacity`] when `record_size` or `burst` is zero.
    pub fn for_records(record_size: usize, burst: usize) -> Result<Self, ChannelError> {
        let bytes = slot_size(record_size).saturating_mul(burst);
        if record_size == 0 || burst == 0 {
            return Err(ChannelError::InvalidCapacity { bytes, reason: "empty record or burst" });
        }
        Self::with_capacity(bytes)
    }

    /// Split into the producer and consumer halves.
    #[must_use]
    pub fn split(self) -> (Producer, Consumer) {
        (Producer { shared: Arc::clone(&self.shared) }, Consumer { shared: self.shared })
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Producer half; cheap to clone, one per emitting thread
#[derive(Clone)]
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Carve out room for a `len`-byte record. Never blocks.
    ///
    /// # Errors
    /// - [`ChannelError::RecordTooLarge`] when the record can never fit
    /// - [`ChannelError::Full`] when unconsumed records leave no room, or
    ///   the position stayed contended for [`MAX_RESERVE_ATTEMPTS`] tries;
    ///   the drop counter is incremented
    pub fn reserve(&self, len: usize) -> Result<Reservation, ChannelError> {
        let shared = &*self.shared;
        let slot = slot_size(len);
        let max = shared.capacity() as usize - HEADER_SIZE;
        if len > max || len as u64 > LEN_MASK {
            return Err(ChannelError::RecordTooLarge { len, max });
        }

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let head = shared.producer_pos.load(Ordering::Relaxed);
            let tail = shared.consumer_pos.load(Ordering::Acquire);
            // A stale `head` may trail `tail`; the CAS below then fails and retries.
            if head.saturating_sub(tail) + slot as u64 > shared.capacity() {
                break;
            }
            if shared
                .producer_pos
                .compare_exchange_weak(head, head + slot as u64, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Reservation {
                    shared: Arc::clone(&self.shared),
                    pos: head,
                    len,
                    published: false,
                });
            }
        }

        shared.dropped.fetch_add(1, Ordering::Relaxed);
        Err(ChannelError::Full)
    }

    /// Records refused for lack of room
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Reserved, not yet visible region of the channel
///
/// Dropping a reservation without committing discards it: the consumer
/// skips it without delivering anything.
pub struct Reservation {
    shared: Arc<Shared>,
    pos: u64,
    len: usize,
    published: bool,
}

impl Reservation {
    /// Payload length requested at reserve time
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `bytes` as the payload; anything past `bytes.len()` stays zero.
    ///
    /// # Panics
    /// If `bytes` is longer than the reservation.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.len, "payload exceeds reservation");
        for (i, chunk) in bytes.chunks(WORD).enumerate() {
            let mut word = [0u8; WORD];
            word[..chunk.len()].copy_from_slice(chunk);
            self.shared.word(self.pos, 1 + i).store(u64::from_le_bytes(word), Ordering::Relaxed);
        }
    }

    /// Make the record visible to the consumer.
    pub fn commit(mut self) {
        self.publish(COMMIT_BIT);
    }

    /// Give the space back without delivering a record.
    pub fn discard(mut self) {
        self.publish(COMMIT_BIT | DISCARD_BIT);
    }

    fn publish(&mut self, bits: u64) {
        self.shared.word(self.pos, 0).store(bits | self.len as u64, Ordering::Release);
        self.published = true;
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation").field("pos", &self.pos).field("len", &self.len).finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.published {
            self.publish(COMMIT_BIT | DISCARD_BIT);
        }
    }
}

impl EventSink for Producer {
    fn emit_with<R>(
        &self,
        fill: impl FnOnce(&mut FileEvent) -> R,
    ) -> Result<R, ReservationDenied> {
        let mut reservation = self.reserve(FILE_EVENT_SIZE).map_err(|_| ReservationDenied)?;
        let mut event = FileEvent::zeroed();
        let result = fill(&mut event);
        reservation.write(bytemuck::bytes_of(&event));
        reservation.commit();
        Ok(result)
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer half; the only reader
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Copy the next visible record into `buf` (replacing its contents).
    ///
    /// Returns `false` when nothing is visible yet: either the channel is
    /// empty or the oldest reservation has not been committed.
    pub fn pop_into(&mut self, buf: &mut Vec<u8>) -> bool {
        let shared = &*self.shared;
        loop {
            let tail = shared.consumer_pos.load(Ordering::Relaxed);
            let head = shared.producer_pos.load(Ordering::Acquire);
            if tail == head {
                return false;
            }

            let header = shared.word(tail, 0).load(Ordering::Acquire);
            if header & COMMIT_BIT == 0 {
                return false;
            }

            #[allow(clippy::cast_possible_truncation)]
            let len = (header & LEN_MASK) as usize;
            let payload_words = len.div_ceil(WORD);
            let discarded = header & DISCARD_BIT != 0;

            if !discarded {
                buf.clear();
                for i in 0..payload_words {
                    let word = shared.word(tail, 1 + i).load(Ordering::Relaxed);
                    buf.extend_from_slice(&word.to_le_bytes());
                }
                buf.truncate(len);
            }

            for i in 0..=payload_words {
                shared.word(tail, i).store(0, Ordering::Relaxed);
            }
            shared.consumer_pos.store(tail + slot_size(len) as u64, Ordering::Release);

            if !discarded {
                return true;
            }
        }
    }

    /// Drain every visible [`FileEvent`] record, returning how many were read.
    /// Records of any other size are skipped.
    pub fn drain_events(&mut self, mut f: impl FnMut(FileEvent)) -> usize {
        let mut buf = Vec::with_capacity(FILE_EVENT_SIZE);
        let mut count = 0;
        while self.pop_into(&mut buf) {
            if let Ok(event) = bytemuck::try_pod_read_unaligned::<FileEvent>(&buf) {
                f(event);
                count += 1;
            }
        }
        count
    }

    /// Bytes reserved but not yet consumed
    #[must_use]
    pub fn pending_bytes(&self) -> u64 {
        let head = self.shared.producer_pos.load(Ordering::Acquire);
        head - self.shared.consumer_pos.load(Ordering::Relaxed)
    }

    /// Total capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.shared.capacity()
    }

    /// Records refused for lack of room
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
