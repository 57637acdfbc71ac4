//! Preallocated, append-only latency store.
//!
//! The recorder is the only state shared between the dispatcher and the units
//! of work it spawns. It is an arena of `capacity` slots plus an atomic cursor.
//! Every completing unit reserves exactly one slot by advancing the cursor and
//! then writes its latency there, so no two writers ever touch the same index.
//!
//! The arena is zero-filled on construction, which faults every page in before
//! the timing-sensitive part of a run starts. It is never resized: once the
//! cursor reaches `capacity` further appends are refused and the recorder is
//! flagged as overflowed, which the dispatcher turns into an aborted run.
//!
//! # Why a bounded CAS instead of a bare `fetch_add`?
//! A bare `fetch_add` would push the cursor past `capacity` on overflow, and
//! the cursor is what interval snapshots read. `fetch_update` keeps the cursor
//! `<= capacity` at all times while still handing out each index exactly once.
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("latency recorder is full ({capacity} entries)")]
pub struct RecorderFull {
    pub capacity: usize,
}

pub struct LatencyRecorder {
    slots: Box<[AtomicU64]>,
    cursor: AtomicUsize,
    overflowed: AtomicBool,
}

impl LatencyRecorder {
    /// Allocates and pages in `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots: Box<[AtomicU64]> = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        tracing::debug!(capacity, "latency recorder paged in");
        Self {
            slots,
            cursor: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots handed out so far. Never decreases, never exceeds
    /// [`capacity`](Self::capacity).
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Set once an append has been refused for lack of space.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Appends one latency, returning the slot it landed in.
    ///
    /// Lock-free and allocation-free; safe to call from any number of
    /// concurrently completing units.
    pub fn record(&self, latency_ns: u64) -> Result<usize, RecorderFull> {
        let capacity = self.capacity();
        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < capacity).then_some(c + 1)
            })
            .map_err(|_| {
                self.overflowed.store(true, Ordering::Relaxed);
                RecorderFull { capacity }
            })?;
        self.slots[index].store(latency_ns, Ordering::Relaxed);
        Ok(index)
    }

    /// Copies the recorded values in `range` out of the arena.
    ///
    /// Only meaningful once every writer that reserved a slot inside `range`
    /// has finished, i.e. after the dispatcher's drain rendezvous.
    pub fn read(&self, range: Range<usize>) -> Vec<u64> {
        let end = range.end.min(self.cursor());
        let start = range.start.min(end);
        self.slots[start..end]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    /// Copies every recorded value out of the arena.
    pub fn read_all(&self) -> Vec<u64> {
        self.read(0..self.cursor())
    }
}

impl std::fmt::Debug for LatencyRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyRecorder")
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor())
            .field("overflowed", &self.overflowed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn appends_in_order() {
        let recorder = LatencyRecorder::with_capacity(4);
        assert_eq!(recorder.record(10), Ok(0));
        assert_eq!(recorder.record(20), Ok(1));
        assert_eq!(recorder.cursor(), 2);
        assert_eq!(recorder.read_all(), vec![10, 20]);
    }

    #[test]
    fn refuses_past_capacity_without_moving_cursor() {
        let recorder = LatencyRecorder::with_capacity(2);
        recorder.record(1).unwrap();
        recorder.record(2).unwrap();
        assert!(!recorder.overflowed());

        assert_eq!(recorder.record(3), Err(RecorderFull { capacity: 2 }));
        assert_eq!(recorder.cursor(), 2);
        assert!(recorder.overflowed());
        assert_eq!(recorder.read_all(), vec![1, 2]);
    }

    #[test]
    fn zero_capacity_is_immediately_full() {
        let recorder = LatencyRecorder::with_capacity(0);
        assert!(recorder.record(1).is_err());
        assert!(recorder.read_all().is_empty());
    }

    #[test]
    fn read_clamps_to_cursor() {
        let recorder = LatencyRecorder::with_capacity(8);
        for v in 0..3 {
            recorder.record(v).unwrap();
        }
        assert_eq!(recorder.read(1..8), vec![1, 2]);
        assert!(recorder.read(5..8).is_empty());
    }

    #[test]
    fn concurrent_writers_get_disjoint_slots() {
        let threads = 8;
        let per_thread = 1_000;
        let recorder = Arc::new(LatencyRecorder::with_capacity(threads * per_thread + 10));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let recorder = recorder.clone();
                thread::spawn(move || {
                    for i in 0..per_thread {
                        recorder.record((t * per_thread + i) as u64).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(recorder.cursor(), threads * per_thread);
        let mut values = recorder.read_all();
        values.sort_unstable();
        let expected: Vec<u64> = (0..(threads * per_thread) as u64).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn concurrent_overflow_never_exceeds_capacity() {
        let recorder = Arc::new(LatencyRecorder::with_capacity(100));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let recorder = recorder.clone();
                thread::spawn(move || {
                    (0..100).filter(|_| recorder.record(7).is_ok()).count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(accepted, 100);
        assert_eq!(recorder.cursor(), 100);
        assert!(recorder.overflowed());
    }
}
