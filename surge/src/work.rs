//! The units of work whose latency the harness measures.
//!
//! A unit busy-waits for its duration, then appends `completion - creation` to
//! the [`LatencyRecorder`]. It never sleeps, blocks, allocates or takes a lock
//! while running; the single atomic append is its only side effect.
//!
//! Two kinds exist:
//! - [`FixedWork`]: one-shot, spawned by the dispatcher at each open-loop
//!   arrival.
//! - [`ReplicatingWork`]: closed-loop. On completion a unit spawns its own
//!   successor, so the number of live units stays at the target set on the
//!   shared [`ConcurrencyGate`]. Units above a lowered target retire instead
//!   of reproducing.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::recorder::LatencyRecorder;
use crate::runtime::{ElasticRuntime, Job, spawn_until_accepted};

/// Spins until `duration` has elapsed.
#[inline]
pub fn spin_for(duration: Duration) {
    let stop = Instant::now() + duration;
    while Instant::now() < stop {
        std::hint::spin_loop();
    }
}

#[inline]
fn latency_ns(created: Instant) -> u64 {
    created.elapsed().as_nanos() as u64
}

/// One-shot unit of fixed duration.
pub struct FixedWork {
    duration: Duration,
    created: Instant,
    recorder: Arc<LatencyRecorder>,
}

impl FixedWork {
    pub fn new(duration: Duration, created: Instant, recorder: Arc<LatencyRecorder>) -> Self {
        Self {
            duration,
            created,
            recorder,
        }
    }

    pub fn run(self) {
        spin_for(self.duration);
        // A refused append flags the recorder; the dispatcher aborts on it.
        let _ = self.recorder.record(latency_ns(self.created));
    }

    pub fn into_job(self) -> Job {
        Box::new(move || self.run())
    }
}

/// Shared target for the fixed-concurrency workload.
///
/// `live` counts units that exist, whether queued or running. Both the
/// dispatcher (scaling up) and units (retiring) change it with CAS, so the
/// count never drifts from the population it describes.
#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    target: AtomicUsize,
    live: AtomicUsize,
    task_ns: AtomicU64,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn task_duration(&self) -> Duration {
        Duration::from_nanos(self.task_ns.load(Ordering::Relaxed))
    }

    pub fn set_task_duration(&self, duration: Duration) {
        self.task_ns
            .store(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Moves the target and returns how many new units the caller must spawn
    /// to reach it. Lowering the target returns 0: surplus units retire on
    /// their own.
    pub fn scale_to(&self, target: usize) -> usize {
        self.target.store(target, Ordering::Release);
        match self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < target).then_some(target)
            }) {
            Ok(previous) => target - previous,
            Err(_) => 0,
        }
    }

    /// Called by a unit before it does anything. Returns `true` (and
    /// forgets the unit) when the population is above target.
    pub fn try_retire(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > self.target.load(Ordering::Acquire)).then(|| live - 1)
            })
            .is_ok()
    }
}

/// Self-replicating unit for the fixed-concurrency workload.
pub struct ReplicatingWork<R: ElasticRuntime> {
    created: Instant,
    gate: Arc<ConcurrencyGate>,
    recorder: Arc<LatencyRecorder>,
    runtime: Arc<R>,
}

impl<R: ElasticRuntime> ReplicatingWork<R> {
    pub fn new(
        created: Instant,
        gate: Arc<ConcurrencyGate>,
        recorder: Arc<LatencyRecorder>,
        runtime: Arc<R>,
    ) -> Self {
        Self {
            created,
            gate,
            recorder,
            runtime,
        }
    }

    pub fn run(self) {
        if self.gate.try_retire() {
            return;
        }
        spin_for(self.gate.task_duration());

        // The successor exists before this unit finishes, so the runtime's
        // occupancy never dips to zero while the population is alive.
        let successor = ReplicatingWork {
            created: Instant::now(),
            gate: self.gate.clone(),
            recorder: self.recorder.clone(),
            runtime: self.runtime.clone(),
        };
        spawn_until_accepted(&*self.runtime, successor.into_job());

        let _ = self.recorder.record(latency_ns(self.created));
    }

    pub fn into_job(self) -> Job {
        Box::new(move || self.run())
    }
}
