use std::sync::Arc;
use std::time::{Duration, Instant};

use typed_builder::TypedBuilder;

use super::{ArrivalStrategy, IntervalSnapshot, RunError, RunRecord};
use crate::arrival::ArrivalProcess;
use crate::plan::{Interval, IntervalPlan};
use crate::recorder::LatencyRecorder;
use crate::runtime::{ElasticRuntime, spawn_until_accepted};
use crate::work::{ConcurrencyGate, FixedWork, ReplicatingWork};
use internals::*;

/// Run configuration: the plan plus how to offer it.
///
/// ```rust, ignore
/// let record = Controller::builder()
///     .plan(plan)
///     .strategy(ArrivalStrategy::Uniform)
///     .seed(7)
///     .build()
///     .run(Arc::new(pool))?;
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Controller {
    pub plan: IntervalPlan,
    #[builder(default)]
    pub strategy: ArrivalStrategy,
    /// Pull overdue arrival deadlines forward to now instead of letting a
    /// backlog build up.
    #[builder(default = true)]
    pub clipping: bool,
    /// Seed for the arrival generator; OS entropy when unset.
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
    /// Recorder slots to preallocate. Sized from the plan when unset.
    #[builder(default, setter(strip_option))]
    pub capacity: Option<usize>,
    /// Core to pin the dispatcher thread to.
    #[builder(default, setter(strip_option))]
    pub dispatch_core: Option<usize>,
}

impl Controller {
    /// Drives the whole plan against `runtime` and waits for every spawned
    /// unit to finish.
    pub fn run<R: ElasticRuntime>(&self, runtime: Arc<R>) -> Result<RunRecord, RunError> {
        if !self.strategy.is_open_loop() {
            self.check_admission(&*runtime)?;
        }
        let capacity = self
            .capacity
            .unwrap_or_else(|| estimate_capacity(&self.plan, self.strategy));
        let recorder = Arc::new(LatencyRecorder::with_capacity(capacity));
        let gate = Arc::new(ConcurrencyGate::new());

        tracing::info!(
            intervals = self.plan.len(),
            strategy = ?self.strategy,
            clipping = self.clipping,
            capacity,
            "starting run"
        );
        let dispatched = std::thread::scope(|scope| {
            let dispatcher = std::thread::Builder::new()
                .name("surge-dispatch".into())
                .spawn_scoped(scope, || {
                    Dispatcher::new(self, &runtime, &recorder, &gate)?.run()
                })
                .map_err(RunError::Spawn)?;
            dispatcher
                .join()
                .unwrap_or(Err(RunError::DispatcherPanicked))
        });

        // closed-loop units retire once the target is zero
        gate.scale_to(0);
        drain(&*runtime);

        let snapshots = dispatched.inspect_err(|e| tracing::error!("run aborted: {e}"))?;
        if recorder.overflowed() {
            tracing::error!(capacity, "measurement buffer overflowed; results would be corrupt");
            return Err(RunError::CapacityExceeded { capacity });
        }

        let record = RunRecord {
            plan: self.plan.clone(),
            strategy: self.strategy,
            snapshots,
            recorder,
        };
        tracing::info!(completions = record.completions(), "run complete");
        Ok(record)
    }

    /// Refuses closed-loop plans whose population the runtime could not keep
    /// cycling.
    fn check_admission<R: ElasticRuntime + ?Sized>(&self, runtime: &R) -> Result<(), RunError> {
        self.plan.check_concurrency()?;
        let target = self.plan.peak_concurrency();
        match runtime.admission_limit() {
            Some(limit) if target > limit => {
                tracing::error!(
                    peak = target,
                    limit,
                    "fixed-concurrency target exceeds runtime admission"
                );
                Err(RunError::AdmissionExceeded { target, limit })
            }
            _ => Ok(()),
        }
    }
}

/// State owned by the dispatcher thread for the length of one run.
struct Dispatcher<'a, R: ElasticRuntime> {
    controller: &'a Controller,
    runtime: &'a Arc<R>,
    recorder: &'a Arc<LatencyRecorder>,
    gate: &'a Arc<ConcurrencyGate>,
    /// `None` for the closed-loop strategy.
    arrivals: Option<ArrivalProcess>,
    start: Instant,
    clips: u64,
    spawn_retries: u64,
}

impl<'a, R: ElasticRuntime> Dispatcher<'a, R> {
    fn new(
        controller: &'a Controller,
        runtime: &'a Arc<R>,
        recorder: &'a Arc<LatencyRecorder>,
        gate: &'a Arc<ConcurrencyGate>,
    ) -> Result<Self, RunError> {
        let first_rate = controller.plan.get(0).map_or(0.0, |i| i.load);
        let arrivals = match controller.strategy.shape() {
            Some(shape) => Some(ArrivalProcess::new(shape, first_rate, controller.seed)?),
            None => None,
        };
        Ok(Self {
            controller,
            runtime,
            recorder,
            gate,
            arrivals,
            start: Instant::now(),
            clips: 0,
            spawn_retries: 0,
        })
    }

    fn run(mut self) -> Result<Vec<IntervalSnapshot>, RunError> {
        if let Some(core) = self.controller.dispatch_core {
            pin_current_thread(core)?;
        }

        let intervals = self.controller.plan.intervals();
        let mut snapshots = Vec::with_capacity(intervals.len() + 1);
        let Some(&first) = intervals.first() else {
            return Ok(snapshots);
        };

        let mut index = 0;
        let mut interval = first;
        self.start = Instant::now();
        snapshots.push(self.snapshot(self.start));
        let mut next = self.enter(&interval, self.start)?;
        let mut interval_end = self.start + interval.run_duration;

        loop {
            let now = Instant::now();

            if let Some(deadline) = next.filter(|d| now >= *d) {
                let unit = FixedWork::new(interval.task_duration, deadline, self.recorder.clone());
                self.spawn_retries += spawn_until_accepted(&**self.runtime, unit.into_job());

                let gap = self.arrivals.as_mut().and_then(ArrivalProcess::draw_duration);
                let (following, clipped) =
                    next_deadline(deadline, gap, Instant::now(), self.controller.clipping);
                next = following;
                self.clips += clipped as u64;
            }

            if self.recorder.overflowed() {
                return Err(RunError::CapacityExceeded {
                    capacity: self.recorder.capacity(),
                });
            }

            if now >= interval_end {
                let at = Instant::now();
                snapshots.push(self.snapshot(at));
                index += 1;
                let Some(&upcoming) = intervals.get(index) else {
                    break;
                };
                tracing::info!(
                    interval = index,
                    from = interval.load,
                    to = upcoming.load,
                    task = ?upcoming.task_duration,
                    "load change"
                );
                interval = upcoming;
                next = self.enter(&interval, at)?;
                interval_end = at + interval.run_duration;
            }
        }

        tracing::debug!(
            clips = self.clips,
            spawn_retries = self.spawn_retries,
            "dispatcher done"
        );
        Ok(snapshots)
    }

    /// Applies `interval`'s parameters. Returns the first arrival deadline
    /// for the open-loop strategies, restarting the arrival clock at `now`.
    fn enter(&mut self, interval: &Interval, now: Instant) -> Result<Option<Instant>, RunError> {
        if let Some(arrivals) = self.arrivals.as_mut() {
            arrivals.reparameterize(interval.load)?;
            return Ok(arrivals.draw_duration().and_then(|gap| now.checked_add(gap)));
        }

        self.gate.set_task_duration(interval.task_duration);
        let deficit = self.gate.scale_to(interval.concurrency());
        for _ in 0..deficit {
            let unit = ReplicatingWork::new(
                now,
                self.gate.clone(),
                self.recorder.clone(),
                self.runtime.clone(),
            );
            self.spawn_retries += spawn_until_accepted(&**self.runtime, unit.into_job());
        }
        Ok(None)
    }

    fn snapshot(&self, at: Instant) -> IntervalSnapshot {
        IntervalSnapshot {
            elapsed: at.saturating_duration_since(self.start),
            cursor: self.recorder.cursor(),
            counters: self.runtime.counters(),
            clips: self.clips,
            spawn_retries: self.spawn_retries,
        }
    }
}

fn pin_current_thread(core: usize) -> Result<(), RunError> {
    let id = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .ok_or(RunError::Pinning { core })?;
    if !core_affinity::set_for_current(id) {
        return Err(RunError::Pinning { core });
    }
    tracing::debug!(core, "dispatcher pinned");
    Ok(())
}

#[cfg(feature = "internals")]
pub use internals::*;

mod internals {
    use super::*;

    /// Smallest and largest recorder sizes picked automatically.
    pub const MIN_CAPACITY: usize = 1 << 16;
    pub const MAX_CAPACITY: usize = 1 << 26;

    /// Pure function computing the arrival deadline that follows `previous`.
    ///
    /// Returns the deadline (`None` when no further arrival is due in this
    /// interval) and whether it was clipped to `now`.
    pub fn next_deadline(
        previous: Instant,
        gap: Option<Duration>,
        now: Instant,
        clipping: bool,
    ) -> (Option<Instant>, bool) {
        let Some(deadline) = gap.and_then(|gap| previous.checked_add(gap)) else {
            return (None, false);
        };
        if clipping && deadline < now {
            (Some(now), true)
        } else {
            (Some(deadline), false)
        }
    }

    /// Recorder slots for a run of `plan`: four times the expected number of
    /// completions, clamped to `[MIN_CAPACITY, MAX_CAPACITY]`.
    pub fn estimate_capacity(plan: &IntervalPlan, strategy: ArrivalStrategy) -> usize {
        let expected = plan.expected_completions(strategy) * 4.0;
        if expected.is_nan() {
            return MIN_CAPACITY;
        }
        (expected as usize).clamp(MIN_CAPACITY, MAX_CAPACITY)
    }

    /// Polls the runtime's occupancy until no accepted unit is left running.
    pub fn drain<R: ElasticRuntime + ?Sized>(runtime: &R) -> Duration {
        let started = Instant::now();
        let pending = runtime.in_flight();
        if pending > 0 {
            tracing::debug!(pending, "draining in-flight units");
        }
        while runtime.in_flight() > 0 {
            std::thread::yield_now();
        }
        let waited = started.elapsed();
        tracing::debug!(?waited, "runtime drained");
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanError;
    use crate::runtime::{Job, PoolConfig, Rejected, RuntimeCounters};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    /// Runs every accepted job on the calling thread, after refusing the
    /// first `refusals` offers.
    struct Inline {
        refusals: AtomicUsize,
    }

    impl Inline {
        fn new() -> Arc<Self> {
            Self::refusing(0)
        }

        fn refusing(refusals: usize) -> Arc<Self> {
            Arc::new(Self {
                refusals: AtomicUsize::new(refusals),
            })
        }
    }

    impl ElasticRuntime for Inline {
        fn try_spawn(&self, job: Job) -> Result<(), Rejected> {
            let refused = self
                .refusals
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                    left.checked_sub(1)
                })
                .is_ok();
            if refused {
                return Err(Rejected(job));
            }
            job();
            Ok(())
        }

        fn counters(&self) -> RuntimeCounters {
            RuntimeCounters::default()
        }

        fn in_flight(&self) -> usize {
            0
        }
    }

    fn plan(intervals: &[(u64, f64, u64)]) -> IntervalPlan {
        IntervalPlan::new(
            intervals
                .iter()
                .map(|&(run_ms, load, task_us)| {
                    Interval::new(
                        Duration::from_millis(run_ms),
                        load,
                        Duration::from_micros(task_us),
                    )
                })
                .collect(),
        )
        .unwrap()
    }

    mod next_deadline {
        use super::*;

        #[test]
        fn advances_from_previous_deadline() {
            let previous = Instant::now();
            let now = previous + Duration::from_micros(5);
            let (next, clipped) =
                next_deadline(previous, Some(Duration::from_micros(10)), now, true);
            assert_eq!(next, Some(previous + Duration::from_micros(10)));
            assert!(!clipped);
        }

        #[test]
        fn clips_overdue_deadline_to_now() {
            let previous = Instant::now();
            let now = previous + Duration::from_millis(1);
            let (next, clipped) =
                next_deadline(previous, Some(Duration::from_micros(10)), now, true);
            assert_eq!(next, Some(now));
            assert!(clipped);
        }

        #[test]
        fn keeps_backlog_when_clipping_is_off() {
            let previous = Instant::now();
            let now = previous + Duration::from_millis(1);
            let (next, clipped) =
                next_deadline(previous, Some(Duration::from_micros(10)), now, false);
            assert_eq!(next, Some(previous + Duration::from_micros(10)));
            assert!(!clipped);
        }

        #[test]
        fn deadline_equal_to_now_is_not_a_clip() {
            let previous = Instant::now();
            let gap = Duration::from_micros(3);
            let (next, clipped) = next_deadline(previous, Some(gap), previous + gap, true);
            assert_eq!(next, Some(previous + gap));
            assert!(!clipped);
        }

        #[test]
        fn no_gap_means_no_arrival() {
            let now = Instant::now();
            assert_eq!(next_deadline(now, None, now, true), (None, false));
        }
    }

    mod estimate_capacity {
        use super::*;

        #[test]
        fn small_plans_get_the_floor() {
            let p = plan(&[(100, 10.0, 0)]);
            assert_eq!(estimate_capacity(&p, ArrivalStrategy::Poisson), MIN_CAPACITY);
        }

        #[test]
        fn scales_with_expected_completions() {
            // 1_000_000/s for 100ms = 100_000 completions
            let p = plan(&[(100, 1_000_000.0, 0)]);
            assert_eq!(estimate_capacity(&p, ArrivalStrategy::Uniform), 400_000);
        }

        #[test]
        fn huge_plans_are_capped() {
            let p = plan(&[(3_600_000, 10_000_000.0, 0)]);
            assert_eq!(estimate_capacity(&p, ArrivalStrategy::Poisson), MAX_CAPACITY);
        }
    }

    mod controller {
        use super::*;

        #[test]
        fn takes_one_snapshot_per_boundary() {
            let record = Controller::builder()
                .plan(plan(&[(20, 2_000.0, 0), (20, 4_000.0, 0), (20, 0.0, 0)]))
                .seed(1)
                .build()
                .run(Inline::new())
                .unwrap();

            assert_eq!(record.snapshots.len(), 4);
            assert_eq!(record.snapshots[0].cursor, 0);
            for pair in record.snapshots.windows(2) {
                assert!(pair[0].cursor <= pair[1].cursor);
                assert!(pair[0].elapsed <= pair[1].elapsed);
            }
            assert!(record.completions() > 0);
            // a zero-rate interval offers nothing
            assert!(record.interval_latencies(2).is_empty());
        }

        #[test]
        fn refused_spawns_are_retried_and_counted() {
            let record = Controller::builder()
                .plan(plan(&[(50, 1_000.0, 0)]))
                .seed(3)
                .build()
                .run(Inline::refusing(3))
                .unwrap();

            let last = record.snapshots.last().unwrap();
            assert_eq!(last.spawn_retries, 3);
            assert!(record.completions() > 0);
        }

        #[test]
        fn serial_overload_is_clipped() {
            // every inline unit stalls the dispatcher for 1ms
            let record = Controller::builder()
                .plan(plan(&[(30, 1_000_000.0, 1_000)]))
                .seed(5)
                .capacity(1 << 16)
                .build()
                .run(Inline::new())
                .unwrap();

            assert!(record.snapshots.last().unwrap().clips > 0);
        }

        #[test]
        fn overflow_aborts_the_run() {
            let err = Controller::builder()
                .plan(plan(&[(50, 100_000.0, 0)]))
                .capacity(4)
                .build()
                .run(Inline::new())
                .unwrap_err();
            assert!(matches!(err, RunError::CapacityExceeded { capacity: 4 }));
        }

        #[test]
        fn unknown_core_cannot_be_pinned() {
            let err = Controller::builder()
                .plan(plan(&[(1, 10.0, 0)]))
                .dispatch_core(usize::MAX)
                .build()
                .run(Inline::new())
                .unwrap_err();
            assert!(matches!(err, RunError::Pinning { core: usize::MAX }));
        }

        #[test]
        fn fixed_concurrency_drains_to_zero() {
            let pool = Arc::new(
                PoolConfig::builder()
                    .max_contexts(4)
                    .build()
                    .start()
                    .unwrap(),
            );
            let record = Controller::builder()
                .plan(plan(&[(30, 2.0, 100), (30, 4.0, 100), (30, 1.0, 100)]))
                .strategy(ArrivalStrategy::FixedConcurrency)
                .build()
                .run(pool.clone())
                .unwrap();

            assert_eq!(record.snapshots.len(), 4);
            for i in 0..3 {
                assert!(!record.interval_latencies(i).is_empty(), "interval {i}");
            }
            assert_eq!(pool.in_flight(), 0);
        }

        /// Runs a fixed-concurrency plan on a helper thread so a hang fails
        /// the test instead of stalling it.
        fn run_closed_loop(
            pool: PoolConfig,
            intervals: &[(u64, f64, u64)],
        ) -> Result<RunRecord, RunError> {
            let pool = Arc::new(pool.start().unwrap());
            let controller = Controller::builder()
                .plan(plan(intervals))
                .strategy(ArrivalStrategy::FixedConcurrency)
                .build();
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(controller.run(pool));
            });
            rx.recv_timeout(Duration::from_secs(10))
                .expect("fixed-concurrency run did not finish")
        }

        #[test]
        fn population_beyond_admission_is_refused() {
            let tiny = PoolConfig::builder().max_contexts(1).queue_depth(2).build();
            let err = run_closed_loop(tiny, &[(50, 8.0, 10)]).unwrap_err();
            assert!(matches!(
                err,
                RunError::AdmissionExceeded { target: 8, limit: 2 }
            ));
        }

        #[test]
        fn population_at_admission_limit_completes() {
            let tiny = PoolConfig::builder().max_contexts(1).queue_depth(2).build();
            let record = run_closed_loop(tiny, &[(50, 2.0, 10), (50, 1.0, 10)]).unwrap();
            assert_eq!(record.snapshots.len(), 3);
            assert!(record.completions() > 0);

            let wider = PoolConfig::builder().max_contexts(2).queue_depth(2).build();
            let record = run_closed_loop(wider, &[(50, 3.0, 10)]).unwrap();
            assert!(!record.interval_latencies(0).is_empty());
        }

        #[test]
        fn unusable_unit_counts_are_plan_errors() {
            let err = Controller::builder()
                .plan(plan(&[(10, 4.0, 0), (10, 1e30, 0)]))
                .strategy(ArrivalStrategy::FixedConcurrency)
                .build()
                .run(Inline::new())
                .unwrap_err();
            assert!(matches!(
                err,
                RunError::Plan(PlanError::InvalidValue { line: 3, .. })
            ));

            let err = Controller::builder()
                .plan(plan(&[(10, 2.5, 0)]))
                .strategy(ArrivalStrategy::FixedConcurrency)
                .build()
                .run(Inline::new())
                .unwrap_err();
            assert!(matches!(err, RunError::Plan(PlanError::InvalidValue { line: 2, .. })));
        }

        #[test]
        fn open_loop_rates_may_be_fractional() {
            let record = Controller::builder()
                .plan(plan(&[(10, 2.5, 0)]))
                .seed(9)
                .build()
                .run(Inline::new())
                .unwrap();
            assert_eq!(record.snapshots.len(), 2);
        }
    }
}
