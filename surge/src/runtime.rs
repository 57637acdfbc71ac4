//! The elastic runtime being measured.
//!
//! surge does not schedule work itself. It consumes two things from the
//! runtime under test:
//!
//! - a non-blocking spawn primitive, [`ElasticRuntime::try_spawn`], which may
//!   refuse work under resource exhaustion and then hands the job back so the
//!   very same unit can be offered again;
//! - point-in-time cumulative counters, [`ElasticRuntime::counters`], plus an
//!   occupancy signal, [`ElasticRuntime::in_flight`], used for the final drain.
//!
//! [`BlockingPool`] is the built-in implementation: tokio's blocking thread
//! pool, which grows a new execution context whenever work arrives and none is
//! idle, and retires contexts that stay idle for `keep_alive`. Context starts
//! and stops are counted as scale-up and scale-down events.
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use surge_macros::record;
use tokio::sync::Semaphore;
use typed_builder::TypedBuilder;

/// A unit of work handed to the runtime.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The runtime refused a job; the job is handed back untouched.
pub struct Rejected(pub Job);

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

/// Cumulative runtime counters. Every field only ever grows, except
/// `contexts`, which is the number of live execution contexts right now.
#[record]
#[derive(Default, Copy)]
pub struct RuntimeCounters {
    /// Context time spent running units.
    pub busy_ns: u64,
    /// Context time spent with nothing to run.
    pub idle_ns: u64,
    /// Context time weighted by how many units were waiting or running.
    pub weighted_load_ns: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub contexts: u64,
}

impl RuntimeCounters {
    pub fn total_ns(&self) -> u64 {
        self.busy_ns.saturating_add(self.idle_ns)
    }
}

pub trait ElasticRuntime: Send + Sync + 'static {
    /// Offers one unit of work without blocking.
    fn try_spawn(&self, job: Job) -> Result<(), Rejected>;

    /// Reads the cumulative counters.
    fn counters(&self) -> RuntimeCounters;

    /// Units accepted by `try_spawn` that have not finished yet.
    fn in_flight(&self) -> usize;

    /// Largest population of self-replicating units the runtime can keep
    /// alive. A unit spawns its successor while it still holds a context, so
    /// beyond this bound every context can end up waiting on a full queue.
    /// `None` when the runtime never refuses for good.
    fn admission_limit(&self) -> Option<usize> {
        None
    }
}

/// Offers `job` until the runtime accepts it, spinning between attempts.
/// Returns how many times it was refused.
pub fn spawn_until_accepted<R>(runtime: &R, mut job: Job) -> u64
where
    R: ElasticRuntime + ?Sized,
{
    let mut refusals = 0;
    loop {
        match runtime.try_spawn(job) {
            Ok(()) => return refusals,
            Err(Rejected(returned)) => {
                job = returned;
                refusals += 1;
                std::hint::spin_loop();
            }
        }
    }
}

/// Configuration for [`BlockingPool`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct PoolConfig {
    /// Upper bound on concurrently live execution contexts.
    #[builder(default = num_cpus::get())]
    pub max_contexts: usize,
    /// How long an idle context lingers before it is retired.
    #[builder(default = Duration::from_millis(10))]
    pub keep_alive: Duration,
    /// Accepted units that may wait for a context before `try_spawn` refuses.
    /// Defaults to `max_contexts * 1024`.
    #[builder(default, setter(strip_option))]
    pub queue_depth: Option<usize>,
}

impl PoolConfig {
    pub fn start(self) -> std::io::Result<BlockingPool> {
        BlockingPool::new(self)
    }
}

thread_local! {
    static BORN_AT_NS: Cell<u64> = const { Cell::new(0) };
}

#[derive(Debug)]
struct PoolState {
    epoch: Instant,
    live_contexts: AtomicU64,
    /// Sum of the birth times of live contexts, relative to `epoch`.
    birth_sum_ns: AtomicU64,
    /// Lifetime of every context that has already stopped.
    retired_ns: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    busy_ns: AtomicU64,
    weighted_load_ns: AtomicU64,
    in_flight: AtomicUsize,
}

impl PoolState {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            live_contexts: AtomicU64::new(0),
            birth_sum_ns: AtomicU64::new(0),
            retired_ns: AtomicU64::new(0),
            scale_ups: AtomicU64::new(0),
            scale_downs: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
            weighted_load_ns: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn context_started(&self) {
        let now = self.now_ns();
        BORN_AT_NS.with(|b| b.set(now));
        self.birth_sum_ns.fetch_add(now, Ordering::AcqRel);
        self.live_contexts.fetch_add(1, Ordering::AcqRel);
        self.scale_ups.fetch_add(1, Ordering::Relaxed);
    }

    fn context_stopped(&self) {
        let now = self.now_ns();
        let born = BORN_AT_NS.with(|b| b.get());
        self.retired_ns
            .fetch_add(now.saturating_sub(born), Ordering::AcqRel);
        self.live_contexts.fetch_sub(1, Ordering::AcqRel);
        self.birth_sum_ns.fetch_sub(born, Ordering::AcqRel);
        self.scale_downs.fetch_add(1, Ordering::Relaxed);
    }

    /// Total context-nanoseconds lived so far, retired and live.
    ///
    /// The three loads are not atomic with respect to each other; a context
    /// starting or stopping in between skews one reading by at most that
    /// context's age.
    fn context_ns(&self) -> u64 {
        let now = self.now_ns();
        let live = self.live_contexts.load(Ordering::Acquire);
        let born = self.birth_sum_ns.load(Ordering::Acquire);
        let retired = self.retired_ns.load(Ordering::Acquire);
        retired
            .saturating_add(live.saturating_mul(now))
            .saturating_sub(born)
    }
}

/// Decrements the in-flight count however the job exits.
struct InFlight(Arc<PoolState>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Release);
    }
}

/// Elastic pool of execution contexts backed by tokio's blocking pool.
pub struct BlockingPool {
    runtime: tokio::runtime::Runtime,
    /// Bounds units that are accepted but not yet running.
    queue: Arc<Semaphore>,
    state: Arc<PoolState>,
    config: PoolConfig,
}

impl BlockingPool {
    pub fn new(config: PoolConfig) -> std::io::Result<Self> {
        let max_contexts = config.max_contexts.max(1);
        let queue_depth = config
            .queue_depth
            .unwrap_or(max_contexts.saturating_mul(1024))
            .clamp(1, Semaphore::MAX_PERMITS);
        let config = PoolConfig {
            max_contexts,
            queue_depth: Some(queue_depth),
            ..config
        };
        let state = Arc::new(PoolState::new());

        // Units only ever run on the blocking pool, so the scheduler itself
        // is never driven and spawns no worker thread of its own.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(max_contexts)
            .thread_keep_alive(config.keep_alive)
            .thread_name("surge-context")
            .on_thread_start({
                let state = state.clone();
                move || state.context_started()
            })
            .on_thread_stop({
                let state = state.clone();
                move || state.context_stopped()
            })
            .build()?;

        Ok(Self {
            runtime,
            queue: Arc::new(Semaphore::new(queue_depth)),
            state,
            config,
        })
    }

    /// The configuration in effect, with defaults and clamping applied.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Shuts the pool down, waiting at most `timeout` for running units.
    pub fn shutdown(self, timeout: Duration) {
        self.runtime.shutdown_timeout(timeout);
    }
}

impl ElasticRuntime for BlockingPool {
    fn try_spawn(&self, job: Job) -> Result<(), Rejected> {
        let Ok(queued) = self.queue.clone().try_acquire_owned() else {
            return Err(Rejected(job));
        };

        let state = self.state.clone();
        let submitted_ns = state.now_ns();
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(state.clone());

        self.runtime.spawn_blocking(move || {
            let _guard = guard;
            drop(queued);

            let started = Instant::now();
            job();
            let busy = started.elapsed().as_nanos() as u64;

            let finished_ns = state.now_ns();
            state.busy_ns.fetch_add(busy, Ordering::Relaxed);
            state
                .weighted_load_ns
                .fetch_add(finished_ns.saturating_sub(submitted_ns), Ordering::Relaxed);
        });
        Ok(())
    }

    fn counters(&self) -> RuntimeCounters {
        let total = self.state.context_ns();
        let busy = self.state.busy_ns.load(Ordering::Relaxed).min(total);
        RuntimeCounters {
            busy_ns: busy,
            idle_ns: total - busy,
            weighted_load_ns: self.state.weighted_load_ns.load(Ordering::Relaxed),
            scale_ups: self.state.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.state.scale_downs.load(Ordering::Relaxed),
            contexts: self.state.live_contexts.load(Ordering::Relaxed),
        }
    }

    fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// A unit gives its queue slot back once it starts running, so a full
    /// house is `max_contexts` running units plus `queue_depth` queued ones.
    /// One less than that always leaves a running unit room to hand off.
    fn admission_limit(&self) -> Option<usize> {
        let queue_depth = self.config.queue_depth.unwrap_or(1);
        Some((queue_depth + self.config.max_contexts).saturating_sub(1))
    }
}
