//! Executor — the load controller that drives a run
//!
//! A run is a single dispatcher thread walking an [`IntervalPlan`] from start
//! to finish. It never sleeps: every decision is taken by busy-polling the
//! monotonic clock, because a blocking timer's wakeup jitter would show up in
//! the very latencies being measured.
//!
//! # Strategies
//!
//! The dispatcher offers load in one of three ways, picked once per run with
//! [`ArrivalStrategy`]:
//!
//! - `Poisson`: open loop, exponentially distributed gaps with mean `1/rate`.
//! - `Uniform`: open loop, gaps uniform on `[0, 2/rate)`. Same mean, different
//!   variance.
//! - `FixedConcurrency`: closed loop. The interval's `load` is a number of live
//!   units; each completing unit spawns its own successor.
//!
//! All three share the plan, the snapshots and the report machinery.
//!
//! # High-level flow
//! 1. Take snapshot 0, then for every iteration of the polling loop:
//!    - if the next arrival deadline has passed, spawn one unit stamped with
//!      that deadline, retrying the very same unit until the runtime accepts
//!      it. The next deadline is `previous deadline + gap`, not `now + gap`, so
//!      the arrival process stays faithful through short backlogs;
//!    - if that next deadline is already in the past and clipping is on, pull
//!      it forward to now and count a clip;
//!    - if the interval's end has passed, snapshot the recorder cursor and the
//!      runtime counters, switch to the next interval, re-parameterize the
//!      arrival process and restart its clock from now.
//! 2. After the last interval the dispatcher exits and the controller waits
//!    until the runtime reports no unit in flight. Only then is the recorder
//!    stable enough to be reduced into a report.
//!
//! # Overload clipping
//! Without clipping, a dispatcher that cannot keep up accumulates an
//! ever-growing backlog of overdue arrivals, and reported latency ends up
//! proportional to how long the run has lasted rather than to the offered
//! load. Clipping bounds the lag to one arrival and surfaces the overload as
//! the `clips` counter instead. It is on by default and can be turned off with
//! `clipping(false)`.
//!
//! # Failure semantics
//! A refused spawn is never an error; it only costs a retry, counted in
//! `spawn_retries`. The one fatal condition during a run is the recorder
//! running out of preallocated slots, which aborts the run with
//! [`RunError::CapacityExceeded`]: a truncated measurement is worse than none.
//!
//! Closed-loop plans are checked before the dispatcher starts. Every unit
//! count must be a whole number, and the peak population must fit the
//! runtime's [`admission_limit`](crate::runtime::ElasticRuntime::admission_limit).
//! Past that limit every running unit waits for a queue slot that only a
//! finishing unit could free, and the run never ends.
pub mod dispatch;
pub use dispatch::Controller;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use surge_macros::record;
use thiserror::Error;

use crate::arrival::{ArrivalError, Shape};
use crate::plan::{IntervalPlan, PlanError};
use crate::recorder::LatencyRecorder;
use crate::runtime::RuntimeCounters;

/// How the dispatcher turns an interval's `load` into units of work.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalStrategy {
    /// Open loop, exponential inter-arrival gaps.
    #[default]
    Poisson,
    /// Open loop, uniform inter-arrival gaps with the Poisson mean.
    Uniform,
    /// Closed loop, `load` units kept alive at all times.
    FixedConcurrency,
}

impl ArrivalStrategy {
    /// Gap distribution for the open-loop strategies.
    pub fn shape(self) -> Option<Shape> {
        match self {
            ArrivalStrategy::Poisson => Some(Shape::Exponential),
            ArrivalStrategy::Uniform => Some(Shape::Uniform),
            ArrivalStrategy::FixedConcurrency => None,
        }
    }

    pub fn is_open_loop(self) -> bool {
        self.shape().is_some()
    }
}

/// Recorder cursor and runtime counters read together at an interval
/// boundary. The reads are not atomic with respect to each other.
#[record]
#[derive(Copy)]
pub struct IntervalSnapshot {
    /// Time since the run started.
    pub elapsed: Duration,
    pub cursor: usize,
    pub counters: RuntimeCounters,
    pub clips: u64,
    pub spawn_retries: u64,
}

/// Everything a finished run leaves behind: `plan.len() + 1` snapshots and
/// the drained recorder.
#[derive(Debug)]
pub struct RunRecord {
    pub plan: IntervalPlan,
    pub strategy: ArrivalStrategy,
    pub snapshots: Vec<IntervalSnapshot>,
    pub recorder: Arc<LatencyRecorder>,
}

impl RunRecord {
    /// Latencies recorded during interval `index`, in completion order.
    pub fn interval_latencies(&self, index: usize) -> Vec<u64> {
        match (self.snapshots.get(index), self.snapshots.get(index + 1)) {
            (Some(prev), Some(cur)) => self.recorder.read(prev.cursor..cur.cursor),
            _ => Vec::new(),
        }
    }

    /// Completions between the first and the last snapshot.
    pub fn completions(&self) -> usize {
        match (self.snapshots.first(), self.snapshots.last()) {
            (Some(first), Some(last)) => last.cursor - first.cursor,
            _ => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "latency recorder overflowed its {capacity} preallocated slots; results would be corrupt"
    )]
    CapacityExceeded { capacity: usize },
    #[error(transparent)]
    Arrival(#[from] ArrivalError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(
        "a population of {target} units cannot replace itself in a runtime that admits at most {limit}"
    )]
    AdmissionExceeded { target: usize, limit: usize },
    #[error("cannot pin the dispatcher to core {core}")]
    Pinning { core: usize },
    #[error("failed to start the dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("dispatcher thread panicked")]
    DispatcherPanicked,
}
