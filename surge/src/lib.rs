//! Surge — an open-loop load generator for elastic runtimes.
//!
//! Surge offers synthetic, fixed-duration units of work to a runtime that grows
//! and shrinks its pool of execution contexts with demand, and measures how
//! that runtime copes. Load follows a scripted [`IntervalPlan`]: each interval
//! has its own arrival rate (or target concurrency) and task duration, and the
//! arrival process is never paused between intervals.
//!
//! Every unit records its end-to-end latency into a preallocated, lock-free
//! [`LatencyRecorder`]. At each interval boundary the dispatcher snapshots the
//! recorder cursor together with the runtime's counters, and once the run has
//! drained those snapshots are reduced into one report row per interval:
//! utilization, throughput, load factor, scaling events and latency
//! percentiles.
//!
//! # Architecture
//!
//! - [`ArrivalProcess`]: Poisson or uniform inter-arrival gaps, re-parameterized
//!   in place at interval boundaries.
//! - [`Controller`]: the dispatcher. A single busy-polling thread that spawns
//!   units at their scheduled deadlines, clips overdue deadlines and walks the
//!   plan.
//! - [`ElasticRuntime`]: the seam to the runtime under test. [`BlockingPool`]
//!   is the built-in implementation.
//! - [`Report`]: per-interval rows built from snapshots and recorded
//!   latencies, written out by a [`Reporter`].
//!
//! # Example
//!
//! ```rust, no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use surge::{
//!     ArrivalStrategy, Controller, Interval, IntervalPlan, PoolConfig, Report, Reporter,
//!     report::CsvReporter,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let plan = IntervalPlan::new(vec![
//!         // one second at 1000 arrivals/s, 2µs of work each
//!         Interval::new(Duration::from_secs(1), 1_000.0, Duration::from_micros(2)),
//!         // then ten times the rate
//!         Interval::new(Duration::from_secs(1), 10_000.0, Duration::from_micros(2)),
//!     ])?;
//!
//!     let pool = Arc::new(PoolConfig::builder().max_contexts(4).build().start()?);
//!     let record = Controller::builder()
//!         .plan(plan)
//!         .strategy(ArrivalStrategy::Poisson)
//!         .build()
//!         .run(pool)?;
//!
//!     CsvReporter::new(std::io::stdout(), true).report(&Report::build(&record))?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `internals`: exposes the dispatcher's pure helpers (deadline arithmetic,
//!   capacity estimate, drain) for benchmarking and experiments.

/// Inter-arrival time generation
pub mod arrival;
/// The load controller and its run artifacts
pub mod executor;
/// Interval plans and their file format
pub mod plan;
/// Preallocated latency store
pub mod recorder;
/// Report rows and reporters
pub mod report;
/// The runtime seam and the built-in elastic pool
pub mod runtime;
/// Order statistics and histograms
pub mod stats;
/// Units of work
pub mod work;

pub use arrival::{ArrivalError, ArrivalProcess, Shape};
pub use executor::{ArrivalStrategy, Controller, IntervalSnapshot, RunError, RunRecord};
pub use plan::{Interval, IntervalPlan, PlanError};
pub use recorder::LatencyRecorder;
pub use report::{Report, ReportError, Reporter};
pub use runtime::{BlockingPool, ElasticRuntime, PoolConfig, RuntimeCounters};
pub use stats::{Histogram, Statistics, compute_statistics};
