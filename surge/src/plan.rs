//! The scripted load shape of a run.
//!
//! A plan is an ordered list of [`Interval`]s, loaded once before the run
//! starts and never mutated afterwards. On disk it is a small text file:
//!
//! ```text
//! <interval count N>
//! <run_duration_ns> <rate_or_concurrency> <task_duration_ns>   # N lines
//! ```
//!
//! Fields are whitespace separated. A missing or malformed line is a fatal
//! configuration error; lines after the N-th are ignored.
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::executor::ArrivalStrategy;

/// Largest population the fixed-concurrency strategy accepts per interval.
pub const MAX_CONCURRENCY: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plan is empty, expected an interval count on line 1")]
    MissingCount,
    #[error("line 1: invalid interval count {0:?}")]
    BadCount(String),
    #[error("plan declares zero intervals")]
    NoIntervals,
    #[error("line {line}: plan declares {expected} intervals but ends here")]
    MissingInterval { line: usize, expected: usize },
    #[error("line {line}: expected 3 fields (run_ns load task_ns), found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: cannot parse {field} from {value:?}")]
    BadField {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: {reason}")]
    InvalidValue { line: usize, reason: &'static str },
}

/// One phase of a run with fixed offered-load parameters.
///
/// Use `Interval::new(Duration::from_secs(2), 1_000.0, Duration::from_micros(2))`
/// for two seconds of 1000 arrivals per second, each occupying 2µs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interval {
    /// Wall-clock length of the phase.
    pub run_duration: Duration,
    /// Arrivals per second, or the number of concurrently live units for the
    /// fixed-concurrency strategy.
    pub load: f64,
    /// How long each spawned unit busy-waits.
    pub task_duration: Duration,
}

impl Interval {
    pub fn new(run_duration: Duration, load: f64, task_duration: Duration) -> Self {
        Self {
            run_duration,
            load,
            task_duration,
        }
    }

    /// `load` read as a unit count; fractional parts are dropped.
    pub fn concurrency(&self) -> usize {
        self.load as usize
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntervalPlan {
    intervals: Vec<Interval>,
}

impl IntervalPlan {
    /// Builds a plan from already-validated intervals.
    pub fn new(intervals: Vec<Interval>) -> Result<Self, PlanError> {
        if intervals.is_empty() {
            return Err(PlanError::NoIntervals);
        }
        for (i, interval) in intervals.iter().enumerate() {
            validate(interval, i + 2)?;
        }
        Ok(Self { intervals })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Interval> {
        self.intervals.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.intervals.iter()
    }

    /// Sum of all run durations.
    pub fn total_duration(&self) -> Duration {
        self.intervals.iter().map(|i| i.run_duration).sum()
    }

    /// Checks that every load is usable as a unit count: a whole number no
    /// larger than [`MAX_CONCURRENCY`].
    pub fn check_concurrency(&self) -> Result<(), PlanError> {
        for (i, interval) in self.intervals.iter().enumerate() {
            let line = i + 2;
            if interval.load.fract() != 0.0 {
                return Err(PlanError::InvalidValue {
                    line,
                    reason: "concurrency must be a whole number of units",
                });
            }
            if interval.load > MAX_CONCURRENCY as f64 {
                return Err(PlanError::InvalidValue {
                    line,
                    reason: "concurrency exceeds 1048576 units",
                });
            }
        }
        Ok(())
    }

    /// Largest unit count any interval asks for.
    pub fn peak_concurrency(&self) -> usize {
        self.intervals
            .iter()
            .map(Interval::concurrency)
            .max()
            .unwrap_or(0)
    }

    /// Rough number of units a run of this plan completes.
    ///
    /// Open loop this is `rate × duration`. Closed loop each live unit is
    /// assumed to turn over once per task duration (at least 1µs).
    pub fn expected_completions(&self, strategy: ArrivalStrategy) -> f64 {
        self.intervals
            .iter()
            .map(|i| {
                let secs = i.run_duration.as_secs_f64();
                if strategy.is_open_loop() {
                    i.load * secs
                } else {
                    let turnover = i.task_duration.max(Duration::from_micros(1));
                    i.concurrency() as f64 * secs / turnover.as_secs_f64()
                }
            })
            .sum()
    }
}

impl FromStr for IntervalPlan {
    type Err = PlanError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut lines = text.lines();
        let count_line = lines.next().ok_or(PlanError::MissingCount)?.trim();
        if count_line.is_empty() {
            return Err(PlanError::MissingCount);
        }
        let expected: usize = count_line
            .parse()
            .map_err(|_| PlanError::BadCount(count_line.to_string()))?;
        if expected == 0 {
            return Err(PlanError::NoIntervals);
        }

        let mut intervals = Vec::with_capacity(expected);
        for i in 0..expected {
            let line = i + 2;
            let raw = lines
                .next()
                .ok_or(PlanError::MissingInterval { line, expected })?;
            intervals.push(parse_interval(raw, line)?);
        }

        let extra = lines.filter(|l| !l.trim().is_empty()).count();
        if extra > 0 {
            tracing::warn!(extra, "ignoring lines after the last declared interval");
        }

        Ok(Self { intervals })
    }
}

fn parse_interval(raw: &str, line: usize) -> Result<Interval, PlanError> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(PlanError::FieldCount {
            line,
            found: fields.len(),
        });
    }

    let bad = |field: &'static str, value: &str| PlanError::BadField {
        line,
        field,
        value: value.to_string(),
    };
    let run_ns: u64 = fields[0].parse().map_err(|_| bad("run duration", fields[0]))?;
    let load: f64 = fields[1].parse().map_err(|_| bad("load", fields[1]))?;
    let task_ns: u64 = fields[2].parse().map_err(|_| bad("task duration", fields[2]))?;

    let interval = Interval::new(
        Duration::from_nanos(run_ns),
        load,
        Duration::from_nanos(task_ns),
    );
    validate(&interval, line)?;
    Ok(interval)
}

fn validate(interval: &Interval, line: usize) -> Result<(), PlanError> {
    if interval.run_duration.is_zero() {
        return Err(PlanError::InvalidValue {
            line,
            reason: "run duration must be positive",
        });
    }
    if !interval.load.is_finite() || interval.load < 0.0 {
        return Err(PlanError::InvalidValue {
            line,
            reason: "load must be a finite, non-negative number",
        });
    }
    Ok(())
}
