//! Reduction of a finished run into per-interval rows, and the writers that
//! put those rows somewhere.
//!
//! `N` intervals leave `N + 1` snapshots behind. Each adjacent pair
//! `(prev, cur)` becomes one [`IntervalRow`]:
//!
//! ```text
//! duration    = cur.elapsed - prev.elapsed
//! utilization = 1 - Δidle / Δtotal
//! throughput  = Δcursor / duration
//! load_factor = Δweighted_load / Δtotal
//! latency     = compute_statistics(recorder[prev.cursor..cur.cursor])
//! ```
//!
//! A whole-run `overall` row is computed the same way between the first and
//! the last snapshot.
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use surge_macros::record;
use thiserror::Error;

use crate::executor::{ArrivalStrategy, IntervalSnapshot, RunRecord};
use crate::plan::IntervalPlan;
use crate::stats::{Histogram, Statistics, compute_statistics};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to access {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {value:?} is not a latency in nanoseconds")]
    Parse { line: usize, value: String },
    #[error("{path} contains no latencies")]
    Empty { path: PathBuf },
}

/// One interval of a run, or the whole run.
#[record]
#[derive(Default)]
pub struct IntervalRow {
    /// Position in the plan; `None` for the whole-run row.
    pub interval: Option<usize>,
    pub duration_secs: f64,
    /// Rate (open loop) or concurrency (closed loop) the plan asked for,
    /// time-weighted for the whole-run row.
    pub offered_load: f64,
    pub utilization: f64,
    pub completions: usize,
    /// `completions / duration_secs`, unrounded.
    pub throughput: f64,
    pub load_factor: f64,
    pub util_x_load_factor: f64,
    /// `(1 - idle_fraction × contexts) × load_factor`, with `contexts` the
    /// live contexts at the closing snapshot.
    pub idle_adjusted_load: f64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub clips: u64,
    pub spawn_retries: u64,
    pub latency: Statistics,
}

impl IntervalRow {
    /// Builds the row between two snapshots. `latencies` is the recorder
    /// slice `[prev.cursor, cur.cursor)`; it is sorted in place.
    pub fn between(
        interval: Option<usize>,
        offered_load: f64,
        prev: &IntervalSnapshot,
        cur: &IntervalSnapshot,
        latencies: &mut [u64],
    ) -> Self {
        let duration_secs = cur.elapsed.saturating_sub(prev.elapsed).as_secs_f64();
        let completions = cur.cursor.saturating_sub(prev.cursor);

        let (a, b) = (&prev.counters, &cur.counters);
        let total = b.total_ns().saturating_sub(a.total_ns()) as f64;
        let idle = b.idle_ns.saturating_sub(a.idle_ns) as f64;
        let weighted = b.weighted_load_ns.saturating_sub(a.weighted_load_ns) as f64;

        let ratio = |num: f64| if total > 0.0 { num / total } else { 0.0 };
        let idle_fraction = ratio(idle);
        let utilization = if total > 0.0 { 1.0 - idle_fraction } else { 0.0 };
        let load_factor = ratio(weighted);

        Self {
            interval,
            duration_secs,
            offered_load,
            utilization,
            completions,
            throughput: if duration_secs > 0.0 {
                completions as f64 / duration_secs
            } else {
                0.0
            },
            load_factor,
            util_x_load_factor: utilization * load_factor,
            idle_adjusted_load: (1.0 - idle_fraction * b.contexts as f64) * load_factor,
            scale_ups: b.scale_ups.saturating_sub(a.scale_ups),
            scale_downs: b.scale_downs.saturating_sub(a.scale_downs),
            clips: cur.clips.saturating_sub(prev.clips),
            spawn_retries: cur.spawn_retries.saturating_sub(prev.spawn_retries),
            latency: compute_statistics(latencies).unwrap_or_default(),
        }
    }
}

#[record]
pub struct Report {
    pub strategy: ArrivalStrategy,
    pub rows: Vec<IntervalRow>,
    pub overall: IntervalRow,
}

impl Report {
    /// Reduces a drained run.
    pub fn build(run: &RunRecord) -> Self {
        Self::from_parts(
            run.strategy,
            &run.plan,
            &run.snapshots,
            &run.recorder.read_all(),
        )
    }

    /// `latencies[i]` is the value recorded in slot `i`; snapshot cursors
    /// index into it.
    pub fn from_parts(
        strategy: ArrivalStrategy,
        plan: &IntervalPlan,
        snapshots: &[IntervalSnapshot],
        latencies: &[u64],
    ) -> Self {
        let slice = |prev: &IntervalSnapshot, cur: &IntervalSnapshot| {
            let end = cur.cursor.min(latencies.len());
            let start = prev.cursor.min(end);
            latencies[start..end].to_vec()
        };

        let rows = snapshots
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let load = plan.get(i).map_or(0.0, |interval| interval.load);
                let mut values = slice(&pair[0], &pair[1]);
                IntervalRow::between(Some(i), load, &pair[0], &pair[1], &mut values)
            })
            .collect::<Vec<_>>();

        let overall = match (snapshots.first(), snapshots.last()) {
            (Some(first), Some(last)) => {
                let offered = time_weighted_load(plan);
                IntervalRow::between(None, offered, first, last, &mut slice(first, last))
            }
            _ => IntervalRow::default(),
        };

        Self {
            strategy,
            rows,
            overall,
        }
    }
}

fn time_weighted_load(plan: &IntervalPlan) -> f64 {
    let total = plan.total_duration().as_secs_f64();
    if total <= 0.0 {
        return 0.0;
    }
    plan.iter()
        .map(|i| i.load * i.run_duration.as_secs_f64())
        .sum::<f64>()
        / total
}

/// Consumes [`Report`]s and sends them somewhere.
pub trait Reporter {
    fn report(&mut self, report: &Report) -> Result<(), ReportError>;
}

/// Flat form of [`IntervalRow`] for CSV, which has no nested records.
#[derive(Debug, Serialize)]
struct CsvRow {
    interval: String,
    duration_s: f64,
    offered_load: f64,
    utilization: f64,
    completions: usize,
    throughput: f64,
    load_factor: f64,
    util_x_load_factor: f64,
    idle_adjusted_load: f64,
    scale_ups: u64,
    scale_downs: u64,
    clips: u64,
    spawn_retries: u64,
    avg_ns: u64,
    min_ns: u64,
    median_ns: u64,
    p90_ns: u64,
    p99_ns: u64,
    p999_ns: u64,
    p9999_ns: u64,
    max_ns: u64,
}

impl From<&IntervalRow> for CsvRow {
    fn from(row: &IntervalRow) -> Self {
        Self {
            interval: row
                .interval
                .map_or_else(|| "all".to_string(), |i| i.to_string()),
            duration_s: row.duration_secs,
            offered_load: row.offered_load,
            utilization: row.utilization,
            completions: row.completions,
            throughput: row.throughput,
            load_factor: row.load_factor,
            util_x_load_factor: row.util_x_load_factor,
            idle_adjusted_load: row.idle_adjusted_load,
            scale_ups: row.scale_ups,
            scale_downs: row.scale_downs,
            clips: row.clips,
            spawn_retries: row.spawn_retries,
            avg_ns: row.latency.average,
            min_ns: row.latency.min,
            median_ns: row.latency.median,
            p90_ns: row.latency.p90,
            p99_ns: row.latency.p99,
            p999_ns: row.latency.p999,
            p9999_ns: row.latency.p9999,
            max_ns: row.latency.max,
        }
    }
}

/// Header row plus one row per interval; with `summary`, a trailing `all` row.
pub struct CsvReporter<W: Write> {
    writer: csv::Writer<W>,
    summary: bool,
}

impl<W: Write> CsvReporter<W> {
    pub fn new(inner: W, summary: bool) -> Self {
        Self {
            writer: csv::Writer::from_writer(inner),
            summary,
        }
    }

    pub fn into_inner(self) -> Result<W, ReportError> {
        self.writer
            .into_inner()
            .map_err(|e| ReportError::Io(e.into_error()))
    }
}

impl<W: Write> Reporter for CsvReporter<W> {
    fn report(&mut self, report: &Report) -> Result<(), ReportError> {
        for row in &report.rows {
            self.writer.serialize(CsvRow::from(row))?;
        }
        if self.summary {
            self.writer.serialize(CsvRow::from(&report.overall))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// The whole [`Report`] as one pretty-printed JSON document.
pub struct JsonReporter<W: Write> {
    writer: W,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn report(&mut self, report: &Report) -> Result<(), ReportError> {
        serde_json::to_writer_pretty(&mut self.writer, report)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes the offline statistics header and one row labelled `label`.
pub fn write_statistics<W: Write>(
    writer: W,
    label: &str,
    stats: &Statistics,
) -> Result<(), ReportError> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record([
        "Label", "Count", "Avg", "Median", "Min", "99%", "99.9%", "99.99%", "Max",
    ])?;
    csv.write_record([
        label.to_string(),
        stats.count.to_string(),
        stats.average.to_string(),
        stats.median.to_string(),
        stats.min.to_string(),
        stats.p99.to_string(),
        stats.p999.to_string(),
        stats.p9999.to_string(),
        stats.max.to_string(),
    ])?;
    csv.flush()?;
    Ok(())
}

/// One `lo-hi: count` line per bucket, then `upper+: overflow`.
pub fn write_histogram<W: Write>(mut writer: W, histogram: &Histogram) -> Result<(), ReportError> {
    for (lo, hi, count) in histogram.ranges() {
        writeln!(writer, "{lo}-{hi}: {count}")?;
    }
    writeln!(writer, "{}+: {}", histogram.upper, histogram.overflow)?;
    writer.flush()?;
    Ok(())
}

/// Writes each interval's sorted latencies to `dir/interval-<i>.txt`, one
/// value per line. Returns the files written.
pub fn dump_latencies(dir: &Path, run: &RunRecord) -> Result<Vec<PathBuf>, ReportError> {
    let file_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ReportError::File { path, source }
    };
    std::fs::create_dir_all(dir).map_err(file_err(dir))?;

    let mut written = Vec::with_capacity(run.plan.len());
    for i in 0..run.snapshots.len().saturating_sub(1) {
        let path = dir.join(format!("interval-{i}.txt"));
        let mut values = run.interval_latencies(i);
        values.sort_unstable();

        let mut out = BufWriter::new(File::create(&path).map_err(file_err(&path))?);
        for v in &values {
            writeln!(out, "{v}")?;
        }
        out.flush()?;
        tracing::debug!(path = %path.display(), count = values.len(), "dumped latencies");
        written.push(path);
    }
    Ok(written)
}

/// Reads a file of newline-separated latencies. Blank lines are skipped.
pub fn read_latency_dump(path: &Path) -> Result<Vec<u64>, ReportError> {
    let file = File::open(path).map_err(|source| ReportError::File {
        path: path.to_path_buf(),
        source,
    })?;

    let mut values = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = trimmed.parse().map_err(|_| ReportError::Parse {
            line: i + 1,
            value: trimmed.to_string(),
        })?;
        values.push(value);
    }

    if values.is_empty() {
        return Err(ReportError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(values)
}
