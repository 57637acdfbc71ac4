//! Order statistics over a batch of latencies.
//!
//! This is a batch reduction, not a streaming one: the dispatcher hands the
//! report builder one contiguous slice of the recorder per interval, and that
//! slice is sorted in place and indexed directly. Callers must not rely on the
//! slice order afterwards.
//!
//! Percentile `p` is read at index `⌊n·p⌋`, clamped to `[0, n-1]`; the median is
//! `values[n / 2]`. For `1..=100` that gives median `51`, P90 `91` and P99 `100`.
use surge_macros::record;

/// Summary of one batch of latencies, all in nanoseconds.
#[record]
#[derive(Default, Copy)]
pub struct Statistics {
    pub count: usize,
    pub average: u64,
    pub min: u64,
    pub median: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub p9999: u64,
    pub max: u64,
}

/// Sorts `values` in place and reduces it to [`Statistics`].
///
/// Returns `None` for an empty slice, for which no order statistic exists.
pub fn compute_statistics(values: &mut [u64]) -> Option<Statistics> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();

    let count = values.len();
    let sum: u128 = values.iter().map(|&v| v as u128).sum();

    Some(Statistics {
        count,
        average: (sum / count as u128) as u64,
        min: values[0],
        median: values[count / 2],
        p90: values[percentile_index(count, 0.90)],
        p99: values[percentile_index(count, 0.99)],
        p999: values[percentile_index(count, 0.999)],
        p9999: values[percentile_index(count, 0.9999)],
        max: values[count - 1],
    })
}

/// Index of percentile `p` in a sorted batch of `count` values.
pub fn percentile_index(count: usize, p: f64) -> usize {
    debug_assert!(count > 0);
    let raw = (count as f64 * p).floor();
    if raw <= 0.0 {
        0
    } else {
        (raw as usize).min(count - 1)
    }
}

/// Most regular buckets a [`Histogram`] will allocate.
pub const MAX_BUCKETS: u64 = 1 << 20;

/// Fixed-width latency histogram.
///
/// Buckets cover `[k, k + step)` for `k` in `lower..upper` by `step`; anything
/// at or above `upper` lands in a final overflow bucket. Values below `lower`
/// are counted in the first bucket. The last bucket ends at `upper` even when
/// `step` does not divide the range.
#[record]
pub struct Histogram {
    pub lower: u64,
    pub upper: u64,
    pub step: u64,
    pub buckets: Vec<u64>,
    pub overflow: u64,
}

impl Histogram {
    /// `None` when `step` is zero, the range is empty, or the range would need
    /// more than [`MAX_BUCKETS`] buckets.
    pub fn build(values: &[u64], lower: u64, upper: u64, step: u64) -> Option<Self> {
        let count = Self::bucket_count(lower, upper, step)?;
        let mut buckets = vec![0u64; count];
        let mut overflow = 0;

        for &v in values {
            if v >= upper {
                overflow += 1;
            } else {
                let slot = (v.saturating_sub(lower) / step) as usize;
                buckets[slot] += 1;
            }
        }

        Some(Self {
            lower,
            upper,
            step,
            buckets,
            overflow,
        })
    }

    /// Regular buckets `[lower, upper)` split into by `step`, if that is a
    /// usable histogram.
    pub fn bucket_count(lower: u64, upper: u64, step: u64) -> Option<usize> {
        if step == 0 || upper <= lower {
            return None;
        }
        let count = (upper - lower).div_ceil(step);
        if count > MAX_BUCKETS {
            return None;
        }
        usize::try_from(count).ok()
    }

    /// `(bucket_start, bucket_end, count)` for every regular bucket.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64, u64)> + '_ {
        self.buckets.iter().enumerate().map(|(i, &n)| {
            // i * step < upper - lower, so neither this nor the start overflows
            let start = self.lower + i as u64 * self.step;
            (start, start.saturating_add(self.step).min(self.upper), n)
        })
    }
}
