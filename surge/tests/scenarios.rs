use std::sync::Arc;
use std::time::Duration;

use surge::report::{dump_latencies, read_latency_dump};
use surge::{
    ArrivalStrategy, BlockingPool, Controller, ElasticRuntime, Interval, IntervalPlan,
    PoolConfig, Report, RunRecord, compute_statistics,
};

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

fn pool(max_contexts: usize) -> Arc<BlockingPool> {
    Arc::new(
        PoolConfig::builder()
            .max_contexts(max_contexts)
            .keep_alive(Duration::from_secs(5))
            .build()
            .start()
            .unwrap(),
    )
}

fn assert_throughput_accounts_for_completions(record: &RunRecord, report: &Report) {
    let accounted: f64 = report
        .rows
        .iter()
        .map(|r| r.throughput * r.duration_secs)
        .sum();
    let completions = record.completions() as f64;
    assert!(
        (accounted - completions).abs() < 1e-6 * completions.max(1.0),
        "{accounted} vs {completions}"
    );
}

#[test]
fn steady_low_rate_matches_offered_load() {
    let record = Controller::builder()
        .plan(plan(&[(500, 1_000.0, 0)]))
        .seed(11)
        .build()
        .run(pool(2))
        .unwrap();
    let report = Report::build(&record);

    assert_eq!(report.rows.len(), 1);
    let row = &report.rows[0];
    assert!(
        (600.0..1_400.0).contains(&row.throughput),
        "throughput {}",
        row.throughput
    );
    // zero-length tasks only wait for a context
    assert!(row.latency.median < 5_000_000, "median {}", row.latency.median);
    assert_throughput_accounts_for_completions(&record, &report);
}

#[test]
fn low_rate_never_clips() {
    let record = Controller::builder()
        .plan(plan(&[(300, 20.0, 0), (300, 20.0, 10)]))
        .seed(2)
        .build()
        .run(pool(2))
        .unwrap();

    let report = Report::build(&record);
    assert_eq!(report.overall.clips, 0);
    assert!(report.rows.iter().all(|r| r.clips == 0));
}

#[test]
fn overload_is_clipped_without_overflow() {
    let runtime = Arc::new(
        PoolConfig::builder()
            .max_contexts(2)
            .queue_depth(64)
            .build()
            .start()
            .unwrap(),
    );
    let record = Controller::builder()
        .plan(plan(&[(200, 10_000_000.0, 1_000)]))
        .seed(3)
        .capacity(1 << 20)
        .build()
        .run(runtime.clone())
        .unwrap();

    let report = Report::build(&record);
    assert!(report.rows[0].clips > 0);
    // the queue filled up, so some spawns had to be retried
    assert!(report.rows[0].spawn_retries > 0);
    assert!(!record.recorder.overflowed());
    assert_eq!(runtime.in_flight(), 0);
}

#[test]
fn rate_jump_shows_in_the_second_row() {
    let record = Controller::builder()
        .plan(plan(&[(200, 100.0, 50), (200, 20_000.0, 50)]))
        .seed(4)
        .build()
        .run(pool(4))
        .unwrap();
    let report = Report::build(&record);

    assert_eq!(report.rows.len(), 2);
    let (low, high) = (&report.rows[0], &report.rows[1]);
    assert!(low.throughput < 300.0, "low {}", low.throughput);
    assert!(
        high.throughput > 10.0 * low.throughput,
        "{} vs {}",
        high.throughput,
        low.throughput
    );

    // 100/s of 50µs tasks keeps one context busy 0.5% of the time; 20000/s
    // needs about one context's worth of work
    assert!(low.utilization < 0.1, "low utilization {}", low.utilization);
    assert!(
        high.utilization > 2.0 * low.utilization,
        "{} vs {}",
        high.utilization,
        low.utilization
    );

    // each row holds only its own interval's latencies
    assert_eq!(low.latency.count, low.completions);
    assert_eq!(high.latency.count, high.completions);
    assert!(high.latency.count > 10 * low.latency.count);
    for row in [low, high] {
        assert!(row.latency.min >= 50_000, "min {}", row.latency.min);
    }
    assert_throughput_accounts_for_completions(&record, &report);
}

#[test]
fn cursor_is_monotonic_and_bounded() {
    let record = Controller::builder()
        .plan(plan(&[(50, 5_000.0, 0), (50, 0.0, 0), (50, 10_000.0, 5)]))
        .strategy(ArrivalStrategy::Uniform)
        .seed(5)
        .build()
        .run(pool(2))
        .unwrap();

    let capacity = record.recorder.capacity();
    assert_eq!(record.snapshots.len(), 4);
    for pair in record.snapshots.windows(2) {
        assert!(pair[0].cursor <= pair[1].cursor);
        assert!(pair[1].cursor <= capacity);
    }
}

#[test]
fn fixed_concurrency_reports_every_interval() {
    let record = Controller::builder()
        .plan(plan(&[(50, 1.0, 50), (50, 4.0, 50), (50, 2.0, 50)]))
        .strategy(ArrivalStrategy::FixedConcurrency)
        .build()
        .run(pool(4))
        .unwrap();
    let report = Report::build(&record);

    assert_eq!(report.strategy, ArrivalStrategy::FixedConcurrency);
    assert_eq!(report.rows.len(), 3);
    for row in &report.rows {
        assert!(row.completions > 0, "interval {:?}", row.interval);
        assert!(row.latency.min >= 50_000);
    }
}

#[test]
fn dumped_latencies_reproduce_row_statistics() {
    let record = Controller::builder()
        .plan(plan(&[(100, 2_000.0, 0), (100, 500.0, 0)]))
        .seed(6)
        .build()
        .run(pool(2))
        .unwrap();
    let report = Report::build(&record);

    let dir = tempfile::tempdir().unwrap();
    let files = dump_latencies(dir.path(), &record).unwrap();
    assert_eq!(files.len(), 2);

    for (file, row) in files.iter().zip(&report.rows) {
        let mut values = read_latency_dump(file).unwrap();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(compute_statistics(&mut values).unwrap(), row.latency);
    }
}
