use std::sync::Arc;
use std::time::Duration;

use surge::{
    ArrivalStrategy, Controller, Interval, IntervalPlan, PoolConfig, Report, Reporter,
    report::CsvReporter,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter("info")
        .init();

    // A quiet second, a step to ten times the rate, then back down. The
    // pool should scale up during the step and retire contexts afterwards.
    let plan = IntervalPlan::new(vec![
        Interval::new(Duration::from_secs(1), 1_000.0, Duration::from_micros(20)),
        Interval::new(Duration::from_secs(1), 10_000.0, Duration::from_micros(20)),
        Interval::new(Duration::from_secs(1), 1_000.0, Duration::from_micros(20)),
    ])?;

    let pool = Arc::new(
        PoolConfig::builder()
            .max_contexts(4)
            .keep_alive(Duration::from_millis(5))
            .build()
            .start()?,
    );

    let record = Controller::builder()
        .plan(plan)
        .strategy(ArrivalStrategy::Poisson)
        .seed(42)
        .build()
        .run(pool)?;

    CsvReporter::new(std::io::stdout(), true).report(&Report::build(&record))?;
    Ok(())
}
