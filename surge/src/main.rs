use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use surge::report::{
    CsvReporter, JsonReporter, dump_latencies, read_latency_dump, write_histogram,
    write_statistics,
};
use surge::stats::MAX_BUCKETS;
use surge::{
    ArrivalStrategy, Controller, Histogram, IntervalPlan, PoolConfig, Report, Reporter,
    compute_statistics,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "surge")]
#[command(about = "Open-loop load generator for elastic runtimes")]
#[command(version)]
struct Cli {
    /// More logging on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive an interval plan against the built-in elastic pool
    Run(RunArgs),

    /// Summarize a file of newline-separated latencies
    Stats {
        /// Latency file, e.g. one written by `run --dump-dir`
        file: PathBuf,

        /// Also print a histogram, as LOWER:UPPER:STEP in nanoseconds
        #[arg(long, value_parser = parse_histogram)]
        histogram: Option<HistogramBounds>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Interval plan file
    plan: PathBuf,

    #[arg(short, long, value_enum, default_value_t = ArrivalStrategy::Poisson)]
    strategy: ArrivalStrategy,

    /// Let overdue arrivals pile up instead of clipping them to now
    #[arg(long)]
    no_clip: bool,

    /// Seed for the arrival generator
    #[arg(long)]
    seed: Option<u64>,

    /// Latency slots to preallocate (default: sized from the plan)
    #[arg(long)]
    capacity: Option<usize>,

    /// Maximum execution contexts (default: number of CPUs)
    #[arg(long)]
    max_contexts: Option<usize>,

    /// Idle time before a context is retired
    #[arg(long, default_value_t = 10)]
    keep_alive_ms: u64,

    /// Units that may queue for a context before spawns are refused
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Pin the dispatcher thread to this core
    #[arg(long)]
    dispatch_core: Option<usize>,

    #[arg(short, long, value_enum, default_value_t = Format::Csv)]
    format: Format,

    /// Append a whole-run row to CSV output
    #[arg(long)]
    summary: bool,

    /// Write each interval's sorted latencies to DIR/interval-<i>.txt
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
}

#[derive(Clone, Copy, Debug)]
struct HistogramBounds {
    lower: u64,
    upper: u64,
    step: u64,
}

fn parse_histogram(raw: &str) -> Result<HistogramBounds, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [lower, upper, step] = parts.as_slice() else {
        return Err("expected LOWER:UPPER:STEP".to_string());
    };
    let num = |s: &str| s.trim().parse::<u64>().map_err(|e| format!("{s:?}: {e}"));
    let bounds = HistogramBounds {
        lower: num(*lower)?,
        upper: num(*upper)?,
        step: num(*step)?,
    };
    if bounds.step == 0 || bounds.upper <= bounds.lower {
        return Err("need STEP > 0 and UPPER > LOWER".to_string());
    }
    if Histogram::bucket_count(bounds.lower, bounds.upper, bounds.step).is_none() {
        return Err(format!(
            "{} buckets is more than the {MAX_BUCKETS} allowed; raise STEP",
            (bounds.upper - bounds.lower).div_ceil(bounds.step)
        ));
    }
    Ok(bounds)
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Stats { file, histogram } => stats(file, histogram),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let plan = IntervalPlan::load(&args.plan)
        .with_context(|| format!("invalid plan {}", args.plan.display()))?;

    let pool = PoolConfig {
        max_contexts: args.max_contexts.unwrap_or_else(num_cpus::get),
        keep_alive: Duration::from_millis(args.keep_alive_ms),
        queue_depth: args.queue_depth,
    }
    .start()
    .context("failed to start the elastic pool")?;
    let config = pool.config();
    tracing::info!(
        max_contexts = config.max_contexts,
        queue_depth = ?config.queue_depth,
        keep_alive = ?config.keep_alive,
        "elastic pool started"
    );
    let pool = Arc::new(pool);

    let controller = Controller {
        plan,
        strategy: args.strategy,
        clipping: !args.no_clip,
        seed: args.seed,
        capacity: args.capacity,
        dispatch_core: args.dispatch_core,
    };
    let record = controller.run(pool.clone()).context("run aborted")?;
    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.shutdown(Duration::from_secs(1));
    }

    let report = Report::build(&record);
    let stdout = std::io::stdout().lock();
    match args.format {
        Format::Csv => CsvReporter::new(stdout, args.summary).report(&report)?,
        Format::Json => JsonReporter::new(stdout).report(&report)?,
    }

    if let Some(dir) = &args.dump_dir {
        let written = dump_latencies(dir, &record)?;
        tracing::info!(files = written.len(), dir = %dir.display(), "latencies dumped");
    }
    Ok(())
}

fn stats(file: PathBuf, histogram: Option<HistogramBounds>) -> Result<()> {
    let mut values = read_latency_dump(&file)?;
    let label = file
        .file_name()
        .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned());
    let Some(summary) = compute_statistics(&mut values) else {
        bail!("{} contains no latencies", file.display());
    };

    let mut stdout = std::io::stdout().lock();
    write_statistics(&mut stdout, &label, &summary)?;
    if let Some(b) = histogram {
        let histogram = Histogram::build(&values, b.lower, b.upper, b.step)
            .ok_or_else(|| anyhow!("invalid histogram bounds {b:?}"))?;
        write_histogram(&mut stdout, &histogram)?;
    }
    stdout.flush()?;
    Ok(())
}
