//! CLI for ktuner: tune, space, cache, devices.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use ktuner::{
    format_report, tune_devices, Backend, DeviceProperties, ResultCache, SimulatedBackend,
    SkipReason, StrategyConfig, TuningJob, TuningReport,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "ktuner")]
#[command(about = "GPU kernel auto-tuner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tune a kernel described by a job file (simulated backend)
    Tune {
        #[arg(long)]
        job: PathBuf,
        /// Cache file; overrides the job's `cache`
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Ignore any cache file
        #[arg(long)]
        no_cache: bool,
        /// Strategy name with default options; overrides the job's `strategy`
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        iterations: Option<usize>,
        #[arg(long)]
        max_fevals: Option<usize>,
        /// Wall-clock limit in seconds
        #[arg(long)]
        time_limit: Option<f64>,
        /// Device preset; repeat to tune several devices in parallel
        #[arg(long = "device")]
        devices: Vec<String>,
        /// Write the JSON report here
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "5")]
        top: usize,
        #[arg(short, long)]
        verbose: bool,
        /// Print Prometheus counters after the run
        #[arg(long)]
        metrics: bool,
    },

    /// Show the size of a job's search space and what the device rejects
    Space {
        #[arg(long)]
        job: PathBuf,
        /// Device preset; defaults to the job's device
        #[arg(long)]
        device: Option<String>,
        /// Print every valid configuration
        #[arg(long)]
        list: bool,
    },

    /// Inspect or compact a cache file
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// List device presets
    Devices,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Summarise the cached results per problem
    Inspect {
        path: PathBuf,
        #[arg(long, default_value = "3")]
        top: usize,
    },
    /// Rewrite the file keeping one entry per configuration
    Compact { path: PathBuf },
}

struct TuneArgs {
    job: PathBuf,
    cache: Option<PathBuf>,
    no_cache: bool,
    strategy: Option<String>,
    seed: Option<u64>,
    iterations: Option<usize>,
    max_fevals: Option<usize>,
    time_limit: Option<f64>,
    devices: Vec<String>,
    output: Option<PathBuf>,
    top: usize,
    verbose: bool,
    metrics: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Tune {
            job,
            cache,
            no_cache,
            strategy,
            seed,
            iterations,
            max_fevals,
            time_limit,
            devices,
            output,
            top,
            verbose,
            metrics,
        } => run_tune(TuneArgs {
            job,
            cache,
            no_cache,
            strategy,
            seed,
            iterations,
            max_fevals,
            time_limit,
            devices,
            output,
            top,
            verbose,
            metrics,
        })?,
        Commands::Space { job, device, list } => run_space(&job, device.as_deref(), list)?,
        Commands::Cache { action } => match action {
            CacheAction::Inspect { path, top } => run_cache_inspect(&path, top)?,
            CacheAction::Compact { path } => run_cache_compact(&path)?,
        },
        Commands::Devices => run_devices(),
    }
    Ok(())
}

fn preset(name: &str) -> Result<DeviceProperties> {
    DeviceProperties::preset(name).ok_or_else(|| {
        anyhow!(
            "unknown device `{}` (known: {})",
            name,
            DeviceProperties::PRESETS.join(", ")
        )
    })
}

fn run_tune(args: TuneArgs) -> Result<()> {
    let job = TuningJob::load(&args.job)
        .with_context(|| format!("loading job {}", args.job.display()))?;

    let mut options = job.options()?;
    if let Some(name) = &args.strategy {
        options.strategy = StrategyConfig::from_name(name).ok_or_else(|| {
            anyhow!(
                "unknown strategy `{}` (known: {})",
                name,
                StrategyConfig::NAMES.join(", ")
            )
        })?;
    }
    if let Some(seed) = args.seed {
        options.strategy = options.strategy.with_seed(seed);
    }
    if let Some(iterations) = args.iterations {
        options.iterations = iterations;
    }
    if args.max_fevals.is_some() {
        options.budget.max_fevals = args.max_fevals;
    }
    if let Some(secs) = args.time_limit {
        if !secs.is_finite() || secs < 0.0 {
            bail!("--time-limit must be a non-negative number of seconds");
        }
        options.budget.time_limit = Some(Duration::from_secs_f64(secs));
    }
    options.verbose |= args.verbose;

    let devices = if args.devices.is_empty() {
        vec![job.device()?]
    } else {
        args.devices
            .iter()
            .map(|d| preset(d))
            .collect::<Result<Vec<_>>>()?
    };

    let tuner = ktuner::Tuner::new(job.problem()?, options);
    let seed = args.seed.unwrap_or(0);
    let cache_path = if args.no_cache {
        None
    } else {
        args.cache.clone().or_else(|| job.cache_path())
    };
    let cache = match &cache_path {
        Some(path) => ResultCache::open(path)?,
        None => ResultCache::in_memory(),
    };

    let reports: Vec<TuningReport> = if devices.len() == 1 {
        let mut cache = cache;
        let mut backend = SimulatedBackend::new(devices[0].clone()).with_seed(seed);
        vec![tuner.run(&mut backend, &mut cache)?]
    } else {
        let backends: Vec<Box<dyn Backend>> = devices
            .into_iter()
            .map(|d| Box::new(SimulatedBackend::new(d).with_seed(seed)) as Box<dyn Backend>)
            .collect();
        let shared = Mutex::new(cache);
        tune_devices(&tuner, backends, &shared)
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    for report in &reports {
        println!("{}", format_report(report, args.top));
    }

    if let Some(output) = &args.output {
        if let [report] = reports.as_slice() {
            report.save(output)?;
        } else {
            std::fs::write(output, serde_json::to_string_pretty(&reports)?)?;
        }
        info!("wrote report to {}", output.display());
    }
    if args.metrics {
        print!("{}", tuner.telemetry().export_metrics());
    }
    Ok(())
}

fn run_space(job_path: &Path, device: Option<&str>, list: bool) -> Result<()> {
    let job = TuningJob::load(job_path)
        .with_context(|| format!("loading job {}", job_path.display()))?;
    let device = match device {
        Some(name) => preset(name)?,
        None => job.device()?,
    };
    let tuner = job.tuner()?;
    let space = &tuner.problem().space;
    let filter = tuner.validate(&device)?;

    let mut feasible = 0usize;
    let mut rejected: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut valid = 0usize;
    for config in space.iter() {
        valid += 1;
        match filter.check(&config) {
            Ok(geometry) => {
                feasible += 1;
                if list {
                    println!("{} | {}", config, geometry);
                }
            }
            Err(reason) => {
                *rejected.entry(reason.category()).or_default() += 1;
                if list {
                    println!("{} | skipped: {}", config, reason);
                }
            }
        }
    }

    println!("Parameters: {}", space.names().join(", "));
    println!("Cartesian product: {}", space.cartesian_size());
    println!("Valid after restrictions: {}", valid);
    println!("Feasible on {}: {}", device.name, feasible);
    for category in SkipReason::CATEGORIES {
        if let Some(n) = rejected.get(category) {
            println!("  {}: {}", category, n);
        }
    }
    Ok(())
}

fn run_cache_inspect(path: &Path, top: usize) -> Result<()> {
    if !path.exists() {
        bail!("cache file {} does not exist", path.display());
    }
    let cache = ResultCache::open(path)?;
    println!(
        "{}: {} results, {} unreadable lines",
        path.display(),
        cache.len(),
        cache.skipped_lines()
    );
    for problem in cache.problems() {
        let results = cache.results(problem);
        let mut measured: Vec<_> = results
            .iter()
            .filter_map(|(_, r)| r.time_ms().map(|t| (t, *r)))
            .collect();
        measured.sort_by(|a, b| a.0.total_cmp(&b.0));
        println!(
            "\n{}\n  {} results, {} measured, {} skipped",
            problem,
            results.len(),
            measured.len(),
            results.len() - measured.len()
        );
        for (t, r) in measured.iter().take(top) {
            println!("  {:.4} ms  {}", t, r.config);
        }
    }
    Ok(())
}

fn run_cache_compact(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("cache file {} does not exist", path.display());
    }
    let mut cache = ResultCache::open(path)?;
    let n = cache.compact()?;
    println!("{}: {} entries", path.display(), n);
    Ok(())
}

fn run_devices() {
    for name in DeviceProperties::PRESETS {
        let Some(d) = DeviceProperties::preset(name) else {
            continue;
        };
        println!(
            "{:<8} {} | {} SMs, warp {}, {} threads/block, {} KiB smem/block, {} regs/block",
            name,
            d.name,
            d.multiprocessor_count,
            d.warp_size,
            d.max_threads_per_block,
            d.max_shared_memory_per_block / 1024,
            d.max_registers_per_block
        );
    }
}
