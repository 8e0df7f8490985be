use anyhow::{bail, Context as _, Result};
use chrono::Local;
use clap::Parser;
use serde_json::Value;
use smtrun_batch::context::SharedContext;
use smtrun_batch::driver::{self, BatchDriver};
use smtrun_common::{BatchConfig, Config, InvocationInfos, ResultInfos, Solver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "smtrun-batch")]
#[command(about = "Run a batch of solver invocations under resource limits", long_about = None)]
struct Cli {
    /// Prefix path for benchmarks (defaults to the current directory)
    #[arg(long)]
    benchmark_base: Option<PathBuf>,

    /// Number of jobs to run in parallel
    #[arg(short, long, default_value = "1")]
    jobs: usize,

    /// Stop after constructing every job
    #[arg(long)]
    dry: bool,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Batch configuration (JSON)
    config: PathBuf,

    /// Invocation info document (JSON)
    invocation_info: PathBuf,

    /// Directory to create working directories inside
    working_dirs_root: PathBuf,

    /// Path to write the result info document to
    output: PathBuf,
}

fn init_tracing(level: Option<&str>, json: bool) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read \"{}\"", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse \"{}\"", path.display()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.log_json);

    match run(cli).await {
        Ok(0) => Ok(()),
        Ok(failures) => {
            error!(failures, "Some jobs failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns the number of error records produced
async fn run(cli: Cli) -> Result<usize> {
    if cli.jobs < 1 {
        bail!("jobs must be >= 1");
    }

    let benchmark_base = match &cli.benchmark_base {
        Some(base) => absolute(base)?,
        None => std::env::current_dir()?,
    };
    if !benchmark_base.is_dir() {
        bail!("benchmark base path \"{}\" must be a directory", benchmark_base.display());
    }

    let config = BatchConfig::from_value(read_json(&cli.config)?)?;
    let solver = Solver::from_str(&config.runner)
        .with_context(|| format!("unknown runner \"{}\"", config.runner))?;

    let invocations: InvocationInfos = serde_json::from_value(read_json(&cli.invocation_info)?)
        .context("invalid invocation info document")?;
    if invocations.results.is_empty() {
        bail!("invocation info contains no invocations");
    }
    let missing: Vec<&str> = invocations
        .results
        .iter()
        .filter(|i| !benchmark_base.join(&i.benchmark).exists())
        .map(|i| i.benchmark.as_str())
        .collect();
    if !missing.is_empty() {
        bail!("benchmarks do not exist: {:?}", missing);
    }

    let output = absolute(&cli.output)?;
    if output.exists() {
        bail!("output file \"{}\" already exists", output.display());
    }
    let root = absolute(&cli.working_dirs_root)?;
    driver::check_output_root(&root)?;

    let backend_name = config
        .runner_config
        .backend
        .as_ref()
        .map(|b| b.name.clone())
        .unwrap_or_else(|| "native".to_string());
    let mut misc = invocations.misc.clone();
    misc.insert("runner".to_string(), Value::from(config.runner.clone()));
    misc.insert("backend".to_string(), Value::from(backend_name));
    misc.insert("jobs_in_parallel".to_string(), Value::from(cli.jobs));

    let ctx = Arc::new(SharedContext::new(cli.jobs, Config::from_env()));
    let driver = BatchDriver::new(ctx, config, solver, benchmark_base, root);

    if cli.dry {
        let prepared = driver.prepare(&invocations.results).await;
        driver.shutdown();
        let failures = prepared.iter().filter(|p| p.is_err()).count();
        info!(jobs = prepared.len(), failures, "Dry run, not running jobs");
        return Ok(failures);
    }

    let start = Local::now();
    info!(start = %start.format("%Y-%m-%d %H:%M:%S"), "Starting batch");
    misc.insert("start_time".to_string(), Value::from(start.to_rfc3339()));

    let outcomes = driver.run(&invocations.results).await;

    let end = Local::now();
    let run_time = (end - start).to_std().unwrap_or_default();
    info!(end = %end.format("%Y-%m-%d %H:%M:%S"), run_time_secs = run_time.as_secs_f64(), "Finished batch");
    misc.insert("end_time".to_string(), Value::from(end.to_rfc3339()));
    misc.insert("run_time".to_string(), Value::from(run_time.as_secs_f64()));

    let failures = outcomes.iter().filter(|o| o.is_error()).count();
    let document = ResultInfos {
        results: outcomes,
        misc,
    };
    let rendered = serde_json::to_string_pretty(&document)?;
    std::fs::write(&output, rendered)
        .with_context(|| format!("failed to write \"{}\"", output.display()))?;
    info!(output = %output.display(), "Wrote result info");

    Ok(failures)
}
