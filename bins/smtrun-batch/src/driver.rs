/// Batch Driver - Fan Out Jobs With Bounded Concurrency
///
/// **Core Responsibility:**
/// Build one `Job` per invocation, run them one at a time or through a
/// fixed number of slots, and report exactly one outcome per invocation.
///
/// **Shutdown order:**
/// 1. Close the slot semaphore so nothing new launches
/// 2. Kill every job that may be running
///
/// A job failing at construction, crashing, timing out or being cancelled
/// never stops the rest of the batch from being reported.

use crate::context::SharedContext;
use crate::job::{error_record, Job};
use smtrun_common::{paths, BatchConfig, InvocationInfo, JobOutcome, Solver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

const CANCELLED: &str = "job cancelled before it started";

/// Job ready to run, or the record explaining why it could not be built
pub type Prepared = Result<Arc<Job>, JobOutcome>;

pub struct BatchDriver {
    ctx: Arc<SharedContext>,
    config: BatchConfig,
    solver: Solver,
    benchmark_base: PathBuf,
    output_root: PathBuf,
}

impl BatchDriver {
    pub fn new(
        ctx: Arc<SharedContext>,
        config: BatchConfig,
        solver: Solver,
        benchmark_base: PathBuf,
        output_root: PathBuf,
    ) -> Self {
        Self {
            ctx,
            config,
            solver,
            benchmark_base,
            output_root,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.ctx.parallelism()
    }

    /// Create every working directory and construct every job up front
    pub async fn prepare(&self, invocations: &[InvocationInfo]) -> Vec<Prepared> {
        let (_tx, rx) = watch::channel(false);
        self.prepare_with_shutdown(invocations, &rx).await
    }

    /// As `prepare`, but once `shutdown` reads `true` the remaining
    /// invocations are reported cancelled without being built
    pub async fn prepare_with_shutdown(
        &self,
        invocations: &[InvocationInfo],
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<Prepared> {
        let mut prepared = Vec::with_capacity(invocations.len());
        for (index, invocation) in invocations.iter().enumerate() {
            if *shutdown.borrow() {
                warn!(remaining = invocations.len() - index, "Shutdown requested while preparing jobs");
                for (index, invocation) in invocations.iter().enumerate().skip(index) {
                    let record = error_record(index, invocation, None, &self.output_root, CANCELLED);
                    prepared.push(Err(JobOutcome::Failed(record)));
                }
                break;
            }

            let wd = self.output_root.join(paths::workdir_name(index));
            if let Err(e) = tokio::fs::create_dir(&wd).await {
                error!(job = index, path = %wd.display(), error = %e, "Failed to create working directory");
                let record = error_record(index, invocation, None, &self.output_root, e);
                prepared.push(Err(JobOutcome::Failed(record)));
                continue;
            }

            let job = Job::new(
                index,
                self.solver,
                invocation.clone(),
                &self.config.runner_config,
                &self.benchmark_base,
                wd.clone(),
                &self.output_root,
                self.ctx.clone(),
            )
            .await;
            match job {
                Ok(job) => prepared.push(Ok(Arc::new(job))),
                Err(e) => {
                    error!(job = index, benchmark = %invocation.benchmark, error = %e, "Failed to construct job");
                    let record = error_record(index, invocation, Some(&wd), &self.output_root, e);
                    prepared.push(Err(JobOutcome::Failed(record)));
                }
            }
        }
        info!(jobs = prepared.len(), "Jobs prepared");
        prepared
    }

    /// Run the batch, stopping early on SIGINT or SIGTERM
    pub async fn run(&self, invocations: &[InvocationInfo]) -> Vec<JobOutcome> {
        let (tx, rx) = watch::channel(false);
        let listener = tokio::spawn(async move {
            wait_for_signal().await;
            warn!("Received shutdown signal, cancelling pending jobs");
            let _ = tx.send(true);
        });

        let outcomes = self.run_with_shutdown(invocations, rx).await;
        listener.abort();
        outcomes
    }

    /// Run the batch; flipping `shutdown` to `true` cancels it
    pub async fn run_with_shutdown(
        &self,
        invocations: &[InvocationInfo],
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JobOutcome> {
        let prepared = self.prepare_with_shutdown(invocations, &shutdown).await;
        let outcomes = if self.parallelism() <= 1 {
            self.run_sequential(prepared, shutdown).await
        } else {
            self.run_parallel(prepared, shutdown).await
        };
        self.shutdown();
        outcomes
    }

    /// Close the shared pools; later client acquisition fails
    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }

    async fn run_sequential(
        &self,
        prepared: Vec<Prepared>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<JobOutcome> {
        let total = prepared.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut stopping = false;

        for entry in prepared {
            let outcome = match entry {
                Err(failed) => failed,
                Ok(job) if stopping => cancelled(&job).await,
                Ok(job) => {
                    let execution = execute(&job);
                    tokio::pin!(execution);
                    tokio::select! {
                        outcome = &mut execution => outcome,
                        _ = wait_for_shutdown(&mut shutdown) => {
                            stopping = true;
                            job.kill().await.log(&job.spec().benchmark);
                            // The killed run still reports what it got
                            execution.await
                        }
                    }
                }
            };
            outcomes.push(outcome);
            report_progress(outcomes.len(), total);
        }
        outcomes
    }

    async fn run_parallel(
        &self,
        prepared: Vec<Prepared>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<JobOutcome> {
        let total = prepared.len();
        let slots = Arc::new(Semaphore::new(self.parallelism()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut jobs = Vec::new();
        info!(parallelism = self.parallelism(), jobs = total, "Running jobs in parallel");

        for entry in prepared {
            match entry {
                Err(failed) => {
                    let _ = tx.send(failed);
                }
                Ok(job) => {
                    jobs.push(job.clone());
                    let slots = slots.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let outcome = match slots.acquire_owned().await {
                            Ok(_slot) => execute(&job).await,
                            Err(_) => cancelled(&job).await,
                        };
                        let _ = tx.send(outcome);
                    });
                }
            }
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(total);
        let mut stopping = false;
        loop {
            tokio::select! {
                outcome = rx.recv() => match outcome {
                    Some(outcome) => {
                        outcomes.push(outcome);
                        report_progress(outcomes.len(), total);
                    }
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown), if !stopping => {
                    stopping = true;
                    slots.close();
                    info!(jobs = jobs.len(), "Killing running jobs");
                    for job in &jobs {
                        job.kill().await.log(&job.spec().benchmark);
                    }
                }
            }
        }
        outcomes
    }
}

/// Run `job`, turning any failure into an error record
async fn execute(job: &Job) -> JobOutcome {
    match job.run().await {
        Ok(record) => JobOutcome::Completed(record),
        Err(e) => {
            error!(job = job.index(), benchmark = %job.spec().benchmark, error = %e, "Job failed");
            job.kill().await.log(&job.spec().benchmark);
            JobOutcome::Failed(job.error_record(e))
        }
    }
}

async fn cancelled(job: &Job) -> JobOutcome {
    job.kill().await.log(&job.spec().benchmark);
    JobOutcome::Failed(job.error_record(CANCELLED))
}

fn report_progress(completed: usize, total: usize) {
    let percent = if total == 0 {
        100.0
    } else {
        100.0 * completed as f64 / total as f64
    };
    info!("Completed {}/{} ({:.1}%)", completed, total, percent);
}

/// Resolves once `shutdown` reads `true`; never if the sender goes away
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = term.recv() => {},
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT stops the batch");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Working-directories root must be absent or an empty directory
pub fn check_output_root(root: &Path) -> anyhow::Result<()> {
    if !root.exists() {
        std::fs::create_dir_all(root)?;
        return Ok(());
    }
    if !root.is_dir() {
        anyhow::bail!("\"{}\" exists but is not a directory", root.display());
    }
    if std::fs::read_dir(root)?.next().is_some() {
        anyhow::bail!("\"{}\" is not empty", root.display());
    }
    Ok(())
}
