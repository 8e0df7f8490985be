/// Job - One Benchmark Invocation Bound to One Backend
///
/// **Core Responsibility:**
/// Turn an invocation record plus the batch configuration into a validated
/// `JobSpec`, own the backend that will run it, and convert the backend's
/// result into a `ResultRecord` with paths relative to the output root.
///
/// Construction is the fail-fast point: bad configuration, a non-empty
/// working directory or a tool the backend cannot see all surface here,
/// before the job takes a scheduling slot.

use crate::backend::{Backend, BackendError, BackendParams, CleanupReport};
use crate::context::SharedContext;
use smtrun_common::{
    paths, BackendResult, ConfigError, ErrorRecord, InvocationInfo, JobSpec, ResultRecord,
    RunnerConfig, Solver,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("working directory \"{path}\" {reason}")]
    WorkingDirectory { path: String, reason: &'static str },
}

pub struct Job {
    index: usize,
    invocation: InvocationInfo,
    spec: JobSpec,
    solver: Solver,
    working_directory: PathBuf,
    output_root: PathBuf,
    backend: Backend,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        index: usize,
        solver: Solver,
        invocation: InvocationInfo,
        runner_config: &RunnerConfig,
        benchmark_base: &Path,
        working_directory: PathBuf,
        output_root: &Path,
        ctx: Arc<SharedContext>,
    ) -> Result<Self, JobError> {
        check_working_directory(&working_directory)?;

        if runner_config.backend.is_none() {
            warn!(job = index, "No backend specified, defaulting to native");
        }
        let spec = JobSpec::build(benchmark_base, &invocation, runner_config)?;

        let params = BackendParams {
            host_program_path: spec.benchmark_path.clone(),
            working_directory: working_directory.clone(),
            time_limit: spec.max_time_secs,
            memory_limit: spec.max_memory_mib,
            stack_limit: spec.stack_limit,
        };
        let backend = Backend::create(spec.backend, &spec.backend_config, params, ctx).await?;
        backend.check_tool_exists(&spec.tool_path).await?;

        debug!(job = index, benchmark = %spec.benchmark, backend = backend.name(), "Job ready");
        Ok(Self {
            index,
            invocation,
            spec,
            solver,
            working_directory,
            output_root: output_root.to_path_buf(),
            backend,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn invocation(&self) -> &InvocationInfo {
        &self.invocation
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Full command line as the backend will see it
    pub fn command_line(&self) -> Vec<String> {
        self.solver.command_line(
            &self.spec.tool_path.display().to_string(),
            &self.spec.additional_args,
            &self.backend.program_path(),
        )
    }

    pub async fn run(&self) -> Result<ResultRecord, JobError> {
        let stdout = paths::stdout_log(&self.working_directory);
        let stderr = paths::stderr_log(&self.working_directory);
        info!(job = self.index, benchmark = %self.spec.benchmark, "Running job");

        let result = self
            .backend
            .run(&self.command_line(), &stdout, &stderr, &self.spec.env)
            .await?;
        Ok(self.collect_result(result, &stdout, &stderr))
    }

    pub async fn kill(&self) -> CleanupReport {
        self.backend.kill().await
    }

    fn collect_result(&self, result: BackendResult, stdout: &Path, stderr: &Path) -> ResultRecord {
        ResultRecord {
            job_index: self.index,
            invocation: self.invocation.clone(),
            wallclock_time: result.run_time.as_secs_f64(),
            working_directory: self.relative(&self.working_directory),
            exit_code: result.exit_code,
            out_of_memory: result.out_of_memory,
            stdout_log_file: self.relative(stdout),
            stderr_log_file: self.relative(stderr),
            user_cpu_time: result.user_cpu_time,
            sys_cpu_time: result.sys_cpu_time,
            backend_timeout: result.out_of_time,
        }
    }

    fn relative(&self, path: &Path) -> String {
        paths::relative_to_root(&self.output_root, path)
            .unwrap_or_else(|| path.display().to_string())
    }

    pub fn error_record(&self, error: impl fmt::Display) -> ErrorRecord {
        error_record(
            self.index,
            &self.invocation,
            Some(&self.working_directory),
            &self.output_root,
            error,
        )
    }
}

/// Error record for an invocation that may never have become a `Job`
pub fn error_record(
    index: usize,
    invocation: &InvocationInfo,
    working_directory: Option<&Path>,
    output_root: &Path,
    error: impl fmt::Display,
) -> ErrorRecord {
    ErrorRecord {
        job_index: index,
        invocation: invocation.clone(),
        working_directory: working_directory.map(|wd| {
            paths::relative_to_root(output_root, wd).unwrap_or_else(|| wd.display().to_string())
        }),
        error: format!("{:#}", error),
    }
}

fn check_working_directory(path: &Path) -> Result<(), JobError> {
    let invalid = |reason| JobError::WorkingDirectory {
        path: path.display().to_string(),
        reason,
    };
    if !path.is_absolute() {
        return Err(invalid("must be absolute"));
    }
    if !path.exists() {
        return Err(invalid("does not exist"));
    }
    if !path.is_dir() {
        return Err(invalid("is not a directory"));
    }
    let mut entries = std::fs::read_dir(path).map_err(|_| invalid("cannot be listed"))?;
    if entries.next().is_some() {
        return Err(invalid("is not empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smtrun_common::Config;

    struct Fixture {
        _dir: tempfile::TempDir,
        bench: PathBuf,
        root: PathBuf,
        ctx: Arc<SharedContext>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bench = dir.path().join("bench");
        let root = dir.path().join("runs");
        std::fs::create_dir_all(bench.join("qf_bv")).unwrap();
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(bench.join("qf_bv/a.smt2"), "(check-sat)\n").unwrap();
        Fixture {
            _dir: dir,
            bench,
            root,
            ctx: Arc::new(SharedContext::new(1, Config::default())),
        }
    }

    fn runner(tool: &str) -> RunnerConfig {
        RunnerConfig::from_value(json!({
            "tool_path": tool,
            "max_time": 5,
            "backend": {"name": "native"},
        }))
        .unwrap()
    }

    async fn job(f: &Fixture, tool: &str, workdir: &str) -> Result<Job, JobError> {
        let wd = f.root.join(workdir);
        std::fs::create_dir_all(&wd).unwrap();
        Job::new(
            0,
            Solver::Cvc5,
            InvocationInfo::new("qf_bv/a.smt2"),
            &runner(tool),
            &f.bench,
            wd,
            &f.root,
            f.ctx.clone(),
        )
        .await
    }

    #[tokio::test]
    async fn test_run_produces_relative_record() {
        let f = fixture();
        let job = job(&f, "/bin/cat", "workdir-0").await.unwrap();
        assert_eq!(
            job.command_line(),
            vec!["/bin/cat".to_string(), f.bench.join("qf_bv/a.smt2").display().to_string()]
        );

        let record = job.run().await.unwrap();
        assert_eq!(record.job_index, 0);
        assert_eq!(record.invocation.benchmark, "qf_bv/a.smt2");
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.working_directory, "workdir-0");
        assert_eq!(record.stdout_log_file, "workdir-0/stdout.log.txt");
        assert_eq!(record.stderr_log_file, "workdir-0/stderr.log.txt");
        assert!(!record.backend_timeout);
        assert_eq!(record.out_of_memory, Some(false));

        let out = std::fs::read_to_string(f.root.join("workdir-0/stdout.log.txt")).unwrap();
        assert_eq!(out, "(check-sat)\n");
    }

    #[tokio::test]
    async fn test_missing_tool_fails_construction() {
        let f = fixture();
        let err = job(&f, "/no/such/solver", "workdir-0").await.err().unwrap();
        assert!(matches!(err, JobError::Backend(BackendError::ToolMissing(_))));
    }

    #[tokio::test]
    async fn test_working_directory_must_be_empty() {
        let f = fixture();
        let wd = f.root.join("workdir-0");
        std::fs::create_dir_all(&wd).unwrap();
        std::fs::write(wd.join("leftover"), "").unwrap();
        let err = job(&f, "/bin/cat", "workdir-0").await.err().unwrap();
        assert!(matches!(err, JobError::WorkingDirectory { reason: "is not empty", .. }));
    }

    #[test]
    fn test_working_directory_checks() {
        assert!(check_working_directory(Path::new("relative/dir")).is_err());
        assert!(check_working_directory(Path::new("/no/such/dir")).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(check_working_directory(dir.path()).is_ok());
        let file = dir.path().join("f");
        std::fs::write(&file, "").unwrap();
        assert!(check_working_directory(&file).is_err());
    }

    #[test]
    fn test_error_record_keeps_chain() {
        let root = Path::new("/runs");
        let err = anyhow::anyhow!("no such file").context("building job");
        let record = error_record(
            2,
            &InvocationInfo::new("a.smt2"),
            Some(Path::new("/runs/workdir-2")),
            root,
            err,
        );
        assert_eq!(record.job_index, 2);
        assert_eq!(record.working_directory.as_deref(), Some("workdir-2"));
        assert_eq!(record.error, "building job: no such file");

        let record = error_record(5, &InvocationInfo::new("a.smt2"), None, root, "boom");
        assert_eq!(record.working_directory, None);
        assert_eq!(record.job_index, 5);
    }
}
