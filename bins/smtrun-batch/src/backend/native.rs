use super::cleanup::CleanupReport;
use super::monitor::MemoryMonitor;
use super::process::{is_alive, terminate_group, terminate_tree};
use super::{decode_options, BackendError, BackendParams};
use crate::context::{SharedContext, NATIVE_POOL};
use crate::pool::{CpuLease, NativePool};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::{setpgid, Pid};
use serde::Deserialize;
use serde_json::{Map, Value};
use smtrun_common::{BackendResult, ResourcePinning};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NativeOptions {
    /// Seconds between memory polls
    #[serde(default)]
    pub memory_limit_poll_time_period: Option<f64>,
    #[serde(default)]
    pub resource_pinning: Option<ResourcePinning>,
}

#[derive(Default)]
struct RunState {
    pid: Option<i32>,
    cpus: Option<CpuLease>,
    killed: bool,
}

/// Runs the tool as a direct child of this process
pub struct NativeBackend {
    params: BackendParams,
    poll_period: Duration,
    oom_grace: Duration,
    pool: Option<Arc<NativePool>>,
    use_memset_of_nearest_node: bool,
    state: Mutex<RunState>,
}

impl NativeBackend {
    pub fn new(
        params: BackendParams,
        options: &Map<String, Value>,
        ctx: &SharedContext,
    ) -> Result<Self, BackendError> {
        let options: NativeOptions = decode_options("native", options)?;

        let poll_period = match options.memory_limit_poll_time_period {
            Some(_) if params.memory_limit == 0 => {
                return Err(BackendError::Options {
                    backend: "native",
                    reason: "cannot have \"memory_limit_poll_time_period\" specified with no memory limit"
                        .to_string(),
                })
            }
            Some(period) if !(period.is_finite() && period > 0.0) => {
                return Err(BackendError::Options {
                    backend: "native",
                    reason: "\"memory_limit_poll_time_period\" must be a float > 0.0".to_string(),
                })
            }
            Some(period) => Duration::from_secs_f64(period),
            None => ctx.config().memory_poll_interval(),
        };

        let use_memset_of_nearest_node = options
            .resource_pinning
            .as_ref()
            .is_some_and(|p| p.use_memset_of_nearest_node);
        let pool = match options.resource_pinning {
            Some(pinning) => Some(ctx.get_or_create(NATIVE_POOL, || {
                Ok::<_, BackendError>(NativePool::new(
                    NATIVE_POOL,
                    ctx.parallelism(),
                    Some(pinning),
                    ctx.topology(),
                )?)
            })?),
            None => None,
        };

        Ok(Self {
            params,
            poll_period,
            oom_grace: ctx.config().oom_grace(),
            pool,
            use_memset_of_nearest_node,
            state: Mutex::new(RunState::default()),
        })
    }

    pub fn params(&self) -> &BackendParams {
        &self.params
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().expect("native backend mutex poisoned")
    }

    pub fn check_tool_exists(&self, tool: &Path) -> Result<(), BackendError> {
        if tool.exists() {
            Ok(())
        } else {
            Err(BackendError::ToolMissing(tool.display().to_string()))
        }
    }

    /// The host path, untouched
    pub fn program_path(&self) -> String {
        self.params.host_program_path.display().to_string()
    }

    pub fn file_path_in_backend(&self, host_path: &Path) -> String {
        host_path.display().to_string()
    }

    pub async fn run(
        &self,
        cmd: &[String],
        stdout_path: &Path,
        stderr_path: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<BackendResult, BackendError> {
        if self.lock().killed {
            return Err(BackendError::Cancelled);
        }

        let mut cmd_line = cmd.to_vec();
        if let Some(pool) = &self.pool {
            let lease = pool.acquire_cpus()?;
            info!(cpus = %lease.cpu_list(), nodes = %lease.node_list(), "Pinning to cpus");
            let mut prefixed = pinning_prefix(&lease, self.use_memset_of_nearest_node);
            prefixed.extend(cmd_line);
            cmd_line = prefixed;
            self.lock().cpus = Some(lease);
        }

        let child = match self.spawn(&cmd_line, stdout_path, stderr_path, env) {
            Ok(child) => child,
            Err(e) => {
                self.kill().await.log(&self.program_path());
                return Err(e);
            }
        };
        self.supervise(child).await
    }

    fn spawn(
        &self,
        cmd_line: &[String],
        stdout_path: &Path,
        stderr_path: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<tokio::process::Child, BackendError> {
        let (program, args) = cmd_line.split_first().ok_or_else(|| BackendError::Spawn {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
        })?;

        let stdout = File::create(stdout_path)
            .map_err(|e| BackendError::io(format!("creating {}", stdout_path.display()), e))?;
        let stderr = File::create(stderr_path)
            .map_err(|e| BackendError::io(format!("creating {}", stderr_path.display()), e))?;

        // The overlay replaces the ambient environment entirely
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(env)
            .current_dir(&self.params.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let stack_limit = match self.params.stack_limit_bytes() {
            Some(bytes) => {
                let (_, hard) = getrlimit(Resource::RLIMIT_STACK)
                    .map_err(|e| BackendError::io("reading stack rlimit", e.into()))?;
                let limit = bytes.min(hard);
                info!(stack_bytes = limit, "Using stack size limit");
                Some(limit)
            }
            None => None,
        };
        // SAFETY: setpgid and setrlimit are async-signal-safe and touch no
        // memory shared with the parent
        unsafe {
            command.pre_exec(move || {
                // Own group so kill() can reach descendants after the tool is reaped
                setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from)?;
                if let Some(limit) = stack_limit {
                    setrlimit(Resource::RLIMIT_STACK, limit, limit).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }

        info!(cmd = ?cmd_line, env = ?env, "Running");
        command.spawn().map_err(|source| BackendError::Spawn {
            program: program.clone(),
            source,
        })
    }

    async fn supervise(&self, mut child: tokio::process::Child) -> Result<BackendResult, BackendError> {
        let start = Instant::now();
        let Some(pid) = child.id().map(|id| id as i32) else {
            // Already reaped, nothing left to watch
            let status = child.wait().await.map_err(|e| BackendError::io("waiting for tool", e))?;
            self.kill().await.log(&self.program_path());
            return Ok(BackendResult {
                exit_code: exit_code_from(status),
                run_time: start.elapsed(),
                out_of_time: false,
                out_of_memory: Some(false),
                user_cpu_time: None,
                sys_cpu_time: None,
            });
        };

        let cancelled = {
            let mut state = self.lock();
            state.pid = Some(pid);
            state.killed
        };
        if cancelled {
            stop_run(pid);
            let _ = child.wait().await;
            self.lock().pid = None;
            self.kill().await.log(&self.program_path());
            return Err(BackendError::Cancelled);
        }

        let monitor = match self.params.memory_limit_bytes() {
            Some(limit) => match MemoryMonitor::spawn(pid, limit, self.poll_period, self.oom_grace) {
                Ok(monitor) => Some(monitor),
                Err(e) => {
                    self.kill().await.log(&self.program_path());
                    let _ = child.wait().await;
                    return Err(BackendError::io("starting memory monitor", e));
                }
            },
            None => None,
        };

        let mut out_of_time = false;
        let waited = if self.params.time_limit > 0 {
            info!(pid, timeout_secs = self.params.time_limit, "Running with timeout");
            let limit = Duration::from_secs(self.params.time_limit);
            match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status),
                Err(_) => {
                    warn!(pid, "Hard timeout hit");
                    out_of_time = true;
                    None
                }
            }
        } else {
            Some(child.wait().await)
        };

        let report = self.kill().await;
        report.log(&self.program_path());

        let exit_code = match waited {
            Some(Ok(status)) => exit_code_from(status),
            Some(Err(e)) => {
                warn!(pid, error = %e, "Failed to wait for tool");
                None
            }
            None => {
                // Reap what kill() just terminated
                if let Err(e) = child.wait().await {
                    warn!(pid, error = %e, "Failed to reap timed out tool");
                }
                None
            }
        };

        let out_of_memory = match monitor {
            Some(monitor) => tokio::task::spawn_blocking(move || monitor.finish())
                .await
                .unwrap_or_else(|e| {
                    warn!(pid, error = %e, "Memory monitor join failed");
                    false
                }),
            None => false,
        };

        let run_time = start.elapsed();
        debug!(pid, ?exit_code, out_of_time, out_of_memory, run_time_secs = run_time.as_secs_f64(), "Tool finished");
        Ok(BackendResult {
            exit_code,
            run_time,
            out_of_time,
            out_of_memory: Some(out_of_memory),
            user_cpu_time: None,
            sys_cpu_time: None,
        })
    }

    pub async fn kill(&self) -> CleanupReport {
        let (pid, cpus) = {
            let mut state = self.lock();
            state.killed = true;
            (state.pid.take(), state.cpus.take())
        };

        let mut report = CleanupReport::new();
        if let Some(pid) = pid {
            let terminated = tokio::task::spawn_blocking(move || stop_run(pid))
                .await
                .map_err(|e| e.to_string());
            report.record("terminate process tree", terminated);
        }
        if let (Some(pool), Some(lease)) = (&self.pool, cpus) {
            report.record("release cpus", pool.release_cpus(&lease));
        }
        report
    }
}

/// Tree first while the tool still links it, then its group for anything
/// orphaned or already past a reaped leader
fn stop_run(pid: i32) {
    if is_alive(pid) {
        terminate_tree(pid, Duration::ZERO);
    }
    terminate_group(pid, Duration::ZERO);
}

/// Signal deaths map to the negated signal number
fn exit_code_from(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

/// `taskset` + `numactl` wrapper pinning the tool to `lease`
fn pinning_prefix(lease: &CpuLease, bind_memory: bool) -> Vec<String> {
    let cpus = lease.cpu_list();
    let mut prefix = vec![
        "taskset".to_string(),
        "--cpu-list".to_string(),
        cpus.clone(),
        "numactl".to_string(),
        format!("--physcpubind={}", cpus),
    ];
    if bind_memory {
        if let Some((_, node)) = lease.slots().first() {
            prefix.push(format!("--membind={}", node));
        }
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;
    use serde_json::json;
    use smtrun_common::{Config, StackLimit};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn ctx(parallelism: usize) -> SharedContext {
        SharedContext::new(parallelism, Config::default())
            .with_topology(Arc::new(StaticTopology::uniform(2, 2)))
    }

    fn params(dir: &TempDir, time_limit: u64, memory_limit: u64) -> BackendParams {
        BackendParams {
            host_program_path: PathBuf::from("/bin/true"),
            working_directory: dir.path().to_path_buf(),
            time_limit,
            memory_limit,
            stack_limit: None,
        }
    }

    fn options(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("options must be an object"),
        }
    }

    fn path_env() -> BTreeMap<String, String> {
        BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())])
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn read_pids(path: &Path) -> Vec<i32> {
        std::fs::read_to_string(path)
            .unwrap()
            .split_whitespace()
            .map(|pid| pid.parse().unwrap())
            .collect()
    }

    /// Signals land asynchronously, give the kernel a moment
    fn wait_until_dead(pid: i32) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if !is_alive(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    async fn run(backend: &NativeBackend, dir: &TempDir, cmd: Vec<String>) -> BackendResult {
        backend
            .run(
                &cmd,
                &dir.path().join("stdout.log.txt"),
                &dir.path().join("stderr.log.txt"),
                &path_env(),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_poll_period_requires_memory_limit() {
        let dir = TempDir::new().unwrap();
        let err = NativeBackend::new(
            params(&dir, 0, 0),
            &options(json!({"memory_limit_poll_time_period": 0.1})),
            &ctx(1),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("no memory limit"));

        let err = NativeBackend::new(
            params(&dir, 0, 10),
            &options(json!({"memory_limit_poll_time_period": -1.0})),
            &ctx(1),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("> 0.0"));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let dir = TempDir::new().unwrap();
        let result = NativeBackend::new(params(&dir, 0, 0), &options(json!({"gpu": true})), &ctx(1));
        assert!(matches!(result, Err(BackendError::Options { .. })));
    }

    #[test]
    fn test_pinning_capacity_checked_at_construction() {
        let dir = TempDir::new().unwrap();
        let result = NativeBackend::new(
            params(&dir, 0, 0),
            &options(json!({"resource_pinning": {"cpu_ids": [0, 1], "cpus_per_job": 2}})),
            &ctx(2),
        );
        assert!(matches!(result, Err(BackendError::Pool(_))));
    }

    #[test]
    fn test_pinning_prefix() {
        let lease = CpuLease::for_tests(vec![(2, 1), (3, 1)]);
        assert_eq!(
            pinning_prefix(&lease, false),
            vec!["taskset", "--cpu-list", "2,3", "numactl", "--physcpubind=2,3"]
        );
        assert_eq!(pinning_prefix(&lease, true).last().unwrap(), "--membind=1");
    }

    #[test]
    fn test_program_path_is_identity() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(params(&dir, 0, 0), &Map::new(), &ctx(1)).unwrap();
        assert_eq!(backend.program_path(), "/bin/true");
        assert_eq!(backend.file_path_in_backend(Path::new("/data/x")), "/data/x");
        assert!(backend.check_tool_exists(Path::new("/bin/sh")).is_ok());
        assert!(matches!(
            backend.check_tool_exists(Path::new("/no/such/tool")),
            Err(BackendError::ToolMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_code_and_logs() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(params(&dir, 10, 0), &Map::new(), &ctx(1)).unwrap();
        let result = run(&backend, &dir, sh("echo out; echo err >&2; exit 3")).await;

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.out_of_time);
        assert_eq!(result.out_of_memory, Some(false));
        assert_eq!(std::fs::read_to_string(dir.path().join("stdout.log.txt")).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("stderr.log.txt")).unwrap(), "err\n");
    }

    #[tokio::test]
    async fn test_environment_is_replaced() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("SMTRUN_AMBIENT_MARKER", "leaked");
        let backend = NativeBackend::new(params(&dir, 10, 0), &Map::new(), &ctx(1)).unwrap();
        let result = run(&backend, &dir, sh("echo \"${SMTRUN_AMBIENT_MARKER:-clean}\"; pwd")).await;

        assert_eq!(result.exit_code, Some(0));
        let out = std::fs::read_to_string(dir.path().join("stdout.log.txt")).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("clean"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(cwd.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_crash_reports_negated_signal() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(params(&dir, 10, 0), &Map::new(), &ctx(1)).unwrap();
        let result = run(&backend, &dir, sh("kill -SEGV $$")).await;
        assert_eq!(result.exit_code, Some(-11));
        assert!(!result.out_of_time);
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(params(&dir, 1, 0), &Map::new(), &ctx(1)).unwrap();
        let pids = dir.path().join("pids");
        let script = format!("sleep 10 & echo $$ $! > {}; wait", pids.display());
        let start = Instant::now();
        let result = run(&backend, &dir, sh(&script)).await;

        assert!(result.out_of_time);
        assert_eq!(result.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(5));
        for pid in read_pids(&pids) {
            assert!(wait_until_dead(pid), "pid {} survived timeout", pid);
        }
    }

    #[tokio::test]
    async fn test_background_descendant_killed_after_exit() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(params(&dir, 10, 0), &Map::new(), &ctx(1)).unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 & echo $! > {}; exit 0", pid_file.display());
        let result = run(&backend, &dir, sh(&script)).await;

        assert_eq!(result.exit_code, Some(0));
        let pids = read_pids(&pid_file);
        assert_eq!(pids.len(), 1);
        assert!(wait_until_dead(pids[0]), "background pid {} survived run", pids[0]);
    }

    #[tokio::test]
    async fn test_memory_limit_kills_tool() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(
            params(&dir, 30, 10),
            &options(json!({"memory_limit_poll_time_period": 0.1})),
            &ctx(1),
        )
        .unwrap();
        let cmd = ["/bin/dd", "if=/dev/zero", "of=/dev/null", "bs=100M", "count=100000"]
            .map(String::from)
            .to_vec();
        let result = run(&backend, &dir, cmd).await;

        assert_eq!(result.out_of_memory, Some(true));
        assert!(!result.out_of_time);
        assert!(matches!(result.exit_code, Some(code) if code < 0));
    }

    #[tokio::test]
    async fn test_monitor_thread_joined_after_run() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(
            params(&dir, 10, 512),
            &options(json!({"memory_limit_poll_time_period": 0.05})),
            &ctx(1),
        )
        .unwrap();
        let result = run(&backend, &dir, sh("echo $$; sleep 0.3")).await;
        assert_eq!(result.out_of_memory, Some(false));

        let out = std::fs::read_to_string(dir.path().join("stdout.log.txt")).unwrap();
        let poller = format!("mempoll-{}", out.trim());
        let pollers = std::fs::read_dir("/proc/self/task")
            .unwrap()
            .flatten()
            .filter_map(|task| std::fs::read_to_string(task.path().join("comm")).ok())
            .filter(|comm| comm.trim() == poller)
            .count();
        assert_eq!(pollers, 0);
    }

    #[tokio::test]
    async fn test_stack_limit_applied() {
        let dir = TempDir::new().unwrap();
        let mut p = params(&dir, 10, 0);
        p.stack_limit = Some(StackLimit::KiB(4096));
        let backend = NativeBackend::new(p, &Map::new(), &ctx(1)).unwrap();
        let result = run(&backend, &dir, sh("ulimit -s")).await;

        assert_eq!(result.exit_code, Some(0));
        let out = std::fs::read_to_string(dir.path().join("stdout.log.txt")).unwrap();
        assert_eq!(out.trim(), "4096");
    }

    #[tokio::test]
    async fn test_kill_before_run_cancels() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(params(&dir, 10, 0), &Map::new(), &ctx(1)).unwrap();
        assert!(backend.kill().await.is_clean());
        let result = backend
            .run(&sh("exit 0"), &dir.path().join("o"), &dir.path().join("e"), &path_env())
            .await;
        assert!(matches!(result, Err(BackendError::Cancelled)));
        assert!(!dir.path().join("o").exists());
    }

    #[tokio::test]
    async fn test_concurrent_kill_stops_run() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(NativeBackend::new(params(&dir, 0, 0), &Map::new(), &ctx(1)).unwrap());

        let runner = {
            let backend = Arc::clone(&backend);
            let stdout = dir.path().join("stdout.log.txt");
            let stderr = dir.path().join("stderr.log.txt");
            tokio::spawn(async move { backend.run(&sh("sleep 30"), &stdout, &stderr, &path_env()).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        backend.kill().await;
        // Second kill is a no-op
        assert!(backend.kill().await.is_clean());

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(result.exit_code, Some(code) if code != 0));
        assert!(!result.out_of_time);
    }

    #[tokio::test]
    async fn test_pinned_run_returns_cpus() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(1);
        let backend = NativeBackend::new(
            params(&dir, 10, 0),
            &options(json!({"resource_pinning": {"cpu_ids": [0], "cpus_per_job": 1}})),
            &ctx,
        )
        .unwrap();
        let pool = ctx.get_object::<NativePool>(NATIVE_POOL).unwrap();
        assert_eq!(pool.free_cpu_count(), 1);

        // Whether or not taskset/numactl are installed the lease must come back
        let _ = backend
            .run(
                &sh("exit 0"),
                &dir.path().join("stdout.log.txt"),
                &dir.path().join("stderr.log.txt"),
                &path_env(),
            )
            .await;
        assert_eq!(pool.free_cpu_count(), 1);
    }
}
