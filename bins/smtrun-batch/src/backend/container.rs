/// Container Backend - Runs the Tool Inside a Docker Container
///
/// **Lifecycle per run:**
/// 1. Borrow a daemon client (and CPUs when pinning) from the shared pool
/// 2. Create a container with the working directory and benchmark mounted
/// 3. Start it and wait, bounded by the wall-time limit
/// 4. `kill()`: stop, save logs, read the OOM flag, remove, return leases
///
/// Each cleanup step runs even if an earlier one failed.

use super::cleanup::CleanupReport;
use super::{decode_options, BackendError, BackendParams};
use crate::context::{SharedContext, CONTAINER_POOL};
use crate::pool::{ClientLease, ContainerPool, CpuLease};
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::ListImagesOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::{ClientVersion, Docker};
use futures_util::StreamExt;
use nix::unistd::{getgid, getuid};
use serde::Deserialize;
use serde_json::{Map, Value};
use smtrun_common::{paths, BackendResult, ConfigError, ResourcePinning};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sentinel for "the user running the batch"; `$` cannot occur in a
/// username so it never collides with a real one
pub const HOST_USER: &str = "$HOST_USER";

const MAPPED_FILE_DIR: &str = "/tmp";
const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
/// Replaced by the configured timeout right after connecting
const DOCKER_CONNECT_TIMEOUT_SECS: u64 = 120;
const SHELL: &str = "/bin/bash";

fn default_image_work_dir() -> String {
    "/mnt/".to_string()
}

fn default_user() -> Option<UserSpec> {
    Some(UserSpec::Name(HOST_USER.to_string()))
}

fn default_read_only() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum UserSpec {
    Id(u32),
    Name(String),
}

impl UserSpec {
    /// Value handed to the daemon's `User` field
    pub fn resolve(&self) -> String {
        match self {
            UserSpec::Id(uid) => uid.to_string(),
            UserSpec::Name(name) if name == HOST_USER => format!("{}:{}", getuid(), getgid()),
            UserSpec::Name(name) => name.clone(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            UserSpec::Id(_) => Ok(()),
            UserSpec::Name(name) if name == HOST_USER => Ok(()),
            UserSpec::Name(name) => {
                let body = name.strip_suffix('$').unwrap_or(name);
                let mut chars = body.chars();
                let valid_start = chars
                    .next()
                    .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
                let valid_rest =
                    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
                if valid_start && valid_rest {
                    Ok(())
                } else {
                    Err(format!("\"{}\" is not a valid username", name))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraMount {
    pub container_path: String,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerOptions {
    pub image: String,
    #[serde(default = "default_image_work_dir")]
    pub image_work_dir: String,
    /// `null` runs as the image's default user
    #[serde(default = "default_user")]
    pub user: Option<UserSpec>,
    #[serde(default)]
    pub skip_tool_check: bool,
    /// Absolute host path → where it appears in the container
    #[serde(default)]
    pub extra_mounts: BTreeMap<String, ExtraMount>,
    #[serde(default)]
    pub memory_swappiness: Option<i64>,
    #[serde(default)]
    pub resource_pinning: Option<ResourcePinning>,
    #[serde(default)]
    pub docker_stats_on_exit_shim: bool,
    #[serde(default)]
    pub stdout_and_stderr_bypass: bool,
}

impl ContainerOptions {
    pub fn validate(&self) -> Result<(), BackendError> {
        let invalid = |reason: String| BackendError::Options {
            backend: "container",
            reason,
        };

        if self.image.is_empty() {
            return Err(invalid("\"image\" must be a non empty string".to_string()));
        }
        if !Path::new(&self.image_work_dir).is_absolute() {
            return Err(invalid(format!(
                "\"image_work_dir\" ({}) must be an absolute path",
                self.image_work_dir
            )));
        }
        if let Some(user) = &self.user {
            user.validate().map_err(invalid)?;
        }
        for (host_path, mount) in &self.extra_mounts {
            if !Path::new(host_path).is_absolute() {
                return Err(invalid(format!("mount source \"{}\" must be absolute", host_path)));
            }
            if !Path::new(&mount.container_path).is_absolute() {
                return Err(invalid(format!(
                    "container mount point \"{}\" must be absolute",
                    mount.container_path
                )));
            }
            if mount.container_path.starts_with(&self.image_work_dir) {
                return Err(invalid(format!(
                    "container mount point \"{}\" cannot be based in \"{}\"",
                    mount.container_path, self.image_work_dir
                )));
            }
        }
        if let Some(swappiness) = self.memory_swappiness {
            if !(0..=100).contains(&swappiness) {
                return Err(invalid("\"memory_swappiness\" must be in [0, 100]".to_string()));
            }
        }
        Ok(())
    }
}

/// Host files exposed under `/tmp/<basename>` inside the container
#[derive(Debug, Clone, Default)]
struct FileMaps {
    maps: BTreeMap<PathBuf, (String, bool)>,
    used_names: BTreeSet<String>,
}

impl FileMaps {
    fn add(
        &mut self,
        host_path: &Path,
        read_only: bool,
        extra_mounts: &BTreeMap<String, ExtraMount>,
    ) -> Result<(), BackendError> {
        let mapping_error = |reason: &str| BackendError::Mapping {
            path: host_path.display().to_string(),
            reason: reason.to_string(),
        };

        if !host_path.is_absolute() {
            return Err(mapping_error("path must be absolute"));
        }
        if !host_path.exists() {
            return Err(mapping_error("file does not exist"));
        }
        let name = host_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| mapping_error("path has no file name"))?;
        if self.used_names.contains(&name) {
            return Err(mapping_error("mapping identically named files is not supported"));
        }
        let container_path = format!("{}/{}", MAPPED_FILE_DIR, name);
        if extra_mounts.values().any(|m| m.container_path == container_path) {
            return Err(mapping_error("target is already used by an extra mount"));
        }

        debug!(host = %host_path.display(), container = %container_path, read_only, "Adding file mapping");
        self.maps.insert(host_path.to_path_buf(), (container_path, read_only));
        self.used_names.insert(name);
        Ok(())
    }

    fn get(&self, host_path: &Path) -> Option<String> {
        self.maps.get(host_path).map(|(path, _)| path.clone())
    }
}

#[derive(Default)]
struct RunState {
    client: Option<ClientLease<Docker>>,
    cpus: Option<CpuLease>,
    container_id: Option<String>,
    logs: Option<(PathBuf, PathBuf)>,
    end: Option<Instant>,
    out_of_memory: Option<bool>,
    killed: bool,
}

pub struct ContainerBackend {
    params: BackendParams,
    options: ContainerOptions,
    pool: Arc<ContainerPool>,
    image_id: String,
    shim: Option<PathBuf>,
    files: FileMaps,
    state: Mutex<RunState>,
}

impl ContainerBackend {
    pub async fn new(
        params: BackendParams,
        options: &Map<String, Value>,
        ctx: Arc<SharedContext>,
    ) -> Result<Self, BackendError> {
        let options: ContainerOptions = decode_options("container", options)?;
        options.validate()?;

        let shim = if options.docker_stats_on_exit_shim {
            let shim = ctx.config().stats_shim_path.clone();
            info!(shim = %shim.display(), "Looking for stats shim");
            if !shim.exists() {
                return Err(BackendError::Config(ConfigError::NotFound {
                    what: "docker-stats-on-exit-shim",
                    path: shim.display().to_string(),
                }));
            }
            Some(shim)
        } else {
            None
        };

        let pool = ctx.get_or_create(CONTAINER_POOL, || {
            let timeout = ctx.config().docker_api_timeout();
            let version = ctx.config().docker_api_version()?;
            if let Some((major, minor)) = version {
                info!(api_version = %format!("{}.{}", major, minor), "Pinning Docker API version");
            }
            let pool = ContainerPool::new(
                CONTAINER_POOL,
                ctx.parallelism(),
                options.resource_pinning.clone(),
                ctx.topology(),
            )?
            .with_clients(move || Ok(connect(version)?.with_timeout(timeout)));
            Ok::<_, BackendError>(pool)
        })?;

        // The client is only needed for discovery; run() borrows its own
        let client = pool.acquire_client()?;
        let image_id = find_image(&client, &options.image).await;
        if let Err(e) = pool.release_client(client) {
            error!(error = %e, "Failed to return client after image discovery");
        }
        let image_id = image_id?;

        let mut files = FileMaps::default();
        // The benchmark itself occupies /tmp/<basename>
        if let Some(name) = params.host_program_path.file_name() {
            files.used_names.insert(name.to_string_lossy().into_owned());
        }

        Ok(Self {
            params,
            options,
            pool,
            image_id,
            shim,
            files,
            state: Mutex::new(RunState {
                out_of_memory: Some(false),
                ..Default::default()
            }),
        })
    }

    pub fn params(&self) -> &BackendParams {
        &self.params
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// Fixed mapped location of the benchmark inside the container
    pub fn program_path(&self) -> String {
        program_path_in_container(&self.params.host_program_path)
    }

    pub fn add_file_to_backend(&mut self, host_path: &Path, read_only: bool) -> Result<(), BackendError> {
        self.files.add(host_path, read_only, &self.options.extra_mounts)
    }

    pub fn file_path_in_backend(&self, host_path: &Path) -> Option<String> {
        self.files.get(host_path)
    }

    /// Run `ls <tool>` in a throwaway container
    pub async fn check_tool_exists(&self, tool: &Path) -> Result<(), BackendError> {
        if self.options.skip_tool_check {
            info!("Skipping tool check");
            return Ok(());
        }
        let client = self.pool.acquire_client()?;
        let exit_code = self.probe_tool(&client, tool).await;
        if let Err(e) = self.pool.release_client(client) {
            error!(error = %e, "Failed to return client after tool check");
        }
        match exit_code? {
            0 => Ok(()),
            code => {
                debug!(tool = %tool.display(), code, "Tool check failed");
                Err(BackendError::ToolMissing(tool.display().to_string()))
            }
        }
    }

    async fn probe_tool(&self, client: &Docker, tool: &Path) -> Result<i64, BackendError> {
        let name = format!("smtrun-check-{}", Uuid::new_v4());
        let config = ContainerConfig {
            image: Some(self.image_id.clone()),
            cmd: Some(vec!["ls".to_string(), tool.display().to_string()]),
            ..Default::default()
        };
        let created = client
            .create_container(Some(CreateContainerOptions { name: name.as_str(), platform: None }), config)
            .await?;
        debug!(container_id = %created.id, tool = %tool.display(), "Created tool check container");

        let outcome: Result<i64, BackendError> = async {
            client
                .start_container(&created.id, None::<StartContainerOptions<String>>)
                .await?;
            let mut wait = client.wait_container(&created.id, None::<WaitContainerOptions<String>>);
            match wait.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(BackendError::from(e)),
                None => Ok(-1),
            }
        }
        .await;

        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = client.remove_container(&created.id, Some(remove)).await {
            warn!(container_id = %created.id, error = %e, "Failed to remove tool check container");
        }
        outcome
    }

    pub async fn run(
        &self,
        cmd: &[String],
        stdout: &Path,
        stderr: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<BackendResult, BackendError> {
        let (client, container_id) = match self.launch(cmd, stdout, stderr, env).await {
            Ok(launched) => launched,
            Err(e) => {
                self.kill().await.log(&self.program_path());
                return Err(e);
            }
        };

        let start = Instant::now();
        let started = client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await;
        let (exit_code, out_of_time) = match started {
            Ok(()) => self.wait(&client, &container_id).await,
            Err(e) => start_failure(&container_id, &e),
        };
        self.kill().await.log(&self.program_path());

        let (end, out_of_memory) = {
            let state = self.state.lock().await;
            (state.end.unwrap_or_else(Instant::now), state.out_of_memory)
        };

        let (user_cpu_time, sys_cpu_time) = match &self.shim {
            Some(_) => {
                let stats = paths::exit_stats(&self.params.working_directory);
                match read_exit_stats(&stats).await {
                    Ok((user, sys)) => (Some(user), Some(sys)),
                    Err(e) => {
                        error!(stats = %stats.display(), error = %e, "Failed to retrieve stats");
                        (None, None)
                    }
                }
            }
            None => (None, None),
        };

        Ok(BackendResult {
            exit_code,
            run_time: end.saturating_duration_since(start),
            out_of_time,
            out_of_memory,
            user_cpu_time,
            sys_cpu_time,
        })
    }

    async fn launch(
        &self,
        cmd: &[String],
        stdout: &Path,
        stderr: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(ClientLease<Docker>, String), BackendError> {
        let (client, cpus) = {
            let mut state = self.state.lock().await;
            if state.killed {
                return Err(BackendError::Cancelled);
            }
            state.logs = Some((stdout.to_path_buf(), stderr.to_path_buf()));
            let client = self.pool.acquire_client()?;
            state.client = Some(client.clone());
            if self.options.resource_pinning.is_some() {
                let lease = self.pool.acquire_cpus()?;
                info!(cpus = %lease.cpu_list(), nodes = %lease.node_list(), "Using cpu pinning");
                state.cpus = Some(lease);
            }
            (client, state.cpus.clone())
        };

        let mut files = self.files.clone();
        let mut log_targets = None;
        if self.options.stdout_and_stderr_bypass {
            info!("Using stdout/stderr bypass");
            for path in [stdout, stderr] {
                tokio::fs::File::create(path)
                    .await
                    .map_err(|e| BackendError::io(format!("creating {}", path.display()), e))?;
                files.add(path, false, &self.options.extra_mounts)?;
            }
            log_targets = files.get(stdout).zip(files.get(stderr));
        }
        if let Some(shim) = &self.shim {
            files.add(shim, true, &self.options.extra_mounts)?;
        }

        let mut final_cmd = cmd.to_vec();
        if let Some(shim_in_container) = self.shim.as_deref().and_then(|s| files.get(s)) {
            let stats = Path::new(&self.options.image_work_dir).join(paths::EXIT_STATS);
            final_cmd = shim_command(&shim_in_container, &stats.display().to_string(), final_cmd);
        }
        if let Some((out, err)) = &log_targets {
            final_cmd = bypass_command(&final_cmd, out, err);
        }
        debug!(cmd = ?final_cmd, "Command line inside container");

        let binds = bind_specs(&self.params, &self.options, &files);
        debug!(binds = ?binds, "Declaring bindings");
        let host_config = host_config(&self.params, &self.options, binds, cpus.as_ref());
        if self.params.memory_limit > 0 {
            info!(memory_mib = self.params.memory_limit, "Setting memory limit");
        }

        let user = self.options.user.as_ref().map(UserSpec::resolve);
        if let Some(user) = &user {
            info!(user = %user, "Using user inside container");
        }

        let config = ContainerConfig {
            image: Some(self.image_id.clone()),
            cmd: Some(final_cmd),
            env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir: Some(self.options.image_work_dir.clone()),
            user,
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("smtrun-{}", Uuid::new_v4());
        let created = client
            .create_container(Some(CreateContainerOptions { name: name.as_str(), platform: None }), config)
            .await?;
        info!(container_id = %created.id, name = %name, "Created container");
        if !created.warnings.is_empty() {
            warn!(container_id = %created.id, warnings = ?created.warnings, "Warnings emitted when creating container");
        }

        {
            let mut state = self.state.lock().await;
            if state.killed {
                drop(state);
                // kill() landed before the container was registered
                let remove = RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                };
                if let Err(e) = client.remove_container(&created.id, Some(remove)).await {
                    warn!(container_id = %created.id, error = %e, "Failed to remove cancelled container");
                }
                return Err(BackendError::Cancelled);
            }
            state.container_id = Some(created.id.clone());
        }
        Ok((client, created.id))
    }

    /// Wait for exit; returns the exit code and the out-of-time flag
    async fn wait(&self, client: &Docker, container_id: &str) -> (Option<i32>, bool) {
        let deadline = (self.params.time_limit > 0).then(|| {
            info!(timeout_secs = self.params.time_limit, "Using timeout");
            Instant::now() + Duration::from_secs(self.params.time_limit)
        });

        loop {
            let next = async {
                let mut stream =
                    client.wait_container(container_id, None::<WaitContainerOptions<String>>);
                stream.next().await
            };
            let outcome = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, next).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            info!(container_id, "Timeout occurred");
                            return (None, true);
                        }
                    }
                }
                None => next.await,
            };

            match outcome {
                Some(Ok(response)) => return classify_status(response.status_code),
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                    return classify_status(code)
                }
                Some(Err(DockerError::RequestTimeoutError)) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        info!(container_id, "Timeout occurred");
                        return (None, true);
                    }
                    // The client's own request timeout, not the tool's limit
                    debug!(container_id, "Wait request timed out, re-issuing");
                }
                Some(Err(e)) => {
                    error!(container_id, error = %e, "Failed to wait on container");
                    return (None, false);
                }
                None => {
                    warn!(container_id, "Wait stream ended without a status");
                    return (None, false);
                }
            }
        }
    }

    pub async fn kill(&self) -> CleanupReport {
        let mut state = self.state.lock().await;
        state.killed = true;
        state.end.get_or_insert_with(Instant::now);

        let mut report = CleanupReport::new();
        let container = state.container_id.take().zip(state.client.clone());
        if let Some((id, client)) = container {
            info!(container_id = %id, "Stopping container");
            report.record("stop container", stop_container(&client, &id).await);

            let logs = state.logs.clone();
            if let Some((stdout, stderr)) = logs {
                let (stdout, stderr) = if self.options.stdout_and_stderr_bypass {
                    // The tool's output went to the files; keep whatever the
                    // wrapping shell printed next to them
                    (paths::internal_log(&stdout), paths::internal_log(&stderr))
                } else {
                    (stdout, stderr)
                };
                report.record("write stdout log", write_log(&client, &id, &stdout, true).await);
                report.record("write stderr log", write_log(&client, &id, &stderr, false).await);
            }

            match read_oom_killed(&client, &id).await {
                Ok(oom) => {
                    state.out_of_memory = Some(oom);
                    report.record::<String>("read oom state", Ok(()));
                }
                Err(e) => {
                    state.out_of_memory = None;
                    report.record("read oom state", Err(e));
                }
            }

            info!(container_id = %id, "Destroying container");
            let remove = RemoveContainerOptions {
                v: true,
                force: true,
                ..Default::default()
            };
            report.record(
                "remove container",
                client.remove_container(&id, Some(remove)).await,
            );
        }

        if let Some(client) = state.client.take() {
            report.record("release client", self.pool.release_client(client));
        }
        if let Some(cpus) = state.cpus.take() {
            report.record("release cpus", self.pool.release_cpus(&cpus));
        }
        report
    }
}

/// Local daemon client, honouring `DOCKER_HOST` like the client defaults do
fn connect(version: Option<(usize, usize)>) -> Result<Docker, DockerError> {
    let Some((major_version, minor_version)) = version else {
        return Docker::connect_with_local_defaults();
    };
    let host = std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_DOCKER_HOST.to_string());
    let version = ClientVersion {
        major_version,
        minor_version,
    };
    Docker::connect_with_local(&host, DOCKER_CONNECT_TIMEOUT_SECS, &version)
}

fn program_path_in_container(host_program_path: &Path) -> String {
    let name = host_program_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{}", MAPPED_FILE_DIR, name)
}

async fn find_image(client: &Docker, image: &str) -> Result<String, BackendError> {
    client
        .ping()
        .await
        .map_err(|e| BackendError::DaemonUnreachable(e.to_string()))?;

    let images = client
        .list_images(Some(ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        }))
        .await?;
    let matches: Vec<String> = images
        .into_iter()
        .filter(|i| i.repo_tags.iter().any(|tag| tag == image))
        .map(|i| i.id)
        .collect();

    match matches.as_slice() {
        [] => Err(BackendError::ImageNotFound(image.to_string())),
        [id] => {
            debug!(image, id = %id, "Found docker image");
            Ok(id.clone())
        }
        _ => Err(BackendError::ImageAmbiguous {
            image: image.to_string(),
            matches,
        }),
    }
}

async fn stop_container(client: &Docker, id: &str) -> Result<(), BackendError> {
    let inspected = client
        .inspect_container(id, None::<InspectContainerOptions>)
        .await?;
    let running = inspected.state.and_then(|s| s.running).unwrap_or(false);
    if running {
        client
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
    }
    Ok(())
}

async fn write_log(client: &Docker, id: &str, path: &Path, stdout: bool) -> Result<(), BackendError> {
    let options = LogsOptions::<String> {
        stdout,
        stderr: !stdout,
        timestamps: false,
        tail: "all".to_string(),
        ..Default::default()
    };
    let mut stream = client.logs(id, Some(options));
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?.into_bytes());
    }
    info!(path = %path.display(), bytes = data.len(), "Writing {} log", if stdout { "stdout" } else { "stderr" });
    tokio::fs::write(path, data)
        .await
        .map_err(|e| BackendError::io(format!("writing {}", path.display()), e))
}

async fn read_oom_killed(client: &Docker, id: &str) -> Result<bool, BackendError> {
    let inspected = client
        .inspect_container(id, None::<InspectContainerOptions>)
        .await?;
    inspected
        .state
        .and_then(|s| s.oom_killed)
        .ok_or_else(|| BackendError::io("reading oom state", std::io::Error::other("state missing")))
}

/// A container that never started still gets a result, with no exit code
fn start_failure(container_id: &str, e: &DockerError) -> (Option<i32>, bool) {
    error!(container_id, error = %e, "Failed to start container");
    (None, false)
}

fn classify_status(code: i64) -> (Option<i32>, bool) {
    if code < 0 {
        (None, true)
    } else {
        (Some(code as i32), false)
    }
}

/// `host:container:mode` bind strings; mandatory mounts come last so they win
fn bind_specs(params: &BackendParams, options: &ContainerOptions, files: &FileMaps) -> Vec<String> {
    let mode = |read_only: bool| if read_only { "ro" } else { "rw" };
    let mut binds = Vec::new();
    for (host, (container, read_only)) in &files.maps {
        binds.push(format!("{}:{}:{}", host.display(), container, mode(*read_only)));
    }
    for (host, mount) in &options.extra_mounts {
        binds.push(format!("{}:{}:{}", host, mount.container_path, mode(mount.read_only)));
    }
    binds.push(format!(
        "{}:{}:rw",
        params.working_directory.display(),
        options.image_work_dir
    ));
    binds.push(format!(
        "{}:{}:ro",
        params.host_program_path.display(),
        program_path_in_container(&params.host_program_path)
    ));
    binds
}

fn host_config(
    params: &BackendParams,
    options: &ContainerOptions,
    binds: Vec<String>,
    cpus: Option<&CpuLease>,
) -> HostConfig {
    let clamp = |bytes: u64| i64::try_from(bytes).unwrap_or(i64::MAX);

    let ulimits = params.stack_limit_bytes().map(|bytes| {
        info!(stack_bytes = bytes, "Setting stack size limit");
        vec![ResourcesUlimits {
            name: Some("stack".to_string()),
            soft: Some(clamp(bytes)),
            hard: Some(clamp(bytes)),
        }]
    });
    let memory = params.memory_limit_bytes().map(clamp);

    let nearest = options
        .resource_pinning
        .as_ref()
        .is_some_and(|p| p.use_memset_of_nearest_node);
    let cpuset_mems = cpus
        .filter(|_| nearest)
        .and_then(|lease| lease.slots().first().map(|(_, node)| node.to_string()));

    HostConfig {
        binds: Some(binds),
        memory,
        memory_swap: memory,
        memory_swappiness: options.memory_swappiness,
        ulimits,
        cpuset_cpus: cpus.map(CpuLease::cpu_list),
        cpuset_mems,
        privileged: Some(false),
        ..Default::default()
    }
}

fn shim_command(shim: &str, stats: &str, cmd: Vec<String>) -> Vec<String> {
    let mut wrapped = vec![shim.to_string(), stats.to_string()];
    wrapped.extend(cmd);
    wrapped
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Redirect through a shell so output lands in files, not the daemon's log
fn bypass_command(cmd: &[String], stdout: &str, stderr: &str) -> Vec<String> {
    let mut script: String = cmd.iter().map(|arg| format!(" {}", shell_quote(arg))).collect();
    script.push_str(&format!(" >> {} 2>> {}", shell_quote(stdout), shell_quote(stderr)));
    vec![SHELL.to_string(), "-c".to_string(), script]
}

fn parse_exit_stats(raw: &str) -> Result<(f64, f64), String> {
    let stats: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let field = |name: &str| {
        stats
            .pointer(&format!("/cgroups/cpu_stats/cpu_usage/{}", name))
            .and_then(Value::as_f64)
            .map(|ns| ns / 1e9)
            .ok_or_else(|| format!("missing \"{}\"", name))
    };
    Ok((field("usage_in_usermode")?, field("usage_in_kernelmode")?))
}

async fn read_exit_stats(path: &Path) -> Result<(f64, f64), String> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| e.to_string())?;
    parse_exit_stats(&raw)
}
