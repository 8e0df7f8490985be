/// Execution Backends - Run One Command Under Constraints
///
/// **Core Responsibility:**
/// Launch a single command with wall-time, memory, stack and CPU limits,
/// and report a uniform `BackendResult`.
///
/// **Contract shared by every substrate:**
/// - Operational failures (timeout, crash, memory ceiling, daemon read
///   timeout) are encoded in the result, never returned as errors
/// - Errors are reserved for configuration and environment problems
/// - `kill()` is idempotent, safe after a normal run, and returns every
///   borrowed pool resource
///
/// Substrates form a closed set selected by configuration.

pub mod cleanup;
mod container;
mod monitor;
mod native;
mod process;

pub use cleanup::CleanupReport;
pub use container::{ContainerBackend, ContainerOptions, ExtraMount, UserSpec};
pub use native::{NativeBackend, NativeOptions};

use crate::context::{ContextError, SharedContext};
use crate::pool::PoolError;
use serde_json::{Map, Value};
use smtrun_common::{BackendKind, BackendResult, ConfigError, StackLimit};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid {backend} backend option: {reason}")]
    Options { backend: &'static str, reason: String },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("docker request failed: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot map \"{path}\" into the container: {reason}")]
    Mapping { path: String, reason: String },

    #[error("tool \"{0}\" does not exist in the backend")]
    ToolMissing(String),

    #[error("no image matches \"{0}\"")]
    ImageNotFound(String),

    #[error("image \"{image}\" is ambiguous, matches: {matches:?}")]
    ImageAmbiguous { image: String, matches: Vec<String> },

    #[error("docker daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("failed to launch \"{program}\": {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("job was killed before it started")]
    Cancelled,
}

impl BackendError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        BackendError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Per-job parameters every substrate receives
#[derive(Debug, Clone, PartialEq)]
pub struct BackendParams {
    /// Benchmark file on the host
    pub host_program_path: PathBuf,
    pub working_directory: PathBuf,
    /// Seconds, 0 = unlimited
    pub time_limit: u64,
    /// MiB, 0 = unlimited
    pub memory_limit: u64,
    pub stack_limit: Option<StackLimit>,
}

impl BackendParams {
    /// Stack limit in bytes, shared policy of both substrates
    pub fn stack_limit_bytes(&self) -> Option<u64> {
        self.stack_limit
            .map(|limit| limit.to_bytes(self.memory_limit, process::host_memory_bytes))
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        (self.memory_limit > 0).then(|| self.memory_limit.saturating_mul(1 << 20))
    }
}

/// Decode a backend's opaque `config` map into its typed options
fn decode_options<T: serde::de::DeserializeOwned>(
    backend: &'static str,
    options: &Map<String, Value>,
) -> Result<T, BackendError> {
    serde_json::from_value(Value::Object(options.clone())).map_err(|e| BackendError::Options {
        backend,
        reason: e.to_string(),
    })
}

pub enum Backend {
    Native(NativeBackend),
    Container(ContainerBackend),
}

impl Backend {
    pub async fn create(
        kind: BackendKind,
        options: &Map<String, Value>,
        params: BackendParams,
        ctx: Arc<SharedContext>,
    ) -> Result<Self, BackendError> {
        match kind {
            BackendKind::Native => Ok(Backend::Native(NativeBackend::new(params, options, &ctx)?)),
            BackendKind::Container => Ok(Backend::Container(
                ContainerBackend::new(params, options, ctx).await?,
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Native(_) => "native",
            Backend::Container(_) => "container",
        }
    }

    pub fn params(&self) -> &BackendParams {
        match self {
            Backend::Native(b) => b.params(),
            Backend::Container(b) => b.params(),
        }
    }

    pub async fn check_tool_exists(&self, tool: &Path) -> Result<(), BackendError> {
        match self {
            Backend::Native(b) => b.check_tool_exists(tool),
            Backend::Container(b) => b.check_tool_exists(tool).await,
        }
    }

    /// Path of the benchmark as seen from inside the substrate
    pub fn program_path(&self) -> String {
        match self {
            Backend::Native(b) => b.program_path(),
            Backend::Container(b) => b.program_path(),
        }
    }

    pub fn add_file_to_backend(&mut self, host_path: &Path, read_only: bool) -> Result<(), BackendError> {
        match self {
            Backend::Native(_) => Ok(()),
            Backend::Container(b) => b.add_file_to_backend(host_path, read_only),
        }
    }

    pub fn file_path_in_backend(&self, host_path: &Path) -> Option<String> {
        match self {
            Backend::Native(b) => Some(b.file_path_in_backend(host_path)),
            Backend::Container(b) => b.file_path_in_backend(host_path),
        }
    }

    pub async fn run(
        &self,
        cmd: &[String],
        stdout: &Path,
        stderr: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<BackendResult, BackendError> {
        match self {
            Backend::Native(b) => b.run(cmd, stdout, stderr, env).await,
            Backend::Container(b) => b.run(cmd, stdout, stderr, env).await,
        }
    }

    pub async fn kill(&self) -> CleanupReport {
        match self {
            Backend::Native(b) => b.kill().await,
            Backend::Container(b) => b.kill().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(memory_limit: u64, stack_limit: Option<StackLimit>) -> BackendParams {
        BackendParams {
            host_program_path: PathBuf::from("/bench/a.smt2"),
            working_directory: PathBuf::from("/runs/workdir-0"),
            time_limit: 0,
            memory_limit,
            stack_limit,
        }
    }

    #[test]
    fn test_stack_limit_policy() {
        assert_eq!(params(0, None).stack_limit_bytes(), None);
        assert_eq!(params(0, Some(StackLimit::KiB(8192))).stack_limit_bytes(), Some(8 << 20));
        assert_eq!(params(64, Some(StackLimit::Unlimited)).stack_limit_bytes(), Some(64 << 20));
        let host = params(0, Some(StackLimit::Unlimited)).stack_limit_bytes().unwrap();
        assert!(host > 0);
    }

    #[test]
    fn test_memory_limit_bytes() {
        assert_eq!(params(0, None).memory_limit_bytes(), None);
        assert_eq!(params(10, None).memory_limit_bytes(), Some(10 << 20));
    }
}
