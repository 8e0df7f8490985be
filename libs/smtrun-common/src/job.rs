use crate::types::InvocationInfo;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
/// Fatal for the job being constructed, never for the whole batch
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("\"{key}\" is invalid: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("\"{key}\" ({path}) must be an absolute path")]
    NotAbsolute { key: &'static str, path: String },

    #[error("{what} \"{path}\" does not exist")]
    NotFound { what: &'static str, path: String },

    #[error("unknown backend \"{0}\"")]
    UnknownBackend(String),

    #[error("number of cpus required ({required}) exceeds number of available CPUs ({available})")]
    InsufficientCpus { required: usize, available: usize },

    #[error("failed to decode {section}: {source}")]
    Decode {
        section: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Stack size limit for the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackLimit {
    /// As large as the memory ceiling (or host memory) allows
    Unlimited,
    KiB(u64),
}

impl StackLimit {
    /// Resolve to bytes given the job's memory ceiling
    ///
    /// `host_memory_bytes` is only consulted for `Unlimited` without a
    /// memory ceiling.
    pub fn to_bytes(self, max_memory_mib: u64, host_memory_bytes: impl FnOnce() -> u64) -> u64 {
        match self {
            StackLimit::KiB(kib) => kib.saturating_mul(1024),
            StackLimit::Unlimited if max_memory_mib > 0 => max_memory_mib.saturating_mul(1 << 20),
            StackLimit::Unlimited => host_memory_bytes(),
        }
    }
}

impl Serialize for StackLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StackLimit::Unlimited => serializer.serialize_str("unlimited"),
            StackLimit::KiB(kib) => serializer.serialize_u64(*kib),
        }
    }
}

impl<'de> Deserialize<'de> for StackLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StackLimitVisitor;

        impl<'de> Visitor<'de> for StackLimitVisitor {
            type Value = StackLimit;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a positive integer (KiB) or \"unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<StackLimit, E> {
                if v == 0 {
                    return Err(E::custom("\"stack_size\" must be greater than 0"));
                }
                Ok(StackLimit::KiB(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<StackLimit, E> {
                if v <= 0 {
                    return Err(E::custom("\"stack_size\" must be greater than 0"));
                }
                Ok(StackLimit::KiB(v as u64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<StackLimit, E> {
                if v == "unlimited" {
                    Ok(StackLimit::Unlimited)
                } else {
                    Err(E::custom("if \"stack_size\" is a string it must be \"unlimited\""))
                }
            }
        }

        deserializer.deserialize_any(StackLimitVisitor)
    }
}

/// CPU pinning request shared by both execution substrates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcePinning {
    pub cpu_ids: BTreeSet<u32>,
    pub cpus_per_job: usize,
    #[serde(default)]
    pub use_memset_of_nearest_node: bool,
}

impl ResourcePinning {
    /// Check `parallelism × cpus_per_job ≤ |cpu_ids|`
    pub fn validate(&self, parallelism: usize) -> Result<(), ConfigError> {
        if self.cpu_ids.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "cpu_ids",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cpus_per_job < 1 {
            return Err(ConfigError::InvalidValue {
                key: "cpus_per_job",
                reason: "must be >= 1".to_string(),
            });
        }
        let required = parallelism.saturating_mul(self.cpus_per_job);
        if required > self.cpu_ids.len() {
            return Err(ConfigError::InsufficientCpus {
                required,
                available: self.cpu_ids.len(),
            });
        }
        Ok(())
    }
}

/// Execution substrate selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Native,
    Container,
}

impl BackendKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "native" | "PythonPsUtil" => Ok(BackendKind::Native),
            "container" | "docker" | "Docker" => Ok(BackendKind::Container),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Container => write!(f, "container"),
        }
    }
}

/// `backend` section: a name plus an opaque map only that backend reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSelection {
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Per-batch runner configuration (`runner_config`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub tool_path: String,
    #[serde(default)]
    pub max_memory: i64,
    #[serde(default)]
    pub max_time: i64,
    #[serde(default)]
    pub stack_size: Option<StackLimit>,
    #[serde(default)]
    pub additional_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub backend: Option<BackendSelection>,
}

impl RunnerConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|source| ConfigError::Decode {
            section: "runner_config",
            source,
        })
    }
}

/// Top-level batch configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub runner: String,
    pub runner_config: RunnerConfig,
}

impl BatchConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|source| ConfigError::Decode {
            section: "config",
            source,
        })
    }
}

/// Everything needed to execute one benchmark invocation
///
/// Built once per job from the batch-wide `RunnerConfig` plus the
/// invocation record; immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    /// Benchmark path as given in the invocation (relative to the base)
    pub benchmark: String,
    pub benchmark_path: PathBuf,
    pub tool_path: PathBuf,
    pub additional_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// 0 = unlimited
    pub max_time_secs: u64,
    /// 0 = unlimited
    pub max_memory_mib: u64,
    pub stack_limit: Option<StackLimit>,
    pub backend: BackendKind,
    pub backend_config: Map<String, Value>,
}

impl JobSpec {
    pub fn build(
        benchmark_base: &Path,
        invocation: &InvocationInfo,
        rc: &RunnerConfig,
    ) -> Result<Self, ConfigError> {
        let tool_path = expand_home(&rc.tool_path);
        if !tool_path.is_absolute() {
            return Err(ConfigError::NotAbsolute {
                key: "tool_path",
                path: rc.tool_path.clone(),
            });
        }

        let benchmark_path = benchmark_base.join(&invocation.benchmark);
        if !benchmark_path.is_absolute() {
            return Err(ConfigError::NotAbsolute {
                key: "benchmark",
                path: benchmark_path.display().to_string(),
            });
        }
        if !benchmark_path.exists() {
            return Err(ConfigError::NotFound {
                what: "benchmark",
                path: benchmark_path.display().to_string(),
            });
        }

        if rc.max_memory < 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_memory",
                reason: "must be >= 0".to_string(),
            });
        }
        if rc.max_time < 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_time",
                reason: "must be >= 0".to_string(),
            });
        }

        let (backend, backend_config) = match &rc.backend {
            Some(selection) => (
                BackendKind::from_name(&selection.name)?,
                selection.config.clone(),
            ),
            None => (BackendKind::Native, Map::new()),
        };

        Ok(Self {
            benchmark: invocation.benchmark.clone(),
            benchmark_path,
            tool_path,
            additional_args: rc.additional_args.clone(),
            env: rc.env.clone(),
            max_time_secs: rc.max_time as u64,
            max_memory_mib: rc.max_memory as u64,
            stack_limit: rc.stack_size,
            backend,
            backend_config,
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}
