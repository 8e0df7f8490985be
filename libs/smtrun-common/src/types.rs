use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// One entry of the invocation list (Immutable Input)
/// Only `benchmark` is interpreted; every other field is carried
/// through untouched into the record produced for this invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationInfo {
    pub benchmark: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InvocationInfo {
    pub fn new(benchmark: impl Into<String>) -> Self {
        Self {
            benchmark: benchmark.into(),
            extra: Map::new(),
        }
    }
}

/// Invocation document handed to the batch driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationInfos {
    pub results: Vec<InvocationInfo>,
    #[serde(default)]
    pub misc: Map<String, Value>,
}

/// Outcome of a single `run()` on an execution backend
///
/// Operational failures (timeout, crash, memory ceiling) are encoded here
/// rather than raised. Created once per run, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResult {
    /// `None` when no status was collected (timeout, failed start); a
    /// native tool killed by a signal reports the negated signal number
    pub exit_code: Option<i32>,
    pub run_time: Duration,
    pub out_of_time: bool,
    /// `None` when the substrate could not determine it
    pub out_of_memory: Option<bool>,
    pub user_cpu_time: Option<f64>,
    pub sys_cpu_time: Option<f64>,
}

/// Per-job record handed to the serialization layer
/// Paths are relative to the shared working-directories root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Position of the invocation in the input list
    pub job_index: usize,
    #[serde(flatten)]
    pub invocation: InvocationInfo,
    pub wallclock_time: f64,
    pub working_directory: String,
    pub exit_code: Option<i32>,
    pub out_of_memory: Option<bool>,
    pub stdout_log_file: String,
    pub stderr_log_file: String,
    pub user_cpu_time: Option<f64>,
    pub sys_cpu_time: Option<f64>,
    pub backend_timeout: bool,
}

/// Record emitted in place of a `ResultRecord` when a job could not be
/// constructed, raised during `run()`, or was cancelled before starting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub job_index: usize,
    #[serde(flatten)]
    pub invocation: InvocationInfo,
    pub working_directory: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutcome {
    Completed(ResultRecord),
    Failed(ErrorRecord),
}

impl JobOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }

    pub fn job_index(&self) -> usize {
        match self {
            JobOutcome::Completed(record) => record.job_index,
            JobOutcome::Failed(record) => record.job_index,
        }
    }

    pub fn benchmark(&self) -> &str {
        match self {
            JobOutcome::Completed(record) => &record.invocation.benchmark,
            JobOutcome::Failed(record) => &record.invocation.benchmark,
        }
    }
}

/// Output document written by the batch driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultInfos {
    pub results: Vec<JobOutcome>,
    #[serde(default)]
    pub misc: Map<String, Value>,
}
