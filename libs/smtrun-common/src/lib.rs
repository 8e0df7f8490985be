pub mod config;
pub mod job;
pub mod paths;
pub mod solver;
pub mod types;

// Re-export commonly used types for convenience
pub use config::Config;
pub use job::{
    BackendKind, BackendSelection, BatchConfig, ConfigError, JobSpec, ResourcePinning, RunnerConfig,
    StackLimit,
};
pub use solver::Solver;
pub use types::{
    BackendResult, ErrorRecord, InvocationInfo, InvocationInfos, JobOutcome, ResultInfos, ResultRecord,
};
