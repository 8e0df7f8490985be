use std::path::{Path, PathBuf};

/// On-disk naming - defines only naming, not any I/O
/// Keeps the driver, the jobs and downstream tooling agreeing on where
/// every artefact of a run lives

pub const WORKDIR_PREFIX: &str = "workdir";
pub const STDOUT_LOG: &str = "stdout.log.txt";
pub const STDERR_LOG: &str = "stderr.log.txt";
pub const EXIT_STATS: &str = "exit_stats.json";
/// Suffix for the container's own output when stdout/stderr bypass is on
pub const INTERNAL_LOG_SUFFIX: &str = ".internal.txt";

/// Deterministic working-directory name for the job at `index`
pub fn workdir_name(index: usize) -> String {
    format!("{}-{}", WORKDIR_PREFIX, index)
}

pub fn stdout_log(working_directory: &Path) -> PathBuf {
    working_directory.join(STDOUT_LOG)
}

pub fn stderr_log(working_directory: &Path) -> PathBuf {
    working_directory.join(STDERR_LOG)
}

pub fn exit_stats(working_directory: &Path) -> PathBuf {
    working_directory.join(EXIT_STATS)
}

/// Side file receiving whatever the wrapping shell itself printed
pub fn internal_log(log: &Path) -> PathBuf {
    let mut name = log.as_os_str().to_owned();
    name.push(INTERNAL_LOG_SUFFIX);
    PathBuf::from(name)
}

/// Express `path` relative to the shared output root
/// Returns `None` when `path` does not live under `root`
pub fn relative_to_root(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().into_owned())
}
