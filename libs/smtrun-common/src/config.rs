use crate::job::ConfigError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub docker_api_timeout_secs: u64,
    /// Helper binary prepended to container commands for CPU accounting
    pub stats_shim_path: PathBuf,
    /// Pause between terminate and kill when the memory ceiling is hit
    pub oom_grace_ms: u64,
    pub memory_poll_ms: u64,
    /// `major.minor` Docker API version to pin; unset lets the client pick
    pub docker_api_version: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            docker_api_timeout_secs: env::var("SMTRUN_DOCKER_API_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            stats_shim_path: env::var("SMTRUN_STATS_SHIM")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_stats_shim_path()),
            oom_grace_ms: env::var("SMTRUN_OOM_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            memory_poll_ms: env::var("SMTRUN_MEMORY_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(500),
            docker_api_version: env::var("SMTRUN_DOCKER_API_VERSION")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    pub fn docker_api_timeout(&self) -> Duration {
        Duration::from_secs(self.docker_api_timeout_secs)
    }

    pub fn oom_grace(&self) -> Duration {
        Duration::from_millis(self.oom_grace_ms)
    }

    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.memory_poll_ms)
    }

    /// Pinned API version as `(major, minor)`, `Ok(None)` when unset
    pub fn docker_api_version(&self) -> Result<Option<(usize, usize)>, ConfigError> {
        let Some(raw) = &self.docker_api_version else {
            return Ok(None);
        };
        let invalid = || ConfigError::InvalidValue {
            key: "SMTRUN_DOCKER_API_VERSION",
            reason: format!("\"{}\" is not of the form major.minor", raw),
        };
        let (major, minor) = raw.trim().split_once('.').ok_or_else(invalid)?;
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.parse().map_err(|_| invalid())?;
        Ok(Some((major, minor)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// `<dir of current exe>/external_deps/docker-stats-on-exit-shim`
fn default_stats_shim_path() -> PathBuf {
    let base = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("external_deps").join("docker-stats-on-exit-shim")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.docker_api_timeout_secs, 120);
        assert_eq!(config.oom_grace_ms, 1000);
        assert_eq!(config.memory_poll_ms, 500);
        assert!(config.stats_shim_path.ends_with("external_deps/docker-stats-on-exit-shim"));
    }

    #[test]
    fn test_durations() {
        let config = Config {
            docker_api_timeout_secs: 5,
            stats_shim_path: PathBuf::from("/shim"),
            oom_grace_ms: 250,
            memory_poll_ms: 100,
            docker_api_version: None,
        };
        assert_eq!(config.docker_api_timeout(), Duration::from_secs(5));
        assert_eq!(config.oom_grace(), Duration::from_millis(250));
        assert_eq!(config.memory_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_docker_api_version() {
        let mut config = Config::default();
        config.docker_api_version = None;
        assert_eq!(config.docker_api_version().unwrap(), None);

        config.docker_api_version = Some("1.26".to_string());
        assert_eq!(config.docker_api_version().unwrap(), Some((1, 26)));

        for bad in ["1", "v1.26", "1.x", "1.26.0"] {
            config.docker_api_version = Some(bad.to_string());
            assert!(
                matches!(config.docker_api_version(), Err(ConfigError::InvalidValue { .. })),
                "accepted {}",
                bad
            );
        }
    }
}
