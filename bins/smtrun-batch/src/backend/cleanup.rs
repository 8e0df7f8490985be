use std::fmt;
use tracing::{debug, warn};

/// One step of a `kill()` sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStep {
    pub name: &'static str,
    pub error: Option<String>,
}

/// Ordered record of a cleanup sequence
///
/// Every step runs regardless of earlier failures; failures are collected
/// here and reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    steps: Vec<CleanupStep>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<E: fmt::Display>(&mut self, name: &'static str, result: Result<(), E>) {
        let error = result.err().map(|e| e.to_string());
        self.steps.push(CleanupStep { name, error });
    }

    pub fn steps(&self) -> &[CleanupStep] {
        &self.steps
    }

    pub fn failures(&self) -> impl Iterator<Item = &CleanupStep> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Emit one log line covering every failed step
    pub fn log(&self, job: &str) {
        if self.is_clean() {
            debug!(job, steps = self.steps.len(), "Cleanup complete");
        } else {
            warn!(job, failures = %self, "Cleanup finished with failures");
        }
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<String> = self
            .failures()
            .map(|s| format!("{}: {}", s.name, s.error.as_deref().unwrap_or_default()))
            .collect();
        if failures.is_empty() {
            write!(f, "ok")
        } else {
            write!(f, "{}", failures.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_are_collected_in_order() {
        let mut report = CleanupReport::new();
        report.record("stop container", Err("no such container"));
        report.record::<String>("write logs", Ok(()));
        report.record("release client", Err("double release"));

        assert_eq!(report.steps().len(), 3);
        assert!(!report.is_clean());
        let failed: Vec<_> = report.failures().map(|s| s.name).collect();
        assert_eq!(failed, vec!["stop container", "release client"]);
        assert_eq!(
            report.to_string(),
            "stop container: no such container; release client: double release"
        );
    }

    #[test]
    fn test_empty_report_is_clean() {
        let report = CleanupReport::new();
        assert!(report.is_clean());
        assert_eq!(report.to_string(), "ok");
    }
}
