//! Bounded execution of the target's test suite.
//!
//! This module provides:
//! - The per-run record (`TestResult`) and its classification (`TestStatus`)
//! - The per-individual rollup (`TestingSummary`)
//! - `SuiteRunner`, the seam between the search and a real test process
//! - `TestHarness`, which repeats runs and calibrates the run timeout

pub mod classify;
pub mod process;
pub mod summary;

pub use process::ProcessRunner;
pub use summary::TestingSummary;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Smallest per-run timeout a calibration may produce.
const MIN_CALIBRATED_TIMEOUT_MS: u64 = 1_000;

/// Classification of a single test suite run
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Every test passed
    Success,
    /// Run completed but no test was counted as passing
    Failed,
    /// Some tests failed
    DataRace,
    /// Nothing completed, or the runtime reported a deadlock
    Deadlock,
    /// Run exceeded its time limit during exploratory runs
    Timeout,
    /// Run could not be launched at all
    Invalid,
    /// Output could not be interpreted
    #[default]
    Unknown,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::DataRace => write!(f, "data_race"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Timeout => write!(f, "timeout"),
            Self::Invalid => write!(f, "invalid"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Why the suite is being run. Decides how a timed out run is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Fitness scoring. A timed out run counts as a deadlock.
    Scoring,
    /// Profiling and calibration. A timed out run counts as a timeout.
    Exploratory,
}

/// Record of one execution of the test suite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    /// Value of `Tests run: N`
    pub tests: u32,
    /// Value of `Failures: M`
    pub failures: u32,
    /// Value of `OK (K tests)`
    pub successes: u32,
    pub status: TestStatus,
    /// Wall-clock time of the test process
    pub duration_ms: u64,
    /// Command line that was launched
    pub command: String,
    pub exit_code: Option<i32>,
    /// Names of failing tests, in report order
    pub failed_tests: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Notes, warnings and errors gathered while running and classifying
    pub notes: Vec<String>,
}

impl TestResult {
    /// A run that never produced a process.
    pub fn invalid(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Invalid,
            command: command.into(),
            notes: vec![reason.into()],
            ..Default::default()
        }
    }

    /// Tests this run actually executed. A passing JUnit run only prints
    /// `OK (n tests)`, so the success count stands in for a missing total.
    pub fn executed_tests(&self) -> u32 {
        self.tests.max(self.successes)
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Success
    }
}

/// Runs the target's test suite exactly once.
#[async_trait]
pub trait SuiteRunner: Send + Sync {
    /// Launch the suite in `project_dir`, bounded by `timeout`.
    ///
    /// Launch problems are reported as an `Invalid` result, never as an error.
    async fn run_once(&self, project_dir: &Path, mode: RunMode, timeout: Duration) -> TestResult;
}

/// Errors that stop the harness from being set up
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Could not calibrate the run timeout: no runs were executed")]
    NoCalibrationRuns,

    #[error("Could not calibrate the run timeout: all {0} runs were invalid ({1})")]
    AllRunsInvalid(usize, String),
}

/// Repeats suite runs for one individual under a fixed per-run timeout.
#[derive(Clone)]
pub struct TestHarness {
    runner: Arc<dyn SuiteRunner>,
    timeout: Duration,
}

impl TestHarness {
    pub fn new(runner: Arc<dyn SuiteRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the suite `runs` times in `project_dir` and summarize.
    ///
    /// An `Invalid` first run ends the batch early.
    pub async fn execute(&self, project_dir: &Path, runs: usize, mode: RunMode) -> TestingSummary {
        let mut results = Vec::with_capacity(runs);

        for run in 0..runs {
            let result = self.runner.run_once(project_dir, mode, self.timeout).await;
            tracing::debug!(
                "Run {}/{}: {} ({} tests, {} failures, {} successes, {}ms)",
                run + 1,
                runs,
                result.status,
                result.tests,
                result.failures,
                result.successes,
                result.duration_ms
            );

            let stop = run == 0 && result.status == TestStatus::Invalid;
            results.push(result);
            if stop {
                tracing::warn!("First run was invalid, skipping the remaining {} runs", runs - 1);
                break;
            }
        }

        TestingSummary::new(results)
    }

    /// Derive a per-run timeout from the unmodified program.
    ///
    /// Runs the suite `runs` times in exploratory mode under `ceiling`, then
    /// multiplies the average wall time by `multiplier`.
    pub async fn calibrate(
        runner: Arc<dyn SuiteRunner>,
        project_dir: &Path,
        runs: usize,
        ceiling: Duration,
        multiplier: f64,
    ) -> Result<(Duration, TestingSummary), HarnessError> {
        let calibration = Self::new(runner, ceiling);
        let summary = calibration.execute(project_dir, runs, RunMode::Exploratory).await;

        if summary.run_count() == 0 {
            return Err(HarnessError::NoCalibrationRuns);
        }
        if summary.count(TestStatus::Invalid) == summary.run_count() {
            let reason = summary
                .results()
                .first()
                .and_then(|r| r.notes.first().cloned())
                .unwrap_or_else(|| "no details".to_string());
            return Err(HarnessError::AllRunsInvalid(summary.run_count(), reason));
        }

        let average_ms = summary.average_duration_ms();
        let timeout_ms = ((average_ms as f64) * multiplier) as u64;
        let timeout_ms = timeout_ms.max(MIN_CALIBRATED_TIMEOUT_MS);
        tracing::info!(
            "Average execution time over {} runs: {}ms, run timeout set to {}ms",
            summary.run_count(),
            average_ms,
            timeout_ms
        );

        Ok((Duration::from_millis(timeout_ms), summary))
    }
}
