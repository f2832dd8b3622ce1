//! Extended re-testing of individuals that look like fixes.

use crate::events::EventLog;
use crate::harness::{RunMode, TestHarness};
use crate::population::Individual;
use std::path::Path;

/// Accepts a fix only after a much larger batch of runs all succeed.
#[derive(Clone)]
pub struct FixValidator {
    harness: TestHarness,
    runs: usize,
}

impl FixValidator {
    pub fn new(harness: TestHarness, runs: usize) -> Self {
        Self { harness, runs }
    }

    /// Re-test `individual`, already installed in `project_dir`.
    ///
    /// The baseline summary must be all successes over at least one run.
    /// The validation batch must then contain exactly `runs` runs, every one
    /// a success. The batch is recorded on the individual either way.
    pub async fn is_final_solution(
        &self,
        individual: &mut Individual,
        project_dir: &Path,
        events: &mut EventLog,
    ) -> bool {
        if !individual.is_final_candidate() {
            return false;
        }

        events.debug(format!(
            "Validating {} with {} runs",
            individual.key, self.runs
        ));
        let summary = self
            .harness
            .execute(project_dir, self.runs, RunMode::Scoring)
            .await;

        let accepted = summary.run_count() == self.runs && summary.all_success();
        if accepted {
            events.debug(format!("{} passed validation", individual.key));
        } else {
            events.warning(format!(
                "{} failed validation: {} over {} of {} runs",
                individual.key,
                summary.describe(),
                summary.run_count(),
                self.runs
            ));
        }

        if let Err(e) = individual.record_validation(summary) {
            events.error(e.to_string());
            return false;
        }

        accepted
    }
}
