//! Repeated searches on one project and their aggregate cost.
//!
//! The search is randomized, so a single run says little about how reliably
//! a project gets fixed. An experiment runs the whole search several times
//! and records, per run, how many generations, individuals and test-suite
//! executions it took.

use crate::events::MessageKind;
use crate::harness::TestingSummary;
use crate::population::Generation;
use crate::search::{RepairOutcome, RepairReport};
use serde::Serialize;
use std::time::Duration;

/// Cost and result of one search.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResult {
    /// 1-based position in the experiment
    pub run: usize,
    pub outcome: &'static str,
    pub found_fix: bool,
    /// Generations materialized, generation 0 included
    pub generations: usize,
    pub individuals_created: usize,
    pub individuals_evaluated: usize,
    /// Test-suite executions for scoring and validation
    pub test_suite_executions: usize,
    pub duration_ms: u64,
    /// Fatal messages of the run
    pub errors: Vec<String>,
}

impl ExperimentResult {
    pub fn from_report(run: usize, report: &RepairReport, elapsed: Duration) -> Self {
        let (generations, individuals_created) =
            report.population.as_ref().map_or((0, 0), |p| {
                let generations = p.generations();
                (generations.len(), generations.iter().map(Generation::len).sum())
            });

        let test_suite_executions = report
            .tested_individuals()
            .map(|i| {
                i.summary().map_or(0, TestingSummary::run_count)
                    + i.validation().map_or(0, TestingSummary::run_count)
            })
            .sum();

        let mut errors: Vec<String> = report
            .phases
            .iter()
            .flat_map(|p| p.messages.iter())
            .filter(|m| m.kind == MessageKind::Fatal)
            .map(|m| m.text.clone())
            .collect();
        if let RepairOutcome::Fatal { reason } = &report.outcome {
            if errors.is_empty() {
                errors.push(reason.clone());
            }
        }

        Self {
            run,
            outcome: report.outcome.label(),
            found_fix: matches!(report.outcome, RepairOutcome::Fixed(_)),
            generations,
            individuals_created,
            individuals_evaluated: report.tested_individuals().count(),
            test_suite_executions,
            duration_ms: elapsed.as_millis() as u64,
            errors,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "run {}: {} after {} generation(s), {} of {} individual(s) evaluated, {} suite execution(s), {}ms",
            self.run,
            self.outcome,
            self.generations,
            self.individuals_evaluated,
            self.individuals_created,
            self.test_suite_executions,
            self.duration_ms
        )
    }
}

/// Aggregate over every run of an experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub runs: usize,
    pub fixes: usize,
    pub fatal: usize,
    pub mean_generations: f64,
    pub mean_individuals_created: f64,
    pub mean_individuals_evaluated: f64,
    pub mean_test_suite_executions: f64,
    pub mean_duration_ms: f64,
    pub results: Vec<ExperimentResult>,
}

impl ExperimentSummary {
    pub fn new(results: Vec<ExperimentResult>) -> Self {
        Self {
            runs: results.len(),
            fixes: results.iter().filter(|r| r.found_fix).count(),
            fatal: results.iter().filter(|r| r.outcome == "fatal").count(),
            mean_generations: mean(&results, |r| r.generations as f64),
            mean_individuals_created: mean(&results, |r| r.individuals_created as f64),
            mean_individuals_evaluated: mean(&results, |r| r.individuals_evaluated as f64),
            mean_test_suite_executions: mean(&results, |r| r.test_suite_executions as f64),
            mean_duration_ms: mean(&results, |r| r.duration_ms as f64),
            results,
        }
    }

    /// Share of runs that found a fix.
    pub fn fix_rate(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.fixes as f64 / self.runs as f64
    }
}

fn mean(results: &[ExperimentResult], value: impl Fn(&ExperimentResult) -> f64) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(value).sum::<f64>() / results.len() as f64
}
