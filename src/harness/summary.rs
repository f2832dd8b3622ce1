//! Rollup of the runs made for one individual.

use super::{TestResult, TestStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable summary of an ordered batch of test runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestingSummary {
    results: Vec<TestResult>,
    /// Runs per status. Statuses that never occurred are absent.
    by_status: BTreeMap<TestStatus, usize>,
    /// Union of failing test names, first-seen order
    failed_tests: Vec<String>,
    /// Largest `Tests run` count seen in any run
    unit_test_count: u32,
    average_duration_ms: u64,
}

impl TestingSummary {
    pub fn new(results: Vec<TestResult>) -> Self {
        let mut by_status = BTreeMap::new();
        let mut failed_tests: Vec<String> = Vec::new();
        let mut unit_test_count = 0;
        let mut total_duration: u64 = 0;

        for result in &results {
            *by_status.entry(result.status).or_insert(0) += 1;

            for name in &result.failed_tests {
                if !failed_tests.contains(name) {
                    failed_tests.push(name.clone());
                }
            }

            unit_test_count = unit_test_count.max(result.tests);
            total_duration = total_duration.saturating_add(result.duration_ms);
        }

        let average_duration_ms = if results.is_empty() {
            0
        } else {
            total_duration / results.len() as u64
        };

        Self {
            results,
            by_status,
            failed_tests,
            unit_test_count,
            average_duration_ms,
        }
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn run_count(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of runs classified as `status`.
    pub fn count(&self, status: TestStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Histogram of statuses that occurred.
    pub fn status_counts(&self) -> &BTreeMap<TestStatus, usize> {
        &self.by_status
    }

    pub fn failed_tests(&self) -> &[String] {
        &self.failed_tests
    }

    pub fn unit_test_count(&self) -> u32 {
        self.unit_test_count
    }

    pub fn average_duration_ms(&self) -> u64 {
        self.average_duration_ms
    }

    /// True when there is at least one run and every run succeeded.
    pub fn all_success(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(TestResult::is_success)
    }

    /// Fitness: successes over executed tests across all runs.
    ///
    /// `None` for an empty summary. A summary whose runs executed no tests at
    /// all scores `0.0`.
    pub fn fitness(&self) -> Option<f64> {
        if self.results.is_empty() {
            return None;
        }

        let (passes, executed) = self.results.iter().fold((0u64, 0u64), |(p, e), r| {
            (p + u64::from(r.successes), e + u64::from(r.executed_tests()))
        });

        if executed == 0 {
            return Some(0.0);
        }
        Some(passes as f64 / executed as f64)
    }

    /// Share of data-race runs among data-race and deadlock runs; 0.5 when
    /// neither occurred.
    pub fn data_race_ratio(&self) -> f64 {
        let races = self.count(TestStatus::DataRace);
        let deadlocks = self.count(TestStatus::Deadlock);
        if races + deadlocks == 0 {
            return 0.5;
        }
        races as f64 / (races + deadlocks) as f64
    }

    /// One-line description for logs, e.g. `success=13 data_race=2`.
    pub fn describe(&self) -> String {
        if self.by_status.is_empty() {
            return "no runs".to_string();
        }
        self.by_status
            .iter()
            .map(|(status, n)| format!("{}={}", status, n))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::testing::{result, success};

    #[test]
    fn test_empty_summary() {
        let summary = TestingSummary::new(vec![]);
        assert!(summary.is_empty());
        assert_eq!(summary.fitness(), None);
        assert!(!summary.all_success());
        assert_eq!(summary.average_duration_ms(), 0);
        assert_eq!(summary.describe(), "no runs");
    }

    #[test]
    fn test_counts_by_status() {
        let summary = TestingSummary::new(vec![
            success(4),
            result(TestStatus::DataRace, 4, 1, 0),
            result(TestStatus::DataRace, 4, 2, 0),
            result(TestStatus::Deadlock, 0, 0, 0),
        ]);

        assert_eq!(summary.run_count(), 4);
        assert_eq!(summary.count(TestStatus::Success), 1);
        assert_eq!(summary.count(TestStatus::DataRace), 2);
        assert_eq!(summary.count(TestStatus::Deadlock), 1);
        assert_eq!(summary.count(TestStatus::Timeout), 0);
        assert!(!summary.status_counts().contains_key(&TestStatus::Timeout));
        assert_eq!(summary.results().iter().filter(|r| r.status == TestStatus::DataRace).count(), 2);
        assert_eq!(summary.unit_test_count(), 4);
    }

    #[test]
    fn test_fitness_is_successes_over_executed() {
        // 4 + 0 + 0 passes over 4 + 4 + 0 executed
        let summary = TestingSummary::new(vec![
            success(4),
            result(TestStatus::DataRace, 4, 1, 0),
            result(TestStatus::Deadlock, 0, 0, 0),
        ]);
        assert_eq!(summary.fitness(), Some(0.5));
    }

    #[test]
    fn test_fitness_perfect() {
        let summary = TestingSummary::new(vec![success(3), success(3)]);
        assert_eq!(summary.fitness(), Some(1.0));
        assert!(summary.all_success());
    }

    #[test]
    fn test_fitness_nothing_executed() {
        let summary = TestingSummary::new(vec![
            result(TestStatus::Deadlock, 0, 0, 0),
            result(TestStatus::Deadlock, 0, 0, 0),
        ]);
        assert_eq!(summary.fitness(), Some(0.0));
    }

    #[test]
    fn test_fitness_counts_unknown_in_denominator() {
        let summary = TestingSummary::new(vec![
            success(2),
            result(TestStatus::Unknown, 2, 0, 0),
        ]);
        assert_eq!(summary.fitness(), Some(0.5));
        assert!(!summary.all_success());
    }

    #[test]
    fn test_failed_tests_union_first_seen_order() {
        let mut a = result(TestStatus::DataRace, 3, 2, 0);
        a.failed_tests = vec!["testDeposit".into(), "testWithdraw".into()];
        let mut b = result(TestStatus::DataRace, 3, 2, 0);
        b.failed_tests = vec!["testTransfer".into(), "testDeposit".into()];

        let summary = TestingSummary::new(vec![a, b]);
        assert_eq!(
            summary.failed_tests(),
            &["testDeposit", "testWithdraw", "testTransfer"]
        );
    }

    #[test]
    fn test_average_duration() {
        let mut a = success(1);
        a.duration_ms = 100;
        let mut b = success(1);
        b.duration_ms = 301;
        let summary = TestingSummary::new(vec![a, b]);
        assert_eq!(summary.average_duration_ms(), 200);
    }

    #[test]
    fn test_data_race_ratio() {
        let none = TestingSummary::new(vec![success(1)]);
        assert_eq!(none.data_race_ratio(), 0.5);

        let mixed = TestingSummary::new(vec![
            result(TestStatus::DataRace, 2, 1, 0),
            result(TestStatus::DataRace, 2, 1, 0),
            result(TestStatus::DataRace, 2, 1, 0),
            result(TestStatus::Deadlock, 0, 0, 0),
        ]);
        assert_eq!(mixed.data_race_ratio(), 0.75);

        let deadlocks = TestingSummary::new(vec![result(TestStatus::Deadlock, 0, 0, 0)]);
        assert_eq!(deadlocks.data_race_ratio(), 0.0);
    }

    #[test]
    fn test_describe() {
        let summary = TestingSummary::new(vec![
            success(1),
            success(1),
            result(TestStatus::Deadlock, 0, 0, 0),
        ]);
        assert_eq!(summary.describe(), "success=2 deadlock=1");
    }
}
