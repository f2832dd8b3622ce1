//! Turning a finished (or killed) test process into a `TestStatus`.

use super::{RunMode, TestStatus};
use regex::Regex;
use std::sync::OnceLock;

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn tests_run_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&PATTERN, r"Tests run: (\d+),\s+Failures: (\d+)")
}

fn ok_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&PATTERN, r"OK \((\d+) test")
}

fn failure_line_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&PATTERN, r"(?m)^\d+\) ([A-Za-z_$][\w$]*)\(([\w.$]+)\)")
}

/// Counts parsed from a JUnit text report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedCounts {
    pub tests: u32,
    pub failures: u32,
    pub successes: u32,
    /// A marker was found but its number could not be read
    pub parse_error: bool,
    /// `Tests run:` marker was present
    pub found_totals: bool,
    /// `OK (n tests)` marker was present
    pub found_successes: bool,
}

/// Read the test, failure and success counts from captured stdout.
pub fn parse_counts(stdout: &str) -> ParsedCounts {
    let mut counts = ParsedCounts::default();

    if let Some(caps) = tests_run_pattern().and_then(|re| re.captures(stdout)) {
        counts.found_totals = true;
        match (caps[1].parse::<u32>(), caps[2].parse::<u32>()) {
            (Ok(tests), Ok(failures)) => {
                counts.tests = tests;
                counts.failures = failures;
            }
            _ => counts.parse_error = true,
        }
    }

    if let Some(caps) = ok_pattern().and_then(|re| re.captures(stdout)) {
        counts.found_successes = true;
        match caps[1].parse::<u32>() {
            Ok(successes) => counts.successes = successes,
            Err(_) => counts.parse_error = true,
        }
    }

    counts
}

/// Names of failing tests from JUnit's `1) testName(ClassName)` lines.
pub fn extract_failed_tests(stdout: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let Some(pattern) = failure_line_pattern() else {
        return names;
    };
    for caps in pattern.captures_iter(stdout) {
        let name = format!("{}.{}", &caps[2], &caps[1]);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Outcome of classifying one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: TestStatus,
    pub counts: ParsedCounts,
    /// Human-readable explanation of the verdict
    pub note: String,
}

/// Classify a run from its captured output.
///
/// A run that finished is judged on its parsed counts. A run that was killed
/// at the timeout is a deadlock when the output carries one of
/// `deadlock_markers`; otherwise it is a timeout in exploratory mode and a
/// deadlock in scoring mode.
pub fn classify(
    stdout: &str,
    finished: bool,
    mode: RunMode,
    deadlock_markers: &[String],
) -> Classification {
    if !finished {
        let counts = ParsedCounts::default();
        if deadlock_markers
            .iter()
            .any(|marker| !marker.is_empty() && stdout.contains(marker.as_str()))
        {
            return Classification {
                status: TestStatus::Deadlock,
                counts,
                note: "Runtime reported a deadlock".to_string(),
            };
        }
        return match mode {
            RunMode::Exploratory => Classification {
                status: TestStatus::Timeout,
                counts,
                note: "Timeout (process did not finish in time)".to_string(),
            },
            RunMode::Scoring => Classification {
                status: TestStatus::Deadlock,
                counts,
                note: "Deadlock or timeout (process did not finish in time)".to_string(),
            },
        };
    }

    let counts = parse_counts(stdout);

    let (status, note) = if counts.parse_error {
        (TestStatus::Unknown, "Could not parse the test counts")
    } else if counts.tests > 0 && counts.failures > 0 {
        (TestStatus::DataRace, "Some tests failed")
    } else if counts.tests == 0 && counts.successes == 0 {
        (TestStatus::Deadlock, "No tests or successes were reported")
    } else {
        // successes > 0, or tests > 0 with no failures
        let total = if counts.tests > 0 {
            counts.tests
        } else {
            counts.successes
        };
        if total == 0 {
            (TestStatus::Failed, "No tests were executed")
        } else {
            (TestStatus::Success, "Execution was successful")
        }
    };

    Classification {
        status,
        counts,
        note: note.to_string(),
    }
}
