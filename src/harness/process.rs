//! Runs the test suite as a bounded child process.

use super::classify::{classify, extract_failed_tests};
use super::{RunMode, SuiteRunner, TestResult, TestStatus};
use crate::command::{kill_process_group, own_process_group};
use crate::config::HarnessConfig;
use crate::project_config::ProjectConfig;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Environment variable carrying the memory ceiling to the test process.
pub const MEMORY_ENV_VAR: &str = "ARC_MEMORY_MB";

/// Bytes of output kept in memory per stream for classification.
const CAPTURE_LIMIT: usize = 4 * 1024 * 1024;

/// How long to wait for the output readers once the process is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Launches the configured test command once per run.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command_template: String,
    classpath: String,
    test_suite: Option<String>,
    memory_mb: i64,
    poll_interval: Duration,
    max_output_bytes: usize,
    deadlock_markers: Vec<String>,
}

impl ProcessRunner {
    pub fn new(project: &ProjectConfig, harness: &HarnessConfig) -> Self {
        Self {
            command_template: project.test_command.clone(),
            classpath: project.classpath.clone(),
            test_suite: project.test_suite.clone(),
            memory_mb: harness.memory_mb,
            poll_interval: Duration::from_millis(harness.poll_interval_ms.max(1)),
            max_output_bytes: harness.max_output_bytes,
            deadlock_markers: harness.deadlock_markers.clone(),
        }
    }

    /// Split the command template on whitespace and fill in placeholders.
    ///
    /// Placeholders are substituted per token so a substituted path that
    /// contains spaces stays a single argument.
    fn build_argv(&self) -> Result<Vec<String>, String> {
        if self.memory_mb <= 0 {
            return Err(format!(
                "Memory ceiling is {}MB, unable to run. Check harness.memory_mb.",
                self.memory_mb
            ));
        }

        let tokens: Vec<&str> = self.command_template.split_whitespace().collect();
        if tokens.is_empty() {
            return Err("No test command configured".to_string());
        }

        let memory = self.memory_mb.to_string();
        let mut argv = Vec::with_capacity(tokens.len());
        for token in tokens {
            let mut arg = token
                .replace("{memory_mb}", &memory)
                .replace("{classpath}", &self.classpath);
            if arg.contains("{test_suite}") {
                let suite = self
                    .test_suite
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| "No test suite configured (test_suite in .arc.toml)".to_string())?;
                arg = arg.replace("{test_suite}", suite);
            }
            argv.push(arg);
        }

        Ok(argv)
    }
}

#[async_trait]
impl SuiteRunner for ProcessRunner {
    async fn run_once(&self, project_dir: &Path, mode: RunMode, timeout: Duration) -> TestResult {
        let argv = match self.build_argv() {
            Ok(argv) => argv,
            Err(reason) => return TestResult::invalid(self.command_template.clone(), reason),
        };
        let command_line = argv.join(" ");

        let started = Instant::now();
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(project_dir)
            .env(MEMORY_ENV_VAR, self.memory_mb.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        own_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return TestResult::invalid(
                    command_line,
                    format!("Execution of the test process failed: {}", e),
                )
            }
        };

        let pid = child.id();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout_buf)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr_buf)));

        let mut notes = vec![format!("Max program execution time: {}ms", timeout.as_millis())];
        let mut finished = false;
        let mut exit_code = None;

        // Poll until the process exits or its time limit runs out
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    finished = true;
                    exit_code = status.code();
                    break;
                }
                Ok(None) => {
                    if started.elapsed() >= timeout {
                        break;
                    }
                }
                Err(e) => {
                    notes.push(format!("Could not poll the test process: {}", e));
                    break;
                }
            }
        }

        let duration = if finished {
            // The exit happened somewhere inside the last poll interval
            started.elapsed().saturating_sub(self.poll_interval / 2)
        } else {
            started.elapsed()
        };

        // Nothing the suite forked may outlive the run
        if let Err(e) = kill_process_group(pid) {
            notes.push(format!("Could not kill the test process group: {}", e));
        }
        if !finished {
            if let Err(e) = child.kill().await {
                notes.push(format!("Could not kill the test process: {}", e));
            }
        }

        wait_for_reader(stdout_reader).await;
        wait_for_reader(stderr_reader).await;
        let stdout = take_output(&stdout_buf);
        let stderr = take_output(&stderr_buf);

        let verdict = classify(&stdout, finished, mode, &self.deadlock_markers);
        notes.push(verdict.note);
        if let Some(code) = exit_code {
            notes.push(format!("Exit code: {}", code));
        }

        let failed_tests = if verdict.status == TestStatus::DataRace {
            extract_failed_tests(&stdout)
        } else {
            Vec::new()
        };

        TestResult {
            tests: verdict.counts.tests,
            failures: verdict.counts.failures,
            successes: verdict.counts.successes,
            status: verdict.status,
            duration_ms: duration.as_millis() as u64,
            command: command_line,
            exit_code,
            failed_tests,
            stdout: truncate_output(&stdout, self.max_output_bytes),
            stderr: truncate_output(&stderr, self.max_output_bytes),
            notes,
        }
    }
}

/// Drain a pipe into `buffer` until EOF, keeping at most `CAPTURE_LIMIT` bytes.
fn spawn_reader<R>(mut pipe: R, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8 * 1024];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        let room = CAPTURE_LIMIT.saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        }
    })
}

/// Give a reader a short grace period, then abandon it.
///
/// A grandchild that inherited the pipe can keep it open after the test
/// process itself is gone.
async fn wait_for_reader(reader: Option<JoinHandle<()>>) {
    let Some(mut handle) = reader else {
        return;
    };
    if tokio::time::timeout(READER_GRACE, &mut handle).await.is_err() {
        handle.abort();
    }
}

fn take_output(buffer: &Mutex<Vec<u8>>) -> String {
    match buffer.lock() {
        Ok(mut buf) => String::from_utf8_lossy(&std::mem::take(&mut *buf)).into_owned(),
        Err(_) => String::new(),
    }
}

/// Truncate output to a maximum number of bytes on a char boundary.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut end = max_bytes;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(template: &str) -> ProcessRunner {
        let project = ProjectConfig {
            test_command: template.to_string(),
            test_suite: Some("AllTests".to_string()),
            classpath: "build:lib/junit.jar".to_string(),
            ..Default::default()
        };
        let harness = HarnessConfig {
            poll_interval_ms: 20,
            ..Default::default()
        };
        ProcessRunner::new(&project, &harness)
    }

    // =========================================================================
    // build_argv tests
    // =========================================================================

    #[test]
    fn test_build_argv_substitutes_placeholders() {
        let runner = runner(
            "java -Xmx{memory_mb}m -cp {classpath} org.junit.runner.JUnitCore {test_suite}",
        );
        assert_eq!(
            runner.build_argv().unwrap(),
            vec![
                "java",
                "-Xmx1024m",
                "-cp",
                "build:lib/junit.jar",
                "org.junit.runner.JUnitCore",
                "AllTests"
            ]
        );
    }

    #[test]
    fn test_build_argv_keeps_spaces_in_substitutions() {
        let mut runner = runner("java -cp {classpath} Main");
        runner.classpath = "my libs/junit.jar".to_string();
        let argv = runner.build_argv().unwrap();
        assert_eq!(argv.len(), 4);
        assert_eq!(argv[2], "my libs/junit.jar");
    }

    #[test]
    fn test_build_argv_missing_suite() {
        let mut runner = runner("java org.junit.runner.JUnitCore {test_suite}");
        runner.test_suite = None;
        let err = runner.build_argv().unwrap_err();
        assert!(err.contains("test suite"));
    }

    #[test]
    fn test_build_argv_suite_not_needed() {
        let mut runner = runner("sh run-tests.sh");
        runner.test_suite = None;
        assert!(runner.build_argv().is_ok());
    }

    #[test]
    fn test_build_argv_empty_command() {
        let runner = runner("   ");
        assert!(runner.build_argv().is_err());
    }

    #[test]
    fn test_build_argv_non_positive_memory() {
        let mut runner = runner("java Main");
        runner.memory_mb = 0;
        assert!(runner.build_argv().unwrap_err().contains("0MB"));
    }

    // =========================================================================
    // truncate_output tests
    // =========================================================================

    #[test]
    fn test_truncate_output_short() {
        assert_eq!(truncate_output("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_output_long() {
        assert_eq!(truncate_output("hello world", 5), "hello...(truncated)");
    }

    #[test]
    fn test_truncate_output_char_boundary() {
        // 'é' is two bytes; cutting at 1 would split it
        assert_eq!(truncate_output("éa", 1), "...(truncated)");
    }

    // =========================================================================
    // run_once tests (real processes)
    // =========================================================================

    #[cfg(unix)]
    fn script_dir(script: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("suite.sh"), script).unwrap();
        dir
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_success() {
        let dir = script_dir("echo 'JUnit version 4.12'\necho 'OK (3 tests)'\n");
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(10))
            .await;

        assert_eq!(result.status, TestStatus::Success);
        assert_eq!(result.successes, 3);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.command, "sh suite.sh");
        assert!(result.stdout.contains("OK (3 tests)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_failures_are_data_race() {
        let dir = script_dir(
            "echo '1) testTransfer(bank.AccountTest)'\necho 'Tests run: 4,  Failures: 1'\nexit 1\n",
        );
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(10))
            .await;

        assert_eq!(result.status, TestStatus::DataRace);
        assert_eq!(result.tests, 4);
        assert_eq!(result.failures, 1);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.failed_tests, vec!["bank.AccountTest.testTransfer"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_passes_memory_ceiling() {
        let dir = script_dir("echo \"OK ($1 tests)\"\necho \"env=$ARC_MEMORY_MB\"\n");
        let mut runner = runner("sh suite.sh {memory_mb}");
        runner.memory_mb = 7;
        let result = runner
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(10))
            .await;

        assert_eq!(result.successes, 7);
        assert!(result.stdout.contains("env=7"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_timeout_scoring_is_deadlock() {
        let dir = script_dir("exec sleep 10\n");
        let started = Instant::now();
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Scoring, Duration::from_millis(200))
            .await;

        assert_eq!(result.status, TestStatus::Deadlock);
        assert!(result.exit_code.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_timeout_exploratory_is_timeout() {
        let dir = script_dir("exec sleep 10\n");
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Exploratory, Duration::from_millis(200))
            .await;

        assert_eq!(result.status, TestStatus::Timeout);
        assert!(result.duration_ms >= 200);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_deadlock_marker() {
        let dir = script_dir("echo 'Found one Java-level deadlock:'\nexec sleep 10\n");
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Exploratory, Duration::from_millis(300))
            .await;

        assert_eq!(result.status, TestStatus::Deadlock);
        assert!(result.stdout.contains("Java-level deadlock"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_no_output_is_deadlock() {
        let dir = script_dir("exit 0\n");
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(10))
            .await;

        assert_eq!(result.status, TestStatus::Deadlock);
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_once_truncates_stored_output() {
        let dir = script_dir("i=0\nwhile [ $i -lt 200 ]; do echo 'line of output'; i=$((i+1)); done\necho 'OK (1 test)'\n");
        let mut runner = runner("sh suite.sh");
        runner.max_output_bytes = 64;
        let result = runner
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(10))
            .await;

        // Classification sees the full output, storage is truncated
        assert_eq!(result.status, TestStatus::Success);
        assert!(result.stdout.ends_with("...(truncated)"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_run_once_timeout_kills_forked_processes() {
        use crate::command::testing::wait_until_gone;

        let dir = script_dir("sleep 30 &\necho $! > pid\nwait\n");
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Scoring, Duration::from_millis(300))
            .await;
        assert_eq!(result.status, TestStatus::Deadlock);

        let (pid, gone) = wait_until_gone(&dir.path().join("pid")).await;
        assert!(gone, "forked process {} survived the timed out run", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_run_once_finished_run_leaves_no_background_process() {
        use crate::command::testing::wait_until_gone;

        let dir = script_dir(
            "sleep 30 > /dev/null 2>&1 &\necho $! > pid\necho 'OK (1 test)'\n",
        );
        let result = runner("sh suite.sh")
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(10))
            .await;
        assert_eq!(result.status, TestStatus::Success);

        let (pid, gone) = wait_until_gone(&dir.path().join("pid")).await;
        assert!(gone, "background process {} outlived the run", pid);
    }

    #[tokio::test]
    async fn test_run_once_missing_program_is_invalid() {
        let dir = TempDir::new().unwrap();
        let result = runner("definitely-not-a-real-program-arc")
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(1))
            .await;

        assert_eq!(result.status, TestStatus::Invalid);
        assert!(result.notes[0].contains("failed"));
    }

    #[tokio::test]
    async fn test_run_once_missing_suite_is_invalid() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner("java {test_suite}");
        runner.test_suite = None;
        let result = runner
            .run_once(dir.path(), RunMode::Scoring, Duration::from_secs(1))
            .await;

        assert_eq!(result.status, TestStatus::Invalid);
    }
}
