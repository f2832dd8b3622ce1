//! Bounded execution of helper commands (build, mutation tool).

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Result of running a helper command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the command succeeded (exit code 0).
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr output.
    pub output: String,
    /// How long the command took to run in milliseconds.
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Run a shell command with a timeout.
///
/// The command is executed via `sh -c` to support shell features like pipes.
pub async fn run_shell_with_timeout(
    working_dir: &Path,
    command: &str,
    timeout: Duration,
) -> CommandResult {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    run_with_timeout(cmd, working_dir, timeout).await
}

/// Run `program` with `args` directly, without a shell.
pub async fn run_program_with_timeout(
    working_dir: &Path,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> CommandResult {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run_with_timeout(cmd, working_dir, timeout).await
}

/// Start the child in a process group of its own, so that everything it
/// forks can be killed together.
pub fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Kill every process in the group led by `pid`.
///
/// A group that is already empty is not an error.
#[cfg(unix)]
pub fn kill_process_group(pid: Option<u32>) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(format!("killpg({}) failed: {}", pid, e)),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: Option<u32>) -> Result<(), String> {
    Ok(())
}

async fn run_with_timeout(mut cmd: Command, working_dir: &Path, timeout: Duration) -> CommandResult {
    let start = Instant::now();

    own_process_group(&mut cmd);
    let child = cmd
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) => {
            return CommandResult {
                success: false,
                exit_code: None,
                output: format!("Failed to spawn command: {}", e),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
            };
        }
    };

    let pid = child.id();
    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            CommandResult {
                success: output.status.success(),
                exit_code: output.status.code(),
                output: format!("{}{}", stdout, stderr),
                duration_ms,
                timed_out: false,
            }
        }
        Ok(Err(e)) => CommandResult {
            success: false,
            exit_code: None,
            output: format!("Command execution error: {}", e),
            duration_ms,
            timed_out: false,
        },
        // Dropping the future drops the child, which kills it
        Err(_) => {
            let mut output = format!("Command timed out after {} seconds", timeout.as_secs());
            if let Err(e) = kill_process_group(pid) {
                output.push_str(&format!("\n{}", e));
            }
            CommandResult {
                success: false,
                exit_code: None,
                output,
                duration_ms,
                timed_out: true,
            }
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shell_success_captures_output() {
        let dir = TempDir::new().unwrap();
        let result =
            run_shell_with_timeout(dir.path(), "echo out; echo err >&2", Duration::from_secs(10))
                .await;
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn test_shell_failure() {
        let dir = TempDir::new().unwrap();
        let result = run_shell_with_timeout(dir.path(), "exit 3", Duration::from_secs(10)).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_shell_runs_in_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let result =
            run_shell_with_timeout(dir.path(), "cat marker.txt", Duration::from_secs(10)).await;
        assert_eq!(result.output, "here");
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let dir = TempDir::new().unwrap();
        let result =
            run_shell_with_timeout(dir.path(), "exec sleep 10", Duration::from_millis(200)).await;
        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.duration_ms < 5_000);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_shell_timeout_kills_background_children() {
        let dir = TempDir::new().unwrap();
        let result = run_shell_with_timeout(
            dir.path(),
            "sleep 30 & echo $! > pid; wait",
            Duration::from_millis(300),
        )
        .await;
        assert!(result.timed_out);

        let (pid, gone) = testing::wait_until_gone(&dir.path().join("pid")).await;
        assert!(gone, "background process {} outlived the command", pid);
    }

    #[tokio::test]
    async fn test_program_without_shell() {
        let dir = TempDir::new().unwrap();
        let result = run_program_with_timeout(
            dir.path(),
            "echo",
            &["a b".to_string(), "c".to_string()],
            Duration::from_secs(10),
        )
        .await;
        assert!(result.success);
        assert_eq!(result.output.trim(), "a b c");
    }

    #[tokio::test]
    async fn test_program_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let result = run_program_with_timeout(
            dir.path(),
            "definitely-not-a-real-program-arc",
            &[],
            Duration::from_secs(1),
        )
        .await;
        assert!(!result.success);
        assert!(result.output.starts_with("Failed to spawn command"));
    }
}
