//! Building a candidate program before it is tested.

use crate::command::run_shell_with_timeout;
use crate::project_config::ProjectConfig;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Result of building the working project.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub success: bool,
    /// Build output, kept for diagnostics
    pub log: String,
}

impl CompileOutcome {
    pub fn ok(log: impl Into<String>) -> Self {
        Self {
            success: true,
            log: log.into(),
        }
    }

    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            success: false,
            log: log.into(),
        }
    }
}

/// Builds the project in a directory.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, project_dir: &Path) -> CompileOutcome;
}

/// Runs the project's `compile_command` through the shell.
#[derive(Debug, Clone)]
pub struct ShellCompiler {
    command: Option<String>,
    timeout: Duration,
}

impl ShellCompiler {
    pub fn new(project: &ProjectConfig) -> Self {
        Self {
            command: project
                .compile_command
                .clone()
                .filter(|c| !c.trim().is_empty()),
            timeout: Duration::from_secs(project.compile_timeout_seconds),
        }
    }
}

#[async_trait]
impl Compiler for ShellCompiler {
    async fn compile(&self, project_dir: &Path) -> CompileOutcome {
        let Some(command) = &self.command else {
            return CompileOutcome::ok("No compile command configured");
        };

        let result = run_shell_with_timeout(project_dir, command, self.timeout).await;
        if result.success && !reports_build_failure(&result.output) {
            CompileOutcome::ok(result.output)
        } else {
            tracing::debug!(
                "Build failed in {} ({}ms)",
                project_dir.display(),
                result.duration_ms
            );
            CompileOutcome::failed(result.output)
        }
    }
}

/// Some build tools exit 0 even when the build failed.
fn reports_build_failure(output: &str) -> bool {
    output.to_ascii_lowercase().contains("build failed")
}
