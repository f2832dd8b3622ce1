//! Project-level configuration.
//!
//! Handles loading and parsing `.arc.toml` files from the program under
//! repair. This configuration says how the program is built, how its test
//! suite is launched, and which files the mutation operators may touch.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of the project configuration.
pub const PROJECT_CONFIG_FILE: &str = ".arc.toml";

/// Project-level configuration loaded from `.arc.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Shell command that builds the project. No build step when unset.
    #[serde(default)]
    pub compile_command: Option<String>,

    /// Timeout in seconds for the build (defaults to 300).
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_seconds: u64,

    /// Test command template, split on whitespace before substitution.
    /// Placeholders: `{memory_mb}`, `{classpath}`, `{test_suite}`.
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Test suite handed to the runner (e.g. a JUnit suite class).
    #[serde(default)]
    pub test_suite: Option<String>,

    /// Classpath handed to the runner.
    #[serde(default = "default_classpath")]
    pub classpath: String,

    /// Globs selecting the files mutation operators may change.
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
}

fn default_compile_timeout() -> u64 {
    300
}

fn default_test_command() -> String {
    "java -Xmx{memory_mb}m -cp {classpath} org.junit.runner.JUnitCore {test_suite}".to_string()
}

fn default_classpath() -> String {
    ".".to_string()
}

fn default_sources() -> Vec<String> {
    vec!["**/*.java".to_string()]
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            compile_command: None,
            compile_timeout_seconds: default_compile_timeout(),
            test_command: default_test_command(),
            test_suite: None,
            classpath: default_classpath(),
            sources: default_sources(),
        }
    }
}

impl ProjectConfig {
    /// Load configuration from `.arc.toml`.
    ///
    /// Returns `Ok(None)` if the file doesn't exist and `Ok(Some(default))`
    /// if it is empty or whitespace-only. A file that fails to parse is an
    /// error.
    pub fn load(project_path: &Path) -> Result<Option<Self>> {
        let config_path = project_path.join(PROJECT_CONFIG_FILE);
        if !config_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {:?}", config_path))?;
        if content.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", config_path))?;
        Ok(Some(config))
    }

    /// Check whether a project-relative path is a mutable source file.
    pub fn is_source(&self, relative_path: &str) -> bool {
        self.sources
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, relative_path))
    }
}
