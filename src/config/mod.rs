use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Genetic search settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Test execution settings
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Mutation tool settings
    #[serde(default)]
    pub mutation: MutationConfig,

    /// Data directory (where the run history database is stored)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Work directory for generations and mutants. A temporary directory is
    /// used when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Keep the work directory after the run finishes
    #[serde(default)]
    pub keep_workspace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Shape of the genetic search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Individuals per generation
    #[serde(default = "default_population_size")]
    pub population_size: usize,

    /// Generations to evolve before giving up
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,

    /// Test suite runs per individual
    #[serde(default = "default_runs_per_individual")]
    pub runs_per_individual: usize,

    /// Test suite runs required to accept a fix
    #[serde(default = "default_validation_runs")]
    pub validation_runs: usize,

    /// Seed for the search's random choices. Entropy is used when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// How a single test suite run is launched and bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Fixed per-run timeout. When unset the timeout is calibrated from the
    /// unmodified program.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Calibrated timeout = average run time * multiplier
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,

    /// Runs used to calibrate the timeout
    #[serde(default = "default_calibration_runs")]
    pub calibration_runs: usize,

    /// Upper bound on a single calibration run
    #[serde(default = "default_calibration_ceiling_ms")]
    pub calibration_ceiling_ms: u64,

    /// Liveness polling interval for the test process
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Memory ceiling handed to the test process
    #[serde(default = "default_memory_mb")]
    pub memory_mb: i64,

    /// Captured output kept per run
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Output markers that identify a runtime-detected deadlock
    #[serde(default = "default_deadlock_markers")]
    pub deadlock_markers: Vec<String>,
}

/// External source transformation tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Command template. Placeholders: `{source}`, `{operator}`,
    /// `{out_file}`, `{out_dir}`. Operator parameters are appended.
    #[serde(default = "default_mutation_command")]
    pub command: String,

    /// Directory holding the operator programs
    #[serde(default = "default_operator_dir")]
    pub operator_dir: PathBuf,

    /// Enabled operator ids. All built-in operators when empty.
    #[serde(default)]
    pub operators: Vec<String>,

    /// Timeout for one invocation of the tool
    #[serde(default = "default_mutation_timeout")]
    pub timeout_seconds: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_population_size() -> usize {
    30
}

fn default_max_generations() -> usize {
    30
}

fn default_runs_per_individual() -> usize {
    15
}

fn default_validation_runs() -> usize {
    150
}

fn default_timeout_multiplier() -> f64 {
    10.0
}

fn default_calibration_runs() -> usize {
    15
}

fn default_calibration_ceiling_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_poll_interval_ms() -> u64 {
    150
}

fn default_memory_mb() -> i64 {
    1024
}

fn default_max_output_bytes() -> usize {
    10_000
}

fn default_deadlock_markers() -> Vec<String> {
    vec!["Java-level deadlock:".to_string()]
}

fn default_mutation_command() -> String {
    "txl {source} {operator} - -outfile {out_file} -outdir {out_dir}".to_string()
}

fn default_operator_dir() -> PathBuf {
    PathBuf::from("operators")
}

fn default_mutation_timeout() -> u64 {
    120
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            max_generations: default_max_generations(),
            runs_per_individual: default_runs_per_individual(),
            validation_runs: default_validation_runs(),
            seed: None,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            timeout_multiplier: default_timeout_multiplier(),
            calibration_runs: default_calibration_runs(),
            calibration_ceiling_ms: default_calibration_ceiling_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            memory_mb: default_memory_mb(),
            max_output_bytes: default_max_output_bytes(),
            deadlock_markers: default_deadlock_markers(),
        }
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            command: default_mutation_command(),
            operator_dir: default_operator_dir(),
            operators: Vec::new(),
            timeout_seconds: default_mutation_timeout(),
        }
    }
}

impl SearchConfig {
    /// Reject search shapes the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.population_size == 0 {
            bail!("population_size must be positive");
        }
        if self.max_generations == 0 {
            bail!("max_generations must be positive");
        }
        if self.runs_per_individual == 0 {
            bail!("runs_per_individual must be positive");
        }
        if self.validation_runs == 0 {
            bail!("validation_runs must be positive");
        }
        if self.validation_runs <= self.runs_per_individual {
            bail!(
                "validation_runs ({}) must be larger than runs_per_individual ({})",
                self.validation_runs,
                self.runs_per_individual
            );
        }
        Ok(())
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == Some(0) {
            bail!("timeout_ms must be positive");
        }
        if self.timeout_multiplier.is_nan() || self.timeout_multiplier <= 0.0 {
            bail!("timeout_multiplier must be positive");
        }
        if self.timeout_ms.is_none() && self.calibration_runs == 0 {
            bail!("calibration_runs must be positive when no timeout_ms is set");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from file, or create default if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(Self::default_config_path)
            .context("No config path available")?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;

        Ok(())
    }

    /// Check every section for values that would make a run impossible.
    pub fn validate(&self) -> Result<()> {
        self.search.validate().context("Invalid [search] section")?;
        self.harness.validate().context("Invalid [harness] section")?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "arc-repair", "arc-repair")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("com", "arc-repair", "arc-repair")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".arc-repair"))
        })
    }

    /// Get the database file path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("arc.db")
    }
}
