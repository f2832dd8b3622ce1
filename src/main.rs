mod command;
mod compile;
mod config;
mod db;
mod events;
mod experiment;
mod harness;
mod mutation;
mod operators;
mod population;
mod project_config;
mod search;
mod workspace;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::compile::ShellCompiler;
use crate::config::Config;
use crate::db::Database;
use crate::events::{EventLog, MessageKind, Phase};
use crate::experiment::{ExperimentResult, ExperimentSummary};
use crate::harness::ProcessRunner;
use crate::mutation::CommandApplier;
use crate::operators::OperatorRegistry;
use crate::project_config::ProjectConfig;
use crate::search::{
    Collaborators, ExhaustReason, RepairOutcome, RepairReport, SearchEngine, SetupError,
};
use crate::workspace::Workspace;

/// Name of the result file written next to a repaired project
const RESULT_FILE: &str = "arc-result.json";

/// Name of the statistics file written by `experiment`
const EXPERIMENT_FILE: &str = "arc-experiment.json";

#[derive(Parser)]
#[command(name = "arc-repair")]
#[command(version)]
#[command(about = "Automatic repair of concurrency bugs by mutation and genetic search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for a fix of a project's concurrency bugs
    Repair(RepairArgs),

    /// Repeat the search several times and report aggregate statistics
    Experiment(ExperimentArgs),

    /// List recent repair runs
    History {
        /// Number of runs to show
        #[arg(short, long, default_value_t = 10)]
        limit: i64,

        /// Show the individuals tested in this run
        #[arg(long)]
        run: Option<i64>,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct RepairArgs {
    /// Root directory of the project to repair
    project: PathBuf,

    /// Where to write the repaired project and the result file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Individuals per generation
    #[arg(long)]
    population: Option<usize>,

    /// Maximum number of generations
    #[arg(long)]
    generations: Option<usize>,

    /// Test runs per individual
    #[arg(long)]
    runs: Option<usize>,

    /// Test runs when validating a candidate fix
    #[arg(long)]
    validation_runs: Option<usize>,

    /// Seed for reproducible searches
    #[arg(long)]
    seed: Option<u64>,

    /// Per-run timeout in milliseconds; calibrated when omitted
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Keep the working directory after the run
    #[arg(long)]
    keep_workspace: bool,
}

#[derive(Args)]
struct ExperimentArgs {
    #[command(flatten)]
    repair: RepairArgs,

    /// Number of independent searches
    #[arg(long, default_value_t = 10)]
    repeat: usize,
}

impl RepairArgs {
    /// Command-line values take precedence over the configuration file.
    fn apply(&self, config: &mut Config) {
        if let Some(n) = self.population {
            config.search.population_size = n;
        }
        if let Some(n) = self.generations {
            config.search.max_generations = n;
        }
        if let Some(n) = self.runs {
            config.search.runs_per_individual = n;
        }
        if let Some(n) = self.validation_runs {
            config.search.validation_runs = n;
        }
        if self.seed.is_some() {
            config.search.seed = self.seed;
        }
        if self.timeout_ms.is_some() {
            config.harness.timeout_ms = self.timeout_ms;
        }
        if self.keep_workspace {
            config.keep_workspace = true;
        }
    }

    /// Default output: a sibling of the project named `<project>-fixed`.
    fn output_dir(&self, project: &Path) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let name = project
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        project.with_file_name(format!("{}-fixed", name))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    // Initialize logging; RUST_LOG takes precedence over the config
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Repair(args) => repair(config, args).await,
        Commands::Experiment(args) => experiment(config, args).await,
        Commands::History { limit, run } => history(&config, limit, run).await.map(|_| 0),
        Commands::InitConfig { force } => init_config(cli.config.as_deref(), force).map(|_| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn repair(mut config: Config, args: RepairArgs) -> anyhow::Result<u8> {
    args.apply(&mut config);

    let project = args
        .project
        .canonicalize()
        .with_context(|| format!("Project directory not found: {:?}", args.project))?;
    let output = args.output_dir(&project);
    tracing::info!("Repairing {}", project.display());

    let db = open_history(&config).await;
    let started_at = Utc::now();
    let report = run_search(&config, &project, Some(&output)).await?;

    write_result(&output, &report).await?;

    if let Some(db) = &db {
        match db.record_run(&project, started_at, &report).await {
            Ok(id) => tracing::info!("Recorded as run #{}", id),
            Err(e) => tracing::warn!("Failed to record run: {:#}", e),
        }
    }

    print_outcome(&report);
    Ok(report.outcome.exit_code() as u8)
}

async fn experiment(mut config: Config, args: ExperimentArgs) -> anyhow::Result<u8> {
    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    args.repair.apply(&mut config);

    let project = args
        .repair
        .project
        .canonicalize()
        .with_context(|| format!("Project directory not found: {:?}", args.repair.project))?;
    let output = args.repair.output_dir(&project);
    tracing::info!(
        "Running {} searches on {}",
        args.repeat,
        project.display()
    );

    let db = open_history(&config).await;
    let base_seed = config.search.seed;
    let mut results = Vec::with_capacity(args.repeat);

    for run in 1..=args.repeat {
        tracing::info!("Experiment run {} of {}", run, args.repeat);
        let mut run_config = config.clone();
        // Distinct but reproducible seeds per run
        run_config.search.seed = base_seed.map(|seed| seed.wrapping_add(run as u64 - 1));

        let started_at = Utc::now();
        let started = Instant::now();
        let report = run_search(&run_config, &project, None).await?;
        let result = ExperimentResult::from_report(run, &report, started.elapsed());
        tracing::info!("{}", result.describe());

        if let Some(db) = &db {
            if let Err(e) = db.record_run(&project, started_at, &report).await {
                tracing::warn!("Failed to record run: {:#}", e);
            }
        }
        results.push(result);

        if matches!(
            report.outcome,
            RepairOutcome::Exhausted {
                reason: ExhaustReason::StopRequested
            }
        ) {
            tracing::info!("Stop requested, skipping the remaining runs");
            break;
        }
    }

    let summary = ExperimentSummary::new(results);
    write_json(&output, EXPERIMENT_FILE, &summary).await?;
    print_experiment(&summary);

    // Fatal only when no run got past setup
    Ok(if summary.fatal == summary.runs { 2 } else { 0 })
}

/// One complete search over `project`.
///
/// Setup failures, an invalid configuration included, come back as a Fatal
/// report. A fix is exported to `export_to` when given.
async fn run_search(
    config: &Config,
    project: &Path,
    export_to: Option<&Path>,
) -> anyhow::Result<RepairReport> {
    let prepared = match config.validate() {
        Ok(()) => prepare(config, project).await,
        Err(e) => Err(SetupError::Config(format!("{:#}", e))),
    };

    let (project_config, registry, workspace) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(RepairReport {
                outcome: RepairOutcome::Fatal {
                    reason: e.to_string(),
                },
                population: None,
                timeout_ms: None,
                phases: Vec::new(),
            });
        }
    };

    let report = search(config, &project_config, &registry, &workspace).await;
    if let (Some(output), RepairOutcome::Fixed(fix)) = (export_to, &report.outcome) {
        workspace
            .export(&fix.tree, output)
            .await
            .context("Failed to write the repaired project")?;
        tracing::info!("Repaired project written to {}", output.display());
    }
    if config.keep_workspace {
        tracing::info!("Workspace kept at {}", workspace.root().display());
    }
    Ok(report)
}

/// Everything that must succeed before a search can start.
async fn prepare(
    config: &Config,
    project: &Path,
) -> Result<(ProjectConfig, OperatorRegistry, Workspace), SetupError> {
    let project_config = match ProjectConfig::load(project) {
        Ok(Some(project_config)) => project_config,
        Ok(None) => {
            tracing::info!("No .arc.toml found, using project defaults");
            ProjectConfig::default()
        }
        Err(e) => return Err(SetupError::Config(format!("{:#}", e))),
    };

    let registry = OperatorRegistry::with_enabled(&config.mutation.operators)?;
    registry.verify_programs(&config.mutation.operator_dir)?;
    tracing::info!("{} mutation operator(s) enabled", registry.len());

    let workspace = Workspace::create(
        project,
        config.work_dir.as_deref(),
        config.keep_workspace,
        &project_config,
    )
    .await?;

    Ok((project_config, registry, workspace))
}

async fn search(
    config: &Config,
    project_config: &ProjectConfig,
    registry: &OperatorRegistry,
    workspace: &Workspace,
) -> RepairReport {
    let collaborators = Collaborators {
        applier: Arc::new(CommandApplier::new(&config.mutation)),
        compiler: Arc::new(ShellCompiler::new(project_config)),
        runner: Arc::new(ProcessRunner::new(project_config, &config.harness)),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let listener = tokio::spawn(report_phases(rx));

    let engine = SearchEngine::new(
        config,
        registry,
        workspace,
        collaborators,
        EventLog::with_forwarder(tx),
    );

    let stop = engine.stop_handle();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let report = engine.run().await;
    signal.abort();
    // The engine dropped its sender, so the listener drains and ends
    if let Err(e) = listener.await {
        tracing::warn!("Phase listener failed: {}", e);
    }
    report
}

/// Log a one-line digest of every finished phase.
async fn report_phases(mut rx: mpsc::UnboundedReceiver<Phase>) {
    while let Some(phase) = rx.recv().await {
        let elapsed = phase
            .finished_at
            .map(|end| (end - phase.started_at).num_milliseconds())
            .unwrap_or_default();
        tracing::info!(
            "{} finished in {}ms ({} warning(s), {} error(s))",
            phase.name,
            elapsed,
            phase.count(MessageKind::Warning),
            phase.count(MessageKind::Error) + phase.count(MessageKind::Fatal)
        );
    }
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    let db = Database::new(&config.database_path()).await?;
    db.run_migrations().await?;
    Ok(db)
}

/// The history database is optional for a run.
async fn open_history(config: &Config) -> Option<Database> {
    match open_database(config).await {
        Ok(db) => Some(db),
        Err(e) => {
            tracing::warn!("Run history unavailable: {:#}", e);
            None
        }
    }
}

async fn write_result(output: &Path, report: &RepairReport) -> anyhow::Result<()> {
    write_json(output, RESULT_FILE, report).await
}

async fn write_json<T: serde::Serialize>(
    output: &Path,
    file_name: &str,
    value: &T,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("Failed to create output directory: {:?}", output))?;
    let path = output.join(file_name);
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    tracing::info!("Result written to {}", path.display());
    Ok(())
}

fn print_outcome(report: &RepairReport) {
    match &report.outcome {
        RepairOutcome::Fixed(fix) => {
            println!("Fixed: individual {} changes {}", fix.key, fix.mutant);
            println!("  operators:  {}", fix.operators.join(" -> "));
            println!(
                "  baseline:   {} ({} unit tests)",
                fix.baseline.describe(),
                fix.baseline.unit_test_count()
            );
            println!("  validation: {}", fix.validation.describe());
        }
        RepairOutcome::Exhausted { reason } => {
            let best = report
                .tested_individuals()
                .map(|i| i.score())
                .fold(f64::NEG_INFINITY, f64::max);
            println!("No fix found ({}), best fitness {:.3}", reason, best);
        }
        RepairOutcome::Fatal { reason } => println!("Repair failed: {}", reason),
    }
}

fn print_experiment(summary: &ExperimentSummary) {
    for result in &summary.results {
        println!("{}", result.describe());
        for error in &result.errors {
            println!("  error: {}", error);
        }
    }
    println!(
        "{} of {} run(s) found a fix ({:.0}%), {} fatal",
        summary.fixes,
        summary.runs,
        summary.fix_rate() * 100.0,
        summary.fatal
    );
    println!(
        "  mean: {:.1} generation(s), {:.1} individual(s) created, {:.1} evaluated, {:.1} suite execution(s), {:.0}ms",
        summary.mean_generations,
        summary.mean_individuals_created,
        summary.mean_individuals_evaluated,
        summary.mean_test_suite_executions,
        summary.mean_duration_ms
    );
}

async fn history(config: &Config, limit: i64, run: Option<i64>) -> anyhow::Result<()> {
    let db = open_database(config).await?;

    if let Some(run_id) = run {
        let individuals = db.get_individuals(run_id).await?;
        if individuals.is_empty() {
            println!("No individuals recorded for run #{}", run_id);
        }
        for i in individuals {
            let validated = match i.validated {
                Some(true) => " validated",
                Some(false) => " failed validation",
                None => "",
            };
            println!(
                "{:>6}  {:<5} from {:<6} fitness {:.3}  {}  {}{}",
                i.key(),
                i.operator.as_deref().unwrap_or("-"),
                i.source_key.as_deref().unwrap_or("-"),
                i.fitness,
                i.mutant,
                i.status_counts_json,
                validated
            );
        }
        return Ok(());
    }

    let runs = db.get_recent_runs(limit).await?;
    if runs.is_empty() {
        println!("No repair runs recorded");
    }
    for r in runs {
        let detail = if r.is_fixed() {
            format!(
                "fix {} via {}",
                r.fix_key.as_deref().unwrap_or("?"),
                r.fix_operators.as_deref().unwrap_or("-")
            )
        } else {
            r.reason.clone().unwrap_or_default()
        };
        println!(
            "#{:<4} {}  {:<9} {} generation(s), {} tested  {}  {}",
            r.id,
            r.started_at,
            r.outcome,
            r.generations,
            r.individuals_tested,
            r.project_path,
            detail
        );
    }
    Ok(())
}

fn init_config(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let target = path
        .map(PathBuf::from)
        .or_else(Config::default_config_path)
        .context("No config path available")?;
    if target.exists() && !force {
        bail!("{:?} already exists, use --force to overwrite", target);
    }
    Config::default().save(Some(&target))?;
    println!("Wrote {}", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(project: &Path, output: &Path) -> RepairArgs {
        RepairArgs {
            project: project.to_path_buf(),
            output: Some(output.to_path_buf()),
            population: None,
            generations: None,
            runs: None,
            validation_runs: None,
            seed: None,
            timeout_ms: None,
            keep_workspace: false,
        }
    }

    fn config(dir: &TempDir) -> Config {
        Config {
            data_dir: Some(dir.path().join("data")),
            work_dir: Some(dir.path().join("work")),
            ..Default::default()
        }
    }

    fn read_json(path: &Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    // =========================================================================
    // RepairArgs tests
    // =========================================================================

    #[test]
    fn test_args_override_config() {
        let mut args = args(Path::new("/tmp/bank"), Path::new("/tmp/out"));
        args.population = Some(4);
        args.runs = Some(3);
        args.seed = Some(9);
        args.timeout_ms = Some(2_000);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.search.population_size, 4);
        assert_eq!(config.search.runs_per_individual, 3);
        assert_eq!(config.search.max_generations, 30);
        assert_eq!(config.search.seed, Some(9));
        assert_eq!(config.harness.timeout_ms, Some(2_000));
    }

    #[test]
    fn test_default_output_is_sibling() {
        let mut args = args(Path::new("/tmp/bank"), Path::new("/tmp/out"));
        args.output = None;
        assert_eq!(
            args.output_dir(Path::new("/work/bank")),
            PathBuf::from("/work/bank-fixed")
        );
    }

    // =========================================================================
    // Invalid configuration tests
    // =========================================================================

    #[tokio::test]
    async fn test_invalid_config_still_writes_fatal_result() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("bank");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&project).unwrap();

        let mut args = args(&project, &output);
        args.validation_runs = Some(10);
        let code = repair(config(&dir), args).await.unwrap();

        assert_eq!(code, 2);
        let result = read_json(&output.join(RESULT_FILE));
        assert_eq!(result["outcome"]["outcome"], "fatal");
        let reason = result["outcome"]["reason"].as_str().unwrap();
        assert!(reason.starts_with("Invalid configuration"));
        assert!(reason.contains("validation_runs"));
        assert!(!dir.path().join("work").exists());
    }

    #[tokio::test]
    async fn test_experiment_records_every_run() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("bank");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&project).unwrap();

        let mut repair = args(&project, &output);
        repair.population = Some(0);
        let code = experiment(config(&dir), ExperimentArgs { repair, repeat: 3 })
            .await
            .unwrap();

        assert_eq!(code, 2);
        let summary = read_json(&output.join(EXPERIMENT_FILE));
        assert_eq!(summary["runs"], 3);
        assert_eq!(summary["fatal"], 3);
        assert_eq!(summary["fixes"], 0);
        assert_eq!(summary["results"][2]["run"], 3);
        assert!(summary["results"][0]["errors"][0]
            .as_str()
            .unwrap()
            .contains("population_size"));
    }

    #[tokio::test]
    async fn test_experiment_rejects_zero_repeat() {
        let dir = TempDir::new().unwrap();
        let repair = args(dir.path(), &dir.path().join("out"));
        let err = experiment(config(&dir), ExperimentArgs { repair, repeat: 0 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--repeat"));
    }
}
