//! Genetic search for a repaired program.
//!
//! Generation 0 is the original program. Each later generation holds
//! variants obtained by applying one mutation operator to a promising
//! individual of an earlier generation. The search stops at the first
//! individual that passes every run of its baseline batch and of a larger
//! validation batch, or when the generation cap is reached.

pub mod selection;
pub mod validator;

pub use validator::FixValidator;

use crate::compile::Compiler;
use crate::config::Config;
use crate::events::{EventLog, Phase};
use crate::harness::process::truncate_output;
use crate::harness::{
    HarnessError, RunMode, SuiteRunner, TestHarness, TestStatus, TestingSummary,
};
use crate::mutation::{apply_cached, MutationApplier, Variant};
use crate::operators::{OperatorDescriptor, OperatorError, OperatorRegistry};
use crate::population::{Generation, Individual, IndividualKey, Mutant, Population};
use crate::workspace::{Workspace, WorkspaceError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_COMPILE_LOG_BYTES: usize = 4000;

/// Problems that prevent a search from starting
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Operators(#[from] OperatorError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("The original program does not compile:\n{0}")]
    BaselineCompile(String),

    #[error(transparent)]
    Harness(#[from] HarnessError),
}

/// Cooperative stop flag shared with the search.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    should_stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the search to halt at its next checkpoint
    pub fn stop(&self) {
        tracing::info!("Stop requested, halting at the next checkpoint...");
        self.should_stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }
}

/// The external collaborators a search drives.
#[derive(Clone)]
pub struct Collaborators {
    pub applier: Arc<dyn MutationApplier>,
    pub compiler: Arc<dyn Compiler>,
    pub runner: Arc<dyn SuiteRunner>,
}

/// Why a search ended without a fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustReason {
    GenerationCap,
    StopRequested,
}

impl std::fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GenerationCap => write!(f, "generation cap reached"),
            Self::StopRequested => write!(f, "stop requested"),
        }
    }
}

/// An accepted fix.
#[derive(Debug, Clone, Serialize)]
pub struct FixRecord {
    pub key: IndividualKey,
    /// Operators applied on the way from the original program
    pub operators: Vec<String>,
    pub mutant: Mutant,
    pub baseline: TestingSummary,
    pub validation: TestingSummary,
    /// Source snapshot of the fixed program
    pub tree: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Fixed(FixRecord),
    Exhausted { reason: ExhaustReason },
    Fatal { reason: String },
}

impl RepairOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fixed(_) => 0,
            Self::Exhausted { .. } => 1,
            Self::Fatal { .. } => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Fixed(_) => "fixed",
            Self::Exhausted { .. } => "exhausted",
            Self::Fatal { .. } => "fatal",
        }
    }
}

/// Everything a finished search produced.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub outcome: RepairOutcome,
    /// Absent when setup failed
    pub population: Option<Population>,
    pub timeout_ms: Option<u64>,
    pub phases: Vec<Phase>,
}

impl RepairReport {
    /// Every individual that received a baseline summary.
    pub fn tested_individuals(&self) -> impl Iterator<Item = &Individual> {
        self.population
            .iter()
            .flat_map(|p| p.generations())
            .flat_map(|g| g.iter())
            .filter(|i| i.has_been_tested())
    }
}

/// Drives one repair run over a prepared workspace.
pub struct SearchEngine<'a> {
    config: &'a Config,
    registry: &'a OperatorRegistry,
    workspace: &'a Workspace,
    collaborators: Collaborators,
    rng: StdRng,
    seen: HashSet<Mutant>,
    events: EventLog,
    stop: StopHandle,
}

impl<'a> SearchEngine<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a OperatorRegistry,
        workspace: &'a Workspace,
        collaborators: Collaborators,
        events: EventLog,
    ) -> Self {
        let rng = match config.search.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            config,
            registry,
            workspace,
            collaborators,
            rng,
            seen: HashSet::new(),
            events,
            stop: StopHandle::new(),
        }
    }

    /// Handle for stopping this search from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the search to completion. Failures end up in the report's
    /// outcome; nothing is returned as an error.
    pub async fn run(mut self) -> RepairReport {
        self.events.start_phase("Setup");

        let (mut population, harness) = match self.setup().await {
            Ok(ready) => ready,
            Err(e) => {
                let reason = e.to_string();
                self.events.fatal(reason.clone());
                self.events.finish_phase();
                return RepairReport {
                    outcome: RepairOutcome::Fatal { reason },
                    population: None,
                    timeout_ms: None,
                    phases: self.events.into_phases(),
                };
            }
        };

        let outcome = self.search(&mut population, &harness).await;
        match &outcome {
            RepairOutcome::Fixed(fix) => tracing::info!(
                "Fix found: individual {} via [{}]",
                fix.key,
                fix.operators.join(", ")
            ),
            RepairOutcome::Exhausted { reason } => {
                tracing::info!("No fix found: {}", reason)
            }
            RepairOutcome::Fatal { reason } => self.events.fatal(reason.clone()),
        }
        self.events.finish_phase();

        RepairReport {
            outcome,
            population: Some(population),
            timeout_ms: Some(harness.timeout().as_millis() as u64),
            phases: self.events.into_phases(),
        }
    }

    async fn setup(&mut self) -> Result<(Population, TestHarness), SetupError> {
        self.config
            .validate()
            .map_err(|e| SetupError::Config(format!("{:#}", e)))?;

        let original_tree = self.workspace.snapshot(IndividualKey::new(0, 0)).await?;

        let compiled = self
            .collaborators
            .compiler
            .compile(self.workspace.project_dir())
            .await;
        if !compiled.success {
            return Err(SetupError::BaselineCompile(truncate_output(
                &compiled.log,
                MAX_COMPILE_LOG_BYTES,
            )));
        }

        let harness_config = &self.config.harness;
        let timeout = match harness_config.timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => {
                self.events.debug(format!(
                    "Calibrating the run timeout over {} runs",
                    harness_config.calibration_runs
                ));
                let (timeout, summary) = TestHarness::calibrate(
                    Arc::clone(&self.collaborators.runner),
                    self.workspace.project_dir(),
                    harness_config.calibration_runs,
                    Duration::from_millis(harness_config.calibration_ceiling_ms),
                    harness_config.timeout_multiplier,
                )
                .await?;
                self.events.debug(format!(
                    "Calibration runs: {}, average {}ms",
                    summary.describe(),
                    summary.average_duration_ms()
                ));
                timeout
            }
        };
        self.events
            .debug(format!("Run timeout: {}ms", timeout.as_millis()));

        // The original program is never a mutant of anything
        self.seen.insert(Mutant::default());

        let population = Population::new(Individual::original(original_tree));
        let harness = TestHarness::new(Arc::clone(&self.collaborators.runner), timeout);
        Ok((population, harness))
    }

    async fn search(&mut self, population: &mut Population, harness: &TestHarness) -> RepairOutcome {
        let validator = FixValidator::new(harness.clone(), self.config.search.validation_runs);
        let original = IndividualKey::new(0, 0);

        self.events.start_phase("Generation 0");
        if !self.evaluate(population, original, harness).await {
            return RepairOutcome::Fatal {
                reason: "The original program could not be tested".to_string(),
            };
        }
        if let Some(summary) = population.original().and_then(Individual::summary) {
            if summary.count(TestStatus::Invalid) == summary.run_count() {
                let detail = summary
                    .results()
                    .first()
                    .and_then(|r| r.notes.first().cloned())
                    .unwrap_or_default();
                return RepairOutcome::Fatal {
                    reason: format!("The original program could not be tested: {}", detail),
                };
            }
        }

        if self.stop.is_stop_requested() {
            return exhausted(ExhaustReason::StopRequested);
        }
        if let Some(fix) = self.validate_generation(population, 0, &validator).await {
            return RepairOutcome::Fixed(fix);
        }

        for g in 1..=self.config.search.max_generations {
            if self.stop.is_stop_requested() {
                return exhausted(ExhaustReason::StopRequested);
            }
            self.events.start_phase(format!("Generation {}", g));

            let generation = match self.populate(population, g).await {
                Ok(generation) => generation,
                Err(reason) => return RepairOutcome::Fatal { reason },
            };
            let size = generation.len();
            population.push_generation(generation);

            if self.stop.is_stop_requested() {
                return exhausted(ExhaustReason::StopRequested);
            }

            let mut tested = 0;
            for id in 0..size {
                if self
                    .evaluate(population, IndividualKey::new(g, id), harness)
                    .await
                {
                    tested += 1;
                }
                if self.stop.is_stop_requested() {
                    return exhausted(ExhaustReason::StopRequested);
                }
            }
            if tested == 0 {
                return RepairOutcome::Fatal {
                    reason: format!("No individual of generation {} could be tested", g),
                };
            }

            if let Some(best) = population.generation(g).and_then(Generation::best) {
                tracing::info!(
                    "Generation {}: {} individual(s), best {} with fitness {:.3}",
                    g,
                    size,
                    best.key,
                    best.score()
                );
            }

            if let Some(fix) = self.validate_generation(population, g, &validator).await {
                return RepairOutcome::Fixed(fix);
            }
        }

        exhausted(ExhaustReason::GenerationCap)
    }

    /// Fill generation `g` with new, compilable mutants.
    async fn populate(&mut self, population: &Population, g: usize) -> Result<Generation, String> {
        let candidates = selection::mutation_candidates(population, g);
        if candidates.is_empty() {
            return Err(format!("No mutation candidates for generation {}", g));
        }
        self.events.debug(format!(
            "Mutation candidates: {}",
            candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));

        let target = self.config.search.population_size;
        let mut generation = Generation::new(g);

        for slot in 0..target {
            let start = (slot / 3) % candidates.len();
            if self
                .fill_slot(population, &candidates, start, &mut generation)
                .await
            {
                continue;
            }
            if slot == 0 {
                return Err(format!("No mutants could be produced for generation {}", g));
            }
            self.events.warning(format!(
                "Only {} of {} mutants could be produced for generation {}",
                slot, target, g
            ));
            break;
        }

        Ok(generation)
    }

    /// Visit candidates round-robin from `start` until one yields a new,
    /// compilable variant. Returns whether an individual was added.
    async fn fill_slot(
        &mut self,
        population: &Population,
        candidates: &[IndividualKey],
        start: usize,
        generation: &mut Generation,
    ) -> bool {
        for offset in 0..candidates.len() {
            let key = candidates[(start + offset) % candidates.len()];
            let Some(candidate) = population.individual(key) else {
                continue;
            };

            let category = selection::choose_category(candidate.summary(), &mut self.rng);
            let operators = selection::operators_to_try(self.registry, category, &mut self.rng);

            for operator in operators {
                let mut variants = self.variants_for(candidate, operator).await;
                variants.shuffle(&mut self.rng);

                for variant in &variants {
                    if let Some(individual) = self
                        .try_variant(candidate, operator, variant, generation.next_key())
                        .await
                    {
                        generation.push(individual);
                        return true;
                    }
                }
            }
        }
        false
    }

    async fn variants_for(
        &mut self,
        candidate: &Individual,
        operator: &OperatorDescriptor,
    ) -> Vec<Variant> {
        let out_dir = self.workspace.mutant_dir(candidate.key, operator.id);
        match apply_cached(
            self.collaborators.applier.as_ref(),
            candidate.tree(),
            operator,
            self.workspace.sources(),
            &out_dir,
        )
        .await
        {
            Ok(variants) => variants,
            Err(e) => {
                self.events.warning(format!(
                    "Applying {} to {} failed: {}",
                    operator.id, candidate.key, e
                ));
                Vec::new()
            }
        }
    }

    /// Turn `variant` into individual `key` if it is a new edit that
    /// compiles.
    async fn try_variant(
        &mut self,
        candidate: &Individual,
        operator: &OperatorDescriptor,
        variant: &Variant,
        key: IndividualKey,
    ) -> Option<Individual> {
        let identity = match self.workspace.identity_of(&candidate.mutant, variant).await {
            Ok(identity) => identity,
            Err(e) => {
                self.events.warning(e.to_string());
                return None;
            }
        };
        if self.seen.contains(&identity) {
            self.events
                .debug(format!("Skipping duplicate mutant {}", identity));
            return None;
        }

        if let Err(e) = self.workspace.install_variant(candidate.tree(), variant).await {
            self.events.warning(e.to_string());
            return None;
        }
        let compiled = self
            .collaborators
            .compiler
            .compile(self.workspace.project_dir())
            .await;
        if !compiled.success {
            self.events.debug(format!(
                "{} applied to {} ({}) does not compile",
                operator.id, candidate.key, variant.target
            ));
            return None;
        }

        let tree = match self.workspace.snapshot(key).await {
            Ok(tree) => tree,
            Err(e) => {
                self.events.warning(e.to_string());
                return None;
            }
        };

        self.events.debug(format!(
            "{}: {} applied to {} changes {}",
            key, operator.id, candidate.key, identity
        ));
        self.seen.insert(identity.clone());
        Some(Individual::derived(
            key,
            tree,
            candidate.key,
            operator.id,
            identity,
        ))
    }

    /// Restore an individual into the working project and compile it.
    async fn install(&mut self, key: IndividualKey, tree: &Path) -> bool {
        if let Err(e) = self.workspace.restore(tree).await {
            self.events
                .warning(format!("Could not materialize {}: {}", key, e));
            return false;
        }
        let compiled = self
            .collaborators
            .compiler
            .compile(self.workspace.project_dir())
            .await;
        if !compiled.success {
            self.events
                .warning(format!("{} does not compile, leaving it untested", key));
            return false;
        }
        true
    }

    /// Test one individual and record its summary. Returns whether a
    /// summary was recorded.
    async fn evaluate(
        &mut self,
        population: &mut Population,
        key: IndividualKey,
        harness: &TestHarness,
    ) -> bool {
        let Some(tree) = population.individual(key).map(|i| i.tree().to_path_buf()) else {
            return false;
        };
        if !self.install(key, &tree).await {
            return false;
        }

        let summary = harness
            .execute(
                self.workspace.project_dir(),
                self.config.search.runs_per_individual,
                RunMode::Scoring,
            )
            .await;
        self.events.debug(format!(
            "{}: fitness {:.3} ({})",
            key,
            summary.fitness().unwrap_or(0.0),
            summary.describe()
        ));
        if !summary.failed_tests().is_empty() {
            self.events.debug(format!(
                "{}: failing tests {}",
                key,
                summary.failed_tests().join(", ")
            ));
        }

        let Some(individual) = population.individual_mut(key) else {
            return false;
        };
        match individual.record_summary(summary) {
            Ok(()) => true,
            Err(e) => {
                self.events.error(e.to_string());
                false
            }
        }
    }

    /// Validate the final candidates of generation `g` in id order.
    async fn validate_generation(
        &mut self,
        population: &mut Population,
        g: usize,
        validator: &FixValidator,
    ) -> Option<FixRecord> {
        let finalists: Vec<(IndividualKey, PathBuf)> = population
            .generation(g)?
            .iter()
            .filter(|i| i.is_final_candidate())
            .map(|i| (i.key, i.tree().to_path_buf()))
            .collect();

        for (key, tree) in finalists {
            if !self.install(key, &tree).await {
                continue;
            }
            let individual = population.individual_mut(key)?;
            if validator
                .is_final_solution(individual, self.workspace.project_dir(), &mut self.events)
                .await
            {
                return fix_record(population, key);
            }
            if self.stop.is_stop_requested() {
                return None;
            }
        }
        None
    }
}

fn exhausted(reason: ExhaustReason) -> RepairOutcome {
    RepairOutcome::Exhausted { reason }
}

fn fix_record(population: &Population, key: IndividualKey) -> Option<FixRecord> {
    let individual = population.individual(key)?;
    Some(FixRecord {
        key,
        operators: population.operator_lineage(key),
        mutant: individual.mutant.clone(),
        baseline: individual.summary()?.clone(),
        validation: individual.validation()?.clone(),
        tree: individual.tree().to_path_buf(),
    })
}
