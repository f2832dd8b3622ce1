//! Candidate programs, the generations holding them, and edit identity.

use crate::harness::TestingSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Position of an individual in the population: `(generation, id)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct IndividualKey {
    pub generation: usize,
    pub id: usize,
}

impl IndividualKey {
    pub fn new(generation: usize, id: usize) -> Self {
        Self { generation, id }
    }
}

impl std::fmt::Display for IndividualKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.generation, self.id)
    }
}

/// Identity of an edit: the sorted set of project-relative paths whose
/// content differs from the original program.
///
/// Two mutants are equal when they touch the same files, whatever the
/// content of those files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mutant {
    files: BTreeSet<String>,
}

impl Mutant {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// Changed files in sorted order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// The original program: nothing differs.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl std::fmt::Display for Mutant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.files.is_empty() {
            return write!(f, "{{}}");
        }
        let files: Vec<&str> = self.files().collect();
        write!(f, "{{{}}}", files.join(", "))
    }
}

/// Errors from population bookkeeping
#[derive(Debug, thiserror::Error)]
pub enum PopulationError {
    #[error("Individual {0} has already been tested")]
    AlreadyTested(IndividualKey),

    #[error("Individual {0} has not been tested")]
    NotTested(IndividualKey),
}

/// One candidate program variant.
#[derive(Debug, Clone, Serialize)]
pub struct Individual {
    pub key: IndividualKey,
    /// Directory holding this variant's source files
    pub tree: PathBuf,
    /// Individual this one was mutated from
    pub source: Option<IndividualKey>,
    /// Operator applied to `source`
    pub operator: Option<String>,
    pub mutant: Mutant,
    summary: Option<TestingSummary>,
    validation: Option<TestingSummary>,
}

impl Individual {
    /// The unmodified program, the single member of generation 0.
    pub fn original(tree: impl Into<PathBuf>) -> Self {
        Self {
            key: IndividualKey::new(0, 0),
            tree: tree.into(),
            source: None,
            operator: None,
            mutant: Mutant::default(),
            summary: None,
            validation: None,
        }
    }

    /// A variant produced by applying `operator` to `source`.
    pub fn derived(
        key: IndividualKey,
        tree: impl Into<PathBuf>,
        source: IndividualKey,
        operator: impl Into<String>,
        mutant: Mutant,
    ) -> Self {
        Self {
            key,
            tree: tree.into(),
            source: Some(source),
            operator: Some(operator.into()),
            mutant,
            summary: None,
            validation: None,
        }
    }

    pub fn tree(&self) -> &Path {
        &self.tree
    }

    /// Record the baseline test summary. An individual is tested once.
    pub fn record_summary(&mut self, summary: TestingSummary) -> Result<(), PopulationError> {
        if self.summary.is_some() {
            return Err(PopulationError::AlreadyTested(self.key));
        }
        self.summary = Some(summary);
        Ok(())
    }

    /// Record the extended validation summary. Requires a baseline summary.
    pub fn record_validation(&mut self, summary: TestingSummary) -> Result<(), PopulationError> {
        if self.summary.is_none() {
            return Err(PopulationError::NotTested(self.key));
        }
        self.validation = Some(summary);
        Ok(())
    }

    pub fn summary(&self) -> Option<&TestingSummary> {
        self.summary.as_ref()
    }

    pub fn validation(&self) -> Option<&TestingSummary> {
        self.validation.as_ref()
    }

    pub fn has_been_tested(&self) -> bool {
        self.summary.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Fitness in `[0, 1]`, or negative infinity until tested.
    pub fn score(&self) -> f64 {
        self.summary
            .as_ref()
            .and_then(TestingSummary::fitness)
            .unwrap_or(f64::NEG_INFINITY)
    }

    /// Every baseline run succeeded.
    pub fn is_final_candidate(&self) -> bool {
        self.summary.as_ref().is_some_and(TestingSummary::all_success)
    }
}

/// Individuals sharing a generation index, in creation order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Generation {
    index: usize,
    individuals: Vec<Individual>,
}

impl Generation {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            individuals: Vec::new(),
        }
    }

    /// Key the next pushed individual will receive.
    pub fn next_key(&self) -> IndividualKey {
        IndividualKey::new(self.index, self.individuals.len())
    }

    pub fn push(&mut self, individual: Individual) {
        self.individuals.push(individual);
    }

    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individuals.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Individual> {
        self.individuals.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Individual> {
        self.individuals.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Individual> {
        self.individuals.iter()
    }

    /// Individuals scoring strictly above `score`.
    pub fn better_than(&self, score: f64) -> impl Iterator<Item = &Individual> {
        self.individuals.iter().filter(move |i| i.score() > score)
    }

    /// Individuals scoring at or above `score`.
    pub fn at_least(&self, score: f64) -> impl Iterator<Item = &Individual> {
        self.individuals.iter().filter(move |i| i.score() >= score)
    }

    /// Highest-scoring individual; the earliest one wins a tie.
    pub fn best(&self) -> Option<&Individual> {
        let mut best: Option<&Individual> = None;
        for individual in &self.individuals {
            match best {
                Some(b) if individual.score() <= b.score() => {}
                _ => best = Some(individual),
            }
        }
        best
    }
}

/// Every generation of one repair run. Generation 0 is the original program.
#[derive(Debug, Clone, Serialize)]
pub struct Population {
    generations: Vec<Generation>,
}

impl Population {
    pub fn new(original: Individual) -> Self {
        let mut generation = Generation::new(0);
        generation.push(original);
        Self {
            generations: vec![generation],
        }
    }

    pub fn original(&self) -> Option<&Individual> {
        self.individual(IndividualKey::new(0, 0))
    }

    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    pub fn generation(&self, index: usize) -> Option<&Generation> {
        self.generations.get(index)
    }

    pub fn push_generation(&mut self, generation: Generation) {
        self.generations.push(generation);
    }

    pub fn individual(&self, key: IndividualKey) -> Option<&Individual> {
        self.generations.get(key.generation)?.get(key.id)
    }

    pub fn individual_mut(&mut self, key: IndividualKey) -> Option<&mut Individual> {
        self.generations.get_mut(key.generation)?.get_mut(key.id)
    }

    /// Chain of individuals from the original program down to `key`.
    pub fn lineage(&self, key: IndividualKey) -> Vec<&Individual> {
        let mut chain = Vec::new();
        let mut current = self.individual(key);
        while let Some(individual) = current {
            chain.push(individual);
            current = individual.source.and_then(|k| self.individual(k));
        }
        chain.reverse();
        chain
    }

    /// Operators applied on the way from the original program to `key`.
    pub fn operator_lineage(&self, key: IndividualKey) -> Vec<String> {
        self.lineage(key)
            .into_iter()
            .filter_map(|i| i.operator.clone())
            .collect()
    }
}
