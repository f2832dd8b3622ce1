use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One finished repair run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RepairRun {
    pub id: i64,
    pub project_path: String,
    /// `fixed`, `exhausted` or `fatal`
    pub outcome: String,
    /// Exhaustion reason or fatal message
    pub reason: Option<String>,
    pub generations: i64,
    pub individuals_tested: i64,
    pub best_fitness: Option<f64>,
    /// `generation.id` of the accepted fix
    pub fix_key: Option<String>,
    /// Comma-separated operator lineage of the accepted fix
    pub fix_operators: Option<String>,
    pub timeout_ms: Option<i64>,
    pub started_at: String,
    pub finished_at: String,
}

impl RepairRun {
    pub fn is_fixed(&self) -> bool {
        self.outcome == "fixed"
    }
}

/// An individual that was tested during a run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EvaluatedIndividual {
    pub id: i64,
    pub run_id: i64,
    pub generation: i64,
    pub individual: i64,
    pub source_key: Option<String>,
    pub operator: Option<String>,
    /// Changed files, e.g. `{src/A.java, src/B.java}`
    pub mutant: String,
    pub fitness: f64,
    pub runs: i64,
    /// JSON map of test status to run count
    pub status_counts_json: String,
    /// Whether the validation batch was all successes; `None` if never validated
    pub validated: Option<bool>,
    pub created_at: String,
}

impl EvaluatedIndividual {
    pub fn key(&self) -> String {
        format!("{}.{}", self.generation, self.individual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(outcome: &str) -> RepairRun {
        RepairRun {
            id: 1,
            project_path: "/tmp/bank".to_string(),
            outcome: outcome.to_string(),
            reason: None,
            generations: 1,
            individuals_tested: 1,
            best_fitness: None,
            fix_key: None,
            fix_operators: None,
            timeout_ms: None,
            started_at: String::new(),
            finished_at: String::new(),
        }
    }

    #[test]
    fn test_is_fixed() {
        assert!(run("fixed").is_fixed());
        assert!(!run("exhausted").is_fixed());
        assert!(!run("fatal").is_fixed());
    }

    #[test]
    fn test_individual_key() {
        let individual = EvaluatedIndividual {
            id: 1,
            run_id: 1,
            generation: 3,
            individual: 12,
            source_key: Some("2.4".to_string()),
            operator: Some("ASAT".to_string()),
            mutant: "{A.java}".to_string(),
            fitness: 0.5,
            runs: 15,
            status_counts_json: "{}".to_string(),
            validated: None,
            created_at: String::new(),
        };
        assert_eq!(individual.key(), "3.12");
    }
}
