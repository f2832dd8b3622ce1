mod models;

pub use models::*;

use crate::search::{RepairOutcome, RepairReport};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

/// Database wrapper for the run history
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .with_context(|| format!("Failed to connect to database: {}", database_url))?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repair_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_path TEXT NOT NULL,
                outcome TEXT NOT NULL,
                reason TEXT,
                generations INTEGER NOT NULL,
                individuals_tested INTEGER NOT NULL,
                best_fitness REAL,
                fix_key TEXT,
                fix_operators TEXT,
                timeout_ms INTEGER,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create repair_runs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evaluated_individuals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                generation INTEGER NOT NULL,
                individual INTEGER NOT NULL,
                source_key TEXT,
                operator TEXT,
                mutant TEXT NOT NULL,
                fitness REAL NOT NULL,
                runs INTEGER NOT NULL,
                status_counts_json TEXT NOT NULL,
                validated INTEGER,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (run_id) REFERENCES repair_runs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create evaluated_individuals table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_evaluated_individuals_run ON evaluated_individuals(run_id)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create evaluated_individuals index")?;

        Ok(())
    }

    /// Store a finished run and every individual it tested.
    pub async fn record_run(
        &self,
        project_path: &Path,
        started_at: DateTime<Utc>,
        report: &RepairReport,
    ) -> Result<i64> {
        let (reason, fix_key, fix_operators) = match &report.outcome {
            RepairOutcome::Fixed(fix) => (None, Some(fix.key.to_string()), Some(fix.operators.join(","))),
            RepairOutcome::Exhausted { reason } => (Some(reason.to_string()), None, None),
            RepairOutcome::Fatal { reason } => (Some(reason.clone()), None, None),
        };
        let generations = report
            .population
            .as_ref()
            .map_or(0, |p| p.generations().len() as i64);
        let best_fitness = report
            .tested_individuals()
            .map(|i| i.score())
            .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));

        let mut tx = self.pool.begin().await.context("Failed to start transaction")?;

        let row = sqlx::query(
            r#"
            INSERT INTO repair_runs
                (project_path, outcome, reason, generations, individuals_tested,
                 best_fitness, fix_key, fix_operators, timeout_ms, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(project_path.display().to_string())
        .bind(report.outcome.label())
        .bind(reason)
        .bind(generations)
        .bind(report.tested_individuals().count() as i64)
        .bind(best_fitness)
        .bind(fix_key)
        .bind(fix_operators)
        .bind(report.timeout_ms.map(|ms| ms as i64))
        .bind(started_at.to_rfc3339())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to record repair run")?;
        let run_id: i64 = sqlx::Row::get(&row, "id");

        for individual in report.tested_individuals() {
            let Some(summary) = individual.summary() else {
                continue;
            };
            let status_counts = serde_json::to_string(summary.status_counts())
                .context("Failed to serialize status counts")?;

            sqlx::query(
                r#"
                INSERT INTO evaluated_individuals
                    (run_id, generation, individual, source_key, operator, mutant,
                     fitness, runs, status_counts_json, validated)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(individual.key.generation as i64)
            .bind(individual.key.id as i64)
            .bind(individual.source.map(|k| k.to_string()))
            .bind(individual.operator.as_deref())
            .bind(individual.mutant.to_string())
            .bind(individual.score())
            .bind(summary.run_count() as i64)
            .bind(status_counts)
            .bind(individual.validation().map(|v| v.all_success()))
            .execute(&mut *tx)
            .await
            .context("Failed to record evaluated individual")?;
        }

        tx.commit().await.context("Failed to commit repair run")?;
        Ok(run_id)
    }

    /// Most recent runs first
    pub async fn get_recent_runs(&self, limit: i64) -> Result<Vec<RepairRun>> {
        let runs = sqlx::query_as::<_, RepairRun>(
            "SELECT * FROM repair_runs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch repair runs")?;

        Ok(runs)
    }

    /// Individuals tested in a run, in discovery order
    pub async fn get_individuals(&self, run_id: i64) -> Result<Vec<EvaluatedIndividual>> {
        let individuals = sqlx::query_as::<_, EvaluatedIndividual>(
            "SELECT * FROM evaluated_individuals WHERE run_id = ? ORDER BY generation, individual",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch evaluated individuals")?;

        Ok(individuals)
    }
}
