//! Producing mutated variants of a candidate's source files.
//!
//! This module provides:
//! - `MutationApplier`, the seam to the external source transformation tool
//! - `apply_cached`, which makes one (candidate, operator) application happen
//!   at most once per output directory
//! - `CommandApplier`, the shipped applier that drives a command-line tool

pub mod command;

pub use command::CommandApplier;

use crate::operators::OperatorDescriptor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Marker written once an application has finished.
pub const COMPLETE_MARKER: &str = ".complete";

/// One mutated copy of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    /// Project-relative path of the file this variant replaces
    pub target: String,
    /// Location of the mutated copy
    pub file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch the mutation tool for '{target}': {message}")]
    Launch { target: String, message: String },

    #[error("Invalid mutation command: {0}")]
    Command(String),
}

impl MutationError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Applies a mutation operator to source files.
#[async_trait]
pub trait MutationApplier: Send + Sync {
    /// Write mutated copies of every file in `targets` (relative to
    /// `source_tree`) into `out_dir/<target>/`. Zero or more copies may be
    /// produced per target.
    async fn mutate(
        &self,
        source_tree: &Path,
        operator: &OperatorDescriptor,
        targets: &[String],
        out_dir: &Path,
    ) -> Result<(), MutationError>;
}

/// Apply `operator` to `source_tree` once, then reuse its output.
///
/// `out_dir` is the deterministic location for this (candidate, operator)
/// pair. A directory without the completion marker is left over from an
/// interrupted application and is regenerated.
pub async fn apply_cached(
    applier: &dyn MutationApplier,
    source_tree: &Path,
    operator: &OperatorDescriptor,
    targets: &[String],
    out_dir: &Path,
) -> Result<Vec<Variant>, MutationError> {
    let marker = out_dir.join(COMPLETE_MARKER);
    if marker.is_file() {
        tracing::debug!("Reusing {} output in {}", operator.id, out_dir.display());
        return collect_variants(out_dir, targets);
    }

    if out_dir.exists() {
        tokio::fs::remove_dir_all(out_dir)
            .await
            .map_err(|e| MutationError::io(out_dir, e))?;
    }
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| MutationError::io(out_dir, e))?;

    applier.mutate(source_tree, operator, targets, out_dir).await?;

    tokio::fs::write(&marker, operator.id)
        .await
        .map_err(|e| MutationError::io(&marker, e))?;

    collect_variants(out_dir, targets)
}

/// Every file under `out_dir/<target>/`, per target, in name order.
pub fn collect_variants(out_dir: &Path, targets: &[String]) -> Result<Vec<Variant>, MutationError> {
    let mut variants = Vec::new();

    for target in targets {
        let dir = out_dir.join(target);
        if !dir.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&dir)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| MutationError::io(&dir, e.into()))?;
            if entry.file_type().is_file() {
                variants.push(Variant {
                    target: target.clone(),
                    file: entry.into_path(),
                });
            }
        }
    }

    Ok(variants)
}
