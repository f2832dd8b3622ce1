//! On-disk layout of one repair run.
//!
//! ```text
//! <root>/project/                    working copy of the target project
//! <root>/generations/<g>/<i>/        source snapshot of individual g.i
//! <root>/mutants/<g>/<i>/<operator>/ mutation tool output
//! ```
//!
//! Only the mutable source files travel between the working copy and the
//! snapshots; everything else in `project/` stays as copied.

use crate::mutation::Variant;
use crate::population::{IndividualKey, Mutant};
use crate::project_config::ProjectConfig;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SKIP_DIRS: &[&str] = &["target", "build", "bin", ".git"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Project directory not found: {0}")]
    ProjectNotFound(String),

    #[error("No source files matching {patterns:?} in {project}")]
    NoSources {
        project: String,
        patterns: Vec<String>,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy {from} to {to}: {message}")]
    Copy {
        from: String,
        to: String,
        message: String,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Hex SHA-256 of some file content.
fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Directory tree of one repair run.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    original: PathBuf,
    project_dir: PathBuf,
    sources: Vec<String>,
    baseline: HashMap<String, String>,
    // Removes the tree on drop unless the workspace is kept
    _temp: Option<tempfile::TempDir>,
}

impl Workspace {
    /// Lay out a fresh workspace for `original`.
    ///
    /// The workspace lives under `work_root` (or the system temp directory).
    /// It is deleted when dropped unless `keep` is set.
    pub async fn create(
        original: &Path,
        work_root: Option<&Path>,
        keep: bool,
        project: &ProjectConfig,
    ) -> Result<Self, WorkspaceError> {
        if !original.is_dir() {
            return Err(WorkspaceError::ProjectNotFound(
                original.display().to_string(),
            ));
        }

        let base = work_root
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(|e| WorkspaceError::io(&base, e))?;

        let (root, temp) = if keep {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%3f");
            let root = base.join(format!("arc-{}", stamp));
            tokio::fs::create_dir_all(&root)
                .await
                .map_err(|e| WorkspaceError::io(&root, e))?;
            (root, None)
        } else {
            let temp = tempfile::Builder::new()
                .prefix("arc-")
                .tempdir_in(&base)
                .map_err(|e| WorkspaceError::io(&base, e))?;
            (temp.path().to_path_buf(), Some(temp))
        };

        let sources = discover_sources(original, project)?;
        if sources.is_empty() {
            return Err(WorkspaceError::NoSources {
                project: original.display().to_string(),
                patterns: project.sources.clone(),
            });
        }

        let mut baseline = HashMap::new();
        for rel in &sources {
            let path = original.join(rel);
            let content = tokio::fs::read(&path)
                .await
                .map_err(|e| WorkspaceError::io(&path, e))?;
            baseline.insert(rel.clone(), compute_hash(&content));
        }

        let project_dir = root.join("project");
        copy_tree(original, &project_dir).await?;

        tracing::info!(
            "Workspace at {} with {} source file(s)",
            root.display(),
            sources.len()
        );

        Ok(Self {
            root,
            original: original.to_path_buf(),
            project_dir,
            sources,
            baseline,
            _temp: temp,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the compiler and test suite run in.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Mutable source files, project-relative, sorted.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn generation_dir(&self, key: IndividualKey) -> PathBuf {
        self.root
            .join("generations")
            .join(key.generation.to_string())
            .join(key.id.to_string())
    }

    /// Output location for applying `operator` to individual `key`.
    pub fn mutant_dir(&self, key: IndividualKey, operator: &str) -> PathBuf {
        self.root
            .join("mutants")
            .join(key.generation.to_string())
            .join(key.id.to_string())
            .join(operator)
    }

    /// Copy the working copy's sources into the snapshot for `key`.
    pub async fn snapshot(&self, key: IndividualKey) -> Result<PathBuf, WorkspaceError> {
        let dest = self.generation_dir(key);
        copy_sources(&self.sources, &self.project_dir, &dest).await?;
        Ok(dest)
    }

    /// Overwrite the working copy's sources with those in `tree`.
    pub async fn restore(&self, tree: &Path) -> Result<(), WorkspaceError> {
        copy_sources(&self.sources, tree, &self.project_dir).await
    }

    /// Restore `tree` into the working copy, then put `variant` in place of
    /// its target.
    pub async fn install_variant(&self, tree: &Path, variant: &Variant) -> Result<(), WorkspaceError> {
        self.restore(tree).await?;
        let dest = self.project_dir.join(&variant.target);
        tokio::fs::copy(&variant.file, &dest)
            .await
            .map_err(|e| WorkspaceError::io(&variant.file, e))?;
        Ok(())
    }

    /// Whether `file` differs from the original content of source `rel`.
    pub async fn differs_from_original(&self, rel: &str, file: &Path) -> Result<bool, WorkspaceError> {
        let content = tokio::fs::read(file)
            .await
            .map_err(|e| WorkspaceError::io(file, e))?;
        Ok(self.baseline.get(rel) != Some(&compute_hash(&content)))
    }

    /// Identity of `variant` applied on top of an individual whose identity
    /// is `base`: the variant's target is in the set iff its new content
    /// differs from the original.
    pub async fn identity_of(&self, base: &Mutant, variant: &Variant) -> Result<Mutant, WorkspaceError> {
        let changed = self.differs_from_original(&variant.target, &variant.file).await?;
        let files = base
            .files()
            .filter(|f| *f != variant.target)
            .map(String::from)
            .chain(changed.then(|| variant.target.clone()));
        Ok(Mutant::new(files))
    }

    /// Write a complete project to `dest`: the original project with the
    /// sources from `tree` on top.
    pub async fn export(&self, tree: &Path, dest: &Path) -> Result<(), WorkspaceError> {
        copy_tree(&self.original, dest).await?;
        copy_sources(&self.sources, tree, dest).await
    }
}

/// Project-relative paths (with `/` separators) of the mutable sources.
fn discover_sources(original: &Path, project: &ProjectConfig) -> Result<Vec<String>, WorkspaceError> {
    let mut sources = Vec::new();

    for entry in walkdir::WalkDir::new(original)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            // The root itself may be a dot-directory
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
        })
    {
        let entry = entry.map_err(|e| WorkspaceError::io(original, e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(original) else {
            continue;
        };
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if project.is_source(&rel) {
            sources.push(rel);
        }
    }

    sources.sort();
    Ok(sources)
}

/// Copy the contents of `from` into `to`, overwriting what is there.
async fn copy_tree(from: &Path, to: &Path) -> Result<(), WorkspaceError> {
    let copy_error = |message: String| WorkspaceError::Copy {
        from: from.display().to_string(),
        to: to.display().to_string(),
        message,
    };
    let from = from.to_path_buf();
    let to = to.to_path_buf();

    // fs_extra is synchronous
    tokio::task::spawn_blocking(move || -> Result<(), String> {
        std::fs::create_dir_all(&to).map_err(|e| e.to_string())?;

        let options = fs_extra::dir::CopyOptions {
            overwrite: true,
            skip_exist: false,
            buffer_size: 64 * 1024,
            copy_inside: true,
            content_only: true,
            depth: 0,
        };

        fs_extra::dir::copy(&from, &to, &options)
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| copy_error(e.to_string()))?
    .map_err(copy_error)
}

async fn copy_sources(sources: &[String], from: &Path, to: &Path) -> Result<(), WorkspaceError> {
    for rel in sources {
        let src = from.join(rel);
        let dest = to.join(rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::io(parent, e))?;
        }
        tokio::fs::copy(&src, &dest)
            .await
            .map_err(|e| WorkspaceError::io(&src, e))?;
    }
    Ok(())
}
