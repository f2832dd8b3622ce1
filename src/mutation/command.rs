use super::{MutationApplier, MutationError};
use crate::command::run_program_with_timeout;
use crate::config::MutationConfig;
use crate::operators::OperatorDescriptor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runs an external transformation tool once per target file.
#[derive(Debug, Clone)]
pub struct CommandApplier {
    template: String,
    operator_dir: PathBuf,
    timeout: Duration,
}

impl CommandApplier {
    pub fn new(config: &MutationConfig) -> Self {
        Self {
            template: config.command.clone(),
            operator_dir: config.operator_dir.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Tokenize the template, substitute placeholders per token and append
    /// the operator's parameters.
    fn build_argv(
        &self,
        source: &Path,
        operator: &OperatorDescriptor,
        out_file: &str,
        out_dir: &Path,
    ) -> Result<Vec<String>, MutationError> {
        let operator_path = self.operator_dir.join(operator.file);
        let source = source.display().to_string();
        let operator_path = operator_path.display().to_string();
        let out_dir = out_dir.display().to_string();

        let mut argv: Vec<String> = self
            .template
            .split_whitespace()
            .map(|token| {
                token
                    .replace("{source}", &source)
                    .replace("{operator}", &operator_path)
                    .replace("{out_file}", out_file)
                    .replace("{out_dir}", &out_dir)
            })
            .collect();

        if argv.is_empty() {
            return Err(MutationError::Command("command template is empty".to_string()));
        }

        argv.extend(operator.params.iter().map(|p| p.to_string()));
        Ok(argv)
    }
}

#[async_trait]
impl MutationApplier for CommandApplier {
    async fn mutate(
        &self,
        source_tree: &Path,
        operator: &OperatorDescriptor,
        targets: &[String],
        out_dir: &Path,
    ) -> Result<(), MutationError> {
        for target in targets {
            let source = source_tree.join(target);
            if !source.is_file() {
                tracing::warn!("Skipping {}: not found in {}", target, source_tree.display());
                continue;
            }

            let target_out = out_dir.join(target);
            tokio::fs::create_dir_all(&target_out)
                .await
                .map_err(|e| MutationError::io(&target_out, e))?;

            let out_file = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| target.clone());

            let argv = self.build_argv(&source, operator, &out_file, &target_out)?;
            let result =
                run_program_with_timeout(source_tree, &argv[0], &argv[1..], self.timeout).await;

            if result.exit_code.is_none() && !result.timed_out && !result.success {
                return Err(MutationError::Launch {
                    target: target.clone(),
                    message: result.output,
                });
            }

            if !result.success {
                tracing::warn!(
                    "{} failed on {} (exit {:?}, timed out: {})",
                    operator.id,
                    target,
                    result.exit_code,
                    result.timed_out
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::apply_cached;
    use crate::operators::OperatorRegistry;
    use tempfile::TempDir;

    fn applier(template: &str, operator_dir: &Path) -> CommandApplier {
        CommandApplier::new(&MutationConfig {
            command: template.to_string(),
            operator_dir: operator_dir.to_path_buf(),
            operators: Vec::new(),
            timeout_seconds: 10,
        })
    }

    // ==================== Argument building ====================

    #[test]
    fn test_build_argv_substitutes_and_appends_params() {
        let a = applier(
            "txl {source} {operator} - -outfile {out_file} -outdir {out_dir}",
            Path::new("/ops"),
        );
        let asat = OperatorRegistry::builtin().get("ASAT").unwrap();

        let argv = a
            .build_argv(
                Path::new("/proj/src/A.java"),
                asat,
                "A.java",
                Path::new("/out/src/A.java"),
            )
            .unwrap();

        assert_eq!(
            argv,
            vec![
                "txl",
                "/proj/src/A.java",
                "/ops/ASAT_RND.Txl",
                "-",
                "-outfile",
                "A.java",
                "-outdir",
                "/out/src/A.java",
                "-syncvar",
                "this",
            ]
        );
    }

    #[test]
    fn test_build_argv_keeps_paths_with_spaces_whole() {
        let a = applier("tool {source}", Path::new("ops"));
        let cso = OperatorRegistry::builtin().get("CSO").unwrap();

        let argv = a
            .build_argv(Path::new("/my project/A.java"), cso, "A.java", Path::new("/o"))
            .unwrap();
        assert_eq!(argv, vec!["tool", "/my project/A.java"]);
    }

    #[test]
    fn test_build_argv_empty_template() {
        let a = applier("   ", Path::new("ops"));
        let cso = OperatorRegistry::builtin().get("CSO").unwrap();
        let err = a
            .build_argv(Path::new("A.java"), cso, "A.java", Path::new("o"))
            .unwrap_err();
        assert!(matches!(err, MutationError::Command(_)));
    }

    // ==================== Running the tool ====================

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_tool_per_target() {
        let work = TempDir::new().unwrap();
        let ops = work.path().join("ops");
        let project = work.path().join("project");
        std::fs::create_dir_all(&ops).unwrap();
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join("src/A.java"), "class A { int x; }\n").unwrap();
        std::fs::write(project.join("src/B.java"), "class B {}").unwrap();

        // Writes two variants of the source into the output directory
        std::fs::write(
            ops.join("ASIM_RND.Txl"),
            "sed 's/int/long/' \"$1\" > \"$3/1_$2\"\ncp \"$1\" \"$3/2_$2\"\n",
        )
        .unwrap();

        let a = applier("sh {operator} {source} {out_file} {out_dir}", &ops);
        let asim = OperatorRegistry::builtin().get("ASIM").unwrap();
        let out_dir = work.path().join("mutants/0/0/ASIM");
        let targets = vec!["src/A.java".to_string(), "src/B.java".to_string()];

        let variants = apply_cached(&a, &project, asim, &targets, &out_dir)
            .await
            .unwrap();

        assert_eq!(variants.len(), 4);
        assert_eq!(variants[0].target, "src/A.java");
        assert!(variants[0].file.ends_with("src/A.java/1_A.java"));
        assert_eq!(
            std::fs::read_to_string(&variants[0].file).unwrap(),
            "class A { long x; }\n"
        );
        assert_eq!(variants[3].target, "src/B.java");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_target_is_skipped() {
        let work = TempDir::new().unwrap();
        let a = applier("sh -c true", work.path());
        let cso = OperatorRegistry::builtin().get("CSO").unwrap();

        let result = a
            .mutate(
                work.path(),
                cso,
                &["Missing.java".to_string()],
                &work.path().join("out"),
            )
            .await;
        assert!(result.is_ok());
        assert!(!work.path().join("out/Missing.java").exists());
    }

    #[tokio::test]
    async fn test_launch_failure_is_error() {
        let work = TempDir::new().unwrap();
        std::fs::write(work.path().join("A.java"), "class A {}").unwrap();
        let a = applier("definitely-not-a-real-tool-arc {source}", work.path());
        let cso = OperatorRegistry::builtin().get("CSO").unwrap();

        let err = a
            .mutate(work.path(), cso, &["A.java".to_string()], &work.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Launch { ref target, .. } if target == "A.java"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_failure_is_not_error() {
        let work = TempDir::new().unwrap();
        std::fs::write(work.path().join("A.java"), "class A {}").unwrap();
        let a = applier("sh -c false", work.path());
        let cso = OperatorRegistry::builtin().get("CSO").unwrap();

        let result = a
            .mutate(work.path(), cso, &["A.java".to_string()], &work.path().join("out"))
            .await;
        assert!(result.is_ok());
    }
}
