//! Concurrency mutation operators.
//!
//! Each operator is a source transformation program that adds, removes,
//! shrinks, shifts or exchanges synchronization. Operators are tagged with
//! the bug categories they can fix.

use serde::Serialize;
use std::path::Path;

/// Bug category an operator is expected to repair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BugCategory {
    DataRace,
    Deadlock,
}

impl std::fmt::Display for BugCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataRace => write!(f, "data race"),
            Self::Deadlock => write!(f, "deadlock"),
        }
    }
}

/// Static description of one mutation operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorDescriptor {
    pub id: &'static str,
    /// Program file inside the operator directory
    pub file: &'static str,
    pub description: &'static str,
    pub fixes_data_races: bool,
    pub fixes_deadlocks: bool,
    /// Extra arguments passed to the mutation tool
    pub params: &'static [&'static str],
}

impl OperatorDescriptor {
    pub fn fixes(&self, category: BugCategory) -> bool {
        match category {
            BugCategory::DataRace => self.fixes_data_races,
            BugCategory::Deadlock => self.fixes_deadlocks,
        }
    }
}

const SYNC_VAR_PARAMS: &[&str] = &["-syncvar", "this"];

/// Every operator shipped with the tool.
pub const BUILTIN_OPERATORS: &[OperatorDescriptor] = &[
    OperatorDescriptor {
        id: "ASAT",
        file: "ASAT_RND.Txl",
        description: "Add synchronized block around statement",
        fixes_data_races: true,
        fixes_deadlocks: true,
        params: SYNC_VAR_PARAMS,
    },
    OperatorDescriptor {
        id: "ASIM",
        file: "ASIM_RND.Txl",
        description: "Add synchronized modifier to method",
        fixes_data_races: true,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "ASM",
        file: "ASM_V.Txl",
        description: "Add synchronized block around method body",
        fixes_data_races: true,
        fixes_deadlocks: true,
        params: SYNC_VAR_PARAMS,
    },
    OperatorDescriptor {
        id: "CSO",
        file: "CSO.Txl",
        description: "Change synchronization order",
        fixes_data_races: false,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "EXSB",
        file: "EXSB.Txl",
        description: "Expand synchronized block before",
        fixes_data_races: true,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "EXSA",
        file: "EXSA.Txl",
        description: "Expand synchronized block after",
        fixes_data_races: true,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "RSAS",
        file: "RSAS.Txl",
        description: "Remove synchronized block around statement",
        fixes_data_races: false,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "RSAV",
        file: "RSAV.Txl",
        description: "Remove synchronized block around variable",
        fixes_data_races: false,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "RSIM",
        file: "RSIM.Txl",
        description: "Remove synchronized modifier from method",
        fixes_data_races: false,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "RSM",
        file: "RSM.Txl",
        description: "Remove synchronized block around method body",
        fixes_data_races: false,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "SHSA",
        file: "SHSA.Txl",
        description: "Shrink synchronized block after",
        fixes_data_races: false,
        fixes_deadlocks: true,
        params: &[],
    },
    OperatorDescriptor {
        id: "SHSB",
        file: "SHSB.Txl",
        description: "Shrink synchronized block before",
        fixes_data_races: false,
        fixes_deadlocks: true,
        params: &[],
    },
];

/// Errors building an operator registry
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("Unknown mutation operator '{0}'")]
    Unknown(String),

    #[error("No mutation operators enabled")]
    Empty,

    #[error("Operator program not found: {0}")]
    MissingProgram(String),
}

/// The set of operators a run may use.
#[derive(Debug, Clone)]
pub struct OperatorRegistry {
    operators: Vec<&'static OperatorDescriptor>,
}

impl OperatorRegistry {
    /// All built-in operators.
    pub fn builtin() -> Self {
        Self {
            operators: BUILTIN_OPERATORS.iter().collect(),
        }
    }

    /// Built-in operators restricted to `ids`, or all of them when `ids` is
    /// empty. Ids are matched case-insensitively.
    pub fn with_enabled(ids: &[String]) -> Result<Self, OperatorError> {
        if ids.is_empty() {
            return Ok(Self::builtin());
        }

        let mut operators = Vec::new();
        for id in ids {
            let descriptor = BUILTIN_OPERATORS
                .iter()
                .find(|op| op.id.eq_ignore_ascii_case(id.trim()))
                .ok_or_else(|| OperatorError::Unknown(id.clone()))?;
            if !operators.contains(&descriptor) {
                operators.push(descriptor);
            }
        }

        Ok(Self { operators })
    }

    /// Check that every operator's program exists in `operator_dir`.
    pub fn verify_programs(&self, operator_dir: &Path) -> Result<(), OperatorError> {
        if self.operators.is_empty() {
            return Err(OperatorError::Empty);
        }
        for op in &self.operators {
            let program = operator_dir.join(op.file);
            if !program.is_file() {
                return Err(OperatorError::MissingProgram(program.display().to_string()));
            }
        }
        Ok(())
    }

    pub fn all(&self) -> &[&'static OperatorDescriptor] {
        &self.operators
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&'static OperatorDescriptor> {
        self.operators.iter().copied().find(|op| op.id == id)
    }

    /// Operators tagged with `category`, in table order.
    pub fn for_category(&self, category: BugCategory) -> Vec<&'static OperatorDescriptor> {
        self.operators
            .iter()
            .copied()
            .filter(|op| op.fixes(category))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_has_twelve_operators() {
        let registry = OperatorRegistry::builtin();
        assert_eq!(registry.len(), 12);
        assert!(registry.get("ASAT").is_some());
        assert!(registry.get("NOPE").is_none());
    }

    #[test]
    fn test_program_file_names() {
        let registry = OperatorRegistry::builtin();
        let file = |id: &str| registry.get(id).unwrap().file;
        assert_eq!(file("ASAT"), "ASAT_RND.Txl");
        assert_eq!(file("ASIM"), "ASIM_RND.Txl");
        assert_eq!(file("ASM"), "ASM_V.Txl");
        assert_eq!(file("CSO"), "CSO.Txl");
        assert_eq!(file("SHSB"), "SHSB.Txl");
    }

    #[test]
    fn test_category_tags() {
        let registry = OperatorRegistry::builtin();
        let races: Vec<&str> = registry
            .for_category(BugCategory::DataRace)
            .iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(races, vec!["ASAT", "ASIM", "ASM", "EXSB", "EXSA"]);
        assert_eq!(registry.for_category(BugCategory::Deadlock).len(), 12);
    }

    #[test]
    fn test_syncvar_params() {
        let registry = OperatorRegistry::builtin();
        assert_eq!(registry.get("ASAT").unwrap().params, &["-syncvar", "this"]);
        assert_eq!(registry.get("ASM").unwrap().params, &["-syncvar", "this"]);
        assert!(registry.get("ASIM").unwrap().params.is_empty());
    }

    #[test]
    fn test_with_enabled_subset() {
        let registry =
            OperatorRegistry::with_enabled(&["cso".to_string(), "RSM".to_string()]).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.for_category(BugCategory::DataRace).is_empty());
    }

    #[test]
    fn test_with_enabled_dedups() {
        let registry =
            OperatorRegistry::with_enabled(&["ASAT".to_string(), "asat".to_string()]).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_with_enabled_unknown() {
        let err = OperatorRegistry::with_enabled(&["XYZ".to_string()]).unwrap_err();
        assert!(matches!(err, OperatorError::Unknown(ref id) if id == "XYZ"));
    }

    #[test]
    fn test_with_enabled_empty_means_all() {
        assert_eq!(OperatorRegistry::with_enabled(&[]).unwrap().len(), 12);
    }

    #[test]
    fn test_verify_programs() {
        let dir = TempDir::new().unwrap();
        let registry =
            OperatorRegistry::with_enabled(&["ASAT".to_string(), "CSO".to_string()]).unwrap();

        let err = registry.verify_programs(dir.path()).unwrap_err();
        assert!(matches!(err, OperatorError::MissingProgram(_)));

        std::fs::write(dir.path().join("ASAT_RND.Txl"), "").unwrap();
        std::fs::write(dir.path().join("CSO.Txl"), "").unwrap();
        assert!(registry.verify_programs(dir.path()).is_ok());
    }
}
