//! Error taxonomy of the instrumentation pipeline.
//!
//! Every variant aborts the run. None of them is retried: they all come from
//! deterministic input (rules, dependency graph, source, compiler).

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::position::RemappedDiagnostic;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Registry,
    Resolver,
    Matcher,
    Injector,
    Optimizer,
    Orchestrator,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Registry => "rule registry",
            Stage::Resolver => "dependency resolver",
            Stage::Matcher => "ast matcher",
            Stage::Injector => "trampoline injector",
            Stage::Optimizer => "ast optimizer",
            Stage::Orchestrator => "build orchestrator",
        };
        f.write_str(name)
    }
}

/// A capture conflict on one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionConflict {
    pub declaration: String,
    pub file: PathBuf,
    pub rule: String,
    /// The earlier rule the conflict is with, `None` when it is with the
    /// declaration's own signature.
    pub against: Option<String>,
    pub reason: String,
}

impl fmt::Display for InjectionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.against {
            Some(other) => write!(
                f,
                "rule '{}' conflicts with rule '{}' on {} ({}): {}",
                self.rule,
                other,
                self.declaration,
                self.file.display(),
                self.reason
            ),
            None => write!(
                f,
                "rule '{}' cannot be applied to {} ({}): {}",
                self.rule,
                self.declaration,
                self.file.display(),
                self.reason
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[{stage}] rule definition error in {source_name}: {message}", stage = Stage::Registry)]
    RuleDefinition {
        source_name: String,
        rule: Option<String>,
        message: String,
    },

    #[error("[{stage}] unresolved dependency '{package}': {message}", stage = Stage::Resolver)]
    UnresolvedDependency { package: String, message: String },

    #[error(
        "[{stage}] version conflict on '{package}': {message}",
        stage = Stage::Resolver
    )]
    VersionConflict {
        package: String,
        rules: Vec<String>,
        message: String,
    },

    #[error("[{stage}] failed to parse {}: {message}", .file.display(), stage = Stage::Matcher)]
    Parse {
        file: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("[{stage}] {} injection conflict(s): {}", .conflicts.len(), join_conflicts(.conflicts), stage = Stage::Injector)]
    InjectionConflict { conflicts: Vec<InjectionConflict> },

    #[error("[{stage}] compilation failed with {} error(s):\n{}", .diagnostics.len(), join_diagnostics(.diagnostics), stage = Stage::Orchestrator)]
    Compilation {
        diagnostics: Vec<RemappedDiagnostic>,
    },

    #[error("[{stage}] I/O error on {}: {source}", .path.display())]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

fn join_conflicts(conflicts: &[InjectionConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_diagnostics(diagnostics: &[RemappedDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl PipelineError {
    pub fn rule_definition(
        source_name: impl Into<String>,
        rule: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::RuleDefinition {
            source_name: source_name.into(),
            rule: rule.map(String::from),
            message: message.into(),
        }
    }

    pub fn unresolved(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnresolvedDependency {
            package: package.into(),
            message: message.into(),
        }
    }

    pub fn io(stage: Stage, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            stage,
            path: path.into(),
            source,
        }
    }

    pub fn parse(file: impl Into<PathBuf>, err: &syn::Error) -> Self {
        let start = err.span().start();
        Self::Parse {
            file: file.into(),
            line: start.line,
            column: start.column + 1,
            message: err.to_string(),
        }
    }

    /// Stage that failed; used for the single terminal error line.
    pub fn stage(&self) -> Stage {
        match self {
            Self::RuleDefinition { .. } => Stage::Registry,
            Self::UnresolvedDependency { .. } | Self::VersionConflict { .. } => Stage::Resolver,
            Self::Parse { .. } => Stage::Matcher,
            Self::InjectionConflict { .. } => Stage::Injector,
            Self::Compilation { .. } => Stage::Orchestrator,
            Self::Io { stage, .. } => *stage,
            Self::Config(_) => Stage::Orchestrator,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_stage_and_subject() {
        let err = PipelineError::unresolved("reqwest", "not in lock file");
        assert_eq!(err.stage(), Stage::Resolver);
        let text = err.to_string();
        assert!(text.contains("dependency resolver"), "{}", text);
        assert!(text.contains("reqwest"), "{}", text);

        let err = PipelineError::VersionConflict {
            package: "tokio".into(),
            rules: vec!["a".into(), "b".into()],
            message: "disjoint ranges".into(),
        };
        assert!(err.to_string().contains("tokio"));
    }

    #[test]
    fn test_conflict_display() {
        let conflict = InjectionConflict {
            declaration: "pkg::Client::send".into(),
            file: PathBuf::from("src/client.rs"),
            rule: "b".into(),
            against: Some("a".into()),
            reason: "param 'req' declared as Request and &Request".into(),
        };
        let err = PipelineError::InjectionConflict {
            conflicts: vec![conflict],
        };
        let text = err.to_string();
        assert!(text.contains("rule 'b' conflicts with rule 'a'"), "{}", text);
    }
}
