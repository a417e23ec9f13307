// Boundaries to the outside world: the Cargo resolver and the compiler.

use std::path::{Path, PathBuf};

use crate::domain::error::Result;
use crate::domain::graph::DependencyGraph;

/// Options the resolver passes through to Cargo.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub offline: bool,
    pub locked: bool,
}

pub trait MetadataSource {
    /// Resolve the dependency graph of the program rooted at `program_root`.
    fn resolve(&self, program_root: &Path, options: &ResolveOptions) -> Result<DependencyGraph>;
}

#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    /// Root manifest of the working copy.
    pub manifest_path: PathBuf,
    pub target_dir: Option<PathBuf>,
    pub offline: bool,
    pub locked: bool,
    pub extra_args: Vec<String>,
}

/// A span as reported by the compiler, in working-copy coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSpan {
    pub file: PathBuf,
    pub line: usize,
    /// 1-based, in characters.
    pub column: usize,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDiagnostic {
    pub level: String,
    pub code: Option<String>,
    pub message: String,
    pub spans: Vec<RawSpan>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub package: String,
    pub target: String,
    pub filenames: Vec<PathBuf>,
    pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub success: bool,
    pub artifacts: Vec<Artifact>,
    pub diagnostics: Vec<RawDiagnostic>,
}

pub trait Compiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput>;
}
