//! Build orchestration: compile the working copy and translate everything
//! the compiler says back into original-tree coordinates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::error::{PipelineError, Result};
use crate::domain::instrumented::InstrumentedFile;
use crate::domain::position::{RemappedDiagnostic, SourcePosition};
use crate::infrastructure::workspace::{normalize_path, WorkingCopy};
use crate::ports::{Artifact, CompileRequest, Compiler, RawDiagnostic, RawSpan};

#[derive(Debug)]
pub struct BuildResult {
    pub artifacts: Vec<Artifact>,
    /// Compiler warnings, already remapped.
    pub warnings: Vec<RemappedDiagnostic>,
    /// Set when the working copy was kept on disk.
    pub work_dir: Option<PathBuf>,
}

pub struct Orchestrator<'a> {
    pub compiler: &'a dyn Compiler,
}

impl<'a> Orchestrator<'a> {
    pub fn new(compiler: &'a dyn Compiler) -> Self {
        Self { compiler }
    }

    /// Compile the working copy. Fails with every error diagnostic,
    /// remapped, when the build does not succeed.
    pub fn build(
        &self,
        wc: &WorkingCopy,
        files: &[InstrumentedFile],
        request: CompileRequest,
    ) -> Result<BuildResult> {
        let output = self.compiler.compile(&request)?;
        let remapper = Remapper::new(wc, files);

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for raw in &output.diagnostics {
            if remapper.is_injection_lint(raw) {
                tracing::trace!(code = ?raw.code, "lint on injected code dropped");
                continue;
            }
            let remapped = remapper.diagnostic(raw);
            if raw.level == "error" {
                errors.push(remapped);
            } else {
                warnings.push(remapped);
            }
        }

        if !output.success {
            tracing::error!(errors = errors.len(), "instrumented build failed");
            return Err(PipelineError::Compilation { diagnostics: errors });
        }
        for w in &warnings {
            tracing::debug!("{}", w);
        }
        tracing::info!(
            artifacts = output.artifacts.len(),
            warnings = warnings.len(),
            "instrumented build succeeded"
        );
        Ok(BuildResult {
            artifacts: output.artifacts,
            warnings,
            work_dir: None,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Internal Implementation
// ═══════════════════════════════════════════════════════════════════════════

struct Remapper<'a> {
    wc: &'a WorkingCopy,
    by_original: HashMap<PathBuf, &'a InstrumentedFile>,
}

impl<'a> Remapper<'a> {
    fn new(wc: &'a WorkingCopy, files: &'a [InstrumentedFile]) -> Self {
        let by_original = files
            .iter()
            .filter(|f| f.is_modified())
            .map(|f| (normalize_path(f.original_path()), f))
            .collect();
        Self { wc, by_original }
    }

    fn diagnostic(&self, raw: &RawDiagnostic) -> RemappedDiagnostic {
        let mut primary = None;
        let mut secondary = Vec::new();
        for span in &raw.spans {
            let pos = self.span(span);
            if span.primary && primary.is_none() {
                primary = Some(pos);
            } else {
                secondary.push(pos);
            }
        }
        RemappedDiagnostic {
            level: raw.level.clone(),
            code: raw.code.clone(),
            message: raw.message.clone(),
            primary,
            secondary,
        }
    }

    /// Lints the rewrite itself provokes: the guard form nests the original
    /// body in a second block, which `unused_braces` reports.
    fn is_injection_lint(&self, raw: &RawDiagnostic) -> bool {
        if raw.code.as_deref() != Some("unused_braces") {
            return false;
        }
        let mut primary = raw.spans.iter().filter(|s| s.primary).peekable();
        primary.peek().is_some()
            && primary.all(|span| {
                self.instrumented(span)
                    .is_some_and(|file| file.is_instrumentation_site(span.line, span.column))
            })
    }

    fn in_copy(&self, span: &RawSpan) -> PathBuf {
        if span.file.is_absolute() {
            normalize_path(&span.file)
        } else {
            normalize_path(&self.wc.root.join(&span.file))
        }
    }

    fn instrumented(&self, span: &RawSpan) -> Option<&'a InstrumentedFile> {
        let original = self.wc.original_path(&self.in_copy(span))?;
        self.by_original.get(&original).copied()
    }

    fn span(&self, span: &RawSpan) -> SourcePosition {
        let in_copy = self.in_copy(span);
        let Some(original) = self.wc.original_path(&in_copy) else {
            // Outside the copy: std, untouched registry sources.
            return unchanged(&span.file, span);
        };
        match self.by_original.get(&original) {
            Some(file) => file.to_original(span.line, span.column),
            None => unchanged(&original, span),
        }
    }
}

fn unchanged(file: &Path, span: &RawSpan) -> SourcePosition {
    SourcePosition {
        file: file.to_path_buf(),
        line: span.line,
        column: span.column,
        generated: false,
    }
}
