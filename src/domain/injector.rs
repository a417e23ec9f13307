//! Trampoline Injector: applies matched rules to an instrumented-file draft.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Deserialize;

use crate::domain::ast::DeclSite;
use crate::domain::error::{InjectionConflict, PipelineError, Result};
use crate::domain::instrumented::{InstrumentedDecl, InstrumentedFile};
use crate::domain::matcher::{DeclMatches, FileMatches};
use crate::domain::rule::{Capture, CaptureMode, HookRule};
use crate::domain::trampoline::StagePlan;

/// What to do when a rule conflicts on a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Fail the run with every conflict found.
    #[default]
    Abort,
    /// Leave the declaration uninstrumented for the conflicting rule, warn,
    /// and go on.
    Skip,
}

/// Result of injecting one file: the file plus the rules that were left
/// out because they conflicted.
#[derive(Debug)]
pub struct Injected {
    pub file: InstrumentedFile,
    pub conflicts: Vec<InjectionConflict>,
}

fn is_borrowed(ty: &str) -> bool {
    ty.contains('&') || ty.contains('\'')
}

/// Check `rule` against the declaration and against the captures already
/// accepted from earlier rules on it.
fn check_rule(
    decl: &DeclSite,
    declaration: &str,
    file: &std::path::Path,
    rule: &HookRule,
    accepted: &HashMap<String, (String, Option<String>)>,
) -> Option<InjectionConflict> {
    let conflict = |against: Option<String>, reason: String| InjectionConflict {
        declaration: declaration.to_string(),
        file: file.to_path_buf(),
        rule: rule.id.clone(),
        against,
        reason,
    };

    for capture in &rule.captures {
        if let (Some(ty), Some((other, Some(other_ty)))) = (&capture.ty, accepted.get(&capture.param)) {
            if ty != other_ty {
                return Some(conflict(
                    Some(other.clone()),
                    format!(
                        "'{}' is captured as {} here but as {} by the earlier rule",
                        capture.param, ty, other_ty
                    ),
                ));
            }
        }
        if let Some(reason) = check_capture(decl, capture) {
            return Some(conflict(None, reason));
        }
    }
    None
}

fn check_capture(decl: &DeclSite, capture: &Capture) -> Option<String> {
    let ty = if capture.is_return() {
        decl.results.first().cloned().unwrap_or_else(|| "()".to_string())
    } else {
        match decl.param(&capture.param) {
            Some(p) => p.ty.clone(),
            None => return Some(format!("the declaration has no parameter named '{}'", capture.param)),
        }
    };
    if let Some(want) = &capture.ty {
        if *want != ty {
            return Some(format!("'{}' is declared as {}, the rule expects {}", capture.param, ty, want));
        }
    }
    if capture.mode == CaptureMode::Clone && (is_borrowed(&ty) || (capture.is_return() && !decl.annotatable)) {
        return Some(format!("'{}' of type {} cannot be captured by clone", capture.param, ty));
    }
    None
}

fn inject_decl(
    file_path: &std::path::Path,
    matched: &DeclMatches,
    conflicts: &mut Vec<InjectionConflict>,
) -> InstrumentedDecl {
    let declaration = format!("{}::{}", matched.import_path, matched.decl.qualified_name());
    // param -> (rule id, declared type) of the first accepted capture.
    let mut accepted: HashMap<String, (String, Option<String>)> = HashMap::new();
    let mut stages = Vec::with_capacity(matched.rules.len());

    for rule in &matched.rules {
        if let Some(conflict) = check_rule(&matched.decl, &declaration, file_path, rule, &accepted) {
            tracing::debug!(rule = %rule.id, declaration = %declaration, "capture conflict");
            conflicts.push(conflict);
            continue;
        }
        for capture in &rule.captures {
            accepted
                .entry(capture.param.clone())
                .and_modify(|slot| {
                    if slot.1.is_none() {
                        *slot = (rule.id.clone(), capture.ty.clone());
                    }
                })
                .or_insert_with(|| (rule.id.clone(), capture.ty.clone()));
        }
        stages.push(StagePlan::new(Arc::clone(rule)));
    }
    InstrumentedDecl::new(matched.import_path.clone(), Arc::clone(&matched.decl), stages)
}

/// Apply the matches of one file to its draft. Conflicting rules are left
/// out and reported in [`Injected::conflicts`].
pub fn inject_file(mut draft: InstrumentedFile, matches: &FileMatches) -> Injected {
    let mut conflicts = Vec::new();
    for matched in &matches.decls {
        let decl = inject_decl(draft.original_path(), matched, &mut conflicts);
        draft.decls.push(decl);
    }
    draft.decls.sort_by_key(|d| d.decl.body_open);
    draft.render();
    Injected {
        file: draft,
        conflicts,
    }
}

/// Apply matches to one draft, failing on any conflict.
pub fn inject(draft: InstrumentedFile, matches: &FileMatches) -> Result<InstrumentedFile> {
    let injected = inject_file(draft, matches);
    if injected.conflicts.is_empty() {
        Ok(injected.file)
    } else {
        Err(PipelineError::InjectionConflict {
            conflicts: injected.conflicts,
        })
    }
}

/// Inject every file in parallel and apply the conflict policy to the
/// conflicts of all files together.
pub fn inject_all(files: Vec<FileMatches>, policy: ConflictPolicy) -> Result<Vec<InstrumentedFile>> {
    let results: Vec<Injected> = files
        .into_par_iter()
        .map(|fm| {
            let draft = InstrumentedFile::draft(fm.package, Arc::clone(&fm.file));
            inject_file(draft, &fm)
        })
        .collect();

    let mut out = Vec::with_capacity(results.len());
    let mut conflicts = Vec::new();
    for injected in results {
        conflicts.extend(injected.conflicts);
        out.push(injected.file);
    }
    if !conflicts.is_empty() {
        match policy {
            ConflictPolicy::Abort => return Err(PipelineError::InjectionConflict { conflicts }),
            ConflictPolicy::Skip => {
                for c in &conflicts {
                    tracing::warn!("{}; rule skipped for this declaration", c);
                }
            }
        }
    }
    let stages: usize = out.iter().flat_map(|f| f.active_decls()).map(|d| d.stages.len()).sum();
    tracing::info!(files = out.len(), stages, "trampolines injected");
    Ok(out)
}
