//! AST Matcher: locates the declarations each rule selects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::domain::ast::{walk_crate, DeclSite, FileScan, ModuleFile, ParseCache};
use crate::domain::error::Result;
use crate::domain::graph::DependencyGraph;
use crate::domain::registry::Registry;
use crate::domain::rule::HookRule;

/// One (rule, declaration) pair.
#[derive(Debug, Clone)]
pub struct Match {
    pub rule: Arc<HookRule>,
    /// Index of the owning package in the graph.
    pub package: usize,
    pub import_path: String,
    pub file: Arc<FileScan>,
    pub decl: Arc<DeclSite>,
}

impl Match {
    pub fn declaration(&self) -> String {
        format!("{}::{}", self.import_path, self.decl.qualified_name())
    }

    fn key(&self) -> (&Path, usize, usize) {
        (&self.file.path, self.decl.body_open, self.rule.order)
    }
}

/// All matched rules of one declaration, in registration order.
#[derive(Debug, Clone)]
pub struct DeclMatches {
    pub import_path: String,
    pub decl: Arc<DeclSite>,
    pub rules: Vec<Arc<HookRule>>,
}

/// Matches of one file, declarations in source order.
#[derive(Debug, Clone)]
pub struct FileMatches {
    pub package: usize,
    pub file: Arc<FileScan>,
    pub decls: Vec<DeclMatches>,
}

#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    matches: Vec<Match>,
}

#[derive(Debug, Serialize)]
struct MatchRecord<'a> {
    rule: &'a str,
    package: String,
    import_path: &'a str,
    declaration: String,
    file: &'a Path,
    line: usize,
}

impl MatchSet {
    pub fn new(mut matches: Vec<Match>) -> Self {
        matches.sort_by(|a, b| a.key().cmp(&b.key()));
        matches.dedup_by(|a, b| a.key() == b.key());
        Self { matches }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Match> {
        self.matches.iter()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Packages that own at least one match, ascending.
    pub fn packages(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self.matches.iter().map(|m| m.package).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Group by file, then by declaration. Consumes the set.
    pub fn into_files(self) -> Vec<FileMatches> {
        let mut files: BTreeMap<PathBuf, FileMatches> = BTreeMap::new();
        for m in self.matches {
            let entry = files
                .entry(m.file.path.clone())
                .or_insert_with(|| FileMatches {
                    package: m.package,
                    file: Arc::clone(&m.file),
                    decls: Vec::new(),
                });
            match entry.decls.last_mut() {
                Some(last) if last.decl.body_open == m.decl.body_open => last.rules.push(m.rule),
                _ => entry.decls.push(DeclMatches {
                    import_path: m.import_path,
                    decl: m.decl,
                    rules: vec![m.rule],
                }),
            }
        }
        files.into_values().collect()
    }

    pub fn to_json(&self, graph: &DependencyGraph) -> serde_json::Result<String> {
        let records: Vec<MatchRecord<'_>> = self
            .matches
            .iter()
            .map(|m| MatchRecord {
                rule: &m.rule.id,
                package: graph.packages[m.package].label(),
                import_path: &m.import_path,
                declaration: m.declaration(),
                file: &m.file.path,
                line: m.decl.line,
            })
            .collect();
        serde_json::to_string_pretty(&records)
    }
}

/// Whether `rule` selects `decl` mounted at `import_path`.
pub fn rule_matches(rule: &HookRule, import_path: &str, decl: &DeclSite) -> bool {
    rule.import_path == import_path
        && rule.function == decl.name
        && rule
            .receiver
            .matches(decl.receiver.as_ref().map(|r| (r.last.as_str(), r.full.as_str())))
        && rule.params.matches(&decl.param_types())
        && rule.results.matches(&decl.results)
}

fn match_file(registry: &Registry, package: usize, applicable: &[usize], file: &ModuleFile) -> Vec<Match> {
    let mut out = Vec::new();
    for decl in &file.scan.decls {
        let import_path = file.import_path(&decl.inline_module);
        let candidates = registry.lookup(&import_path);
        if candidates.is_empty() {
            continue;
        }
        let decl = Arc::new(decl.clone());
        for rule in candidates {
            let allowed = applicable.contains(&rule.order);
            if allowed && rule_matches(&rule, &import_path, &decl) {
                out.push(Match {
                    rule,
                    package,
                    import_path: import_path.clone(),
                    file: Arc::clone(&file.scan),
                    decl: Arc::clone(&decl),
                });
            }
        }
    }
    out
}

/// Scan every package of the graph that some rule targets and collect the
/// matches. The result is sorted by (file, declaration offset, rule order),
/// so it is identical across runs on unchanged input.
pub fn find_matches(graph: &DependencyGraph, registry: &Registry, cache: &ParseCache) -> Result<MatchSet> {
    let reachable = graph.reachable();
    let mut matches = Vec::new();

    for (idx, package) in graph.packages.iter().enumerate() {
        if !reachable[idx] {
            continue;
        }
        let applicable: Vec<usize> = registry
            .for_crate(&package.crate_name)
            .iter()
            .filter(|r| r.version.contains(&package.version))
            .map(|r| r.order)
            .collect();
        if applicable.is_empty() {
            continue;
        }
        let Some(root) = &package.lib_root else {
            tracing::debug!(package = %package.label(), "no library target, nothing to match");
            continue;
        };
        let files = walk_crate(&package.crate_name, root, cache)?;
        let found: Vec<Match> = files
            .par_iter()
            .flat_map_iter(|file| match_file(registry, idx, &applicable, file))
            .collect();
        tracing::debug!(
            package = %package.label(),
            files = files.len(),
            matches = found.len(),
            "package scanned"
        );
        matches.extend(found);
    }

    let set = MatchSet::new(matches);
    tracing::info!(matches = set.len(), files_parsed = cache.len(), "matching finished");
    Ok(set)
}
