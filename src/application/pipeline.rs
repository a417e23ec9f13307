//! The instrumentation pipeline, stage by stage:
//! Registry → Resolver → Matcher → Injector → Optimizer → Orchestrator.
//!
//! Stages run one after another; the matcher, injector, and optimizer fan
//! out over files on the rayon pool. Any stage error aborts the run and the
//! temporary working copy is dropped with it.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::application::config::PipelineConfig;
use crate::application::orchestrator::{BuildResult, Orchestrator};
use crate::domain::ast::ParseCache;
use crate::domain::callgraph::Reachability;
use crate::domain::error::{PipelineError, Result, Stage};
use crate::domain::graph::DependencyGraph;
use crate::domain::injector::inject_all;
use crate::domain::instrumented::InstrumentedFile;
use crate::domain::matcher::{find_matches, MatchSet};
use crate::domain::optimizer::{optimize_all, OptimizeContext, ALL_RULES};
use crate::domain::registry::Registry;
use crate::domain::resolver::select_rules;
use crate::domain::rule::HookCrate;
use crate::domain::trampoline::RUNTIME_CRATE;
use crate::infrastructure::workspace::{MaterializePlan, WorkingCopy};
use crate::ports::{CompileRequest, Compiler, MetadataSource, ResolveOptions};

pub const MATCH_REPORT: &str = "matched_rules.json";

/// Resolved graph, applicable rules, and their matches.
pub struct Analysis {
    pub graph: DependencyGraph,
    pub registry: Registry,
    pub matches: MatchSet,
    cache: ParseCache,
}

impl Analysis {
    pub fn report(&self) -> Result<String> {
        self.matches
            .to_json(&self.graph)
            .map_err(|e| PipelineError::io(Stage::Matcher, MATCH_REPORT, e.into()))
    }
}

/// Optimized files ready to be written into a working copy.
pub struct Instrumentation {
    pub files: Vec<InstrumentedFile>,
    /// Packages with at least one modified file, ascending.
    pub packages: Vec<usize>,
    /// Hook crates referenced by surviving stages.
    pub hook_crates: Vec<HookCrate>,
}

pub struct Pipeline<'a> {
    pub metadata: &'a dyn MetadataSource,
    pub compiler: &'a dyn Compiler,
    pub config: &'a PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        metadata: &'a dyn MetadataSource,
        compiler: &'a dyn Compiler,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            metadata,
            compiler,
            config,
        }
    }

    pub fn load_rules(&self) -> Result<Registry> {
        if self.config.rules.is_empty() {
            tracing::warn!("no rule files configured; nothing will be instrumented");
        }
        let registry = Registry::load_files(&self.config.rules)?;
        for id in self.config.disabled_rules.iter().chain(&self.config.runtime_toggle) {
            if id != ALL_RULES && registry.get(id).is_none() {
                tracing::warn!(rule = %id, "configured rule id does not exist");
            }
        }
        Ok(registry)
    }

    /// Registry, resolver, and matcher.
    pub fn analyze(&self, program_root: &Path) -> Result<Analysis> {
        let registry = self.load_rules()?;
        let options = ResolveOptions {
            offline: self.config.offline,
            locked: self.config.locked,
        };
        let graph = self.metadata.resolve(program_root, &options)?;
        tracing::info!(
            packages = graph.packages.len(),
            members = graph.members().count(),
            "dependency graph resolved"
        );
        let registry = select_rules(&graph, &registry)?;
        let cache = ParseCache::new();
        let matches = find_matches(&graph, &registry, &cache)?;
        Ok(Analysis {
            graph,
            registry,
            matches,
            cache,
        })
    }

    /// Injector and optimizer.
    pub fn instrument(&self, analysis: Analysis) -> Result<(DependencyGraph, Instrumentation)> {
        let Analysis {
            graph,
            matches,
            cache,
            ..
        } = analysis;

        let matched_packages = matches.packages();
        let injected = inject_all(matches.into_files(), self.config.conflict_policy)?;

        let reachability = if self.config.prune_unreachable && !matched_packages.is_empty() {
            Some(Reachability::analyze(&graph, &matched_packages, &cache)?)
        } else {
            None
        };
        let ctx = OptimizeContext {
            disabled: self.config.disabled_rules.iter().cloned().collect(),
            runtime_toggle: self.config.runtime_toggle.iter().cloned().collect(),
            reachability: reachability.as_ref(),
        };
        let mut files = optimize_all(injected, &ctx);
        add_preludes(&graph, &mut files, &cache)?;

        let mut packages: Vec<usize> = files.iter().filter(|f| f.is_modified()).map(|f| f.package).collect();
        packages.sort_unstable();
        packages.dedup();
        let hook_crates = used_hook_crates(&files);
        Ok((
            graph,
            Instrumentation {
                files,
                packages,
                hook_crates,
            },
        ))
    }

    /// The whole run. The working copy is removed afterwards unless
    /// `keep_work_dir` is set, in which case it is kept on success and on
    /// compile failure alike.
    pub fn build(&self, program_root: &Path) -> Result<BuildResult> {
        let analysis = self.analyze(program_root)?;
        let report = analysis.report()?;
        let (graph, inst) = self.instrument(analysis)?;
        if inst.packages.is_empty() {
            tracing::info!("no declaration instrumented; building the program unchanged");
        }

        let runtime_dir = self.config.runtime_dir();
        let mut wc = WorkingCopy::materialize(
            &graph,
            MaterializePlan {
                instrumented: &inst.packages,
                hook_crates: &inst.hook_crates,
                runtime_dir: &runtime_dir,
            },
        )?;
        wc.write_files(&inst.files)?;
        wc.write_report(MATCH_REPORT, &report)?;
        if self.config.keep_work_dir {
            let n = wc.write_debug_copies(&inst.files)?;
            tracing::debug!(files = n, "debug copies written");
        }

        let request = CompileRequest {
            manifest_path: wc.manifest_path(),
            target_dir: Some(
                self.config
                    .target_dir
                    .clone()
                    .unwrap_or_else(|| graph.workspace_root.join("target").join("hookweave")),
            ),
            offline: self.config.offline,
            locked: self.config.locked,
            extra_args: self.config.cargo_args.clone(),
        };
        let result = Orchestrator::new(self.compiler).build(&wc, &inst.files, request);

        if self.config.keep_work_dir {
            let dir = wc.persist();
            tracing::info!(dir = %dir.display(), "working copy kept");
            return result.map(|r| BuildResult {
                work_dir: Some(dir),
                ..r
            });
        }
        result
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Internal Implementation
// ═══════════════════════════════════════════════════════════════════════════

/// 2015-edition crates cannot name dependencies without `extern crate`.
fn add_preludes(graph: &DependencyGraph, files: &mut Vec<InstrumentedFile>, cache: &ParseCache) -> Result<()> {
    let mut needs: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for file in files.iter().filter(|f| f.is_modified()) {
        if graph.packages[file.package].edition != "2015" {
            continue;
        }
        let crates = needs
            .entry(file.package)
            .or_insert_with(|| vec![RUNTIME_CRATE.to_string()]);
        for name in file
            .active_decls()
            .flat_map(|d| &d.stages)
            .map(|s| &s.rule.hook_crate.name)
        {
            if !crates.contains(name) {
                crates.push(name.clone());
            }
        }
    }

    for (package, crates) in needs {
        let Some(root) = &graph.packages[package].lib_root else {
            continue;
        };
        let idx = match files.iter().position(|f| f.original_path() == root.as_path()) {
            Some(i) => i,
            None => {
                files.push(InstrumentedFile::draft(package, cache.get_or_parse(root)?));
                files.len() - 1
            }
        };
        let file = &mut files[idx];
        file.prelude = crates;
        file.render();
        tracing::debug!(package = %graph.packages[package].label(), "extern crate prelude added");
    }
    Ok(())
}

fn used_hook_crates(files: &[InstrumentedFile]) -> Vec<HookCrate> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for stage in files.iter().flat_map(|f| f.active_decls()).flat_map(|d| &d.stages) {
        let hook = &stage.rule.hook_crate;
        if seen.insert(hook.name.clone()) {
            out.push(hook.clone());
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}
