//! AST Optimizer: rewrites stage lists, then re-renders.
//!
//! Each pass reads only the original declaration and the stage list, and the
//! body is rendered again from the untouched original text. Running the
//! optimizer on its own output therefore changes nothing.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::domain::callgraph::Reachability;
use crate::domain::instrumented::{InstrumentedDecl, InstrumentedFile};
use crate::domain::trampoline::{Group, StagePlan, Toggle};

/// Rule id that stands for every rule in `disabled` and `runtime_toggle`.
pub const ALL_RULES: &str = "all";

#[derive(Debug, Default)]
pub struct OptimizeContext<'a> {
    /// Rules statically disabled for this build.
    pub disabled: HashSet<String>,
    /// Rules that keep their runtime switch check.
    pub runtime_toggle: HashSet<String>,
    pub reachability: Option<&'a Reachability>,
}

impl OptimizeContext<'_> {
    fn is_disabled(&self, rule: &str) -> bool {
        self.disabled.contains(ALL_RULES) || self.disabled.contains(rule)
    }

    fn toggle(&self, rule: &str) -> Toggle {
        if self.runtime_toggle.contains(ALL_RULES) || self.runtime_toggle.contains(rule) {
            Toggle::Runtime
        } else {
            Toggle::Static
        }
    }
}

/// Pass 1: drop stages of disabled rules and settle every runtime check.
fn eliminate_dead_guards(decl: &mut InstrumentedDecl, ctx: &OptimizeContext<'_>) {
    decl.stages.retain(|s| !ctx.is_disabled(&s.rule.id));
    for stage in &mut decl.stages {
        stage.toggle = ctx.toggle(&stage.rule.id);
    }
}

fn fusible(stage: &StagePlan) -> bool {
    stage.rule.fusible && stage.toggle == Toggle::Static
}

/// Pass 2: group maximal runs of two or more fusible stages.
fn fuse(stages: &[StagePlan]) -> Vec<Group> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < stages.len() {
        let mut end = i;
        while end < stages.len() && fusible(&stages[end]) {
            end += 1;
        }
        if end - i >= 2 {
            groups.push(Group::Fused(i..end));
            i = end;
        } else {
            groups.push(Group::Single(i));
            i += 1;
        }
    }
    groups
}

/// Pass 3: drop instrumentation of functions that never run.
fn prune(file: &InstrumentedFile, decl: &InstrumentedDecl, reachability: &Reachability) -> bool {
    !reachability.is_live(file.package, file.original_path(), decl.decl.body_open)
}

pub fn optimize(mut file: InstrumentedFile, ctx: &OptimizeContext<'_>) -> InstrumentedFile {
    let mut decls = std::mem::take(&mut file.decls);
    for decl in &mut decls {
        eliminate_dead_guards(decl, ctx);
        decl.groups = fuse(&decl.stages);
        if let Some(reachability) = ctx.reachability {
            if prune(&file, decl, reachability) {
                tracing::debug!(
                    file = %file.original_path().display(),
                    function = %decl.decl.qualified_name(),
                    "unreachable, instrumentation pruned"
                );
                decl.pruned = true;
            }
        }
    }
    file.decls = decls;
    file.render();
    file
}

pub fn optimize_all(files: Vec<InstrumentedFile>, ctx: &OptimizeContext<'_>) -> Vec<InstrumentedFile> {
    let out: Vec<InstrumentedFile> = files.into_par_iter().map(|f| optimize(f, ctx)).collect();
    let (active, fused, pruned) = out.iter().flat_map(|f| &f.decls).fold((0, 0, 0), |(a, fu, p), d| {
        (
            a + usize::from(d.is_active()),
            fu + d.groups.iter().filter(|g| matches!(g, Group::Fused(_))).count(),
            p + usize::from(d.pruned),
        )
    });
    tracing::info!(active, fused_groups = fused, pruned, "optimizer finished");
    out
}
