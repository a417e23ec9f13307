//! Code generation for trampolines.
//!
//! Everything generated here is a single line of Rust that talks only to
//! `::hookweave_rt` and to the rule's hook crate. The text is spliced around
//! the original body block, which is never re-printed.

use std::fmt::Write as _;
use std::ops::Range;
use std::sync::Arc;

use crate::domain::ast::{DeclSite, SelfKind};
use crate::domain::rule::HookRule;

pub const RUNTIME_CRATE: &str = "hookweave_rt";
const RT: &str = "::hookweave_rt";

/// Whether a stage checks the runtime switch before running its hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// `Trampoline::toggled`: consults `HOOKWEAVE_DISABLED_RULES`.
    Runtime,
    /// `Trampoline::new`: always on.
    Static,
}

/// One applied rule on one declaration.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub rule: Arc<HookRule>,
    pub toggle: Toggle,
}

impl StagePlan {
    pub fn new(rule: Arc<HookRule>) -> Self {
        Self {
            rule,
            toggle: Toggle::Runtime,
        }
    }
}

/// How stages are laid out as runtime guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    Single(usize),
    /// Consecutive stages behind one `Fused` guard.
    Fused(Range<usize>),
}

/// Shape of the rewritten body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyForm {
    /// `{ prologue { body } }`; exit hooks see no return value.
    Guard,
    /// The body runs in a closure (or async block) whose value is inspected
    /// before it is returned. Async bodies always take this form so a future
    /// dropped before completion reports `Cancelled`.
    Observing,
}

pub fn body_form(decl: &DeclSite, stages: &[StagePlan]) -> BodyForm {
    if decl.is_async || decl.returns_result || stages.iter().any(|s| s.rule.captures_return()) {
        BodyForm::Observing
    } else {
        BodyForm::Guard
    }
}

/// Text spliced before the body's `{` and after its `}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub before: String,
    pub after: String,
}

pub fn single_groups(len: usize) -> Vec<Group> {
    (0..len).map(Group::Single).collect()
}

fn stage_accessor(group_idx: usize, group: &Group, stage: usize) -> String {
    match group {
        Group::Single(_) => format!("__hw_t{}", group_idx),
        Group::Fused(range) => format!("__hw_f{}.stage({})", group_idx, stage - range.start),
    }
}

fn receiver_expr(kind: SelfKind) -> Option<&'static str> {
    match kind {
        SelfKind::None => None,
        SelfKind::Ref | SelfKind::Typed => Some("&*self"),
        SelfKind::Value => Some("&self"),
    }
}

fn enter_call(decl: &DeclSite, rule: &HookRule) -> Option<String> {
    let receiver = receiver_expr(decl.self_kind);
    let mut body = String::new();
    for capture in rule.param_captures() {
        let binding = decl
            .param(&capture.param)
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| capture.param.clone());
        let _ = write!(
            body,
            "__hw_ctx.{}({:?}, &{}); ",
            capture.mode.context_method(),
            capture.param,
            binding
        );
    }
    if let Some(recv) = receiver {
        let _ = write!(body, "__hw_ctx.capture_receiver({}); ", recv);
    }
    match &rule.on_enter {
        Some(hook) => match receiver {
            Some(recv) => {
                let _ = write!(body, "{}(__hw_ctx, {})", hook.absolute(), recv);
            }
            None => {
                let _ = write!(body, "{}(__hw_ctx)", hook.absolute());
            }
        },
        None if body.is_empty() => return None,
        None => {}
    }
    Some(format!("|__hw_ctx| {{ {}}}", body))
}

/// Generate the splice for `decl` with the given stages and grouping.
/// `stages` is in nesting order: the first stage is the outermost.
pub fn generate(import_path: &str, decl: &DeclSite, stages: &[StagePlan], groups: &[Group]) -> Splice {
    let form = body_form(decl, stages);
    let observing = if form == BodyForm::Observing { ".observing()" } else { "" };
    let function = decl.qualified_name();
    let mut pre = String::from("{ ");

    for (k, stage) in stages.iter().enumerate() {
        let _ = write!(
            pre,
            "static __HW_SITE_{k}: {RT}::CallSite = {RT}::CallSite {{ rule: {:?}, package: {:?}, function: {:?} }}; ",
            stage.rule.id, import_path, function
        );
    }

    for (g, group) in groups.iter().enumerate() {
        let link = match g.checked_sub(1).map(|p| (p, &groups[p])) {
            None if decl.is_async => format!("{RT}::Link::Detached"),
            None => format!("{RT}::Link::Thread"),
            Some((p, Group::Single(_))) => format!("{RT}::Link::Outer(&__hw_t{})", p),
            Some((p, Group::Fused(_))) => format!("{RT}::Link::Fused(&__hw_f{})", p),
        };
        let members: Range<usize> = match group {
            Group::Single(k) => {
                let ctor = match stages[*k].toggle {
                    Toggle::Runtime => "toggled",
                    Toggle::Static => "new",
                };
                let _ = write!(
                    pre,
                    "let mut __hw_t{g} = {RT}::Trampoline::{ctor}(&__HW_SITE_{k}, {link}){observing}; "
                );
                *k..*k + 1
            }
            Group::Fused(range) => {
                let sites: Vec<String> = range.clone().map(|k| format!("&__HW_SITE_{}", k)).collect();
                let _ = write!(
                    pre,
                    "static __HW_SITES_{g}: [&{RT}::CallSite; {}] = [{}]; let mut __hw_f{g} = {RT}::Fused::new(&__HW_SITES_{g}, {link}){observing}; ",
                    range.len(),
                    sites.join(", ")
                );
                range.clone()
            }
        };
        for k in members {
            let rule = &stages[k].rule;
            let target = stage_accessor(g, group, k);
            if let Some(exit) = &rule.on_exit {
                let _ = write!(pre, "{}.set_exit({}); ", target, exit.absolute());
            }
            if let Some(closure) = enter_call(decl, rule) {
                let _ = write!(pre, "{}.enter({}); ", target, closure);
            }
        }
    }

    let after = match form {
        BodyForm::Guard => " }".to_string(),
        BodyForm::Observing => {
            if decl.is_async {
                pre.push_str("let __hw_ret = async move ");
            } else {
                pre.push_str("#[allow(clippy::redundant_closure_call)] let __hw_ret = (move || ");
                if let (true, Some(ret)) = (decl.annotatable, &decl.return_type) {
                    let _ = write!(pre, "-> {} ", ret);
                }
            }
            let mut post = String::from(if decl.is_async { ".await; " } else { ")(); " });
            for (g, group) in groups.iter().enumerate() {
                let members = match group {
                    Group::Single(k) => *k..*k + 1,
                    Group::Fused(range) => range.clone(),
                };
                for k in members {
                    let rule = &stages[k].rule;
                    if let Some(capture) = rule.captures.iter().find(|c| c.is_return()) {
                        let _ = write!(
                            post,
                            "{}.record(|__hw_ctx| __hw_ctx.{}(\"return\", &__hw_ret)); ",
                            stage_accessor(g, group, k),
                            capture.mode.context_method()
                        );
                    }
                }
                let guard = match group {
                    Group::Single(_) => format!("__hw_t{}", g),
                    Group::Fused(_) => format!("__hw_f{}", g),
                };
                let complete = if decl.returns_result { "complete_result" } else { "complete" };
                let _ = write!(post, "{}.{}(&__hw_ret); ", guard, complete);
            }
            post.push_str("__hw_ret }");
            post
        }
    };
    Splice { before: pre, after }
}

/// `extern crate` line needed by 2015-edition crate roots.
pub fn extern_crate_line(crates: &[String]) -> String {
    crates
        .iter()
        .map(|c| format!("extern crate {};", c))
        .collect::<Vec<_>>()
        .join(" ")
}
