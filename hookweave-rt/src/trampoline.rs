use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use crate::chain;
use crate::context::{CallContext, CallSite, InvocationId};
use crate::switch;

/// How a wrapped call ended, as reported to onExit hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Returned `Ok(..)`.
    Succeeded,
    /// Returned `Err(..)`; carries the error's type name.
    Failed { error_type: &'static str },
    /// Returned a value whose success could not be classified.
    Returned,
    /// Unwound through the function.
    Panicked,
    /// An async body was dropped before it completed.
    Cancelled,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. } | Outcome::Panicked)
    }
}

pub type ExitHook = fn(&mut CallContext, &Outcome);

/// Where a new trampoline takes its parent invocation from.
pub enum Link<'a> {
    /// Top of the calling thread's chain; the new invocation is pushed on it.
    Thread,
    /// Top of the calling thread's chain, but never pushed (async bodies can
    /// migrate between threads).
    Detached,
    /// An outer trampoline of the same declaration.
    Outer(&'a Trampoline),
    /// An outer fused group of the same declaration; links to its innermost
    /// stage.
    Fused(&'a Fused),
}

impl Link<'_> {
    fn resolve(&self) -> (Option<InvocationId>, bool) {
        match self {
            Link::Thread => (chain::current(), true),
            Link::Detached => (chain::current(), false),
            Link::Outer(outer) => (outer.link_id, outer.chained),
            Link::Fused(group) => match group.stages.last() {
                Some(inner) => (inner.link_id, inner.chained),
                None => (group.parent, group.chained),
            },
        }
    }
}

/// Guard created at function entry for one applied rule.
pub struct Trampoline {
    ctx: CallContext,
    active: bool,
    chained: bool,
    observing: bool,
    // Opened while the thread was already unwinding, e.g. from a `Drop`.
    opened_unwinding: bool,
    // Own id when active, otherwise the parent it would have had.
    link_id: Option<InvocationId>,
    exit: Option<ExitHook>,
    outcome: Option<Outcome>,
}

impl Trampoline {
    pub fn new(site: &'static CallSite, link: Link<'_>) -> Self {
        Self::open(site, link, true)
    }

    /// Like [`Trampoline::new`], but inert when the rule is switched off at
    /// runtime through [`switch`].
    pub fn toggled(site: &'static CallSite, link: Link<'_>) -> Self {
        Self::open(site, link, switch::is_enabled(site.rule))
    }

    fn open(site: &'static CallSite, link: Link<'_>, active: bool) -> Self {
        let (parent, chained) = link.resolve();
        Self::open_linked(site, parent, chained, active)
    }

    fn open_linked(
        site: &'static CallSite,
        parent: Option<InvocationId>,
        chained: bool,
        active: bool,
    ) -> Self {
        let ctx = CallContext::new(site, parent);
        let link_id = if active { Some(ctx.invocation_id()) } else { parent };
        if active && chained {
            chain::push(ctx.invocation_id());
        }
        Self {
            ctx,
            active,
            chained,
            observing: false,
            opened_unwinding: thread::panicking(),
            link_id,
            exit: None,
            outcome: None,
        }
    }

    /// Marks a guard whose body result is reported through `complete*`; a
    /// missing completion then means the body never finished.
    pub fn observing(mut self) -> Self {
        self.observing = true;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn set_exit(&mut self, hook: ExitHook) {
        self.exit = Some(hook);
    }

    /// Run the onEnter part: captures plus the hook call. The closure's
    /// result is attached to the context.
    pub fn enter<F, R>(&mut self, f: F)
    where
        F: FnOnce(&mut CallContext) -> R,
        R: Send + 'static,
    {
        if !self.active {
            return;
        }
        let ctx = &mut self.ctx;
        if let Ok(value) = catch_unwind(AssertUnwindSafe(|| f(ctx))) {
            self.ctx.attach(value);
        }
    }

    /// Record extra data (e.g. a return value capture) before exit.
    pub fn record<F: FnOnce(&mut CallContext)>(&mut self, f: F) {
        if !self.active {
            return;
        }
        let ctx = &mut self.ctx;
        let _ = catch_unwind(AssertUnwindSafe(|| f(ctx)));
    }

    pub fn complete<T: ?Sized>(&mut self, _value: &T) {
        self.outcome = Some(Outcome::Returned);
    }

    pub fn complete_result<T, E>(&mut self, value: &Result<T, E>) {
        self.outcome = Some(match value {
            Ok(_) => Outcome::Succeeded,
            Err(_) => Outcome::Failed {
                error_type: std::any::type_name::<E>(),
            },
        });
    }

    fn finish(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None if thread::panicking() && !self.opened_unwinding => Outcome::Panicked,
            None if self.observing => Outcome::Cancelled,
            None => Outcome::Returned,
        };
        if let Some(exit) = self.exit {
            let ctx = &mut self.ctx;
            let _ = catch_unwind(AssertUnwindSafe(|| exit(ctx, &outcome)));
        }
        if self.chained {
            chain::pop(self.ctx.invocation_id());
        }
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Several stages of one declaration behind a single guard.
///
/// Stages enter in order and exit in reverse order, exactly as the same
/// number of separate nested trampolines would.
pub struct Fused {
    stages: Vec<Trampoline>,
    parent: Option<InvocationId>,
    chained: bool,
}

impl Fused {
    pub fn new(sites: &[&'static CallSite], link: Link<'_>) -> Self {
        let mut stages: Vec<Trampoline> = Vec::with_capacity(sites.len());
        let (parent, chained) = link.resolve();
        for &site in sites {
            let stage = match stages.last() {
                Some(prev) => Trampoline::new(site, Link::Outer(prev)),
                None => Trampoline::open_linked(site, parent, chained, true),
            };
            stages.push(stage);
        }
        Self {
            stages,
            parent,
            chained,
        }
    }

    pub fn observing(mut self) -> Self {
        for stage in &mut self.stages {
            stage.observing = true;
        }
        self
    }

    pub fn stage(&mut self, index: usize) -> &mut Trampoline {
        &mut self.stages[index]
    }

    pub fn complete<T: ?Sized>(&mut self, value: &T) {
        for stage in &mut self.stages {
            stage.complete(value);
        }
    }

    pub fn complete_result<T, E>(&mut self, value: &Result<T, E>) {
        for stage in &mut self.stages {
            stage.complete_result(value);
        }
    }
}

impl Drop for Fused {
    fn drop(&mut self) {
        while let Some(mut stage) = self.stages.pop() {
            stage.finish();
        }
    }
}
