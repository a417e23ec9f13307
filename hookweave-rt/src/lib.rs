//! Runtime support for programs instrumented by hookweave.
//!
//! Code injected at build time only ever talks to this crate. Every matched
//! declaration gets one [`Trampoline`] per applied rule: the trampoline owns a
//! fresh [`CallContext`], runs the rule's onEnter hook at function entry, and
//! runs the onExit hook from its `Drop` impl. Because the exit hook lives in
//! `Drop`, it fires on every way out of the function: normal return, `?`,
//! early `return`, and unwinding panics.
//!
//! Hook crates depend on this crate and expose functions of the shape
//!
//! ```ignore
//! pub fn on_enter(ctx: &mut CallContext) -> Span;                  // free fn
//! pub fn on_enter<R: ?Sized>(ctx: &mut CallContext, recv: &R);      // method
//! pub fn on_exit(ctx: &mut CallContext, outcome: &Outcome);
//! ```

mod chain;
mod context;
pub mod switch;
mod trampoline;

pub use chain::current;
pub use context::{CallContext, CallSite, Captured, InvocationId};
pub use trampoline::{ExitHook, Fused, Link, Outcome, Trampoline};
