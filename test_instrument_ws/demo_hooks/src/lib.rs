use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use hookweave_rt::{CallContext, Outcome};

static EXITS: AtomicUsize = AtomicUsize::new(0);

pub fn on_enter<R: ?Sized>(ctx: &mut CallContext, _receiver: &R) -> Instant {
    eprintln!(
        "[hook] enter {} #{} parent={:?} url={}",
        ctx.site().function,
        ctx.invocation_id(),
        ctx.parent_id(),
        ctx.param("url").unwrap_or("?")
    );
    Instant::now()
}

pub fn on_enter_free(ctx: &mut CallContext) -> Instant {
    eprintln!("[hook] enter {} #{} parent={:?}", ctx.site().function, ctx.invocation_id(), ctx.parent_id());
    Instant::now()
}

pub fn on_exit(ctx: &mut CallContext, outcome: &Outcome) {
    let elapsed = ctx.attachment::<Instant>().map(|t| t.elapsed());
    eprintln!(
        "[hook] exit {} #{} {:?} after {:?} ret={}",
        ctx.site().function,
        ctx.invocation_id(),
        outcome,
        elapsed,
        ctx.return_value().unwrap_or("-")
    );
}

pub fn count_exit(_ctx: &mut CallContext, _outcome: &Outcome) {
    EXITS.fetch_add(1, Ordering::Relaxed);
}
