//! Per-thread invocation chain.
//!
//! Each synchronous trampoline pushes its invocation id on entry and pops it
//! on exit, so the top of the stack is always the innermost instrumented
//! frame of *this* thread. Nothing here is shared between threads.

use std::cell::RefCell;

use crate::context::InvocationId;

thread_local! {
    static CHAIN: RefCell<Vec<InvocationId>> = const { RefCell::new(Vec::new()) };
}

/// Innermost instrumented invocation currently running on the calling thread.
pub fn current() -> Option<InvocationId> {
    CHAIN
        .try_with(|chain| chain.borrow().last().copied())
        .ok()
        .flatten()
}

pub(crate) fn push(id: InvocationId) {
    let _ = CHAIN.try_with(|chain| chain.borrow_mut().push(id));
}

pub(crate) fn pop(id: InvocationId) {
    let _ = CHAIN.try_with(|chain| {
        let mut chain = chain.borrow_mut();
        if chain.last() == Some(&id) {
            chain.pop();
        } else if let Some(pos) = chain.iter().rposition(|&other| other == id) {
            // A guard was leaked (mem::forget) further up; drop everything above it too.
            chain.truncate(pos);
        }
    });
}
