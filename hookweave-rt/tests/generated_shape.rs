// Functions written out in the exact shape the injector renders, checked
// against the runtime: hooks fire once per invocation on every exit path.

use std::cell::RefCell;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::thread;

use hookweave_rt::{CallContext, InvocationId, Outcome};

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static PARENTS: RefCell<Vec<(&'static str, Option<InvocationId>, InvocationId)>> = const { RefCell::new(Vec::new()) };
}

fn take_events() -> Vec<String> {
    EVENTS.with(|e| std::mem::take(&mut *e.borrow_mut()))
}

mod hooks {
    use super::*;

    pub struct Span(pub &'static str);

    pub fn on_enter(ctx: &mut CallContext) -> Span {
        EVENTS.with(|e| e.borrow_mut().push(format!("enter {}", ctx.site().rule)));
        PARENTS.with(|p| p.borrow_mut().push((ctx.site().rule, ctx.parent_id(), ctx.invocation_id())));
        Span(ctx.site().rule)
    }

    pub fn on_enter_method<R: ?Sized>(ctx: &mut CallContext, _recv: &R) {
        let url = ctx.param("url").unwrap_or("-").to_string();
        EVENTS.with(|e| e.borrow_mut().push(format!("enter {} {}", ctx.site().rule, url)));
    }

    pub fn on_exit(ctx: &mut CallContext, outcome: &Outcome) {
        let span = ctx.attachment::<Span>().map(|s| s.0).unwrap_or("none");
        let ret = ctx.return_value().unwrap_or("-").to_string();
        EVENTS.with(|e| {
            e.borrow_mut()
                .push(format!("exit {} {:?} span={} ret={}", ctx.site().rule, outcome, span, ret))
        });
    }
}

#[derive(Debug)]
pub struct Error;

pub struct Client {
    fail_on: u32,
}

impl Client {
    // Two rules, observing form (returns Result), second rule captures a param.
    pub fn do_request(&self, url: &str, attempt: u32) -> Result<String, Error> { static __HW_SITE_0: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "outer", package: "pkg::client", function: "Client::do_request" }; static __HW_SITE_1: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "inner", package: "pkg::client", function: "Client::do_request" }; let mut __hw_t0 = ::hookweave_rt::Trampoline::new(&__HW_SITE_0, ::hookweave_rt::Link::Thread).observing(); __hw_t0.set_exit(crate::hooks::on_exit); __hw_t0.enter(|__hw_ctx| { crate::hooks::on_enter(__hw_ctx)}); let mut __hw_t1 = ::hookweave_rt::Trampoline::new(&__HW_SITE_1, ::hookweave_rt::Link::Outer(&__hw_t0)).observing(); __hw_t1.set_exit(crate::hooks::on_exit); __hw_t1.enter(|__hw_ctx| { __hw_ctx.capture_display("url", &url); __hw_ctx.capture_receiver(&*self); crate::hooks::on_enter_method(__hw_ctx, &*self)}); #[allow(clippy::redundant_closure_call)] let __hw_ret = (move || -> Result<String, Error> {
        if attempt == self.fail_on {
            return Err(Error);
        }
        Ok(format!("{}#{}", url, attempt))
    })(); __hw_t0.complete_result(&__hw_ret); __hw_t1.complete_result(&__hw_ret); __hw_ret }
}

// Guard form with an early return.
pub fn early(flag: bool) -> u8 { static __HW_SITE_0: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "early", package: "pkg", function: "early" }; let mut __hw_t0 = ::hookweave_rt::Trampoline::new(&__HW_SITE_0, ::hookweave_rt::Link::Thread); __hw_t0.set_exit(crate::hooks::on_exit); __hw_t0.enter(|__hw_ctx| { crate::hooks::on_enter(__hw_ctx)}); {
    if flag {
        return 1;
    }
    2
} }

// Guard form around a panicking body.
pub fn explode() { static __HW_SITE_0: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "explode", package: "pkg", function: "explode" }; let mut __hw_t0 = ::hookweave_rt::Trampoline::new(&__HW_SITE_0, ::hookweave_rt::Link::Thread); __hw_t0.set_exit(crate::hooks::on_exit); {
    panic!("boom");
} }

// Observing form with a return capture, calling another instrumented fn.
pub fn caller() -> u8 { static __HW_SITE_0: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "caller", package: "pkg", function: "caller" }; let mut __hw_t0 = ::hookweave_rt::Trampoline::new(&__HW_SITE_0, ::hookweave_rt::Link::Thread).observing(); __hw_t0.set_exit(crate::hooks::on_exit); __hw_t0.enter(|__hw_ctx| { crate::hooks::on_enter(__hw_ctx)}); #[allow(clippy::redundant_closure_call)] let __hw_ret = (move || -> u8 {
    early(false) + 1
})(); __hw_t0.record(|__hw_ctx| __hw_ctx.capture_debug("return", &__hw_ret)); __hw_t0.complete(&__hw_ret); __hw_ret }

// Two fusible rules behind one guard.
pub fn fused(n: u32) -> u32 { static __HW_SITE_0: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "f0", package: "pkg", function: "fused" }; static __HW_SITE_1: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "f1", package: "pkg", function: "fused" }; static __HW_SITES_0: [&::hookweave_rt::CallSite; 2] = [&__HW_SITE_0, &__HW_SITE_1]; let mut __hw_f0 = ::hookweave_rt::Fused::new(&__HW_SITES_0, ::hookweave_rt::Link::Thread); __hw_f0.stage(0).set_exit(crate::hooks::on_exit); __hw_f0.stage(0).enter(|__hw_ctx| { crate::hooks::on_enter(__hw_ctx)}); __hw_f0.stage(1).set_exit(crate::hooks::on_exit); __hw_f0.stage(1).enter(|__hw_ctx| { crate::hooks::on_enter(__hw_ctx)}); {
    n * 2
} }

// Async bodies: detached link, observing form.
pub async fn tick() { static __HW_SITE_0: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "tick", package: "pkg", function: "tick" }; let mut __hw_t0 = ::hookweave_rt::Trampoline::new(&__HW_SITE_0, ::hookweave_rt::Link::Detached).observing(); __hw_t0.set_exit(crate::hooks::on_exit); __hw_t0.enter(|__hw_ctx| { crate::hooks::on_enter(__hw_ctx)}); let __hw_ret = async move {
    std::future::pending::<()>().await
}.await; __hw_t0.complete(&__hw_ret); __hw_ret }

pub async fn ready(n: u8) -> u8 { static __HW_SITE_0: ::hookweave_rt::CallSite = ::hookweave_rt::CallSite { rule: "ready", package: "pkg", function: "ready" }; let mut __hw_t0 = ::hookweave_rt::Trampoline::new(&__HW_SITE_0, ::hookweave_rt::Link::Detached).observing(); __hw_t0.set_exit(crate::hooks::on_exit); __hw_t0.enter(|__hw_ctx| { crate::hooks::on_enter(__hw_ctx)}); let __hw_ret = async move {
    n + 1
}.await; __hw_t0.complete(&__hw_ret); __hw_ret }

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    // SAFETY: every vtable entry ignores the data pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    pin!(fut).poll(&mut cx)
}

#[test]
fn test_three_calls_two_succeed_one_fails() {
    take_events();
    let client = Client { fail_on: 2 };
    let results: Vec<bool> = (1..=3).map(|i| client.do_request("http://x", i).is_ok()).collect();
    assert_eq!(results, vec![true, false, true]);

    let events = take_events();
    let enters = events.iter().filter(|e| e.starts_with("enter")).count();
    let exits: Vec<&String> = events.iter().filter(|e| e.starts_with("exit")).collect();
    assert_eq!(enters, 6);
    assert_eq!(exits.len(), 6);
    // Rule order: outer enters first and exits last.
    assert_eq!(events[0], "enter outer");
    assert_eq!(events[1], "enter inner http://x");
    assert!(events[2].starts_with("exit inner Succeeded"));
    assert!(events[3].starts_with("exit outer Succeeded span=outer"));
    assert_eq!(exits.iter().filter(|e| e.contains("Failed")).count(), 2);
}

#[test]
fn test_original_values_unchanged() {
    let client = Client { fail_on: 0 };
    assert_eq!(client.do_request("a", 7).unwrap(), "a#7");
    assert_eq!(early(true), 1);
    assert_eq!(early(false), 2);
    assert_eq!(fused(21), 42);
    take_events();
}

#[test]
fn test_early_return_fires_exit() {
    take_events();
    early(true);
    assert_eq!(take_events(), vec!["enter early", "exit early Returned span=early ret=-"]);
}

#[test]
fn test_panic_fires_exit_with_panicked() {
    take_events();
    let result = std::panic::catch_unwind(explode);
    assert!(result.is_err());
    assert_eq!(take_events(), vec!["exit explode Panicked span=none ret=-"]);
    assert_eq!(hookweave_rt::current(), None);
}

#[test]
fn test_cross_function_parent_and_return_capture() {
    PARENTS.with(|p| p.borrow_mut().clear());
    take_events();
    assert_eq!(caller(), 3);
    let parents = PARENTS.with(|p| p.borrow().clone());
    assert_eq!(parents.len(), 2);
    let (_, caller_parent, caller_id) = parents[0];
    let (_, early_parent, _) = parents[1];
    assert_eq!(caller_parent, None);
    assert_eq!(early_parent, Some(caller_id));
    let events = take_events();
    assert_eq!(events.last().map(String::as_str), Some("exit caller Returned span=caller ret=3"));
}

#[test]
fn test_fused_stages_nest_like_separate_guards() {
    take_events();
    fused(1);
    assert_eq!(
        take_events(),
        vec![
            "enter f0",
            "enter f1",
            "exit f1 Returned span=f1 ret=-",
            "exit f0 Returned span=f0 ret=-",
        ]
    );
}

#[test]
fn test_concurrent_invocations_are_independent() {
    let client = Arc::new(Client { fail_on: u32::MAX });
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                PARENTS.with(|p| p.borrow_mut().clear());
                for n in 0..50 {
                    client.do_request("c", i * 100 + n).unwrap();
                }
                let parents = PARENTS.with(|p| p.borrow().clone());
                let events = take_events();
                // Every top-level invocation starts a fresh chain on its own thread.
                assert!(parents.iter().all(|(_, parent, _)| parent.is_none()));
                assert_eq!(events.iter().filter(|e| e.starts_with("exit")).count(), 100);
                parents.into_iter().map(|(_, _, id)| id).collect::<Vec<_>>()
            })
        })
        .collect();
    let mut ids: Vec<InvocationId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert_eq!(total, 400);
}

#[test]
fn test_dropped_future_reports_cancelled() {
    take_events();
    assert!(poll_once(tick()).is_pending());
    assert_eq!(take_events(), vec!["enter tick", "exit tick Cancelled span=tick ret=-"]);
    assert_eq!(hookweave_rt::current(), None);
}

#[test]
fn test_completed_future_reports_returned() {
    take_events();
    assert_eq!(poll_once(ready(1)), Poll::Ready(2));
    assert_eq!(take_events(), vec!["enter ready", "exit ready Returned span=ready ret=-"]);
}
