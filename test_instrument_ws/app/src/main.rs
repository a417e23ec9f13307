use std::future::Future;
use std::pin::pin;
use std::task::{Context, RawWaker, RawWakerVTable, Waker};

use pkg::client::Client;

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    // SAFETY: the vtable never touches the data pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn main() {
    let client = Client::new(2);
    for attempt in 1..=3 {
        match client.do_request("http://example.test", attempt) {
            Ok(body) => println!("ok: {}", body),
            Err(e) => println!("err: {}", e),
        }
    }

    // Poll once, then drop the pending future.
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    if pin!(pkg::tick()).poll(&mut cx).is_pending() {
        println!("tick: pending");
    }
}
