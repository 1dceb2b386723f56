//! C-ABI compatibility gasket.
//!
//! Legacy callers that cannot thread a nursery handle through every call
//! get a thread-local nursery stack and a handful of `extern "C"` entry
//! points over it. This module is a gasket, not the primary interface:
//! the scheduler itself never reads the thread-local stack, and native
//! callers should pass nursery handles explicitly.
//!
//! C-side convention: a task entry returning a negative value reports
//! that value as its error code; zero and positive values are success.

use crate::error::SchedError;
use crate::sched::nursery::Nursery;
use crate::sched::task::Task;
use crate::sched::worker;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static NURSERY_STACK: RefCell<Vec<Arc<Nursery>>> = const { RefCell::new(Vec::new()) };
}

/// Pushes `nursery` as this thread's implicit current nursery.
pub fn enter(nursery: Arc<Nursery>) {
    NURSERY_STACK.with(|stack| stack.borrow_mut().push(nursery));
}

/// Pops the implicit nursery stack.
pub fn exit() -> Option<Arc<Nursery>> {
    NURSERY_STACK.with(|stack| stack.borrow_mut().pop())
}

/// The innermost implicit nursery, if one is installed.
pub fn current() -> Option<Arc<Nursery>> {
    NURSERY_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Spawns into the innermost implicit nursery.
pub fn spawn<F>(entry: F) -> Result<Arc<Task>, SchedError>
where
    F: FnOnce() -> Result<i64, i32> + Send + 'static,
{
    match current() {
        Some(nursery) => nursery.spawn(entry),
        None => Err(SchedError::SpawnRejected),
    }
}

/// C entry point: spawns `entry(arg)` into the implicit nursery.
/// Returns the raw task id, or `0` when the spawn was rejected.
#[no_mangle]
pub extern "C" fn sovereign_compat_spawn(entry: extern "C" fn(i64) -> i64, arg: i64) -> u64 {
    let spawned = spawn(move || {
        let value = entry(arg);
        if value < 0 {
            Err(value as i32)
        } else {
            Ok(value)
        }
    });
    match spawned {
        Ok(task) => task.id().0,
        Err(_) => 0,
    }
}

/// C entry point: cooperative yield from the current fiber. No-op when
/// called outside a fiber.
#[no_mangle]
pub extern "C" fn sovereign_compat_yield() {
    if worker::in_fiber_context() {
        worker::yield_now();
    }
}

/// C entry point: whether the calling thread is inside a fiber.
#[no_mangle]
pub extern "C" fn sovereign_compat_in_fiber() -> i32 {
    worker::in_fiber_context() as i32
}
