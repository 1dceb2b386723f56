//! Worker threads and the fiber yield primitives.
//!
//! Each worker drives one OS thread: run the local deque (LIFO), drain
//! the scheduler's injector, steal from a seeded round-robin sequence of
//! peers, or back off. Running a task installs it as the thread-local
//! current fiber and context-switches onto its stack; the only ways back
//! are the yield primitives below.
//!
//! State transitions triggered by a yield are performed by the *worker*,
//! after the fiber's context is saved. A task therefore never becomes
//! visible as `Ready` or `Blocked` while its registers are still live on
//! a CPU, which is what makes wakeups from other threads safe.

use super::cx::{switch, Context};
use super::deque::{Steal, WorkDeque};
use super::task::{BlockReason, Task, TaskOutcome, TaskState};
use super::Scheduler;
use crossbeam_utils::Backoff;
use log::{debug, trace};
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Why the current fiber handed control back to its worker.
#[derive(Copy, Clone, Debug)]
enum YieldIntent {
    /// Reschedule me.
    Yield,
    /// Park me with this reason.
    Block(BlockReason),
    /// I am done; record this outcome.
    Complete(TaskOutcome),
}

struct CurrentFiber {
    task: Arc<Task>,
    worker_cx: *mut Context,
    intent: Cell<YieldIntent>,
}

struct WorkerTls {
    sched_addr: usize,
    deque: Arc<WorkDeque>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentFiber>> = const { RefCell::new(None) };
    static WORKER: RefCell<Option<WorkerTls>> = const { RefCell::new(None) };
}

/// The task executing on this thread, when called from inside a fiber.
#[inline(never)]
pub fn current_task() -> Option<Arc<Task>> {
    CURRENT.with(|current| current.borrow().as_ref().map(|fiber| fiber.task.clone()))
}

/// Whether this thread is currently inside a fiber context.
#[inline(never)]
pub fn in_fiber_context() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

#[inline(never)]
fn yield_with(intent: YieldIntent) {
    let (task_cx, worker_cx) = CURRENT.with(|current| {
        let current = current.borrow();
        let fiber = current
            .as_ref()
            .expect("yield primitive called outside a fiber");
        fiber.intent.set(intent);
        (fiber.task.context_ptr(), fiber.worker_cx)
    });
    // The borrow is released before the switch; the worker reclaims the
    // slot after control returns to it.
    unsafe { switch(task_cx, worker_cx) };
}

/// Cooperatively gives up the CPU; the task is requeued as `Ready`.
pub fn yield_now() {
    yield_with(YieldIntent::Yield);
}

/// Parks the current task with a typed reason. Something must later mark
/// it `Ready` and resubmit it (nurseries and channels do).
pub fn yield_blocked(reason: BlockReason) {
    yield_with(YieldIntent::Block(reason));
}

/// Finishes the current task with `outcome` and never returns.
pub fn yield_complete(outcome: TaskOutcome) -> ! {
    yield_with(YieldIntent::Complete(outcome));
    unreachable!("completed fiber was resumed");
}

/// Local-deque hand-off for `Scheduler::submit` when called on a worker
/// thread of the same scheduler. Returns the task back otherwise.
#[inline(never)]
pub(crate) fn push_local(sched_addr: usize, task: Arc<Task>) -> Result<(), Arc<Task>> {
    WORKER.with(|worker| {
        let worker = worker.borrow();
        match worker.as_ref() {
            Some(tls) if tls.sched_addr == sched_addr => tls.deque.push_bottom(task),
            _ => Err(task),
        }
    })
}

fn requeue(sched: &Scheduler, deque: &WorkDeque, task: Arc<Task>) {
    if let Err(task) = deque.push_bottom(task) {
        sched.inject(task);
    }
}

fn run_task(sched: &Arc<Scheduler>, deque: &Arc<WorkDeque>, task: Arc<Task>) {
    if !task.transition(TaskState::Ready, TaskState::Running) {
        // Cancelled (or otherwise finished) while queued.
        trace!("worker: skipping {:?} in state {:?}", task.id(), task.state());
        return;
    }
    task.consume_wake_pending();

    if !task.fiber_initialized() {
        let fiber_task = task.clone();
        task.init_fiber(
            sched.config().stack_size,
            Box::new(move || {
                let entry = fiber_task.take_entry().expect("fiber booted twice");
                let outcome = match catch_unwind(AssertUnwindSafe(entry)) {
                    Ok(Ok(value)) => TaskOutcome::Success(value),
                    Ok(Err(code)) => TaskOutcome::Error(code),
                    Err(_) => TaskOutcome::Panicked,
                };
                yield_complete(outcome);
            }),
        );
    }

    let mut worker_cx = Context::new();
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(CurrentFiber {
            task: task.clone(),
            worker_cx: &mut worker_cx,
            intent: Cell::new(YieldIntent::Yield),
        });
    });

    unsafe { switch(&mut worker_cx, task.context_ptr()) };

    let fiber = CURRENT
        .with(|current| current.borrow_mut().take())
        .expect("current fiber slot cleared during run");

    match fiber.intent.get() {
        YieldIntent::Yield => {
            if task.transition(TaskState::Running, TaskState::Ready) {
                requeue(sched, deque, task);
            }
            // Transition failure means cancellation won while the fiber
            // ran; the canceller has already notified the nursery and
            // the fiber is abandoned.
        }
        YieldIntent::Block(reason) => {
            if task.block(reason) {
                // A wakeup that raced the park is honored now that the
                // context is saved.
                if task.consume_wake_pending()
                    && task.transition(TaskState::Blocked, TaskState::Ready)
                {
                    requeue(sched, deque, task);
                }
            }
        }
        YieldIntent::Complete(outcome) => {
            let terminal = match outcome {
                TaskOutcome::Success(_) => TaskState::Completed,
                TaskOutcome::Error(_) | TaskOutcome::Panicked => TaskState::Errored,
                TaskOutcome::Cancelled => TaskState::Cancelled,
            };
            if task.try_terminalize(terminal, outcome) {
                task.notify_owner();
            }
        }
    }
}

/// Body of one worker thread.
pub(crate) fn worker_loop(sched: Arc<Scheduler>, index: usize) {
    let deque = sched.deque(index);
    WORKER.with(|worker| {
        *worker.borrow_mut() = Some(WorkerTls {
            sched_addr: Arc::as_ptr(&sched) as usize,
            deque: deque.clone(),
        });
    });
    debug!("worker {}: up", index);

    let worker_count = sched.worker_count();
    let mut rng = oorandom::Rand32::new(
        sched
            .config()
            .steal_seed
            .wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
    );
    let mut backoff = Backoff::new();

    while !sched.is_shutdown() {
        if let Some(task) = deque.pop_bottom() {
            backoff = Backoff::new();
            run_task(&sched, &deque, task);
            continue;
        }
        if let Some(task) = sched.pop_injected() {
            backoff = Backoff::new();
            run_task(&sched, &deque, task);
            continue;
        }

        let mut stolen = None;
        if worker_count > 1 {
            let start = rng.rand_range(0..worker_count as u32) as usize;
            for offset in 0..worker_count {
                let victim = (start + offset) % worker_count;
                if victim == index {
                    continue;
                }
                match sched.deque(victim).steal_top() {
                    Steal::Success(task) => {
                        stolen = Some(task);
                        break;
                    }
                    Steal::Retry | Steal::Empty => {}
                }
            }
        }
        if let Some(task) = stolen {
            backoff = Backoff::new();
            run_task(&sched, &deque, task);
            continue;
        }

        if backoff.is_completed() {
            std::thread::park_timeout(Duration::from_micros(500));
        } else {
            backoff.snooze();
        }
    }

    WORKER.with(|worker| worker.borrow_mut().take());
    debug!("worker {}: down ({} tasks left local)", index, deque.len());
}
