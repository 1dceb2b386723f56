//! Task objects: entry closure, budget, state machine, fiber storage.
//!
//! A task's state lives in a single atomic word; terminal states are
//! absorbing, enforced by compare-and-swap loops that refuse to leave
//! them. Exactly one nursery owns each task. The saved-register block and
//! stack are touched only by the worker currently running the task (or
//! the fiber itself, which is the same thread), never concurrently.
//!
//! Cancellation is cooperative: a running task that is cancelled keeps
//! the CPU until its next yield point, where the worker abandons the
//! fiber. Locals still live on an abandoned fiber stack are not dropped;
//! the stack memory itself is reclaimed with the task.

use super::budget::{Budget, BudgetCost};
use super::cx::{Context, FiberStack};
use super::nursery::Nursery;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Result slot value for a task whose body panicked.
pub const PANIC_ERROR_CODE: i32 = i32::MIN;

/// Result slot value for a task terminated by budget exhaustion.
pub const BUDGET_EXHAUSTED_CODE: i32 = i32::MIN + 1;

/// Entry closure of a task.
pub type TaskEntry = Box<dyn FnOnce() -> Result<i64, i32> + Send>;

/// Unique task identifier: owning nursery id in the high 32 bits, spawn
/// sequence number in the low 32.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Id of the owning nursery.
    pub fn nursery(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Spawn sequence within the owning nursery.
    pub fn seq(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "task:{}.{}", self.nursery(), self.seq())
    }
}

/// Task lifecycle states. `Completed`, `Errored`, `Cancelled` and
/// `BudgetExhausted` are terminal and absorbing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued, waiting for a worker.
    Ready = 0,
    /// Executing on a worker.
    Running = 1,
    /// Suspended with a typed reason.
    Blocked = 2,
    /// Finished with a success value.
    Completed = 3,
    /// Finished with an error code (or a panic).
    Errored = 4,
    /// Cancelled before completing.
    Cancelled = 5,
    /// Terminated by a failed budget charge.
    BudgetExhausted = 6,
}

impl TaskState {
    fn from_u8(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Blocked,
            3 => TaskState::Completed,
            4 => TaskState::Errored,
            5 => TaskState::Cancelled,
            _ => TaskState::BudgetExhausted,
        }
    }

    /// Whether this state is absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Errored
                | TaskState::Cancelled
                | TaskState::BudgetExhausted
        )
    }
}

/// Why a blocked task is blocked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockReason {
    /// Parked in `Nursery::await_all`.
    NurseryAwait = 0,
    /// Waiting on the channel collaborator.
    Channel = 1,
    /// Explicit `yield_blocked` with no further detail.
    Other = 2,
}

/// Final value of a task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The entry closure returned `Ok`.
    Success(i64),
    /// The entry closure returned `Err`.
    Error(i32),
    /// The entry closure panicked.
    Panicked,
    /// The task was cancelled before finishing.
    Cancelled,
}

impl TaskOutcome {
    /// The error code a nursery records for this outcome, if any.
    pub fn error_code(self) -> Option<i32> {
        match self {
            TaskOutcome::Error(code) => Some(code),
            TaskOutcome::Panicked => Some(PANIC_ERROR_CODE),
            TaskOutcome::Success(_) | TaskOutcome::Cancelled => None,
        }
    }
}

/// One schedulable unit of work.
pub struct Task {
    id: TaskId,
    state: AtomicU8,
    block_reason: AtomicU8,
    entry: Mutex<Option<TaskEntry>>,
    budget: Arc<Budget>,
    nursery: Weak<Nursery>,
    owned: Mutex<Option<Arc<Nursery>>>,
    result: Mutex<Option<TaskOutcome>>,
    wake_pending: AtomicBool,
    cx: UnsafeCell<Context>,
    stack: Mutex<Option<FiberStack>>,
}

// The register block and stack are only ever touched by the worker that
// currently runs the task (the fiber is that same thread); the state
// machine keeps everyone else out.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// A fresh `Ready` task owned by `nursery`.
    pub(crate) fn new(
        id: TaskId,
        entry: TaskEntry,
        budget: Arc<Budget>,
        nursery: Weak<Nursery>,
    ) -> Arc<Task> {
        Arc::new(Task {
            id,
            state: AtomicU8::new(TaskState::Ready as u8),
            block_reason: AtomicU8::new(BlockReason::Other as u8),
            entry: Mutex::new(Some(entry)),
            budget,
            nursery,
            owned: Mutex::new(None),
            result: Mutex::new(None),
            wake_pending: AtomicBool::new(false),
            cx: UnsafeCell::new(Context::new()),
            stack: Mutex::new(None),
        })
    }

    /// This task's id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Why the task is blocked; meaningful only in `Blocked`.
    pub fn block_reason(&self) -> BlockReason {
        match self.block_reason.load(Ordering::Acquire) {
            0 => BlockReason::NurseryAwait,
            1 => BlockReason::Channel,
            _ => BlockReason::Other,
        }
    }

    /// The budget this task draws on (shared with its nursery).
    pub fn budget(&self) -> &Arc<Budget> {
        &self.budget
    }

    /// Final outcome, once terminal.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        *self.result.lock()
    }

    /// The nursery that owns this task, while it is alive.
    pub fn owning_nursery(&self) -> Option<Arc<Nursery>> {
        self.nursery.upgrade()
    }

    /// CAS one non-terminal transition.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the task `Blocked` with `reason`; caller must be the
    /// running fiber.
    pub(crate) fn block(&self, reason: BlockReason) -> bool {
        self.block_reason.store(reason as u8, Ordering::Release);
        self.transition(TaskState::Running, TaskState::Blocked)
    }

    /// Moves into terminal state `to`, recording `outcome` if no outcome
    /// was recorded yet. Returns `false` when the task was already
    /// terminal (the existing state and outcome win).
    pub(crate) fn try_terminalize(&self, to: TaskState, outcome: TaskOutcome) -> bool {
        debug_assert!(to.is_terminal());
        loop {
            let current = self.state.load(Ordering::Acquire);
            if TaskState::from_u8(current).is_terminal() {
                return false;
            }
            if self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let mut slot = self.result.lock();
                if slot.is_none() {
                    *slot = Some(outcome);
                }
                return true;
            }
        }
    }

    /// Cancels this task. The nursery it owns (if any) is cancelled
    /// first, so the whole subtree is cancelled before this task becomes
    /// terminal. Returns whether this call performed the cancellation.
    pub fn cancel(self: &Arc<Self>) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        if let Some(nursery) = self.owned_nursery() {
            nursery.cancel();
        }
        if self.try_terminalize(TaskState::Cancelled, TaskOutcome::Cancelled) {
            self.notify_owner();
            true
        } else {
            false
        }
    }

    /// Charges this task's budget. On exhaustion the task is moved to
    /// `BudgetExhausted` and its nursery notified; the body should
    /// return promptly.
    pub fn try_charge(self: &Arc<Self>, cost: BudgetCost) -> bool {
        if self.budget.try_charge(cost) {
            return true;
        }
        if self.try_terminalize(
            TaskState::BudgetExhausted,
            TaskOutcome::Error(BUDGET_EXHAUSTED_CODE),
        ) {
            self.notify_owner();
        }
        false
    }

    /// Reports this task's terminal outcome to its owning nursery.
    pub(crate) fn notify_owner(self: &Arc<Self>) {
        if let Some(nursery) = self.nursery.upgrade() {
            nursery.notify_child_complete(self);
        }
    }

    /// Takes the entry closure; `None` after the first run began.
    pub(crate) fn take_entry(&self) -> Option<TaskEntry> {
        self.entry.lock().take()
    }

    /// Leaves a wake token for a task that may not have finished
    /// parking yet. The worker consumes it right after the `Blocked`
    /// transition, turning a lost wakeup into an immediate requeue.
    pub(crate) fn set_wake_pending(&self) {
        self.wake_pending.store(true, Ordering::Release);
    }

    /// Consumes the wake token, if one is pending.
    pub(crate) fn consume_wake_pending(&self) -> bool {
        self.wake_pending.swap(false, Ordering::AcqRel)
    }

    /// Binds the nursery this task opened. Used by the bidirectional
    /// link helper in `nursery.rs`.
    pub(crate) fn set_owned_nursery(&self, nursery: Option<Arc<Nursery>>) {
        *self.owned.lock() = nursery;
    }

    /// The nursery this task currently owns.
    pub(crate) fn owned_nursery(&self) -> Option<Arc<Nursery>> {
        self.owned.lock().clone()
    }

    /// Whether the fiber context has been laid out.
    pub(crate) fn fiber_initialized(&self) -> bool {
        self.stack.lock().is_some()
    }

    /// Allocates the fiber stack and lays out the boot context. Called
    /// once, by the worker about to run the task for the first time.
    pub(crate) fn init_fiber(&self, stack_size: usize, boot: Box<dyn FnOnce() + Send>) {
        let stack = FiberStack::new(stack_size);
        let cx = Context::fresh(&stack, boot);
        unsafe { self.cx.get().write(cx) };
        *self.stack.lock() = Some(stack);
    }

    /// Raw pointer to the saved-register block. Only the worker that
    /// currently owns the run may use it.
    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.cx.get()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("outcome", &self.outcome())
            .finish()
    }
}
