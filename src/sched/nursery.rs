//! Structured-concurrency nurseries.
//!
//! A nursery owns every task spawned into it and refuses to finish before
//! they do. The state machine is `Open → Closing → Closed` on the happy
//! path, with `Cancelling → Cancelled` reachable from `Open` or
//! `Closing`; the two right-hand states are terminal. Cancellation walks
//! the whole subtree: each non-finished child is cancelled, and any
//! nursery such a child owns is cancelled before the child becomes
//! terminal.
//!
//! Awaiting parks the calling fiber as the nursery's awaiter; the last
//! child to complete marks it ready and hands it back to the scheduler.
//! Outside a fiber the wait degrades to short polling. The result
//! priority is fixed: a child failure beats cancellation beats success.

use super::budget::{Budget, BudgetCost};
use super::task::{BlockReason, Task, TaskEntry, TaskId, TaskState};
use super::worker;
use super::Scheduler;
use crate::error::SchedError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Nursery lifecycle states. `Closed` and `Cancelled` are terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NurseryState {
    /// Accepting spawns.
    Open = 0,
    /// No further spawns; draining children.
    Closing = 1,
    /// Cancelling children; no further spawns.
    Cancelling = 2,
    /// All children finished after a close.
    Closed = 3,
    /// All children finished after a cancel.
    Cancelled = 4,
}

impl NurseryState {
    fn from_u8(raw: u8) -> NurseryState {
        match raw {
            0 => NurseryState::Open,
            1 => NurseryState::Closing,
            2 => NurseryState::Cancelling,
            3 => NurseryState::Closed,
            _ => NurseryState::Cancelled,
        }
    }

    /// Whether this state is absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, NurseryState::Closed | NurseryState::Cancelled)
    }
}

/// What `await_all` concluded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NurseryOutcome {
    /// Every child completed successfully.
    Success,
    /// At least one child failed; the first failure wins, even when the
    /// nursery was also cancelled.
    ChildFailed {
        /// The failing task.
        task: TaskId,
        /// Its error code.
        code: i32,
    },
    /// The nursery was cancelled and no child failed.
    Cancelled,
    /// Children are still running.
    Pending,
}

/// A scope owning a set of child tasks.
pub struct Nursery {
    id: u32,
    state: AtomicU8,
    budget: Arc<Budget>,
    children: Mutex<SmallVec<[Arc<Task>; 4]>>,
    completed: AtomicUsize,
    next_seq: AtomicU32,
    first_error: Mutex<Option<(TaskId, i32)>>,
    parent: Option<u32>,
    owner: Mutex<Option<Weak<Task>>>,
    sched: Arc<Scheduler>,
    awaiter: Mutex<Option<Arc<Task>>>,
}

impl Nursery {
    pub(crate) fn new(
        sched: Arc<Scheduler>,
        budget: Budget,
        parent: Option<u32>,
    ) -> Arc<Nursery> {
        let id = sched.next_nursery_id();
        debug!("nursery {}: open (parent {:?})", id, parent);
        Arc::new(Nursery {
            id,
            state: AtomicU8::new(NurseryState::Open as u8),
            budget: Arc::new(budget),
            children: Mutex::new(SmallVec::new()),
            completed: AtomicUsize::new(0),
            next_seq: AtomicU32::new(0),
            first_error: Mutex::new(None),
            parent,
            owner: Mutex::new(None),
            sched,
            awaiter: Mutex::new(None),
        })
    }

    /// This nursery's id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Parent nursery id, when opened from inside another scope.
    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    /// Current state.
    pub fn state(&self) -> NurseryState {
        NurseryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The budget children draw on.
    pub fn budget(&self) -> &Arc<Budget> {
        &self.budget
    }

    /// Children spawned so far.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Children that reached a terminal state.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    fn transition(&self, from: NurseryState, to: NurseryState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Spawns a child task. Rejected unless the nursery is `Open` and
    /// its budget covers a spawn; a failed scheduler hand-off rolls the
    /// child back out.
    pub fn spawn<F>(self: &Arc<Self>, entry: F) -> Result<Arc<Task>, SchedError>
    where
        F: FnOnce() -> Result<i64, i32> + Send + 'static,
    {
        if self.state() != NurseryState::Open {
            return Err(SchedError::SpawnRejected);
        }
        if !self.budget.try_charge(BudgetCost::Spawn) {
            return Err(SchedError::SpawnRejected);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = TaskId(((self.id as u64) << 32) | seq as u64);
        let entry: TaskEntry = Box::new(entry);
        let task = Task::new(id, entry, self.budget.clone(), Arc::downgrade(self));
        self.children.lock().push(task.clone());

        // A close that raced the state check above must not gain a child
        // it will never be notified about.
        if self.state() != NurseryState::Open {
            self.children.lock().retain(|child| child.id() != id);
            return Err(SchedError::SpawnRejected);
        }

        if let Err(err) = self.sched.submit(task.clone()) {
            self.children.lock().retain(|child| child.id() != id);
            return Err(err);
        }
        debug!("nursery {}: spawned {:?}", self.id, id);
        Ok(task)
    }

    /// Opens a nested nursery on the same scheduler. When called from a
    /// fiber, the current task is bound as the nursery's owner so that
    /// cancellation propagates through it.
    pub fn open_child(self: &Arc<Self>, budget: Budget) -> Arc<Nursery> {
        let child = Nursery::new(self.sched.clone(), budget, Some(self.id));
        if let Some(task) = worker::current_task() {
            Nursery::bind_owner(&child, &task);
        }
        child
    }

    /// Stops accepting spawns: `Open → Closing`. Returns whether this
    /// call made the transition.
    pub fn close(&self) -> bool {
        let closed = self.transition(NurseryState::Open, NurseryState::Closing);
        self.maybe_finalize();
        closed
    }

    /// Fires the all-done edge of the state machine: `Closing → Closed`
    /// or `Cancelling → Cancelled` once every child is terminal. Called
    /// from every place the child set or the state can move.
    fn maybe_finalize(&self) {
        if !self.all_done() {
            return;
        }
        loop {
            match self.state() {
                NurseryState::Closing => {
                    if self.transition(NurseryState::Closing, NurseryState::Closed) {
                        self.clear_owner_binding();
                        return;
                    }
                }
                NurseryState::Cancelling => {
                    if self.transition(NurseryState::Cancelling, NurseryState::Cancelled) {
                        self.clear_owner_binding();
                        return;
                    }
                }
                NurseryState::Open | NurseryState::Closed | NurseryState::Cancelled => return,
            }
        }
    }

    /// Cancels the scope: every non-finished child is cancelled, and
    /// each nursery owned by such a child is cancelled first, so the
    /// whole subtree is torn down. Idempotent.
    pub fn cancel(&self) {
        loop {
            match self.state() {
                NurseryState::Open => {
                    if self.transition(NurseryState::Open, NurseryState::Cancelling) {
                        break;
                    }
                }
                NurseryState::Closing => {
                    if self.transition(NurseryState::Closing, NurseryState::Cancelling) {
                        break;
                    }
                }
                NurseryState::Cancelling
                | NurseryState::Closed
                | NurseryState::Cancelled => return,
            }
        }

        info!("nursery {}: cancelling", self.id);
        let children: Vec<Arc<Task>> = self.children.lock().iter().cloned().collect();
        for child in children {
            if !child.state().is_terminal() {
                child.cancel();
            }
        }
        self.maybe_finalize();
    }

    /// Records a child's terminal outcome: first error wins, completion
    /// count advances, and the parked awaiter (if any) is handed back to
    /// the scheduler once every child is done.
    pub(crate) fn notify_child_complete(&self, task: &Arc<Task>) {
        if let Some(code) = task.outcome().and_then(|outcome| outcome.error_code()) {
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some((task.id(), code));
                debug!("nursery {}: first error {:?} code {}", self.id, task.id(), code);
            }
        }

        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.children.lock().len();
        if done >= total {
            self.maybe_finalize();
            if let Some(awaiter) = self.awaiter.lock().take() {
                awaiter.set_wake_pending();
                if awaiter.transition(TaskState::Blocked, TaskState::Ready)
                    && self.sched.submit(awaiter).is_err()
                {
                    warn!("nursery {}: failed to resubmit awaiter", self.id);
                }
            }
        }
    }

    fn all_done(&self) -> bool {
        self.completed.load(Ordering::Acquire) >= self.children.lock().len()
    }

    /// Closes the nursery and waits for every child to reach a terminal
    /// state. Inside a fiber the wait parks as the nursery's awaiter;
    /// outside, it polls. Returns the final outcome.
    pub fn await_all(&self) -> NurseryOutcome {
        self.close();

        if let Some(current) = worker::current_task() {
            loop {
                if self.all_done() {
                    break;
                }
                *self.awaiter.lock() = Some(current.clone());
                if self.all_done() {
                    // A child finished between the check and the
                    // registration; reclaim the slot and re-check.
                    self.awaiter.lock().take();
                    break;
                }
                worker::yield_blocked(BlockReason::NurseryAwait);
            }
        } else {
            while !self.all_done() {
                std::thread::sleep(Duration::from_micros(200));
            }
        }

        loop {
            match self.state() {
                NurseryState::Closing => {
                    if self.transition(NurseryState::Closing, NurseryState::Closed) {
                        break;
                    }
                }
                NurseryState::Cancelling => {
                    if self.transition(NurseryState::Cancelling, NurseryState::Cancelled) {
                        break;
                    }
                }
                NurseryState::Closed | NurseryState::Cancelled => break,
                NurseryState::Open => {
                    self.close();
                }
            }
        }

        self.clear_owner_binding();
        let outcome = self.outcome();
        info!("nursery {}: finished with {:?}", self.id, outcome);
        outcome
    }

    /// The outcome as of now. `Pending` while children are running and
    /// no error was recorded yet; errors outrank cancellation.
    pub fn outcome(&self) -> NurseryOutcome {
        if let Some((task, code)) = *self.first_error.lock() {
            return NurseryOutcome::ChildFailed { task, code };
        }
        match self.state() {
            NurseryState::Cancelled => NurseryOutcome::Cancelled,
            NurseryState::Closed => NurseryOutcome::Success,
            NurseryState::Open | NurseryState::Closing | NurseryState::Cancelling => {
                NurseryOutcome::Pending
            }
        }
    }

    /// Links `task` as the owner of `nursery`. Both sides are set
    /// together; linking an already-linked pair is a caller bug.
    pub fn bind_owner(nursery: &Arc<Nursery>, task: &Arc<Task>) {
        let mut owner = nursery.owner.lock();
        debug_assert!(owner.is_none(), "nursery already has an owner task");
        *owner = Some(Arc::downgrade(task));
        task.set_owned_nursery(Some(nursery.clone()));
    }

    /// Clears the owner link on both sides. No-op when unlinked.
    pub(crate) fn clear_owner_binding(&self) {
        let owner = self.owner.lock().take();
        if let Some(weak) = owner {
            if let Some(task) = weak.upgrade() {
                task.set_owned_nursery(None);
            }
        }
    }

    /// The task currently bound as owner, if the link is live.
    pub fn owner_task(&self) -> Option<Arc<Task>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for Nursery {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Nursery")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("children", &self.child_count())
            .field("completed", &self.completed_count())
            .finish()
    }
}
