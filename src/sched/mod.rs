//! The cooperative M:N scheduler: runtime root, workers, tasks,
//! nurseries, budgets.
//!
//! There is exactly one [`Runtime`] value per scheduler, created by an
//! explicit constructor and threaded through the public API; nothing in
//! the scheduler's own code paths reaches for ambient state. N worker
//! threads host M fibers; yielding is explicit, and there is no
//! preemption.

pub mod budget;
pub(crate) mod cx;
pub(crate) mod deque;
pub mod nursery;
pub mod task;
pub mod worker;

use crate::error::SchedError;
use budget::Budget;
use deque::WorkDeque;
use log::{info, warn};
use nursery::Nursery;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use task::Task;

/// Construction-time scheduler parameters.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Worker threads; `0` detects the CPU count.
    pub worker_count: usize,
    /// Capacity of each worker's deque (rounded up to a power of two).
    pub deque_capacity: usize,
    /// Seed for deterministic steal-victim selection.
    pub steal_seed: u64,
    /// Fiber stack size in bytes.
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_count: 0,
            deque_capacity: 256,
            steal_seed: 0x5EED_CAFE,
            stack_size: 128 * 1024,
        }
    }
}

/// Shared scheduler state: the deques, the injector, and shutdown.
pub struct Scheduler {
    config: RuntimeConfig,
    deques: Vec<Arc<WorkDeque>>,
    injector: Mutex<VecDeque<Arc<Task>>>,
    shutdown: AtomicBool,
    next_nursery: AtomicU32,
}

impl Scheduler {
    fn new(mut config: RuntimeConfig) -> Arc<Scheduler> {
        if config.worker_count == 0 {
            config.worker_count = std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1);
        }
        let deques = (0..config.worker_count)
            .map(|_| Arc::new(WorkDeque::new(config.deque_capacity)))
            .collect();
        Arc::new(Scheduler {
            config,
            deques,
            injector: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            next_nursery: AtomicU32::new(1),
        })
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.deques.len()
    }

    pub(crate) fn deque(&self, index: usize) -> Arc<WorkDeque> {
        self.deques[index].clone()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn next_nursery_id(&self) -> u32 {
        self.next_nursery.fetch_add(1, Ordering::Relaxed)
    }

    /// Hands a `Ready` task to the scheduler. On a worker thread of this
    /// scheduler the task goes to the local deque (injector on
    /// overflow); from anywhere else it goes to the injector.
    pub(crate) fn submit(&self, task: Arc<Task>) -> Result<(), SchedError> {
        if self.is_shutdown() {
            return Err(SchedError::SubmissionFailed);
        }
        let addr = self as *const Scheduler as usize;
        match worker::push_local(addr, task) {
            Ok(()) => Ok(()),
            Err(task) => {
                self.inject(task);
                Ok(())
            }
        }
    }

    pub(crate) fn inject(&self, task: Arc<Task>) {
        self.injector.lock().push_back(task);
    }

    pub(crate) fn pop_injected(&self) -> Option<Arc<Task>> {
        self.injector.lock().pop_front()
    }
}

/// The single process-wide handle owning one scheduler.
///
/// Explicit lifecycle: `new` builds the scheduler, `start` spawns the
/// workers, `stop` signals shutdown and joins them. Dropping a started
/// runtime stops it. Restarting a stopped runtime is an error — build a
/// fresh one instead.
pub struct Runtime {
    sched: Arc<Scheduler>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Runtime {
    /// Builds a runtime; no threads run until [`Runtime::start`].
    pub fn new(config: RuntimeConfig) -> Runtime {
        Runtime {
            sched: Scheduler::new(config),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the worker threads. Fails with `AlreadyStarted` on a
    /// second call, including after `stop`.
    pub fn start(&self) -> Result<(), SchedError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SchedError::AlreadyStarted);
        }
        let mut handles = self.handles.lock();
        for index in 0..self.sched.worker_count() {
            let sched = self.sched.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sovereign-worker-{}", index))
                .spawn(move || worker::worker_loop(sched, index))
                .map_err(|_| SchedError::SubmissionFailed)?;
            handles.push(handle);
        }
        info!("runtime: started {} workers", handles.len());
        Ok(())
    }

    /// Signals shutdown and joins every worker. Idempotent.
    pub fn stop(&self) {
        self.sched.shutdown.store(true, Ordering::Release);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("runtime: worker panicked during shutdown");
            }
        }
        info!("runtime: stopped");
    }

    /// Opens a top-level nursery bound to this runtime's scheduler.
    pub fn create_nursery(&self, budget: Budget) -> Arc<Nursery> {
        Nursery::new(self.sched.clone(), budget, None)
    }

    /// Number of worker threads this runtime drives.
    pub fn worker_count(&self) -> usize {
        self.sched.worker_count()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_start_is_rejected() {
        let runtime = Runtime::new(RuntimeConfig {
            worker_count: 1,
            ..RuntimeConfig::default()
        });
        runtime.start().unwrap();
        assert_eq!(runtime.start().unwrap_err(), SchedError::AlreadyStarted);
        runtime.stop();
        assert_eq!(runtime.start().unwrap_err(), SchedError::AlreadyStarted);
    }

    #[test]
    fn stop_is_idempotent() {
        let runtime = Runtime::new(RuntimeConfig {
            worker_count: 2,
            ..RuntimeConfig::default()
        });
        runtime.start().unwrap();
        runtime.stop();
        runtime.stop();
    }

    #[test]
    fn worker_count_detection_is_nonzero() {
        let runtime = Runtime::new(RuntimeConfig::default());
        assert!(runtime.worker_count() >= 1);
    }

    #[test]
    fn submission_after_shutdown_fails() {
        let runtime = Runtime::new(RuntimeConfig {
            worker_count: 1,
            ..RuntimeConfig::default()
        });
        runtime.start().unwrap();
        let nursery = runtime.create_nursery(Budget::service_default());
        runtime.stop();
        assert_eq!(
            nursery.spawn(|| Ok(1)).unwrap_err(),
            SchedError::SubmissionFailed
        );
    }
}
