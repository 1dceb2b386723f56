//! Bounded work-stealing deque, one per worker.
//!
//! The owner pushes and pops at the tail; thieves steal at the head via
//! CAS and either win the slot or report the race. Head and tail are
//! monotonic 64-bit counters, so `len = tail - head` and a slot index is
//! `counter & mask`. The protocol guarantees each pushed task is claimed
//! exactly once: the head CAS is the single point of arbitration between
//! thieves and between a thief and the owner taking the last item.
//!
//! Tasks are stored as raw `Arc` pointers; a pointer read before a lost
//! CAS is simply forgotten, never dereferenced or dropped.

use super::task::Task;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Result of a steal attempt.
#[derive(Debug)]
pub(crate) enum Steal {
    /// The thief claimed this task.
    Success(Arc<Task>),
    /// Nothing to steal.
    Empty,
    /// Lost a race; the caller may retry or move on.
    Retry,
}

/// Owner-at-tail, thieves-at-head ready queue.
pub(crate) struct WorkDeque {
    buffer: Box<[AtomicPtr<Task>]>,
    mask: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

unsafe impl Send for WorkDeque {}
unsafe impl Sync for WorkDeque {}

impl WorkDeque {
    /// A deque holding at most `capacity` tasks (rounded up to a power
    /// of two).
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        WorkDeque {
            buffer,
            mask: capacity as u64 - 1,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    fn slot(&self, index: u64) -> &AtomicPtr<Task> {
        &self.buffer[(index & self.mask) as usize]
    }

    /// Tasks currently enqueued.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    /// Owner-only: appends at the tail. Returns the task back when the
    /// deque is full.
    pub(crate) fn push_bottom(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail - head > self.mask {
            return Err(task);
        }
        self.slot(tail)
            .store(Arc::into_raw(task) as *mut Task, Ordering::Relaxed);
        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Owner-only: takes from the tail. Races a thief for the last item.
    pub(crate) fn pop_bottom(&self) -> Option<Arc<Task>> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        if tail == head {
            return None;
        }

        let tail = tail - 1;
        self.tail.store(tail, Ordering::SeqCst);
        let head = self.head.load(Ordering::SeqCst);

        if head > tail {
            // A thief emptied the deque under us; restore the tail.
            self.tail.store(tail + 1, Ordering::SeqCst);
            return None;
        }

        let raw = self.slot(tail).load(Ordering::Relaxed);
        if head == tail {
            // Last item: arbitrate with thieves through the head.
            let won = self
                .head
                .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.tail.store(tail + 1, Ordering::SeqCst);
            if !won {
                return None;
            }
        }
        Some(unsafe { Arc::from_raw(raw) })
    }

    /// Thief: attempts to claim the head item. The slot pointer is read
    /// speculatively and only materialized after winning the CAS.
    pub(crate) fn steal_top(&self) -> Steal {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            return Steal::Empty;
        }

        let raw = self.slot(head).load(Ordering::Relaxed);
        if self
            .head
            .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }
        Steal::Success(unsafe { Arc::from_raw(raw) })
    }
}

impl Drop for WorkDeque {
    fn drop(&mut self) {
        // Exclusive access here; reconstitute and drop whatever remains.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for index in head..tail {
            let raw = self.slot(index).load(Ordering::Relaxed);
            if !raw.is_null() {
                drop(unsafe { Arc::from_raw(raw) });
            }
        }
    }
}
