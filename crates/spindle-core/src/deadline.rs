//! Earliest-deadline-first scheduling of timed tasks.
//!
//! One-shot, fixed-delay, and fixed-rate tasks sit in a bounded min-heap
//! keyed by deadline. Every loop cycle calls [`DeadlineScheduler::tick`]
//! with the cached clock sample; due tasks are dispatched into their
//! owning task queue's local FIFO (or complete a [`Promise`] for
//! `sleep`). The heap root also drives the loop's park timeout.

use std::cmp::Ordering;
use std::sync::Arc;

use slab::Slab;
use smallvec::SmallVec;
use tracing::warn;

use crate::promise::Promise;
use crate::queue::BoundedHeap;
use crate::sched::TaskQueueScheduler;
use crate::task::Task;
use crate::task_queue::{offer_local, BlockedList, TaskQueue};

/// Re-fire policy of a periodic deadline task.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Repeat {
    /// Next deadline = previous deadline + period. A stalled loop fires
    /// the accumulated backlog without coalescing, one re-offer per tick.
    FixedRate {
        /// Period between scheduled firing times.
        period_nanos: u64,
    },
    /// Next deadline = now + delay, measured from dispatch.
    FixedDelay {
        /// Delay between a dispatch and the next deadline.
        delay_nanos: u64,
    },
}

/// What firing a deadline task does.
pub(crate) enum DeadlinePayload {
    /// Run a one-shot command inside the owning task queue.
    Once(Box<dyn FnOnce() + Send>),
    /// Run a re-usable command inside the owning task queue; kept by the
    /// entry so periodic re-offers can dispatch it again.
    Periodic(Arc<dyn Fn() + Send + Sync>),
    /// Complete a sleep promise; nothing enters a task queue.
    Sleep(Promise),
}

/// A timed task: a firing deadline, an optional repeat policy, the task
/// queue to run inside, and the payload.
pub(crate) struct DeadlineEntry {
    pub(crate) deadline_nanos: u64,
    seq: u64,
    pub(crate) queue: usize,
    pub(crate) repeat: Option<Repeat>,
    pub(crate) payload: DeadlinePayload,
}

impl DeadlineEntry {
    fn is_cancelled(&self) -> bool {
        match &self.payload {
            DeadlinePayload::Sleep(promise) => promise.is_cancelled(),
            _ => false,
        }
    }
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_nanos == other.deadline_nanos && self.seq == other.seq
    }
}

impl Eq for DeadlineEntry {}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline_nanos, self.seq).cmp(&(other.deadline_nanos, other.seq))
    }
}

/// Bounded earliest-deadline-first store of timed tasks.
///
/// Loop-thread-only; cross-thread scheduling goes through an offered task
/// that schedules from inside the loop.
pub(crate) struct DeadlineScheduler {
    heap: BoundedHeap<DeadlineEntry>,
    seq: u64,
}

impl DeadlineScheduler {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            heap: BoundedHeap::new(capacity),
            seq: 0,
        }
    }

    /// Number of pending deadline tasks.
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Inserts a timed task. Returns `false` if the heap is at capacity.
    pub(crate) fn offer(
        &mut self,
        deadline_nanos: u64,
        queue: usize,
        repeat: Option<Repeat>,
        payload: DeadlinePayload,
    ) -> bool {
        self.seq += 1;
        self.heap.offer(DeadlineEntry {
            deadline_nanos,
            seq: self.seq,
            queue,
            repeat,
            payload,
        })
    }

    /// Deadline of the earliest pending task, or `None` when idle. The
    /// loop turns this into its park timeout.
    pub(crate) fn earliest_deadline_nanos(&self) -> Option<u64> {
        self.heap.peek().map(|entry| entry.deadline_nanos)
    }

    /// Fires every task whose deadline has passed, dispatching commands
    /// into their owning queues and completing sleep promises. Returns
    /// the number of tasks fired.
    ///
    /// Cancelled tasks are discarded on pop. A dispatch into a full local
    /// FIFO drops the task (periodic ones included) after logging; so
    /// does a periodic re-offer into a full heap.
    pub(crate) fn tick(
        &mut self,
        now_nanos: u64,
        queues: &mut Slab<TaskQueue>,
        scheduler: &mut dyn TaskQueueScheduler,
        blocked: &mut BlockedList,
    ) -> usize {
        let mut fired = 0;
        // Re-offers go through a scratch batch: a fixed-rate task that is
        // already due again must not be popped in the same tick twice.
        let mut reoffers: SmallVec<[DeadlineEntry; 4]> = SmallVec::new();

        loop {
            match self.heap.peek() {
                Some(entry) if entry.deadline_nanos <= now_nanos => {}
                _ => break,
            }
            let entry = self.heap.poll().expect("peeked entry");
            if entry.is_cancelled() {
                continue;
            }
            let DeadlineEntry {
                deadline_nanos,
                queue,
                repeat,
                payload,
                ..
            } = entry;

            match payload {
                DeadlinePayload::Sleep(promise) => {
                    promise.complete();
                    fired += 1;
                }
                DeadlinePayload::Once(cmd) => {
                    if offer_local(queues, scheduler, blocked, queue, Task::Once(cmd)) {
                        fired += 1;
                    } else {
                        warn!(
                            queue = %queues[queue].name,
                            "deadline task dropped: local queue full"
                        );
                    }
                }
                DeadlinePayload::Periodic(cmd) => {
                    let task = Task::Once(Box::new({
                        let cmd = Arc::clone(&cmd);
                        move || cmd()
                    }));
                    if offer_local(queues, scheduler, blocked, queue, task) {
                        fired += 1;
                        if let Some(repeat) = repeat {
                            let next = match repeat {
                                Repeat::FixedRate { period_nanos } => {
                                    deadline_nanos.saturating_add(period_nanos)
                                }
                                Repeat::FixedDelay { delay_nanos } => {
                                    now_nanos.saturating_add(delay_nanos)
                                }
                            };
                            self.seq += 1;
                            reoffers.push(DeadlineEntry {
                                deadline_nanos: next,
                                seq: self.seq,
                                queue,
                                repeat: Some(repeat),
                                payload: DeadlinePayload::Periodic(cmd),
                            });
                        }
                    } else {
                        warn!(
                            queue = %queues[queue].name,
                            "periodic deadline task dropped: local queue full"
                        );
                    }
                }
            }
        }

        for entry in reoffers {
            let queue = entry.queue;
            if !self.heap.offer(entry) {
                warn!(
                    queue = %queues[queue].name,
                    "periodic deadline task dropped: deadline run queue full"
                );
            }
        }

        fired
    }
}

impl std::fmt::Debug for DeadlineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineScheduler")
            .field("pending", &self.heap.len())
            .field("capacity", &self.heap.capacity())
            .finish()
    }
}
