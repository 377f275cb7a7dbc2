//! Task queues: the unit of scheduling.
//!
//! A task queue owns a local FIFO fed from the loop thread and, when
//! built as concurrent, a global MPMC queue fed from any thread. The
//! task-queue scheduler decides which runnable queue gets the CPU next;
//! a queue with nothing in either FIFO is blocked and costs nothing.
//!
//! Queues live in a slab arena owned by their event loop and are referred
//! to by stable ids ([`TaskQueueHandle`]); the blocked-concurrent list is
//! threaded through the arena with plain id links.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use slab::Slab;

use crate::queue::CircularQueue;
use crate::sched::TaskQueueScheduler;
use crate::task::Task;

/// Default weight for queues that do not configure shares.
pub const DEFAULT_SHARES: u64 = 1;

/// Identifies a task queue within its owning event loop.
///
/// Handles are only meaningful on the loop that created the queue;
/// cross-thread submission goes through a
/// [`RemoteQueueHandle`](crate::eventloop::RemoteQueueHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskQueueHandle(pub(crate) usize);

/// Run state of a task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    /// Neither FIFO holds work; the queue is not in the run queue.
    Blocked,
    /// The queue sits in the task-queue scheduler's run queue.
    Running,
}

/// Configuration for a task queue, built with the usual chained setters.
///
/// ```ignore
/// let builder = TaskQueueBuilder::new("ingest")
///     .shares(4)
///     .concurrent(true)
///     .clock_sample_interval(8);
/// let handle = cx.create_task_queue(&builder)?;
/// ```
#[derive(Debug, Clone)]
pub struct TaskQueueBuilder {
    pub(crate) name: String,
    pub(crate) shares: u64,
    pub(crate) local_capacity: Option<usize>,
    pub(crate) concurrent: bool,
    pub(crate) concurrent_capacity: Option<usize>,
    pub(crate) clock_sample_interval: u32,
}

impl TaskQueueBuilder {
    /// Starts a builder for a queue with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shares: DEFAULT_SHARES,
            local_capacity: None,
            concurrent: false,
            concurrent_capacity: None,
            clock_sample_interval: 1,
        }
    }

    /// Sets the fairness weight. Must be positive.
    #[must_use]
    pub fn shares(mut self, shares: u64) -> Self {
        self.shares = shares;
        self
    }

    /// Overrides the engine-wide local FIFO capacity for this queue.
    #[must_use]
    pub fn local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = Some(capacity);
        self
    }

    /// Gives the queue a global MPMC queue so any thread can submit.
    #[must_use]
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Overrides the engine-wide global queue capacity for this queue.
    #[must_use]
    pub fn concurrent_capacity(mut self, capacity: usize) -> Self {
        self.concurrent_capacity = Some(capacity);
        self
    }

    /// Sets how many tasks run between clock re-samples inside this
    /// queue's slice. Must be at least 1; higher values amortise the cost
    /// of `now()` for queues of uniformly tiny tasks.
    #[must_use]
    pub fn clock_sample_interval(mut self, interval: u32) -> Self {
        self.clock_sample_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("task queue name must not be empty".to_string());
        }
        if self.shares == 0 {
            return Err("shares must be positive".to_string());
        }
        if self.clock_sample_interval == 0 {
            return Err("clock_sample_interval must be >= 1".to_string());
        }
        Ok(())
    }
}

/// A schedulable task queue. Owned by the loop's arena; every field is
/// loop-thread-only except `global`, which is the designated cross-thread
/// ingress.
pub(crate) struct TaskQueue {
    pub(crate) name: String,
    pub(crate) shares: u64,
    pub(crate) run_state: RunState,
    pub(crate) local: CircularQueue<Task>,
    pub(crate) global: Option<Arc<ArrayQueue<Task>>>,
    /// Virtual runtime: actual runtime scaled by inverse shares. Only the
    /// CFS scheduler reads it; it increases monotonically apart from the
    /// re-entry floor applied on enqueue.
    pub(crate) vruntime_nanos: u64,
    pub(crate) actual_runtime_nanos: u64,
    pub(crate) clock_sample_interval: u32,
    pub(crate) blocked_count: u64,
    pub(crate) tasks_processed: u64,
    /// Links for the loop's blocked-concurrent list. `Some` only while
    /// the queue is blocked and has a global queue to watch.
    pub(crate) list_prev: Option<usize>,
    pub(crate) list_next: Option<usize>,
    pub(crate) on_blocked_list: bool,
    /// The task pulled by [`next`](Self::next), consumed by the loop.
    pub(crate) current: Option<Task>,
}

impl TaskQueue {
    pub(crate) fn new(
        builder: &TaskQueueBuilder,
        local_capacity: usize,
        concurrent_capacity: usize,
    ) -> Self {
        let global = builder
            .concurrent
            .then(|| Arc::new(ArrayQueue::new(concurrent_capacity)));
        Self {
            name: builder.name.clone(),
            shares: builder.shares,
            run_state: RunState::Blocked,
            local: CircularQueue::new(local_capacity),
            global,
            vruntime_nanos: 0,
            actual_runtime_nanos: 0,
            clock_sample_interval: builder.clock_sample_interval,
            blocked_count: 0,
            tasks_processed: 0,
            list_prev: None,
            list_next: None,
            on_blocked_list: false,
            current: None,
        }
    }

    /// Pulls one task, preferring local over global ingress. Returns
    /// false when both are empty.
    pub(crate) fn next(&mut self) -> bool {
        debug_assert!(self.current.is_none(), "previous task not consumed");
        if let Some(task) = self.local.poll() {
            self.current = Some(task);
            return true;
        }
        if let Some(global) = &self.global {
            if let Some(task) = global.pop() {
                self.current = Some(task);
                return true;
            }
        }
        false
    }

    /// True when neither FIFO holds work.
    pub(crate) fn is_empty(&self) -> bool {
        self.local.is_empty() && self.global.as_ref().map_or(true, |g| g.is_empty())
    }
}

/// The loop's list of blocked queues that have a global queue to watch.
///
/// Intrusive doubly-linked list threaded through the arena with plain id
/// links; the arena owns the nodes, the list holds no storage of its own.
/// A queue is on this list exactly while it is blocked *and* has a global
/// queue, so the loop can reap cross-thread submissions at the top of
/// every cycle without touching queues nobody can feed.
#[derive(Debug, Default)]
pub(crate) struct BlockedList {
    pub(crate) head: Option<usize>,
    pub(crate) tail: Option<usize>,
}

impl BlockedList {
    pub(crate) fn push_back(&mut self, id: usize, queues: &mut Slab<TaskQueue>) {
        debug_assert!(queues[id].global.is_some());
        debug_assert_eq!(queues[id].run_state, RunState::Blocked);
        debug_assert!(!queues[id].on_blocked_list);

        let old_tail = self.tail;
        {
            let queue = &mut queues[id];
            queue.list_prev = old_tail;
            queue.list_next = None;
            queue.on_blocked_list = true;
        }
        match old_tail {
            Some(tail) => queues[tail].list_next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    pub(crate) fn remove(&mut self, id: usize, queues: &mut Slab<TaskQueue>) {
        debug_assert!(queues[id].on_blocked_list);
        let (prev, next) = {
            let queue = &mut queues[id];
            let links = (queue.list_prev.take(), queue.list_next.take());
            queue.on_blocked_list = false;
            links
        };
        match prev {
            Some(prev) => queues[prev].list_next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => queues[next].list_prev = prev,
            None => self.tail = prev,
        }
    }
}

/// Offers a task into a queue's local FIFO, waking the queue if it was
/// blocked. Returns `false` when the FIFO is full.
///
/// Loop-thread-only: this is the shared tail of every local submission
/// path (direct offers, deadline dispatch, cooperative re-offers).
pub(crate) fn offer_local(
    queues: &mut Slab<TaskQueue>,
    scheduler: &mut dyn TaskQueueScheduler,
    blocked: &mut BlockedList,
    id: usize,
    task: Task,
) -> bool {
    if !queues[id].local.offer(task) {
        return false;
    }
    if queues[id].run_state == RunState::Blocked {
        if queues[id].on_blocked_list {
            blocked.remove(id, queues);
        }
        scheduler.enqueue(id, queues);
    }
    true
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("shares", &self.shares)
            .field("run_state", &self.run_state)
            .field("local_len", &self.local.len())
            .field("global_len", &self.global.as_ref().map(|g| g.len()))
            .field("vruntime_nanos", &self.vruntime_nanos)
            .finish_non_exhaustive()
    }
}
