//! The event loop: one thread, one CPU, one run cycle.
//!
//! Each cycle samples the clock once, fires due deadline tasks, reaps
//! cross-thread submissions into the run queue, then grants the next
//! task queue a time slice. Inside the slice, tasks run back to back with
//! amortised clock reads, per-task stall accounting, and intra-slice I/O
//! ticks. With nothing runnable the loop parks in the I/O backend until
//! an event, a deadline, or a cross-thread wake.
//!
//! Everything here is loop-thread-only except the pieces that are
//! explicitly shared: each queue's global MPMC queue, the `wakeup_needed`
//! flag, and the stop flag.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::deadline::{DeadlinePayload, DeadlineScheduler, Repeat};
use crate::engine::EngineConfig;
use crate::io::{build_backend, IoBackend, LoopWaker};
use crate::promise::Promise;
use crate::sched::{CfsScheduler, FcfsScheduler, TaskQueueScheduler};
use crate::task::{Progress, Task};
use crate::task_queue::{
    offer_local, BlockedList, RunState, TaskQueue, TaskQueueBuilder, TaskQueueHandle,
};

/// Name of the task queue every loop starts with.
pub const DEFAULT_QUEUE_NAME: &str = "main";

/// Upper bound on tasks run while draining during shutdown, so a task
/// that perpetually re-offers itself cannot keep the loop alive.
const SHUTDOWN_DRAIN_LIMIT: u64 = 1024;

/// Errors raised by the event loop itself (never by tasks).
#[derive(Debug, Error)]
pub enum EventLoopError {
    /// The I/O backend failed unrecoverably; the loop terminates.
    #[error("io backend failure: {0}")]
    Backend(#[from] std::io::Error),

    /// A task queue definition was rejected.
    #[error("invalid task queue: {0}")]
    InvalidTaskQueue(String),

    /// The loop already hosts as many task queues as its run queue can
    /// hold.
    #[error("task queue limit reached (run queue capacity: {capacity})")]
    TaskQueueLimit {
        /// The configured run queue capacity.
        capacity: usize,
    },
}

/// Handles a task that overran the stall threshold.
///
/// Stalls are diagnostics, never fatal: the default handler logs and the
/// loop moves on.
pub trait StallHandler: Send + Sync {
    /// Called from the loop thread after the stalled task finished.
    fn on_stall(&self, loop_index: usize, queue_name: &str, start_nanos: u64, exec_nanos: u64);
}

/// Default stall handler: a `tracing` warning per stall.
#[derive(Debug, Default)]
pub struct LoggingStallHandler;

impl StallHandler for LoggingStallHandler {
    fn on_stall(&self, loop_index: usize, queue_name: &str, _start_nanos: u64, exec_nanos: u64) {
        warn!(
            loop_index,
            queue = queue_name,
            exec_micros = exec_nanos / 1_000,
            "task stalled the event loop"
        );
    }
}

/// State shared between a loop and its producers.
#[derive(Debug)]
pub(crate) struct LoopShared {
    /// True while the loop is inside (or entering) a blocking poll.
    /// Producers clear it with a CAS before issuing the one wake syscall.
    pub(crate) wakeup_needed: CachePadded<AtomicBool>,
    /// Set by the engine on shutdown; observed at every cycle top.
    pub(crate) stop: AtomicBool,
}

impl LoopShared {
    fn new() -> Self {
        Self {
            wakeup_needed: CachePadded::new(AtomicBool::new(false)),
            stop: AtomicBool::new(false),
        }
    }
}

/// Wakes a loop if it is parked (or about to park), issuing at most one
/// wake syscall per `wakeup_needed` transition.
pub(crate) fn wake_loop(shared: &LoopShared, waker: &dyn LoopWaker) {
    if shared
        .wakeup_needed
        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        if let Err(e) = waker.wake() {
            warn!(error = %e, "loop wake failed");
        }
    }
}

/// Per-loop counters, shared so the engine can snapshot them.
#[derive(Debug, Default)]
pub(crate) struct LoopMetrics {
    pub(crate) tasks_processed: AtomicU64,
    pub(crate) cpu_time_nanos: AtomicU64,
    pub(crate) context_switches: AtomicU64,
    pub(crate) stalls: AtomicU64,
    pub(crate) parks: AtomicU64,
    pub(crate) task_failures: AtomicU64,
}

/// Point-in-time copy of one loop's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopMetricsSnapshot {
    /// Tasks run to completion (or to a cooperative yield).
    pub tasks_processed: u64,
    /// CPU nanoseconds charged to task queues.
    pub cpu_time_nanos: u64,
    /// Task-queue context switches (one per granted slice).
    pub context_switches: u64,
    /// Tasks that overran the stall threshold.
    pub stalls: u64,
    /// Times the loop blocked in the I/O backend.
    pub parks: u64,
    /// Tasks that panicked and were contained.
    pub task_failures: u64,
}

impl LoopMetrics {
    fn snapshot(&self) -> LoopMetricsSnapshot {
        LoopMetricsSnapshot {
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            cpu_time_nanos: self.cpu_time_nanos.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
        }
    }
}

/// Cross-thread handle to one event loop.
///
/// Offers land in the default queue's global MPMC queue and wake the
/// loop; both are safe from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    index: usize,
    shared: Arc<LoopShared>,
    waker: Arc<dyn LoopWaker>,
    default_global: Arc<ArrayQueue<Task>>,
    metrics: Arc<LoopMetrics>,
}

impl LoopHandle {
    /// Index of the loop within its engine.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Submits a one-shot closure to the loop's default queue. Returns
    /// `false` if the queue is full or the loop is stopping.
    pub fn offer<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.offer_task(Task::once(f))
    }

    /// Submits a task to the loop's default queue. Returns `false` if
    /// the queue is full or the loop is stopping.
    pub fn offer_task(&self, task: Task) -> bool {
        if self.shared.stop.load(Ordering::Acquire) {
            return false;
        }
        if self.default_global.push(task).is_err() {
            return false;
        }
        wake_loop(&self.shared, self.waker.as_ref());
        true
    }

    /// Snapshot of the loop's counters.
    #[must_use]
    pub fn metrics(&self) -> LoopMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    /// Shutdown sentinel: bypasses the stop-flag gate so a stopping loop
    /// still receives the queue activity that makes it re-check the flag.
    pub(crate) fn offer_sentinel(&self) -> bool {
        self.default_global.push(Task::once(|| {})).is_ok()
    }

    pub(crate) fn wake(&self) {
        wake_loop(&self.shared, self.waker.as_ref());
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("index", &self.index)
            .field("queued", &self.default_global.len())
            .finish_non_exhaustive()
    }
}

/// Cross-thread handle to one concurrent task queue.
#[derive(Clone)]
pub struct RemoteQueueHandle {
    global: Arc<ArrayQueue<Task>>,
    shared: Arc<LoopShared>,
    waker: Arc<dyn LoopWaker>,
}

impl RemoteQueueHandle {
    /// Submits a task to the queue's global MPMC queue and wakes the
    /// owning loop. Returns `false` if the queue is full or the loop is
    /// stopping.
    pub fn offer_task(&self, task: Task) -> bool {
        if self.shared.stop.load(Ordering::Acquire) {
            return false;
        }
        if self.global.push(task).is_err() {
            return false;
        }
        wake_loop(&self.shared, self.waker.as_ref());
        true
    }

    /// Submits a one-shot closure; see [`offer_task`](Self::offer_task).
    pub fn offer<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.offer_task(Task::once(f))
    }
}

impl std::fmt::Debug for RemoteQueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQueueHandle")
            .field("queued", &self.global.len())
            .finish_non_exhaustive()
    }
}

/// Loop-thread services handed to cooperative tasks.
///
/// This is the only way running code touches loop-owned state, which is
/// what keeps every non-shared field single-threaded by construction.
pub struct TaskContext<'a> {
    index: usize,
    clock: &'a Clock,
    yield_deadline_nanos: u64,
    queues: &'a mut Slab<TaskQueue>,
    scheduler: &'a mut dyn TaskQueueScheduler,
    deadline: &'a mut DeadlineScheduler,
    blocked: &'a mut BlockedList,
    default_queue: usize,
    shared: &'a Arc<LoopShared>,
    waker: &'a Arc<dyn LoopWaker>,
    local_capacity: usize,
    concurrent_capacity: usize,
    run_queue_capacity: usize,
}

impl TaskContext<'_> {
    /// Index of the loop running this task.
    #[must_use]
    pub fn loop_index(&self) -> usize {
        self.index
    }

    /// Current monotonic time in nanoseconds.
    #[must_use]
    pub fn now_nanos(&self) -> u64 {
        self.clock.nanos()
    }

    /// True once this task's cooperative horizon has passed. Long tasks
    /// should poll this and return [`Progress::More`] when it trips.
    ///
    /// Each call reads the clock (tens of nanoseconds); poll it at a
    /// coarse granularity, not per iteration of a tight loop.
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.clock.nanos() > self.yield_deadline_nanos
    }

    /// Handle of this loop's default task queue.
    #[must_use]
    pub fn default_queue_handle(&self) -> TaskQueueHandle {
        TaskQueueHandle(self.default_queue)
    }

    /// Offers a task to the default queue. Returns `false` when full.
    pub fn offer(&mut self, task: Task) -> bool {
        let default_queue = self.default_queue;
        self.offer_to(TaskQueueHandle(default_queue), task)
    }

    /// Offers a task to a specific queue's local FIFO. Returns `false`
    /// when full.
    pub fn offer_to(&mut self, handle: TaskQueueHandle, task: Task) -> bool {
        if !self.queues.contains(handle.0) {
            debug_assert!(false, "stale task queue handle");
            return false;
        }
        offer_local(
            &mut *self.queues,
            &mut *self.scheduler,
            &mut *self.blocked,
            handle.0,
            task,
        )
    }

    /// Creates a task queue on this loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder is invalid or the loop already
    /// hosts as many queues as its run queue can hold.
    pub fn create_task_queue(
        &mut self,
        builder: &TaskQueueBuilder,
    ) -> Result<TaskQueueHandle, EventLoopError> {
        builder
            .validate()
            .map_err(EventLoopError::InvalidTaskQueue)?;
        if self.queues.len() >= self.run_queue_capacity {
            return Err(EventLoopError::TaskQueueLimit {
                capacity: self.run_queue_capacity,
            });
        }
        let local_capacity = builder.local_capacity.unwrap_or(self.local_capacity);
        let concurrent_capacity = builder
            .concurrent_capacity
            .unwrap_or(self.concurrent_capacity);
        let id = self
            .queues
            .insert(TaskQueue::new(builder, local_capacity, concurrent_capacity));
        if self.queues[id].global.is_some() {
            // Blocked with a global queue: watched for cross-thread
            // submissions from the first cycle on.
            self.blocked.push_back(id, &mut *self.queues);
        }
        Ok(TaskQueueHandle(id))
    }

    /// Returns a cross-thread submission handle for a concurrent queue,
    /// or `None` if the queue has no global queue.
    #[must_use]
    pub fn remote_handle(&self, handle: TaskQueueHandle) -> Option<RemoteQueueHandle> {
        let global = self.queues.get(handle.0)?.global.as_ref()?;
        Some(RemoteQueueHandle {
            global: Arc::clone(global),
            shared: Arc::clone(self.shared),
            waker: Arc::clone(self.waker),
        })
    }

    /// Schedules a one-shot command on the default queue after `delay`.
    /// Returns `false` if the deadline run queue is full.
    pub fn schedule<F>(&mut self, cmd: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = TaskQueueHandle(self.default_queue);
        self.schedule_to(cmd, delay, handle)
    }

    /// Schedules a one-shot command on a specific queue after `delay`.
    /// Returns `false` if the deadline run queue is full.
    pub fn schedule_to<F>(&mut self, cmd: F, delay: Duration, handle: TaskQueueHandle) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.queues.contains(handle.0) {
            debug_assert!(false, "stale task queue handle");
            return false;
        }
        let deadline_nanos = deadline_from(self.clock.nanos(), delay);
        self.deadline.offer(
            deadline_nanos,
            handle.0,
            None,
            DeadlinePayload::Once(Box::new(cmd)),
        )
    }

    /// Schedules `cmd` to run repeatedly with `delay` between the end of
    /// one dispatch and the next deadline. Returns `false` if the
    /// deadline run queue is full.
    pub fn schedule_with_fixed_delay<F>(
        &mut self,
        cmd: F,
        initial_delay: Duration,
        delay: Duration,
        handle: TaskQueueHandle,
    ) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !self.queues.contains(handle.0) {
            debug_assert!(false, "stale task queue handle");
            return false;
        }
        let deadline_nanos = deadline_from(self.clock.nanos(), initial_delay);
        self.deadline.offer(
            deadline_nanos,
            handle.0,
            Some(Repeat::FixedDelay {
                delay_nanos: duration_nanos(delay),
            }),
            DeadlinePayload::Periodic(Arc::new(cmd)),
        )
    }

    /// Schedules `cmd` to run at a fixed rate: each deadline is the
    /// previous deadline plus `period`, with no catch-up coalescing.
    /// Returns `false` if the deadline run queue is full.
    pub fn schedule_at_fixed_rate<F>(
        &mut self,
        cmd: F,
        initial_delay: Duration,
        period: Duration,
        handle: TaskQueueHandle,
    ) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !self.queues.contains(handle.0) {
            debug_assert!(false, "stale task queue handle");
            return false;
        }
        let deadline_nanos = deadline_from(self.clock.nanos(), initial_delay);
        self.deadline.offer(
            deadline_nanos,
            handle.0,
            Some(Repeat::FixedRate {
                period_nanos: duration_nanos(period),
            }),
            DeadlinePayload::Periodic(Arc::new(cmd)),
        )
    }

    /// Returns a promise completed once `delay` has elapsed, or `None`
    /// if the deadline run queue is full.
    pub fn sleep(&mut self, delay: Duration) -> Option<Promise> {
        let promise = Promise::new();
        let deadline_nanos = deadline_from(self.clock.nanos(), delay);
        let offered = self.deadline.offer(
            deadline_nanos,
            self.default_queue,
            None,
            DeadlinePayload::Sleep(promise.clone()),
        );
        offered.then_some(promise)
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn deadline_from(now: u64, delay: Duration) -> u64 {
    now.saturating_add(duration_nanos(delay))
}

/// One event loop, owned by its thread once the engine starts.
pub struct EventLoop {
    index: usize,
    clock: Clock,
    queues: Slab<TaskQueue>,
    scheduler: Box<dyn TaskQueueScheduler>,
    deadline: DeadlineScheduler,
    backend: Box<dyn IoBackend>,
    waker: Arc<dyn LoopWaker>,
    shared: Arc<LoopShared>,
    blocked: BlockedList,
    default_queue: usize,
    metrics: Arc<LoopMetrics>,
    stall_handler: Arc<dyn StallHandler>,
    spin: bool,
    min_granularity_nanos: u64,
    stall_threshold_nanos: u64,
    io_interval_nanos: u64,
    local_capacity: usize,
    concurrent_capacity: usize,
    run_queue_capacity: usize,
}

impl EventLoop {
    pub(crate) fn new(config: &EngineConfig, index: usize) -> Result<Self, EventLoopError> {
        let backend = build_backend(config.eventloop_type)?;
        let waker = backend.waker();
        let scheduler: Box<dyn TaskQueueScheduler> = if config.cfs {
            Box::new(CfsScheduler::new(
                config.run_queue_capacity,
                config.target_latency_nanos,
                config.min_granularity_nanos,
            ))
        } else {
            Box::new(FcfsScheduler::new(
                config.run_queue_capacity,
                config.target_latency_nanos,
                config.min_granularity_nanos,
            ))
        };

        let mut queues = Slab::new();
        let mut blocked = BlockedList::default();
        let default_builder = TaskQueueBuilder::new(DEFAULT_QUEUE_NAME).concurrent(true);
        let default_queue = queues.insert(TaskQueue::new(
            &default_builder,
            config.local_task_queue_capacity,
            config.concurrent_task_queue_capacity,
        ));
        blocked.push_back(default_queue, &mut queues);

        Ok(Self {
            index,
            clock: Clock::new(),
            queues,
            scheduler,
            deadline: DeadlineScheduler::new(config.deadline_run_queue_capacity),
            backend,
            waker,
            shared: Arc::new(LoopShared::new()),
            blocked,
            default_queue,
            metrics: Arc::new(LoopMetrics::default()),
            stall_handler: Arc::clone(&config.stall_handler),
            spin: config.spin,
            min_granularity_nanos: config.min_granularity_nanos,
            stall_threshold_nanos: config.stall_threshold_nanos,
            io_interval_nanos: config.io_interval_nanos,
            local_capacity: config.local_task_queue_capacity,
            concurrent_capacity: config.concurrent_task_queue_capacity,
            run_queue_capacity: config.run_queue_capacity,
        })
    }

    /// Cross-thread handle for this loop.
    pub(crate) fn handle(&self) -> LoopHandle {
        let default_global = self.queues[self.default_queue]
            .global
            .as_ref()
            .map(Arc::clone)
            .expect("default queue is concurrent");
        LoopHandle {
            index: self.index,
            shared: Arc::clone(&self.shared),
            waker: Arc::clone(&self.waker),
            default_global,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Runs the loop until the stop flag is observed, then drains.
    pub(crate) fn run(&mut self) -> Result<(), EventLoopError> {
        debug!(index = self.index, "event loop running");
        let mut now = self.clock.nanos();
        let mut io_deadline = now.saturating_add(self.io_interval_nanos);

        while !self.shared.stop.load(Ordering::Acquire) {
            self.deadline_tick(now);
            self.reap_blocked_global();

            let Some(active) = self.scheduler.pick_next(&self.queues) else {
                self.park(now)?;
                now = self.clock.nanos();
                io_deadline = now.saturating_add(self.io_interval_nanos);
                continue;
            };

            let slice_nanos = self.scheduler.time_slice_nanos_active(&self.queues);
            let queue_deadline = now.saturating_add(slice_nanos);
            let mut slice_exec_nanos = 0u64;
            let mut tasks_run = 0u64;
            let mut queue_drained = false;
            // 1 forces a clock read after the first task.
            let mut clock_round: u32 = 1;

            while now <= queue_deadline {
                if !self.queues[active].next() {
                    queue_drained = true;
                    break;
                }

                let task_start_nanos = now;
                let yield_deadline = now.saturating_add(self.min_granularity_nanos);
                self.run_task(active, yield_deadline);
                tasks_run += 1;

                if clock_round == 1 {
                    now = self.clock.nanos();
                    clock_round = self.queues[active].clock_sample_interval;
                } else {
                    clock_round -= 1;
                }

                // A task always progresses time, even under a coarse
                // sample interval.
                let task_exec_nanos = now.saturating_sub(task_start_nanos).max(1);
                slice_exec_nanos += task_exec_nanos;

                if task_exec_nanos > self.stall_threshold_nanos {
                    self.metrics.stalls.fetch_add(1, Ordering::Relaxed);
                    self.stall_handler.on_stall(
                        self.index,
                        &self.queues[active].name,
                        task_start_nanos,
                        task_exec_nanos,
                    );
                }

                if now >= io_deadline {
                    self.io_tick()?;
                    now = self.clock.nanos();
                    io_deadline = now.saturating_add(self.io_interval_nanos);
                }
            }

            self.scheduler.update_active(&mut self.queues, slice_exec_nanos);
            self.metrics
                .tasks_processed
                .fetch_add(tasks_run, Ordering::Relaxed);
            self.metrics
                .cpu_time_nanos
                .fetch_add(slice_exec_nanos, Ordering::Relaxed);
            self.metrics.context_switches.fetch_add(1, Ordering::Relaxed);

            if queue_drained || self.queues[active].is_empty() {
                self.scheduler.dequeue_active(&mut self.queues);
                let queue = &mut self.queues[active];
                queue.run_state = RunState::Blocked;
                queue.blocked_count += 1;
                if queue.global.is_some() {
                    self.blocked.push_back(active, &mut self.queues);
                }
            } else {
                self.scheduler.yield_active(&mut self.queues);
            }
        }

        self.drain_for_shutdown();
        debug!(index = self.index, "event loop stopped");
        Ok(())
    }

    fn deadline_tick(&mut self, now: u64) {
        let Self {
            queues,
            scheduler,
            deadline,
            blocked,
            ..
        } = self;
        deadline.tick(now, queues, scheduler.as_mut(), blocked);
    }

    /// Walks the blocked-concurrent list and enqueues every queue whose
    /// global queue received work since the last cycle.
    fn reap_blocked_global(&mut self) {
        let mut cursor = self.blocked.head;
        while let Some(id) = cursor {
            cursor = self.queues[id].list_next;
            let has_work = self.queues[id]
                .global
                .as_ref()
                .is_some_and(|global| !global.is_empty());
            if has_work {
                self.blocked.remove(id, &mut self.queues);
                self.scheduler.enqueue(id, &mut self.queues);
            }
        }
    }

    fn run_task(&mut self, active: usize, yield_deadline: u64) {
        let task = self.queues[active].current.take().expect("task was pulled");
        match task {
            Task::Once(f) => {
                if catch_unwind(AssertUnwindSafe(f)).is_err() {
                    self.metrics.task_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        queue = %self.queues[active].name,
                        "task panicked; loop continues"
                    );
                }
            }
            Task::Cooperative(mut f) => {
                let index = self.index;
                let default_queue = self.default_queue;
                let local_capacity = self.local_capacity;
                let concurrent_capacity = self.concurrent_capacity;
                let run_queue_capacity = self.run_queue_capacity;
                let Self {
                    clock,
                    queues,
                    scheduler,
                    deadline,
                    blocked,
                    shared,
                    waker,
                    ..
                } = self;

                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let mut cx = TaskContext {
                        index,
                        clock,
                        yield_deadline_nanos: yield_deadline,
                        queues,
                        scheduler: scheduler.as_mut(),
                        deadline,
                        blocked,
                        default_queue,
                        shared,
                        waker,
                        local_capacity,
                        concurrent_capacity,
                        run_queue_capacity,
                    };
                    f(&mut cx)
                }));

                match outcome {
                    Ok(Progress::Done) => {}
                    Ok(Progress::More) => {
                        let accepted = offer_local(
                            &mut self.queues,
                            self.scheduler.as_mut(),
                            &mut self.blocked,
                            active,
                            Task::Cooperative(f),
                        );
                        if !accepted {
                            warn!(
                                queue = %self.queues[active].name,
                                "cooperative task dropped on re-offer: local queue full"
                            );
                        }
                    }
                    Err(_) => {
                        self.metrics.task_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            queue = %self.queues[active].name,
                            "task panicked; loop continues"
                        );
                    }
                }
            }
        }
        self.queues[active].tasks_processed += 1;
    }

    fn io_tick(&mut self) -> Result<(), EventLoopError> {
        self.backend.flush()?;
        self.backend.poll(Some(Duration::ZERO))?;
        Ok(())
    }

    /// Parks in the I/O backend until an event, the earliest deadline,
    /// or a cross-thread wake. In spin mode this is a non-blocking poll.
    fn park(&mut self, now: u64) -> Result<(), EventLoopError> {
        self.backend.flush()?;

        if self.spin {
            self.backend.poll(Some(Duration::ZERO))?;
            return Ok(());
        }

        let timeout = self
            .deadline
            .earliest_deadline_nanos()
            .map(|deadline| Duration::from_nanos(deadline.saturating_sub(now)));

        self.shared.wakeup_needed.store(true, Ordering::Release);
        // Producers that raced the flag may have queued work already;
        // re-check before committing to a blocking wait.
        let ingress = self.shared.stop.load(Ordering::Acquire) || self.has_pending_global();
        let poll_result = if ingress {
            self.backend.poll(Some(Duration::ZERO))
        } else {
            self.metrics.parks.fetch_add(1, Ordering::Relaxed);
            self.backend.poll(timeout)
        };
        self.shared.wakeup_needed.store(false, Ordering::Release);
        poll_result?;
        Ok(())
    }

    fn has_pending_global(&self) -> bool {
        let mut cursor = self.blocked.head;
        while let Some(id) = cursor {
            if self.queues[id]
                .global
                .as_ref()
                .is_some_and(|global| !global.is_empty())
            {
                return true;
            }
            cursor = self.queues[id].list_next;
        }
        false
    }

    /// Runs remaining queued work after stop, bounded by
    /// [`SHUTDOWN_DRAIN_LIMIT`] so perpetually re-offering tasks cannot
    /// block termination.
    fn drain_for_shutdown(&mut self) {
        let mut budget = SHUTDOWN_DRAIN_LIMIT;
        loop {
            self.reap_blocked_global();
            let Some(active) = self.scheduler.pick_next(&self.queues) else {
                break;
            };
            let mut queue_drained = false;
            while budget > 0 {
                if !self.queues[active].next() {
                    queue_drained = true;
                    break;
                }
                budget -= 1;
                let yield_deadline = self
                    .clock
                    .nanos()
                    .saturating_add(self.min_granularity_nanos);
                self.run_task(active, yield_deadline);
            }
            self.scheduler.update_active(&mut self.queues, 1);
            if queue_drained || self.queues[active].is_empty() {
                self.scheduler.dequeue_active(&mut self.queues);
                self.queues[active].run_state = RunState::Blocked;
                self.queues[active].blocked_count += 1;
            } else {
                self.scheduler.yield_active(&mut self.queues);
            }
            if budget == 0 {
                break;
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("index", &self.index)
            .field("queues", &self.queues.len())
            .field("spin", &self.spin)
            .finish_non_exhaustive()
    }
}
