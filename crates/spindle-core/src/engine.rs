//! The engine: a group of event loops, one per pinned CPU.
//!
//! The engine owns loop construction, thread lifecycle, and the partition
//! routing rule. Its state machine is strict: `New -> Running ->
//! Shutdown -> Terminated`, with `shutdown` from `New` jumping straight
//! to `Terminated`. Illegal transitions are errors, not no-ops, so a
//! double `start` surfaces immediately.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::eventloop::{
    EventLoop, EventLoopError, LoggingStallHandler, LoopHandle, LoopMetricsSnapshot, StallHandler,
};
use crate::io::BackendKind;

/// Errors raised by engine lifecycle and configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was not in the state the operation requires.
    #[error("illegal engine state: {found} (expected {expected})")]
    IllegalState {
        /// State the operation requires.
        expected: EngineState,
        /// State the engine was in.
        found: EngineState,
    },

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A loop thread could not be spawned.
    #[error("failed to spawn loop {index}: {message}")]
    SpawnFailed {
        /// Index of the loop that failed to spawn.
        index: usize,
        /// OS error message.
        message: String,
    },

    /// A loop could not be constructed.
    #[error(transparent)]
    EventLoop(#[from] EventLoopError),
}

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built but not started.
    New,
    /// Loops are running.
    Running,
    /// Shutdown signalled; loops are draining.
    Shutdown,
    /// Every loop thread has confirmed termination.
    Terminated,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Running,
            2 => Self::Shutdown,
            _ => Self::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Running => 1,
            Self::Shutdown => 2,
            Self::Terminated => 3,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Shutdown => "shutdown",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Engine configuration. Build with [`EngineConfig::builder`].
#[derive(Clone)]
pub struct EngineConfig {
    /// Number of event loops (one thread each).
    pub eventloop_count: usize,
    /// Which I/O backend every loop drives.
    pub eventloop_type: BackendKind,
    /// Busy-poll instead of parking; trades a core for tail latency.
    pub spin: bool,
    /// Use the fair scheduler; `false` selects FCFS.
    pub cfs: bool,
    /// Scheduling period shared across runnable queues.
    pub target_latency_nanos: u64,
    /// Minimum slice and the per-task cooperative yield horizon.
    pub min_granularity_nanos: u64,
    /// Most task queues one loop will host.
    pub run_queue_capacity: usize,
    /// Capacity of the deadline task heap.
    pub deadline_run_queue_capacity: usize,
    /// Single-task runtime above which the stall handler fires.
    pub stall_threshold_nanos: u64,
    /// Longest stretch of task execution between I/O ticks.
    pub io_interval_nanos: u64,
    /// CPUs to pin loops to; loop `i` gets `cpus[i % len]`. `None`
    /// leaves placement to the OS.
    pub thread_affinity: Option<Vec<usize>>,
    /// Default capacity of each queue's local FIFO.
    pub local_task_queue_capacity: usize,
    /// Default capacity of each concurrent queue's global queue.
    pub concurrent_task_queue_capacity: usize,
    /// Receives stall notifications; defaults to a logging handler.
    pub stall_handler: Arc<dyn StallHandler>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            eventloop_count: num_cpus::get(),
            eventloop_type: BackendKind::default(),
            spin: false,
            cfs: true,
            target_latency_nanos: 1_000_000,
            min_granularity_nanos: 100_000,
            run_queue_capacity: 1024,
            deadline_run_queue_capacity: 4096,
            stall_threshold_nanos: 1_000_000,
            io_interval_nanos: 10_000,
            thread_affinity: None,
            local_task_queue_capacity: 65536,
            concurrent_task_queue_capacity: 65536,
            stall_handler: Arc::new(LoggingStallHandler),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("eventloop_count", &self.eventloop_count)
            .field("eventloop_type", &self.eventloop_type)
            .field("spin", &self.spin)
            .field("cfs", &self.cfs)
            .field("target_latency_nanos", &self.target_latency_nanos)
            .field("min_granularity_nanos", &self.min_granularity_nanos)
            .field("run_queue_capacity", &self.run_queue_capacity)
            .field(
                "deadline_run_queue_capacity",
                &self.deadline_run_queue_capacity,
            )
            .field("stall_threshold_nanos", &self.stall_threshold_nanos)
            .field("io_interval_nanos", &self.io_interval_nanos)
            .field("thread_affinity", &self.thread_affinity)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Starts a configuration builder.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.eventloop_count == 0 {
            return Err(EngineError::InvalidConfig(
                "eventloop_count must be > 0".to_string(),
            ));
        }
        if self.target_latency_nanos == 0 {
            return Err(EngineError::InvalidConfig(
                "target_latency_nanos must be > 0".to_string(),
            ));
        }
        if self.min_granularity_nanos == 0 {
            return Err(EngineError::InvalidConfig(
                "min_granularity_nanos must be > 0".to_string(),
            ));
        }
        if self.min_granularity_nanos > self.target_latency_nanos {
            return Err(EngineError::InvalidConfig(
                "min_granularity_nanos must not exceed target_latency_nanos".to_string(),
            ));
        }
        if self.run_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "run_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.deadline_run_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "deadline_run_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.local_task_queue_capacity == 0 || self.concurrent_task_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "task queue capacities must be > 0".to_string(),
            ));
        }
        if self.io_interval_nanos == 0 {
            return Err(EngineError::InvalidConfig(
                "io_interval_nanos must be > 0".to_string(),
            ));
        }
        if let Some(cpus) = &self.thread_affinity {
            if cpus.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "thread_affinity must name at least one cpu".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    eventloop_count: Option<usize>,
    eventloop_type: Option<BackendKind>,
    spin: Option<bool>,
    cfs: Option<bool>,
    target_latency_nanos: Option<u64>,
    min_granularity_nanos: Option<u64>,
    run_queue_capacity: Option<usize>,
    deadline_run_queue_capacity: Option<usize>,
    stall_threshold_nanos: Option<u64>,
    io_interval_nanos: Option<u64>,
    thread_affinity: Option<Vec<usize>>,
    local_task_queue_capacity: Option<usize>,
    concurrent_task_queue_capacity: Option<usize>,
    stall_handler: Option<Arc<dyn StallHandler>>,
}

impl fmt::Debug for EngineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfigBuilder")
            .field("eventloop_count", &self.eventloop_count)
            .field("eventloop_type", &self.eventloop_type)
            .field("spin", &self.spin)
            .field("cfs", &self.cfs)
            .field("target_latency_nanos", &self.target_latency_nanos)
            .field("min_granularity_nanos", &self.min_granularity_nanos)
            .field("run_queue_capacity", &self.run_queue_capacity)
            .field(
                "deadline_run_queue_capacity",
                &self.deadline_run_queue_capacity,
            )
            .field("stall_threshold_nanos", &self.stall_threshold_nanos)
            .field("io_interval_nanos", &self.io_interval_nanos)
            .field("thread_affinity", &self.thread_affinity)
            .field(
                "local_task_queue_capacity",
                &self.local_task_queue_capacity,
            )
            .field(
                "concurrent_task_queue_capacity",
                &self.concurrent_task_queue_capacity,
            )
            .field(
                "stall_handler",
                &self.stall_handler.as_ref().map(|_| "<dyn StallHandler>"),
            )
            .finish()
    }
}

impl EngineConfigBuilder {
    /// Sets the number of event loops.
    #[must_use]
    pub fn eventloop_count(mut self, count: usize) -> Self {
        self.eventloop_count = Some(count);
        self
    }

    /// Sets the I/O backend driven by every loop.
    #[must_use]
    pub fn eventloop_type(mut self, kind: BackendKind) -> Self {
        self.eventloop_type = Some(kind);
        self
    }

    /// Enables busy-polling instead of parking.
    #[must_use]
    pub fn spin(mut self, spin: bool) -> Self {
        self.spin = Some(spin);
        self
    }

    /// Selects the fair scheduler (`true`) or FCFS (`false`).
    #[must_use]
    pub fn cfs(mut self, cfs: bool) -> Self {
        self.cfs = Some(cfs);
        self
    }

    /// Sets the scheduling period shared across runnable queues.
    #[must_use]
    pub fn target_latency(mut self, latency: Duration) -> Self {
        self.target_latency_nanos = Some(duration_nanos(latency));
        self
    }

    /// Sets the minimum slice and cooperative yield horizon.
    #[must_use]
    pub fn min_granularity(mut self, granularity: Duration) -> Self {
        self.min_granularity_nanos = Some(duration_nanos(granularity));
        self
    }

    /// Sets how many task queues one loop may host.
    #[must_use]
    pub fn run_queue_capacity(mut self, capacity: usize) -> Self {
        self.run_queue_capacity = Some(capacity);
        self
    }

    /// Sets the deadline heap capacity.
    #[must_use]
    pub fn deadline_run_queue_capacity(mut self, capacity: usize) -> Self {
        self.deadline_run_queue_capacity = Some(capacity);
        self
    }

    /// Sets the single-task stall threshold.
    #[must_use]
    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold_nanos = Some(duration_nanos(threshold));
        self
    }

    /// Sets the longest stretch between intra-slice I/O ticks.
    #[must_use]
    pub fn io_interval(mut self, interval: Duration) -> Self {
        self.io_interval_nanos = Some(duration_nanos(interval));
        self
    }

    /// Pins loop threads to the given CPUs, round-robin.
    #[must_use]
    pub fn thread_affinity(mut self, cpus: Vec<usize>) -> Self {
        self.thread_affinity = Some(cpus);
        self
    }

    /// Sets the default local FIFO capacity per queue.
    #[must_use]
    pub fn local_task_queue_capacity(mut self, capacity: usize) -> Self {
        self.local_task_queue_capacity = Some(capacity);
        self
    }

    /// Sets the default global queue capacity per concurrent queue.
    #[must_use]
    pub fn concurrent_task_queue_capacity(mut self, capacity: usize) -> Self {
        self.concurrent_task_queue_capacity = Some(capacity);
        self
    }

    /// Installs a custom stall handler.
    #[must_use]
    pub fn stall_handler(mut self, handler: Arc<dyn StallHandler>) -> Self {
        self.stall_handler = Some(handler);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any knob is out of range.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            eventloop_count: self.eventloop_count.unwrap_or(defaults.eventloop_count),
            eventloop_type: self.eventloop_type.unwrap_or(defaults.eventloop_type),
            spin: self.spin.unwrap_or(defaults.spin),
            cfs: self.cfs.unwrap_or(defaults.cfs),
            target_latency_nanos: self
                .target_latency_nanos
                .unwrap_or(defaults.target_latency_nanos),
            min_granularity_nanos: self
                .min_granularity_nanos
                .unwrap_or(defaults.min_granularity_nanos),
            run_queue_capacity: self
                .run_queue_capacity
                .unwrap_or(defaults.run_queue_capacity),
            deadline_run_queue_capacity: self
                .deadline_run_queue_capacity
                .unwrap_or(defaults.deadline_run_queue_capacity),
            stall_threshold_nanos: self
                .stall_threshold_nanos
                .unwrap_or(defaults.stall_threshold_nanos),
            io_interval_nanos: self.io_interval_nanos.unwrap_or(defaults.io_interval_nanos),
            thread_affinity: self.thread_affinity,
            local_task_queue_capacity: self
                .local_task_queue_capacity
                .unwrap_or(defaults.local_task_queue_capacity),
            concurrent_task_queue_capacity: self
                .concurrent_task_queue_capacity
                .unwrap_or(defaults.concurrent_task_queue_capacity),
            stall_handler: self.stall_handler.unwrap_or(defaults.stall_handler),
        };
        config.validate()?;
        Ok(config)
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Latch opened once every loop thread has confirmed termination.
#[derive(Debug)]
struct TerminationLatch {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl TerminationLatch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrements the latch; returns the number still outstanding.
    fn count_down(&self) -> usize {
        let mut remaining = self.remaining.lock().expect("latch poisoned");
        *remaining = remaining.saturating_sub(1);
        let left = *remaining;
        drop(remaining);
        self.cond.notify_all();
        left
    }

    /// Opens the latch unconditionally.
    fn open(&self) {
        let mut remaining = self.remaining.lock().expect("latch poisoned");
        *remaining = 0;
        drop(remaining);
        self.cond.notify_all();
    }

    /// Waits up to `timeout` for the latch to open.
    fn await_open(&self, timeout: Duration) -> bool {
        let mut remaining = self.remaining.lock().expect("latch poisoned");
        while *remaining > 0 {
            let (guard, result) = self
                .cond
                .wait_timeout(remaining, timeout)
                .expect("latch poisoned");
            remaining = guard;
            if result.timed_out() && *remaining > 0 {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
struct EngineShared {
    state: AtomicU8,
    latch: TerminationLatch,
}

/// Per-loop stats plus the engine-wide aggregate.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Snapshot per loop, indexed by loop.
    pub loops: Vec<LoopMetricsSnapshot>,
    /// Tasks processed across all loops.
    pub total_tasks_processed: u64,
}

/// A group of event loops, one per pinned CPU.
///
/// ```ignore
/// let engine = Engine::new(EngineConfig::builder().eventloop_count(4).build()?)?;
/// engine.start()?;
/// engine.loop_for_hash(partition_id).offer(|| process());
/// engine.shutdown();
/// assert!(engine.await_termination(Duration::from_secs(5)));
/// ```
pub struct Engine {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    handles: Vec<LoopHandle>,
    pending: Mutex<Vec<EventLoop>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Builds the engine and its loops without starting any threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a loop's I/O
    /// backend cannot be created.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let mut loops = Vec::with_capacity(config.eventloop_count);
        let mut handles = Vec::with_capacity(config.eventloop_count);
        for index in 0..config.eventloop_count {
            let event_loop = EventLoop::new(&config, index)?;
            handles.push(event_loop.handle());
            loops.push(event_loop);
        }

        Ok(Self {
            shared: Arc::new(EngineShared {
                state: AtomicU8::new(EngineState::New.as_u8()),
                latch: TerminationLatch::new(config.eventloop_count),
            }),
            config,
            handles,
            pending: Mutex::new(loops),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Number of event loops.
    #[must_use]
    pub fn eventloop_count(&self) -> usize {
        self.handles.len()
    }

    /// Handles to every loop, indexed by loop.
    #[must_use]
    pub fn handles(&self) -> &[LoopHandle] {
        &self.handles
    }

    /// Handle to the loop at `index`.
    #[must_use]
    pub fn loop_handle(&self, index: usize) -> Option<&LoopHandle> {
        self.handles.get(index)
    }

    /// Maps an integer key (a partition id, a connection id) to a loop
    /// with the immutable hash-mod rule.
    #[must_use]
    pub fn loop_for_hash(&self, key: u64) -> &LoopHandle {
        let index = fxhash::hash64(&key) as usize % self.handles.len();
        &self.handles[index]
    }

    /// Starts one thread per loop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] unless the engine is `New`,
    /// or [`EngineError::SpawnFailed`] if the OS refuses a thread.
    pub fn start(&self) -> Result<(), EngineError> {
        self.transition(EngineState::New, EngineState::Running)?;

        let loops = std::mem::take(&mut *self.pending.lock().expect("pending poisoned"));
        let mut threads = self.threads.lock().expect("threads poisoned");
        for mut event_loop in loops {
            let index = threads.len();
            let shared = Arc::clone(&self.shared);
            let affinity = self.config.thread_affinity.clone();
            let thread = std::thread::Builder::new()
                .name(format!("spindle-loop-{index}"))
                .spawn(move || {
                    if let Some(cpus) = affinity {
                        apply_affinity(index, &cpus);
                    }
                    if let Err(e) = event_loop.run() {
                        // The loop terminates alone; the rest of the
                        // engine keeps running.
                        error!(index, error = %e, "event loop terminated abnormally");
                    }
                    if shared.latch.count_down() == 0 {
                        shared
                            .state
                            .store(EngineState::Terminated.as_u8(), Ordering::Release);
                    }
                })
                .map_err(|e| EngineError::SpawnFailed {
                    index,
                    message: e.to_string(),
                })?;
            threads.push(thread);
        }
        debug!(loops = threads.len(), "engine started");
        Ok(())
    }

    /// Requests shutdown. Idempotent; safe from any thread.
    ///
    /// From `New` the engine goes straight to `Terminated`. From
    /// `Running`, every loop gets a stop flag, a sentinel task, and a
    /// wake; `Terminated` is reached once all loop threads confirm.
    pub fn shutdown(&self) {
        loop {
            match self.state() {
                EngineState::New => {
                    if self
                        .try_swap(EngineState::New, EngineState::Terminated)
                        .is_ok()
                    {
                        self.pending.lock().expect("pending poisoned").clear();
                        self.shared.latch.open();
                        return;
                    }
                }
                EngineState::Running => {
                    if self
                        .try_swap(EngineState::Running, EngineState::Shutdown)
                        .is_ok()
                    {
                        for handle in &self.handles {
                            handle.shared().stop.store(true, Ordering::Release);
                            // The sentinel makes the stop visible even to
                            // a loop mid-reap; the wake unparks it.
                            let _ = handle.offer_sentinel();
                            handle.wake();
                        }
                        return;
                    }
                }
                EngineState::Shutdown | EngineState::Terminated => return,
            }
        }
    }

    /// Blocks until every loop thread has terminated or `timeout`
    /// elapses. Returns true once terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let terminated = self.shared.latch.await_open(timeout);
        if terminated {
            let threads = std::mem::take(&mut *self.threads.lock().expect("threads poisoned"));
            for thread in threads {
                if thread.join().is_err() {
                    warn!("loop thread panicked before termination");
                }
            }
        }
        terminated
    }

    /// Snapshot of per-loop metrics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let loops: Vec<LoopMetricsSnapshot> =
            self.handles.iter().map(LoopHandle::metrics).collect();
        let total_tasks_processed = loops.iter().map(|m| m.tasks_processed).sum();
        EngineStats {
            loops,
            total_tasks_processed,
        }
    }

    fn transition(&self, from: EngineState, to: EngineState) -> Result<(), EngineError> {
        self.try_swap(from, to)
            .map_err(|found| EngineError::IllegalState {
                expected: from,
                found,
            })
    }

    fn try_swap(&self, from: EngineState, to: EngineState) -> Result<(), EngineState> {
        self.shared
            .state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(EngineState::from_u8)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("eventloop_count", &self.handles.len())
            .finish_non_exhaustive()
    }
}

/// Pins the calling thread to `cpus[index % len]`, verifying the applied
/// set afterwards. A mismatch or failure is a warning, never fatal.
#[cfg(target_os = "linux")]
fn apply_affinity(index: usize, cpus: &[usize]) {
    use std::mem;

    let cpu = cpus[index % cpus.len()];
    // SAFETY: cpu_set_t is a plain bitmask initialised with CPU_ZERO;
    // sched_setaffinity/getaffinity read and write only within its size.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(
                index,
                cpu,
                error = %std::io::Error::last_os_error(),
                "sched_setaffinity failed; continuing unpinned"
            );
            return;
        }

        let mut applied: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut applied) == 0
            && !libc::CPU_ISSET(cpu, &applied)
        {
            warn!(index, cpu, "applied cpu set differs from requested; continuing");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(index: usize, cpus: &[usize]) {
    let cpu = cpus[index % cpus.len()];
    warn!(index, cpu, "thread affinity is not supported on this platform");
}
