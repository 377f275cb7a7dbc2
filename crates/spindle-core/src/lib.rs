//! # Spindle Core
//!
//! Thread-per-core event-loop engine for request/response services.
//!
//! Each CPU gets one dedicated worker thread owning an event loop that
//! schedules application tasks across fairness-weighted task queues,
//! drives a pluggable I/O backend, and services deadline (timer) tasks.
//! On top sits an [`Engine`] that pins N loops to N CPUs and routes
//! partitions to loops with an immutable hash-mod rule.
//!
//! ## Design Principles
//!
//! 1. **No cross-thread sharing on the hot path** - every scheduler and
//!    queue field is owned by its loop thread; the only shared pieces
//!    are each queue's global MPMC queue, a wake flag, and the engine
//!    state machine
//! 2. **Bounded everything** - local FIFOs, global queues, the run
//!    queue, and the deadline heap all reject instead of growing
//! 3. **Cooperative tasks** - long tasks poll a yield horizon instead of
//!    being preempted; stalls are detected and reported, never fatal
//! 4. **O(1) frames** - request/response payloads come from per-thread
//!    and cross-thread pools
//!
//! ## Example
//!
//! ```rust,ignore
//! use spindle_core::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::builder().eventloop_count(4).build()?)?;
//! engine.start()?;
//!
//! // Route work by partition and submit from any thread.
//! engine.loop_for_hash(partition_id).offer(move || handle_request());
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the io drivers (epoll/io_uring/affinity syscalls).
#![allow(unsafe_code)]

pub mod clock;
pub(crate) mod deadline;
pub mod engine;
pub mod eventloop;
pub mod frame;
pub mod io;
pub mod promise;
pub mod queue;
pub(crate) mod sched;
pub mod task;
pub mod task_queue;

// Re-export the headline types.
pub use clock::Clock;
pub use engine::{Engine, EngineConfig, EngineError, EngineState, EngineStats};
pub use eventloop::{
    EventLoopError, LoggingStallHandler, LoopHandle, LoopMetricsSnapshot, RemoteQueueHandle,
    StallHandler, TaskContext,
};
pub use frame::{Frame, FrameAllocator};
pub use io::BackendKind;
pub use promise::Promise;
pub use task::{Progress, Task};
pub use task_queue::{TaskQueueBuilder, TaskQueueHandle};

/// Result type for spindle-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for spindle-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Engine lifecycle and configuration errors.
    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Event-loop mechanism errors.
    #[error("event loop error: {0}")]
    EventLoop(#[from] eventloop::EventLoopError),
}
