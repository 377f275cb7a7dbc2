//! Task-queue schedulers: who gets the CPU next.
//!
//! Two variants behind one trait, fixed at loop construction:
//!
//! - [`FcfsScheduler`]: a circular run queue. Trivially correct, O(1),
//!   and the baseline the fair scheduler is benchmarked against.
//! - [`CfsScheduler`]: weighted fair scheduling over virtual runtime,
//!   modelled on the kernel's CFS. Queues with more shares earn
//!   proportionally more CPU.
//!
//! The scheduler tracks at most one *active* queue between `pick_next`
//! and the closing `dequeue_active`/`yield_active`; the active queue is
//! never simultaneously present in the runnable set.

mod cfs;
mod fcfs;

pub use cfs::CfsScheduler;
pub use fcfs::FcfsScheduler;

use slab::Slab;

use crate::task_queue::TaskQueue;

/// Weight that one share is scaled against in vruntime accounting.
pub const REFERENCE_SHARES: u64 = 1024;

/// Scheduling policy over the runnable task queues of one event loop.
///
/// All methods are loop-thread-only. Queues are referred to by their slab
/// id; the arena itself is passed in so the scheduler can read and update
/// accounting fields without owning the queues.
pub(crate) trait TaskQueueScheduler: Send {
    /// Number of runnable queues, including the active one.
    fn nr_running(&self) -> usize;

    /// Adds a blocked queue to the runnable set and flips it to running.
    fn enqueue(&mut self, id: usize, queues: &mut Slab<TaskQueue>);

    /// Selects the next queue to run and makes it active. Returns `None`
    /// when nothing is runnable.
    fn pick_next(&mut self, queues: &Slab<TaskQueue>) -> Option<usize>;

    /// Time budget for the active queue's current turn.
    fn time_slice_nanos_active(&self, queues: &Slab<TaskQueue>) -> u64;

    /// Charges the active queue for `cpu_nanos` of consumed CPU.
    fn update_active(&mut self, queues: &mut Slab<TaskQueue>, cpu_nanos: u64);

    /// Removes the active queue from the runnable set (it drained).
    fn dequeue_active(&mut self, queues: &mut Slab<TaskQueue>);

    /// Returns the active queue to the runnable set (it still has work).
    fn yield_active(&mut self, queues: &mut Slab<TaskQueue>);
}
