//! First-come-first-serve task-queue scheduler.

use slab::Slab;

use crate::queue::CircularQueue;
use crate::task_queue::{RunState, TaskQueue};

use super::TaskQueueScheduler;

/// FIFO scheduler over a circular run queue.
///
/// `pick_next` peeks the head without removing it; a yield rotates the
/// head to the tail. The time slice is the target latency divided evenly
/// over the runnable queues, floored at the minimum granularity.
///
/// Kept alongside the fair scheduler for two reasons: it isolates
/// scheduling bugs (swap it in and compare), and it gives benchmarks an
/// O(1) baseline against the fair scheduler's O(log n) bookkeeping.
#[derive(Debug)]
pub struct FcfsScheduler {
    run_queue: CircularQueue<usize>,
    target_latency_nanos: u64,
    min_granularity_nanos: u64,
    active: Option<usize>,
}

impl FcfsScheduler {
    /// Creates a scheduler holding at most `run_queue_capacity` runnable
    /// queues.
    #[must_use]
    pub fn new(
        run_queue_capacity: usize,
        target_latency_nanos: u64,
        min_granularity_nanos: u64,
    ) -> Self {
        Self {
            run_queue: CircularQueue::new(run_queue_capacity),
            target_latency_nanos,
            min_granularity_nanos,
            active: None,
        }
    }
}

impl TaskQueueScheduler for FcfsScheduler {
    fn nr_running(&self) -> usize {
        self.run_queue.len()
    }

    fn enqueue(&mut self, id: usize, queues: &mut Slab<TaskQueue>) {
        queues[id].run_state = RunState::Running;
        let offered = self.run_queue.offer(id);
        // The loop bounds queue creation by the run-queue capacity, so
        // the runnable set can never overflow.
        debug_assert!(offered, "run queue overflow");
    }

    fn pick_next(&mut self, _queues: &Slab<TaskQueue>) -> Option<usize> {
        debug_assert!(self.active.is_none());
        self.active = self.run_queue.peek().copied();
        self.active
    }

    fn time_slice_nanos_active(&self, _queues: &Slab<TaskQueue>) -> u64 {
        debug_assert!(self.active.is_some());
        let nr_running = self.run_queue.len().max(1) as u64;
        (self.target_latency_nanos / nr_running).max(self.min_granularity_nanos)
    }

    fn update_active(&mut self, queues: &mut Slab<TaskQueue>, cpu_nanos: u64) {
        let id = self.active.expect("no active queue");
        queues[id].actual_runtime_nanos += cpu_nanos;
    }

    fn dequeue_active(&mut self, _queues: &mut Slab<TaskQueue>) {
        let id = self.active.take().expect("no active queue");
        let head = self.run_queue.poll();
        debug_assert_eq!(head, Some(id));
    }

    fn yield_active(&mut self, _queues: &mut Slab<TaskQueue>) {
        let id = self.active.take().expect("no active queue");
        if self.run_queue.len() > 1 {
            // Rotate: with a single runnable queue there is nothing to
            // rotate past.
            let head = self.run_queue.poll();
            debug_assert_eq!(head, Some(id));
            let offered = self.run_queue.offer(id);
            debug_assert!(offered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_queue::TaskQueueBuilder;

    fn arena(n: usize) -> (Slab<TaskQueue>, Vec<usize>) {
        let mut slab = Slab::new();
        let ids = (0..n)
            .map(|i| {
                let builder = TaskQueueBuilder::new(format!("q{i}"));
                slab.insert(TaskQueue::new(&builder, 16, 16))
            })
            .collect();
        (slab, ids)
    }

    #[test]
    fn test_time_slice_divides_target_latency() {
        let (mut queues, ids) = arena(4);
        let mut sched = FcfsScheduler::new(8, 1_000_000, 50_000);
        for &id in &ids {
            sched.enqueue(id, &mut queues);
        }
        sched.pick_next(&queues);
        assert_eq!(sched.time_slice_nanos_active(&queues), 250_000);
        sched.dequeue_active(&mut queues);
    }

    #[test]
    fn test_time_slice_floors_at_min_granularity() {
        let (mut queues, ids) = arena(100);
        let mut sched = FcfsScheduler::new(128, 1_000_000, 50_000);
        for &id in &ids {
            sched.enqueue(id, &mut queues);
        }
        sched.pick_next(&queues);
        // 1ms / 100 = 10us, below the 50us floor.
        assert_eq!(sched.time_slice_nanos_active(&queues), 50_000);
        sched.dequeue_active(&mut queues);
    }

    #[test]
    fn test_yield_single_queue_is_noop() {
        let (mut queues, ids) = arena(1);
        let mut sched = FcfsScheduler::new(8, 1_000_000, 50_000);
        sched.enqueue(ids[0], &mut queues);
        for _ in 0..3 {
            assert_eq!(sched.pick_next(&queues), Some(ids[0]));
            sched.yield_active(&mut queues);
        }
    }

    #[test]
    fn test_dequeue_removes_head() {
        let (mut queues, ids) = arena(2);
        let mut sched = FcfsScheduler::new(8, 1_000_000, 50_000);
        sched.enqueue(ids[0], &mut queues);
        sched.enqueue(ids[1], &mut queues);

        assert_eq!(sched.pick_next(&queues), Some(ids[0]));
        sched.dequeue_active(&mut queues);
        assert_eq!(sched.nr_running(), 1);
        assert_eq!(sched.pick_next(&queues), Some(ids[1]));
        sched.dequeue_active(&mut queues);
        assert_eq!(sched.nr_running(), 0);
        assert_eq!(sched.pick_next(&queues), None);
    }

    #[test]
    fn test_update_active_accumulates_runtime() {
        let (mut queues, ids) = arena(1);
        let mut sched = FcfsScheduler::new(8, 1_000_000, 50_000);
        sched.enqueue(ids[0], &mut queues);
        sched.pick_next(&queues);
        sched.update_active(&mut queues, 1234);
        sched.yield_active(&mut queues);
        sched.pick_next(&queues);
        sched.update_active(&mut queues, 766);
        sched.dequeue_active(&mut queues);
        assert_eq!(queues[ids[0]].actual_runtime_nanos, 2000);
    }
}
