//! Weighted fair task-queue scheduler.

use std::collections::BTreeMap;

use slab::Slab;

use crate::task_queue::{RunState, TaskQueue};

use super::{TaskQueueScheduler, REFERENCE_SHARES};

/// Completely-fair scheduler over virtual runtime.
///
/// Runnable queues sit in an ordered set keyed by `(vruntime, seq)`; the
/// insertion sequence breaks ties so equal vruntimes stay FIFO. Charging
/// a queue for `delta` nanoseconds advances its vruntime by
/// `delta * REFERENCE_SHARES / shares`, so a queue with more shares ages
/// slower and is picked more often.
///
/// The time slice is the queue's shares-weighted portion of the target
/// latency, floored at the minimum granularity.
///
/// When a long-blocked queue re-enters, its vruntime is floored at
/// `min_vruntime - target_latency`: enough credit to be scheduled
/// promptly, not enough to starve the queues that kept running.
#[derive(Debug)]
pub struct CfsScheduler {
    /// Runnable queues ordered by (vruntime, insertion seq).
    tree: BTreeMap<(u64, u64), usize>,
    target_latency_nanos: u64,
    min_granularity_nanos: u64,
    run_queue_capacity: usize,
    /// Monotone lower bound over runnable vruntimes; floors re-entries.
    min_vruntime: u64,
    /// Sum of shares over runnable queues, including the active one.
    total_shares: u64,
    seq: u64,
    active: Option<usize>,
}

impl CfsScheduler {
    /// Creates a scheduler holding at most `run_queue_capacity` runnable
    /// queues.
    #[must_use]
    pub fn new(
        run_queue_capacity: usize,
        target_latency_nanos: u64,
        min_granularity_nanos: u64,
    ) -> Self {
        Self {
            tree: BTreeMap::new(),
            target_latency_nanos,
            min_granularity_nanos,
            run_queue_capacity,
            min_vruntime: 0,
            total_shares: 0,
            seq: 0,
            active: None,
        }
    }

    fn insert(&mut self, id: usize, vruntime: u64) {
        self.seq += 1;
        let prev = self.tree.insert((vruntime, self.seq), id);
        debug_assert!(prev.is_none());
        debug_assert!(self.tree.len() <= self.run_queue_capacity);
    }

    fn advance_min_vruntime(&mut self, candidate: u64) {
        let floor = match self.tree.keys().next() {
            Some(&(leftmost, _)) => candidate.min(leftmost),
            None => candidate,
        };
        self.min_vruntime = self.min_vruntime.max(floor);
    }
}

impl TaskQueueScheduler for CfsScheduler {
    fn nr_running(&self) -> usize {
        self.tree.len() + usize::from(self.active.is_some())
    }

    fn enqueue(&mut self, id: usize, queues: &mut Slab<TaskQueue>) {
        let queue = &mut queues[id];
        queue.run_state = RunState::Running;
        // Re-entry floor: neither unbounded credit for long sleepers nor
        // starvation behind queues that never blocked.
        queue.vruntime_nanos = queue
            .vruntime_nanos
            .max(self.min_vruntime.saturating_sub(self.target_latency_nanos));
        self.total_shares += queue.shares;
        let vruntime = queue.vruntime_nanos;
        self.insert(id, vruntime);
    }

    fn pick_next(&mut self, _queues: &Slab<TaskQueue>) -> Option<usize> {
        debug_assert!(self.active.is_none());
        // The active queue leaves the ordered set while it runs; its key
        // would go stale as it accrues vruntime.
        let (_, id) = self.tree.pop_first()?;
        self.active = Some(id);
        Some(id)
    }

    fn time_slice_nanos_active(&self, queues: &Slab<TaskQueue>) -> u64 {
        let id = self.active.expect("no active queue");
        let shares = queues[id].shares;
        let total = self.total_shares.max(1);
        let slice = self
            .target_latency_nanos
            .saturating_mul(shares)
            .checked_div(total)
            .unwrap_or(self.target_latency_nanos);
        slice.max(self.min_granularity_nanos)
    }

    fn update_active(&mut self, queues: &mut Slab<TaskQueue>, cpu_nanos: u64) {
        let id = self.active.expect("no active queue");
        let queue = &mut queues[id];
        queue.actual_runtime_nanos += cpu_nanos;
        let weighted = cpu_nanos
            .saturating_mul(REFERENCE_SHARES)
            .checked_div(queue.shares)
            .unwrap_or(cpu_nanos);
        queue.vruntime_nanos = queue.vruntime_nanos.saturating_add(weighted);
        let candidate = queue.vruntime_nanos;
        self.advance_min_vruntime(candidate);
    }

    fn dequeue_active(&mut self, queues: &mut Slab<TaskQueue>) {
        let id = self.active.take().expect("no active queue");
        self.total_shares -= queues[id].shares;
    }

    fn yield_active(&mut self, queues: &mut Slab<TaskQueue>) {
        let id = self.active.take().expect("no active queue");
        let vruntime = queues[id].vruntime_nanos;
        self.insert(id, vruntime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_queue::TaskQueueBuilder;

    fn arena(shares: &[u64]) -> (Slab<TaskQueue>, Vec<usize>) {
        let mut slab = Slab::new();
        let ids = shares
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let builder = TaskQueueBuilder::new(format!("q{i}")).shares(s);
                slab.insert(TaskQueue::new(&builder, 16, 16))
            })
            .collect();
        (slab, ids)
    }

    #[test]
    fn test_active_leaves_ordered_set() {
        let (mut queues, ids) = arena(&[1, 1]);
        let mut sched = CfsScheduler::new(8, 1_000_000, 50_000);
        sched.enqueue(ids[0], &mut queues);
        sched.enqueue(ids[1], &mut queues);

        let picked = sched.pick_next(&queues).expect("pick");
        // One queue is active, one remains in the set.
        assert_eq!(sched.tree.len(), 1);
        assert!(!sched.tree.values().any(|&id| id == picked));
        sched.yield_active(&mut queues);
        assert_eq!(sched.tree.len(), 2);
    }

    #[test]
    fn test_tie_break_is_fifo() {
        let (mut queues, ids) = arena(&[1, 1, 1]);
        let mut sched = CfsScheduler::new(8, 1_000_000, 50_000);
        for &id in &ids {
            sched.enqueue(id, &mut queues);
        }
        // All vruntimes are zero; insertion order decides.
        assert_eq!(sched.pick_next(&queues), Some(ids[0]));
        sched.update_active(&mut queues, 1);
        sched.yield_active(&mut queues);
        assert_eq!(sched.pick_next(&queues), Some(ids[1]));
        sched.update_active(&mut queues, 1);
        sched.dequeue_active(&mut queues);
    }

    #[test]
    fn test_time_slice_weighted_by_shares() {
        let (mut queues, ids) = arena(&[3, 1]);
        let mut sched = CfsScheduler::new(8, 1_000_000, 50_000);
        sched.enqueue(ids[0], &mut queues);
        sched.enqueue(ids[1], &mut queues);

        let first = sched.pick_next(&queues).expect("pick");
        assert_eq!(first, ids[0]);
        // 1ms * 3/4 shares.
        assert_eq!(sched.time_slice_nanos_active(&queues), 750_000);
        sched.update_active(&mut queues, 1);
        sched.yield_active(&mut queues);

        let second = sched.pick_next(&queues).expect("pick");
        assert_eq!(second, ids[1]);
        assert_eq!(sched.time_slice_nanos_active(&queues), 250_000);
        sched.dequeue_active(&mut queues);
    }

    #[test]
    fn test_reentry_floor_bounds_credit() {
        let (mut queues, ids) = arena(&[1, 1]);
        let target_latency = 1_000_000;
        let mut sched = CfsScheduler::new(8, target_latency, 50_000);
        sched.enqueue(ids[0], &mut queues);

        // Run queue 0 far ahead while queue 1 stays blocked.
        for _ in 0..100 {
            sched.pick_next(&queues).expect("pick");
            sched.update_active(&mut queues, 1_000_000);
            sched.yield_active(&mut queues);
        }
        let leader = queues[ids[0]].vruntime_nanos;

        // Queue 1 wakes: it gets at most one target latency of credit.
        sched.enqueue(ids[1], &mut queues);
        let floored = queues[ids[1]].vruntime_nanos;
        assert!(floored + target_latency >= sched.min_vruntime);
        assert!(floored < leader);
    }

    #[test]
    fn test_min_vruntime_is_monotone() {
        let (mut queues, ids) = arena(&[1]);
        let mut sched = CfsScheduler::new(8, 1_000_000, 50_000);
        sched.enqueue(ids[0], &mut queues);
        let mut last = 0;
        for _ in 0..10 {
            sched.pick_next(&queues).expect("pick");
            sched.update_active(&mut queues, 500_000);
            sched.yield_active(&mut queues);
            assert!(sched.min_vruntime >= last);
            last = sched.min_vruntime;
        }
    }

    #[test]
    fn test_dequeue_releases_shares() {
        let (mut queues, ids) = arena(&[2, 2]);
        let mut sched = CfsScheduler::new(8, 1_000_000, 50_000);
        sched.enqueue(ids[0], &mut queues);
        sched.enqueue(ids[1], &mut queues);
        assert_eq!(sched.total_shares, 4);

        sched.pick_next(&queues).expect("pick");
        sched.dequeue_active(&mut queues);
        assert_eq!(sched.total_shares, 2);
        assert_eq!(sched.nr_running(), 1);
    }
}
