//! Frame allocators: serial, concurrent, and unpooled.
//!
//! The request hot path allocates a frame per read and frees it once the
//! response is written. Pooling keeps that O(1) and allocation-free in
//! steady state. Responses are often built on one loop thread and freed
//! on another; that cross-thread return path is what the concurrent pool
//! exists for.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use super::{Frame, FrameOrigin};

/// Number of frames a serial pool preallocates when drained.
const SERIAL_PREALLOC_COUNT: usize = 4096;

/// Allocates and reclaims [`Frame`]s.
///
/// A frame must be freed through the allocator that produced it; in debug
/// builds the origin tag is asserted on `free`.
pub trait FrameAllocator {
    /// Takes a frame from the pool, constructing one if necessary.
    fn allocate(&mut self) -> Frame;

    /// Like [`allocate`](Self::allocate), but guarantees at least
    /// `min_size` bytes of remaining capacity.
    fn allocate_with_capacity(&mut self, min_size: usize) -> Frame {
        let mut frame = self.allocate();
        frame.ensure_remaining(min_size);
        frame
    }

    /// Returns a frame to the pool in the clean state.
    fn free(&mut self, frame: Frame);
}

/// Single-owner frame pool: a plain stack of clean frames.
///
/// Never shared between threads. The free list is preallocated in blocks
/// of [`SERIAL_PREALLOC_COUNT`] the first time it runs dry, so steady
/// request traffic stops constructing frames almost immediately.
#[derive(Debug)]
pub struct SerialFramePool {
    min_size: usize,
    free_list: Vec<Frame>,
    constructed: u64,
    allocations: u64,
}

impl SerialFramePool {
    /// Creates a pool producing frames of at least `min_size` bytes.
    #[must_use]
    pub fn new(min_size: usize) -> Self {
        Self {
            min_size,
            free_list: Vec::new(),
            constructed: 0,
            allocations: 0,
        }
    }

    /// Total allocate calls served.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Frames constructed from scratch (pool misses).
    #[must_use]
    pub fn constructed(&self) -> u64 {
        self.constructed
    }

    /// Number of clean frames currently pooled.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.free_list.len()
    }
}

impl FrameAllocator for SerialFramePool {
    fn allocate(&mut self) -> Frame {
        self.allocations += 1;
        if self.free_list.is_empty() {
            // Refill in a block so a drained pool does not construct one
            // frame per request from here on.
            self.free_list.reserve(SERIAL_PREALLOC_COUNT);
            for _ in 0..SERIAL_PREALLOC_COUNT {
                self.free_list
                    .push(Frame::with_capacity(self.min_size, FrameOrigin::Serial));
                self.constructed += 1;
            }
        }
        self.free_list.pop().expect("free list refilled above")
    }

    fn free(&mut self, mut frame: Frame) {
        debug_assert_eq!(frame.origin(), FrameOrigin::Serial);
        frame.reset();
        self.free_list.push(frame);
    }
}

/// Cross-thread frame pool over a bounded MPMC free list.
///
/// Cloning the pool clones a handle to the same free list, so a response
/// constructed on one loop can be freed on another. When the free list is
/// full, `free` drops the frame's backing instead of blocking.
#[derive(Debug, Clone)]
pub struct ConcurrentFramePool {
    min_size: usize,
    free_list: Arc<ArrayQueue<Frame>>,
}

impl ConcurrentFramePool {
    /// Creates a pool bounded at `capacity` pooled frames, each of at
    /// least `min_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(min_size: usize, capacity: usize) -> Self {
        Self {
            min_size,
            free_list: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    /// Number of clean frames currently pooled.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.free_list.len()
    }
}

impl FrameAllocator for ConcurrentFramePool {
    fn allocate(&mut self) -> Frame {
        self.free_list
            .pop()
            .unwrap_or_else(|| Frame::with_capacity(self.min_size, FrameOrigin::Concurrent))
    }

    fn free(&mut self, mut frame: Frame) {
        debug_assert_eq!(frame.origin(), FrameOrigin::Concurrent);
        frame.reset();
        // A full pool means we are holding enough memory already; the
        // surplus frame is dropped rather than queued.
        let _ = self.free_list.push(frame);
    }
}

/// No-pool allocator: every allocate constructs, every free drops.
///
/// Useful as a baseline in benchmarks and for cold paths where pooling
/// buys nothing.
#[derive(Debug)]
pub struct UnpooledFrameAllocator {
    min_size: usize,
}

impl UnpooledFrameAllocator {
    /// Creates an allocator producing frames of at least `min_size` bytes.
    #[must_use]
    pub fn new(min_size: usize) -> Self {
        Self { min_size }
    }
}

impl FrameAllocator for UnpooledFrameAllocator {
    fn allocate(&mut self) -> Frame {
        Frame::with_capacity(self.min_size, FrameOrigin::Unpooled)
    }

    fn free(&mut self, frame: Frame) {
        debug_assert_eq!(frame.origin(), FrameOrigin::Unpooled);
        drop(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_serial_preallocates_block() {
        let mut pool = SerialFramePool::new(64);
        let frame = pool.allocate();
        assert_eq!(frame.origin(), FrameOrigin::Serial);
        assert_eq!(pool.constructed(), SERIAL_PREALLOC_COUNT as u64);
        assert_eq!(pool.pooled(), SERIAL_PREALLOC_COUNT - 1);
        pool.free(frame);
        assert_eq!(pool.pooled(), SERIAL_PREALLOC_COUNT);
    }

    #[test]
    fn test_serial_reuses_frames() {
        let mut pool = SerialFramePool::new(64);
        let frame = pool.allocate();
        pool.free(frame);
        let constructed = pool.constructed();
        for _ in 0..1000 {
            let frame = pool.allocate();
            pool.free(frame);
        }
        // Steady state: no new construction.
        assert_eq!(pool.constructed(), constructed);
    }

    #[test]
    fn test_free_returns_clean_frame() {
        let mut pool = SerialFramePool::new(64);
        let mut frame = pool.allocate();
        frame.write_u64(99);
        frame.set_promise(crate::promise::Promise::new());
        frame.set_next(Some(Box::new(Frame::with_capacity(
            16,
            FrameOrigin::Unpooled,
        ))));
        pool.free(frame);

        let frame = pool.allocate();
        assert!(frame.is_clean());
        pool.free(frame);
    }

    #[test]
    fn test_allocate_with_capacity() {
        let mut pool = SerialFramePool::new(32);
        let frame = pool.allocate_with_capacity(4096);
        assert!(frame.remaining() >= 4096);
        pool.free(frame);
    }

    #[test]
    fn test_concurrent_pool_bounded() {
        let mut pool = ConcurrentFramePool::new(64, 2);
        let frames: Vec<Frame> = (0..4).map(|_| pool.allocate()).collect();
        for frame in frames {
            pool.free(frame);
        }
        // Only two fit; the rest were dropped.
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn test_concurrent_pool_cross_thread_free() {
        let mut pool = ConcurrentFramePool::new(64, 16);
        let frame = pool.allocate();

        let mut remote = pool.clone();
        thread::spawn(move || {
            remote.free(frame);
        })
        .join()
        .expect("free thread");

        assert_eq!(pool.pooled(), 1);
        let frame = pool.allocate();
        assert!(frame.is_clean());
        assert_eq!(frame.origin(), FrameOrigin::Concurrent);
    }

    #[test]
    fn test_unpooled_constructs_every_time() {
        let mut pool = UnpooledFrameAllocator::new(128);
        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(a.origin(), FrameOrigin::Unpooled);
        assert!(a.capacity() >= 128 && b.capacity() >= 128);
        pool.free(a);
        pool.free(b);
    }
}
