//! Bounded single-threaded queues backing the schedulers.
//!
//! Both structures reject on overflow instead of growing: capacity limits
//! are how the engine surfaces backpressure to producers (an `offer`
//! returning `false` is the `CapacityExceeded` signal described in the
//! error model).

mod circular;
mod priority;

pub use circular::CircularQueue;
pub use priority::BoundedHeap;
