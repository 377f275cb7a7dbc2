//! Fixed-minimum-size byte frames for request/response payloads.
//!
//! A [`Frame`] is the unit handed from the read path to application
//! operations and back to the write path. Frames come out of one of three
//! allocators (see [`pool`]) and must be returned to the allocator they
//! came from; the origin tag enforces that pairing.

pub mod pool;

pub use pool::{ConcurrentFramePool, FrameAllocator, SerialFramePool, UnpooledFrameAllocator};

use crate::promise::Promise;

/// Byte offset of the frame's size field.
pub const OFFSET_SIZE: usize = 0;
/// Byte offset of the frame's flags field.
pub const OFFSET_FLAGS: usize = 4;
/// Byte offset of the 8-byte request call id.
///
/// The request layer uses this region to correlate in-flight requests
/// with responses. The engine itself never reads or writes it; access
/// goes exclusively through [`Frame::call_id`] and [`Frame::set_call_id`].
pub const OFFSET_REQ_CALL_ID: usize = 8;
/// Total size of the fixed frame header.
pub const HEADER_SIZE: usize = 16;

/// Identifies the allocator a frame was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// From a single-owner [`SerialFramePool`].
    Serial,
    /// From a cross-thread [`ConcurrentFramePool`].
    Concurrent,
    /// From an [`UnpooledFrameAllocator`]; freed frames are dropped.
    Unpooled,
}

/// A reusable byte buffer with a write cursor and an optional intrusive
/// chain link.
///
/// The chain link (`next`) lets the write path queue frames per socket
/// without an extra container allocation. The optional [`Promise`] is
/// completed by whoever finishes processing the frame.
///
/// After [`Frame::reset`] (which every allocator's `free` performs) the
/// frame is clean: cursor at zero, chain link `None`, promise `None`.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pos: usize,
    next: Option<Box<Frame>>,
    promise: Option<Promise>,
    origin: FrameOrigin,
}

impl Frame {
    /// Creates a frame with at least `capacity` bytes of backing storage,
    /// tagged with the given origin.
    #[must_use]
    pub fn with_capacity(capacity: usize, origin: FrameOrigin) -> Self {
        Self {
            data: vec![0; capacity.max(HEADER_SIZE)],
            pos: 0,
            next: None,
            promise: None,
            origin,
        }
    }

    /// Returns the allocator origin. Immutable for the frame's lifetime.
    #[must_use]
    pub fn origin(&self) -> FrameOrigin {
        self.origin
    }

    /// Returns the backing capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the write cursor.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the bytes written so far.
    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Returns how many bytes can be written before the backing is full.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Grows the backing so at least `extra` more bytes fit.
    ///
    /// Growth doubles the backing until it suffices, preserving contents.
    pub fn ensure_remaining(&mut self, extra: usize) {
        let needed = self.pos + extra;
        if needed <= self.data.len() {
            return;
        }
        let mut new_len = self.data.len().max(1);
        while new_len < needed {
            new_len *= 2;
        }
        self.data.resize(new_len, 0);
    }

    /// Appends bytes at the cursor, growing the backing if needed.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure_remaining(bytes.len());
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Appends a little-endian `u32` at the cursor.
    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Appends a little-endian `u64` at the cursor.
    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes a little-endian `u64` at an absolute offset without moving
    /// the cursor. The offset region must already be within capacity.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8` exceeds the backing capacity.
    pub fn put_u64_at(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads a little-endian `u64` at an absolute offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8` exceeds the backing capacity.
    #[must_use]
    pub fn get_u64_at(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    /// Returns the request call id.
    #[must_use]
    pub fn call_id(&self) -> u64 {
        self.get_u64_at(OFFSET_REQ_CALL_ID)
    }

    /// Sets the request call id. Only the request layer calls this.
    pub fn set_call_id(&mut self, call_id: u64) {
        self.put_u64_at(OFFSET_REQ_CALL_ID, call_id);
    }

    /// Chains another frame behind this one.
    pub fn set_next(&mut self, next: Option<Box<Frame>>) {
        self.next = next;
    }

    /// Detaches and returns the chained frame, if any.
    pub fn take_next(&mut self) -> Option<Box<Frame>> {
        self.next.take()
    }

    /// Returns true if a frame is chained behind this one.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Attaches a completion promise.
    pub fn set_promise(&mut self, promise: Promise) {
        self.promise = Some(promise);
    }

    /// Returns the attached completion promise, if any.
    #[must_use]
    pub fn promise(&self) -> Option<&Promise> {
        self.promise.as_ref()
    }

    /// Detaches and returns the completion promise, if any.
    pub fn take_promise(&mut self) -> Option<Promise> {
        self.promise.take()
    }

    /// Restores the clean state: cursor zero, chain link and promise
    /// detached. Backing bytes are not scrubbed; the cursor defines what
    /// is live.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.next = None;
        self.promise = None;
    }

    /// Returns true if the frame is in the clean state `reset` produces.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.pos == 0 && self.next.is_none() && self.promise.is_none()
    }
}
