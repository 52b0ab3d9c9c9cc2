//! Bounded, blocking FIFO queue connecting the acceptor to the workers.
//!
//! Storage is a fixed ring of slots allocated once at construction. The
//! producer blocks while the ring is full (backpressure) and consumers block
//! while it is empty. All slot, index and size updates happen under a single
//! mutex; two condition variables signal "not full" and "not empty".
//!
//! ## Shutdown
//!
//! `close()` sets a flag and wakes *every* waiter on both conditions.
//! After close:
//! - `enqueue` hands the item back to the caller instead of storing it
//! - `dequeue` keeps returning queued items until the ring is drained, then
//!   returns `None`

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Returned by `enqueue` when the queue has been closed.
///
/// Carries the rejected item so the caller decides how to dispose of it.
pub struct Closed<T>(pub T);

impl<T> Closed<T> {
    /// Take back the rejected item.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

impl<T> fmt::Display for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is closed")
    }
}

impl<T> std::error::Error for Closed<T> {}

/// Error for the non-blocking `try_enqueue`.
pub enum TryEnqueueError<T> {
    /// The ring is at capacity.
    Full(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> fmt::Debug for TryEnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryEnqueueError::Full(_) => f.write_str("Full(..)"),
            TryEnqueueError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// Ring state, only touched with the mutex held.
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    size: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn is_full(&self) -> bool {
        self.size == self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        debug_assert!(self.slots[self.tail].is_none(), "tail slot occupied");
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
        self.size += 1;
    }

    fn pop(&mut self) -> T {
        debug_assert!(!self.is_empty());
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.size -= 1;
        match item {
            Some(item) => item,
            None => unreachable!("head slot empty while size > 0"),
        }
    }
}

/// Fixed-capacity, thread-safe FIFO.
///
/// Share between threads with `Arc<BoundedQueue<T>>`.
pub struct BoundedQueue<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be > 0");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            capacity,
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                size: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Lock the ring, recovering from poison.
    ///
    /// No user code runs while the lock is held, so a poisoned ring is
    /// still consistent.
    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Wakes one waiting consumer. Returns the item inside `Closed` if the
    /// queue is closed before space becomes available.
    pub fn enqueue(&self, item: T) -> Result<(), Closed<T>> {
        let mut ring = self.lock();
        while ring.is_full() && !ring.closed {
            ring = self
                .not_full
                .wait(ring)
                .unwrap_or_else(|poison| poison.into_inner());
        }

        if ring.closed {
            return Err(Closed(item));
        }

        ring.push(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append `item` without blocking.
    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut ring = self.lock();
        if ring.closed {
            return Err(TryEnqueueError::Closed(item));
        }
        if ring.is_full() {
            return Err(TryEnqueueError::Full(item));
        }

        ring.push(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Wakes one waiting producer. Returns `None` once the queue is closed
    /// and fully drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut ring = self.lock();
        while ring.is_empty() && !ring.closed {
            ring = self
                .not_empty
                .wait(ring)
                .unwrap_or_else(|poison| poison.into_inner());
        }

        if ring.is_empty() {
            return None;
        }

        let item = ring.pop();
        drop(ring);
        self.not_full.notify_one();
        Some(item)
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn close(&self) {
        let mut ring = self.lock();
        ring.closed = true;
        drop(ring);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued items (snapshot).
    pub fn len(&self) -> usize {
        self.lock().size
    }

    /// Whether the queue currently holds no items (snapshot).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
