//! Bounded, non-blocking ring used between every pipeline stage.
//!
//! Capacity is a power of two chosen at creation. A full ring hands the item back to the
//! caller instead of blocking or dropping it; an empty ring returns `None`. Whether to
//! retry, back off or fail is always the caller's decision.

use crate::error::{Result, SchedError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;

/// Largest supported `log2` capacity.
pub const MAX_RING_LOG2: u32 = 24;

/// Returned by [`Ring::enqueue`] when no slot is free. Carries the rejected item.
pub struct RingFull<T>(pub T);

impl<T> RingFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for RingFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RingFull(..)")
    }
}

/// Multi-producer/multi-consumer bounded queue. Clones share the same slots.
pub struct Ring<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for Ring<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> Ring<T> {
    /// Create a ring holding `1 << log2` items.
    pub fn with_log2_capacity(log2: u32) -> Result<Self> {
        if log2 > MAX_RING_LOG2 {
            return Err(SchedError::config(format!(
                "ring log2 capacity {log2} exceeds {MAX_RING_LOG2}"
            )));
        }
        let capacity = 1usize << log2;
        let (sender, receiver) = bounded(capacity);
        Ok(Self {
            sender,
            receiver,
            capacity,
        })
    }

    /// Append `item`, or give it back when the ring is full.
    pub fn enqueue(&self, item: T) -> std::result::Result<(), RingFull<T>> {
        // Both ends live in `self`, so the channel cannot be disconnected.
        self.sender.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) | TrySendError::Disconnected(item) => RingFull(item),
        })
    }

    /// Take the oldest item, if any.
    pub fn dequeue(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Iterate over everything currently queued, removing it.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        self.receiver.try_iter()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.receiver.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }
}
