//! Fixed-capacity object pool with move-only handles.
//!
//! Every object is allocated up front. [`ObjectPool::acquire`] hands out a [`Pooled`]
//! handle that owns the object exclusively; dropping the handle (or passing it to
//! [`ObjectPool::release`]) recycles the object and puts it back on the lock-free free
//! list. Because the handle is consumed on release, an object can neither be released
//! twice nor be touched after release.

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Restores a pooled object to its blank state before it is reused.
pub trait Recycle {
    fn recycle(&mut self);
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub acquired: u64,
    pub released: u64,
    /// Number of `acquire` calls that found the pool empty.
    pub exhausted: u64,
}

impl PoolStats {
    /// Objects currently held by callers.
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }
}

struct PoolShared<T> {
    free: ArrayQueue<Box<T>>,
    acquired: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
}

impl<T> PoolShared<T> {
    fn give_back(&self, item: Box<T>) {
        // The free list has exactly one slot per object ever created, so this never fails.
        let _ = self.free.push(item);
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared handle to a pool of pre-allocated `T`s. Clones refer to the same pool.
pub struct ObjectPool<T: Recycle> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Recycle> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Recycle> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Recycle> ObjectPool<T> {
    /// Pre-allocate `capacity` objects built by `make`.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, mut make: impl FnMut() -> T) -> Self {
        assert!(capacity > 0, "object pool capacity must be non-zero");
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(Box::new(make()));
        }
        Self {
            shared: Arc::new(PoolShared {
                free,
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Take an object, or `None` when every object is in use.
    pub fn acquire(&self) -> Option<Pooled<T>> {
        match self.shared.free.pop() {
            Some(item) => {
                self.shared.acquired.fetch_add(1, Ordering::Relaxed);
                Some(Pooled {
                    item: Some(item),
                    shared: self.shared.clone(),
                })
            }
            None => {
                self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return an object. Equivalent to dropping the handle.
    pub fn release(&self, item: Pooled<T>) {
        debug_assert!(
            Arc::ptr_eq(&self.shared, &item.shared),
            "object released to a pool it did not come from"
        );
        drop(item);
    }

    pub fn capacity(&self) -> usize {
        self.shared.free.capacity()
    }

    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            available: self.available(),
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            exhausted: self.shared.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive owner of one pooled object.
pub struct Pooled<T: Recycle> {
    item: Option<Box<T>>,
    shared: Arc<PoolShared<T>>,
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_deref().expect("pooled object already released")
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item
            .as_deref_mut()
            .expect("pooled object already released")
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut item) = self.item.take() {
            item.recycle();
            self.shared.give_back(item);
        }
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Scratch {
        values: Vec<u32>,
    }

    impl Recycle for Scratch {
        fn recycle(&mut self) {
            self.values.clear();
        }
    }

    #[test]
    fn pool_exhausts_and_recovers() {
        let pool = ObjectPool::new(2, Scratch::default);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.stats().exhausted, 1);

        pool.release(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn released_objects_are_recycled() {
        let pool = ObjectPool::new(1, Scratch::default);
        let mut item = pool.acquire().unwrap();
        item.values.extend([1, 2, 3]);
        drop(item);

        let item = pool.acquire().unwrap();
        assert!(item.values.is_empty());
    }

    #[test]
    fn acquire_and_release_counts_balance() {
        let pool = ObjectPool::new(4, Scratch::default);
        let held: Vec<_> = (0..3).filter_map(|_| pool.acquire()).collect();
        assert_eq!(pool.stats().outstanding(), 3);
        drop(held);

        let stats = pool.stats();
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.released, 3);
        assert_eq!(stats.available, 4);
    }

    #[test]
    fn handles_move_across_threads() {
        let pool = ObjectPool::new(1, Scratch::default);
        let mut item = pool.acquire().unwrap();
        item.values.push(9);
        let handle = std::thread::spawn(move || item.values[0]);
        assert_eq!(handle.join().unwrap(), 9);
        assert_eq!(pool.available(), 1);
    }
}
