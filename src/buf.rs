//! Bounded single-producer/single-consumer ring buffer.
//!
//! Two monotonically increasing counters, `produced` and `consumed`, define
//! the occupancy; the producer publishes a filled slot with a release store
//! and the consumer observes it with an acquire load. The endpoints are
//! separate owned types, so the one-writer/one-reader discipline is enforced
//! by ownership rather than convention.
//!
//! The producer side blocks when the ring is full, sleeping a short interval
//! between occupancy checks and warning once per contiguous stall. Everything
//! on the consumer side is non-blocking.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::warn;
use spin_sleep::{SpinSleeper, SpinStrategy};

/// Default sleep while waiting for the consumer to make room.
pub const DEFAULT_FULL_SLEEP: Duration = Duration::from_micros(500);

struct Inner<T> {
    slots: Box<[UnsafeCell<T>]>,
    produced: AtomicU64,
    consumed: AtomicU64,
    name: String,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn occupancy(&self) -> u64 {
        self.produced.load(Ordering::Acquire) - self.consumed.load(Ordering::Acquire)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let residual = self.occupancy();
        if residual > 0 {
            warn!("[buf] {} dropped with {} unconsumed items", self.name, residual);
        }
    }
}

/// Create a new ring with `capacity` preallocated slots.
pub fn spsc<T: Default>(name: &str, capacity: usize) -> (BufProducer<T>, BufConsumer<T>) {
    assert!(capacity > 0, "buffer capacity must be non-zero");
    let slots: Box<[UnsafeCell<T>]> = (0..capacity)
        .map(|_| UnsafeCell::new(T::default()))
        .collect();
    let inner = Arc::new(Inner {
        slots,
        produced: AtomicU64::new(0),
        consumed: AtomicU64::new(0),
        name: name.to_string(),
    });
    (
        BufProducer {
            inner: inner.clone(),
            full_sleep: DEFAULT_FULL_SLEEP,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
        },
        BufConsumer { inner },
    )
}

pub struct BufProducer<T> {
    inner: Arc<Inner<T>>,
    full_sleep: Duration,
    sleeper: SpinSleeper,
}

impl<T: Default> BufProducer<T> {
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn occupancy(&self) -> u64 {
        self.inner.occupancy()
    }

    /// Adjust the sleep used while the ring is full.
    pub fn set_full_sleep(&mut self, sleep: Duration) {
        self.full_sleep = sleep;
    }

    /// Claim the next writable slot, blocking while the ring is full.
    ///
    /// The returned guard must be committed to publish; dropping it leaves
    /// the slot unpublished and reusable.
    pub fn reserve(&mut self) -> Reserved<'_, T> {
        let mut warned = false;
        while self.inner.occupancy() as usize == self.inner.slots.len() {
            if !warned {
                warn!("[buf] {} is full, producer stalled", self.inner.name);
                warned = true;
            }
            self.sleeper.sleep(self.full_sleep);
        }
        let idx = self.inner.produced.load(Ordering::Relaxed) as usize % self.inner.slots.len();
        Reserved { inner: &*self.inner, idx }
    }

    /// Claim a slot only if the ring has room.
    pub fn try_reserve(&mut self) -> Option<Reserved<'_, T>> {
        if self.inner.occupancy() as usize == self.inner.slots.len() {
            return None;
        }
        let idx = self.inner.produced.load(Ordering::Relaxed) as usize % self.inner.slots.len();
        Some(Reserved { inner: &*self.inner, idx })
    }

    /// Copy `value` into the next slot and publish it, blocking while full.
    pub fn push(&mut self, value: T) {
        let mut slot = self.reserve();
        *slot = value;
        slot.commit();
    }
}

/// A claimed, not-yet-published slot.
pub struct Reserved<'a, T> {
    inner: &'a Inner<T>,
    idx: usize,
}

impl<T> Reserved<'_, T> {
    /// Publish the slot. Consumes the guard so each claim publishes at most
    /// once.
    pub fn commit(self) {
        let p = self.inner.produced.load(Ordering::Relaxed);
        self.inner.produced.store(p + 1, Ordering::Release);
    }
}

impl<T> Deref for Reserved<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.inner.slots[self.idx].get() }
    }
}

impl<T> DerefMut for Reserved<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.inner.slots[self.idx].get() }
    }
}

pub struct BufConsumer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Default> BufConsumer<T> {
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn occupancy(&self) -> u64 {
        self.inner.occupancy()
    }

    /// Look at the next unconsumed slot without advancing.
    pub fn peek(&self) -> Option<&T> {
        let c = self.inner.consumed.load(Ordering::Relaxed);
        if self.inner.produced.load(Ordering::Acquire) == c {
            return None;
        }
        let idx = c as usize % self.inner.slots.len();
        Some(unsafe { &*self.inner.slots[idx].get() })
    }

    /// Take the next item, leaving a default value in the slot.
    pub fn pop(&mut self) -> Option<T> {
        let c = self.inner.consumed.load(Ordering::Relaxed);
        if self.inner.produced.load(Ordering::Acquire) == c {
            return None;
        }
        let idx = c as usize % self.inner.slots.len();
        let value = std::mem::take(unsafe { &mut *self.inner.slots[idx].get() });
        self.inner.consumed.store(c + 1, Ordering::Release);
        Some(value)
    }

    /// Copy the next item into `dest` and advance. Returns false on empty.
    pub fn pop_into(&mut self, dest: &mut T) -> bool
    where
        T: Clone,
    {
        let c = self.inner.consumed.load(Ordering::Relaxed);
        if self.inner.produced.load(Ordering::Acquire) == c {
            return false;
        }
        let idx = c as usize % self.inner.slots.len();
        dest.clone_from(unsafe { &*self.inner.slots[idx].get() });
        self.inner.consumed.store(c + 1, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn fifo_order_is_preserved() {
        let (mut tx, mut rx) = spsc::<u32>("t", 8);
        for i in 0..8 {
            tx.push(i);
        }
        for i in 0..8 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn pop_on_empty_is_none() {
        let (_tx, mut rx) = spsc::<u32>("t", 4);
        assert_eq!(rx.pop(), None);
        assert!(rx.peek().is_none());
        let mut dest = 0u32;
        assert!(!rx.pop_into(&mut dest));
    }

    #[test]
    fn peek_does_not_advance() {
        let (mut tx, mut rx) = spsc::<u32>("t", 4);
        tx.push(42);
        assert_eq!(rx.peek(), Some(&42));
        assert_eq!(rx.peek(), Some(&42));
        assert_eq!(rx.occupancy(), 1);
        assert_eq!(rx.pop(), Some(42));
        assert_eq!(rx.occupancy(), 0);
    }

    #[test]
    fn reserve_commit_publishes_in_place() {
        let (mut tx, mut rx) = spsc::<Vec<u8>>("t", 2);
        let mut slot = tx.reserve();
        slot.extend_from_slice(b"abc");
        slot.commit();
        assert_eq!(rx.pop().as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn dropped_reservation_publishes_nothing() {
        let (mut tx, rx) = spsc::<u32>("t", 2);
        {
            let mut slot = tx.reserve();
            *slot = 9;
        }
        assert_eq!(rx.occupancy(), 0);
        assert!(rx.peek().is_none());
    }

    #[test]
    fn try_reserve_fails_when_full() {
        let (mut tx, _rx) = spsc::<u32>("t", 2);
        tx.push(1);
        tx.push(2);
        assert!(tx.try_reserve().is_none());
    }

    // N+k pushes on a capacity-N ring complete exactly when the consumer
    // performs k pops.
    #[test]
    fn full_ring_blocks_producer_until_consumer_drains() {
        let (mut tx, mut rx) = spsc::<u32>("t", 2);
        tx.push(1);
        tx.push(2);

        let producer = thread::spawn(move || {
            let start = Instant::now();
            tx.push(3);
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.pop(), Some(1));
        let blocked_for = producer.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(40), "producer did not block");
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
    }

    #[test]
    fn cross_thread_sequence_arrives_in_order() {
        let (mut tx, mut rx) = spsc::<u64>("t", 16);
        let producer = thread::spawn(move || {
            for i in 0..10_000u64 {
                tx.push(i);
            }
        });
        let mut expect = 0u64;
        while expect < 10_000 {
            if let Some(v) = rx.pop() {
                assert_eq!(v, expect);
                expect += 1;
            }
        }
        producer.join().unwrap();
    }
}
