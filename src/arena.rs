//! Fixed-slot arena for reusable event buffers.
//!
//! A bitmap (one bit per slot, set = free) guarded by a mutex provides the
//! slot bookkeeping; a counting semaphore built from the same mutex and a
//! condvar provides the blocking. The producer claims a slot, fills it, and
//! hands the slot index downstream through the event ring; the consumer
//! adopts the index and the slot returns to the pool when it drops.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ArenaError {
    #[error("slot index {0} is out of range")]
    OutOfRange(usize),
    #[error("slot index {0} is already free (double free?)")]
    DoubleFree(usize),
}

struct FreeState {
    /// One bit per slot, set = free.
    map: Box<[u64]>,
    available: usize,
}

pub struct Arena<T> {
    slots: Box<[UnsafeCell<T>]>,
    free: Mutex<FreeState>,
    freed: Condvar,
    nallocated: AtomicU64,
    nfreed: AtomicU64,
    name: String,
}

unsafe impl<T: Send> Send for Arena<T> {}
unsafe impl<T: Send> Sync for Arena<T> {}

impl<T> Arena<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupancy(&self) -> u64 {
        self.nallocated.load(Ordering::Relaxed) - self.nfreed.load(Ordering::Relaxed)
    }

    /// Return a slot to the pool.
    ///
    /// An index that is out of range or already free is diagnosed and leaves
    /// the arena untouched.
    pub fn release(&self, idx: usize) -> Result<(), ArenaError> {
        if idx >= self.slots.len() {
            warn!("[arena] {}: release of invalid slot {}", self.name, idx);
            return Err(ArenaError::OutOfRange(idx));
        }
        let mut free = self.free.lock();
        let word = idx >> 6;
        let bit = 1u64 << (idx & 63);
        if free.map[word] & bit != 0 {
            warn!("[arena] {}: double free of slot {}", self.name, idx);
            return Err(ArenaError::DoubleFree(idx));
        }
        free.map[word] |= bit;
        free.available += 1;
        drop(free);
        self.nfreed.fetch_add(1, Ordering::Relaxed);
        self.freed.notify_one();
        Ok(())
    }

    fn take_lowest_free(&self, free: &mut FreeState) -> Option<usize> {
        for (word_idx, word) in free.map.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1u64 << bit);
                return Some(word_idx * 64 + bit);
            }
        }
        None
    }

    #[cfg(test)]
    fn set_bit_count(&self) -> usize {
        let free = self.free.lock();
        free.map.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl<T: Default> Arena<T> {
    /// Create an arena of at least `nmemb` slots, rounded up to a multiple
    /// of 64 so the bitmap has no partial word.
    pub fn new(name: &str, nmemb: usize) -> Arena<T> {
        let nmemb = (nmemb + 63) & !63;
        let slots: Box<[UnsafeCell<T>]> = (0..nmemb)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();
        Arena {
            slots,
            free: Mutex::new(FreeState {
                map: vec![u64::MAX; nmemb >> 6].into_boxed_slice(),
                available: nmemb,
            }),
            freed: Condvar::new(),
            nallocated: AtomicU64::new(0),
            nfreed: AtomicU64::new(0),
            name: name.to_string(),
        }
    }

    /// Claim a free slot, blocking until one is available.
    pub fn acquire(&self) -> ArenaSlot<'_, T> {
        let mut free = self.free.lock();
        while free.available == 0 {
            self.freed.wait(&mut free);
        }
        free.available -= 1;
        let idx = self
            .take_lowest_free(&mut free)
            .expect("semaphore said a slot was free");
        drop(free);
        self.nallocated.fetch_add(1, Ordering::Relaxed);
        ArenaSlot { arena: self, idx: Some(idx) }
    }

    /// Claim a free slot if one is available right now.
    pub fn try_acquire(&self) -> Option<ArenaSlot<'_, T>> {
        let mut free = self.free.lock();
        if free.available == 0 {
            return None;
        }
        free.available -= 1;
        let idx = self.take_lowest_free(&mut free)?;
        drop(free);
        self.nallocated.fetch_add(1, Ordering::Relaxed);
        Some(ArenaSlot { arena: self, idx: Some(idx) })
    }

    /// Re-adopt a slot index previously detached with
    /// [`ArenaSlot::into_index`].
    ///
    /// # Safety
    ///
    /// `idx` must have been produced by `into_index` and not yet released;
    /// exactly one adopter may exist at a time.
    pub unsafe fn adopt(&self, idx: usize) -> ArenaSlot<'_, T> {
        debug_assert!(idx < self.slots.len());
        ArenaSlot { arena: self, idx: Some(idx) }
    }
}

/// A claimed arena slot. Dereferences to the slot storage and returns the
/// slot to the pool when dropped, unless detached with `into_index`.
pub struct ArenaSlot<'a, T> {
    arena: &'a Arena<T>,
    idx: Option<usize>,
}

impl<T: Default> ArenaSlot<'_, T> {
    pub fn index(&self) -> usize {
        self.idx.expect("slot already detached")
    }

    /// Detach the slot from the guard so the bare index can travel through
    /// the event ring. The holder must eventually `adopt` and drop it (or
    /// `release` the index) to return the slot.
    pub fn into_index(mut self) -> usize {
        self.idx.take().expect("slot already detached")
    }
}

impl<T: Default> Deref for ArenaSlot<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.arena.slots[self.index()].get() }
    }
}

impl<T: Default> DerefMut for ArenaSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.arena.slots[self.index()].get() }
    }
}

impl<T> Drop for ArenaSlot<'_, T> {
    fn drop(&mut self) {
        if let Some(idx) = self.idx.take() {
            // Errors here mean corrupted bookkeeping; release already logged.
            let _ = self.arena.release(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn capacity_rounds_up_to_64() {
        let arena: Arena<u32> = Arena::new("t", 2);
        assert_eq!(arena.capacity(), 64);
        let arena: Arena<u32> = Arena::new("t", 64);
        assert_eq!(arena.capacity(), 64);
        let arena: Arena<u32> = Arena::new("t", 65);
        assert_eq!(arena.capacity(), 128);
    }

    #[test]
    fn gets_minus_frees_equals_occupancy() {
        let arena: Arena<u32> = Arena::new("t", 64);
        let a = arena.acquire().into_index();
        let b = arena.acquire().into_index();
        let _c = arena.acquire().into_index();
        assert_eq!(arena.occupancy(), 3);
        assert_eq!(arena.set_bit_count(), arena.capacity() - 3);
        arena.release(a).unwrap();
        arena.release(b).unwrap();
        assert_eq!(arena.occupancy(), 1);
        assert_eq!(arena.set_bit_count(), arena.capacity() - 1);
    }

    #[test]
    fn double_free_is_diagnosed_and_harmless() {
        let arena: Arena<u32> = Arena::new("t", 64);
        let idx = arena.acquire().into_index();
        arena.release(idx).unwrap();
        let before = arena.set_bit_count();
        assert_eq!(arena.release(idx), Err(ArenaError::DoubleFree(idx)));
        assert_eq!(arena.set_bit_count(), before);
        assert_eq!(arena.occupancy(), 0);
    }

    #[test]
    fn foreign_index_is_rejected_without_side_effects() {
        let arena: Arena<u32> = Arena::new("t", 64);
        let before = arena.set_bit_count();
        assert_eq!(arena.release(4096), Err(ArenaError::OutOfRange(4096)));
        assert_eq!(arena.set_bit_count(), before);
    }

    #[test]
    fn lowest_free_slot_is_reused_first() {
        let arena: Arena<u32> = Arena::new("t", 64);
        let a = arena.acquire().into_index();
        let b = arena.acquire().into_index();
        assert_eq!((a, b), (0, 1));
        arena.release(a).unwrap();
        assert_eq!(arena.acquire().into_index(), 0);
    }

    #[test]
    fn guard_drop_returns_the_slot() {
        let arena: Arena<u32> = Arena::new("t", 64);
        {
            let mut slot = arena.acquire();
            *slot = 7;
            assert_eq!(arena.occupancy(), 1);
        }
        assert_eq!(arena.occupancy(), 0);
    }

    #[test]
    fn exhausted_arena_blocks_until_release() {
        let arena: Arc<Arena<u32>> = Arc::new(Arena::new("t", 1));
        let held: Vec<usize> = (0..64).map(|_| arena.acquire().into_index()).collect();

        let a2 = arena.clone();
        let waiter = thread::spawn(move || a2.acquire().into_index());

        thread::sleep(Duration::from_millis(30));
        arena.release(held[10]).unwrap();
        assert_eq!(waiter.join().unwrap(), 10);
    }
}
