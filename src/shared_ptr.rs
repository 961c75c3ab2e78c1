// Copyright (c) 2025 The emu-sync Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Lock-free, reference-counted publication of immutable records.
//!
//! [`Shared<T>`] is an owning handle to a heap control block holding the
//! payload and its strong reference counter. The counter is pre-charged
//! with a whole "reference pool" at construction, and every handle carries
//! an embedded count of pre-paid references it may hand out without
//! touching the control block.
//!
//! [`AtomicShared<T>`] packs a control-block pointer and a borrowed
//! reference count into one machine word, so `load()` grants a reference
//! by decrementing the word with a single compare-and-swap. Only when the
//! embedded pool is exhausted does a loader fall back to recharging the
//! pool from the main counter, briefly claiming the word with a reserved
//! sentinel count. Loads never park on a condition variable and never
//! need another thread's help to finish.
//!
//! Word encoding is target-width dependent: 64-bit targets keep the
//! pointer in the high 48 bits and a 16-bit count below it; 32-bit
//! targets over-align the control block and use its four low alignment
//! bits. All layout arithmetic is confined to the `pack`/`ptr_of`/
//! `count_of` accessors.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicIsize, AtomicUsize, Ordering};

#[cfg(target_pointer_width = "64")]
const BORROW_BITS: u32 = 16;
#[cfg(not(target_pointer_width = "64"))]
const BORROW_BITS: u32 = 4;

/// Mask of the embedded borrowed-count field.
const COUNT_MASK: usize = (1 << BORROW_BITS) - 1;
/// Count value reserved to mark a pool refill in progress.
const REFILL_SENTINEL: usize = COUNT_MASK;
/// A full borrowed pool, as installed in a word or a fresh handle.
const POOL_FULL: usize = COUNT_MASK - 1;
/// Main-counter charge backing one full pool plus the reference that keeps
/// the holder itself alive.
const POOL_CHARGE: isize = POOL_FULL as isize + 1;

#[cfg(target_pointer_width = "64")]
#[inline]
fn pack(ptr: usize, count: usize) -> usize {
    debug_assert_eq!(ptr >> (usize::BITS - BORROW_BITS), 0);
    debug_assert!(count <= COUNT_MASK);
    (ptr << BORROW_BITS) | count
}

#[cfg(target_pointer_width = "64")]
#[inline]
fn ptr_of(word: usize) -> usize {
    word >> BORROW_BITS
}

#[cfg(not(target_pointer_width = "64"))]
#[inline]
fn pack(ptr: usize, count: usize) -> usize {
    debug_assert_eq!(ptr & COUNT_MASK, 0);
    debug_assert!(count <= COUNT_MASK);
    ptr | count
}

#[cfg(not(target_pointer_width = "64"))]
#[inline]
fn ptr_of(word: usize) -> usize {
    word & !COUNT_MASK
}

#[inline]
fn count_of(word: usize) -> usize {
    word & COUNT_MASK
}

/// Heap record shared by all handles to the same logical object.
///
/// The payload is immutable once constructed; only the counter moves.
#[cfg_attr(not(target_pointer_width = "64"), repr(align(16)))]
struct ControlBlock<T> {
    refs: AtomicIsize,
    value: T,
}

/// Owning, always-non-null handle to a [`ControlBlock`].
///
/// A handle with embedded count `b` represents `b + 1` strong references:
/// `b` pre-paid ones it may hand out cheaply, plus the one keeping the
/// handle itself alive.
pub struct Shared<T> {
    block: NonNull<ControlBlock<T>>,
    borrowed: AtomicUsize,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Allocate a control block for `value` with a fully charged
    /// reference pool.
    pub fn new(value: T) -> Self {
        let block = Box::into_raw(Box::new(ControlBlock {
            refs: AtomicIsize::new(POOL_CHARGE),
            value,
        }));
        Shared {
            // Box::into_raw is never null.
            block: unsafe { NonNull::new_unchecked(block) },
            borrowed: AtomicUsize::new(POOL_FULL),
        }
    }

    /// Raw payload pointer, for identity and null comparisons against
    /// [`AtomicShared::observe`].
    pub fn as_ptr(&self) -> *const T {
        unsafe { ptr::addr_of!((*self.block.as_ptr()).value) }
    }

    /// True when both handles refer to the same control block.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.block == other.block
    }

    fn block(&self) -> &ControlBlock<T> {
        unsafe { self.block.as_ref() }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.block().value
    }
}

impl<T> Clone for Shared<T> {
    /// Split half of this handle's own pre-paid pool; the control block
    /// is only touched when the pool is empty.
    fn clone(&self) -> Self {
        let mut cur = self.borrowed.load(Ordering::Relaxed);
        while cur > 0 {
            let give = (cur - 1) / 2;
            let keep = cur - 1 - give;
            match self.borrowed.compare_exchange_weak(
                cur,
                keep,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Shared {
                        block: self.block,
                        borrowed: AtomicUsize::new(give),
                    }
                }
                Err(seen) => cur = seen,
            }
        }
        // Pool exhausted: charge the main counter a full pool for the new
        // handle.
        self.block().refs.fetch_add(POOL_CHARGE, Ordering::Relaxed);
        Shared {
            block: self.block,
            borrowed: AtomicUsize::new(POOL_FULL),
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let owed = *self.borrowed.get_mut() as isize + 1;
        // Release so payload reads stay before the decrement; the final
        // owner takes an Acquire fence before destruction.
        if self.block().refs.fetch_sub(owed, Ordering::Release) == owed {
            atomic::fence(Ordering::Acquire);
            unsafe { drop(Box::from_raw(self.block.as_ptr())) };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&**self).finish()
    }
}

/// One machine word publishing an optional [`Shared<T>`] to any number of
/// concurrent readers and writers.
pub struct AtomicShared<T> {
    word: AtomicUsize,
    _marker: PhantomData<Shared<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicShared<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicShared<T> {}

impl<T> AtomicShared<T> {
    /// An empty (null) slot.
    pub fn null() -> Self {
        AtomicShared {
            word: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// A slot initially publishing `value`.
    pub fn new(value: Option<Shared<T>>) -> Self {
        AtomicShared {
            word: AtomicUsize::new(Self::into_word(value)),
            _marker: PhantomData,
        }
    }

    /// Borrow one reference from the published word without blocking.
    ///
    /// Returns either the value published before or after any concurrent
    /// [`store`](Self::store), never a torn value. May spin briefly while
    /// another thread holds the refill sentinel, but never parks.
    pub fn load(&self) -> Option<Shared<T>> {
        let mut cur = self.word.load(Ordering::SeqCst);
        loop {
            if cur == 0 {
                return None;
            }
            let count = count_of(cur);
            if count == REFILL_SENTINEL {
                // A refill is in flight; its critical section is two
                // atomic operations, so this resolves promptly.
                std::hint::spin_loop();
                cur = self.word.load(Ordering::SeqCst);
                continue;
            }
            if count > 0 {
                // Fast path: take one pre-paid reference out of the word.
                match self.word.compare_exchange_weak(
                    cur,
                    cur - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        return Some(Shared {
                            block: unsafe { block_from(cur) },
                            borrowed: AtomicUsize::new(0),
                        })
                    }
                    Err(seen) => {
                        cur = seen;
                        continue;
                    }
                }
            }
            // Pool exhausted: claim the word, recharge from the main
            // counter, reinstall a full pool minus the reference we keep.
            let claimed = pack(ptr_of(cur), REFILL_SENTINEL);
            match self
                .word
                .compare_exchange_weak(cur, claimed, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    let block = unsafe { block_from::<T>(cur) };
                    unsafe { block.as_ref() }
                        .refs
                        .fetch_add(POOL_CHARGE, Ordering::Relaxed);
                    self.word
                        .store(pack(ptr_of(cur), POOL_FULL), Ordering::SeqCst);
                    return Some(Shared {
                        block,
                        borrowed: AtomicUsize::new(0),
                    });
                }
                Err(seen) => cur = seen,
            }
        }
    }

    /// Publish `value`, releasing whatever was installed before.
    pub fn store(&self, value: Option<Shared<T>>) {
        drop(self.exchange(value));
    }

    /// Publish `value` and return the previously installed handle; the
    /// caller is responsible for releasing it.
    pub fn exchange(&self, value: Option<Shared<T>>) -> Option<Shared<T>> {
        let new_word = Self::into_word(value);
        let mut cur = self.word.load(Ordering::SeqCst);
        loop {
            if cur != 0 && count_of(cur) == REFILL_SENTINEL {
                std::hint::spin_loop();
                cur = self.word.load(Ordering::SeqCst);
                continue;
            }
            match self
                .word
                .compare_exchange_weak(cur, new_word, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return unsafe { Self::from_word(cur) },
                Err(seen) => cur = seen,
            }
        }
    }

    /// Non-owning view of the current pointer, for identity and null
    /// checks only.
    ///
    /// The returned pointer must never be dereferenced: a concurrent
    /// [`store`](Self::store) may retire the record at any time.
    pub fn observe(&self) -> *const T {
        let word = self.word.load(Ordering::SeqCst);
        if word == 0 {
            return ptr::null();
        }
        // Pure address arithmetic; the block is not dereferenced.
        let base = ptr_of(word) as *const u8;
        base.wrapping_add(mem::offset_of!(ControlBlock<T>, value)) as *const T
    }

    /// Snapshot: true while no value is published.
    pub fn is_null(&self) -> bool {
        self.word.load(Ordering::SeqCst) == 0
    }

    /// Consume a handle into a word owning a full pool plus the keeper
    /// reference, topping the pool up from the main counter if needed.
    fn into_word(value: Option<Shared<T>>) -> usize {
        match value {
            None => 0,
            Some(handle) => {
                let handle = ManuallyDrop::new(handle);
                let borrowed = handle.borrowed.load(Ordering::Relaxed);
                if borrowed < POOL_FULL {
                    handle
                        .block()
                        .refs
                        .fetch_add(POOL_FULL as isize - borrowed as isize, Ordering::Relaxed);
                }
                pack(handle.block.as_ptr() as usize, POOL_FULL)
            }
        }
    }

    /// Reconstitute the handle owning all references encoded in a word
    /// that has been swapped out.
    unsafe fn from_word(word: usize) -> Option<Shared<T>> {
        if word == 0 {
            return None;
        }
        debug_assert_ne!(count_of(word), REFILL_SENTINEL);
        Some(Shared {
            block: block_from(word),
            borrowed: AtomicUsize::new(count_of(word)),
        })
    }
}

unsafe fn block_from<T>(word: usize) -> NonNull<ControlBlock<T>> {
    NonNull::new_unchecked(ptr_of(word) as *mut ControlBlock<T>)
}

impl<T> Default for AtomicShared<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Drop for AtomicShared<T> {
    fn drop(&mut self) {
        // Exclusive access: no refill can be in flight.
        let word = *self.word.get_mut();
        drop(unsafe { Self::from_word(word) });
    }
}

impl<T> fmt::Debug for AtomicShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicShared")
            .field("ptr", &self.observe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// Payload that counts its drops, to check single destruction.
    struct Probe(Arc<AtomicUsize>);

    impl Probe {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let drops = Arc::new(AtomicUsize::new(0));
            (Probe(drops.clone()), drops)
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn new_and_drop_destroys_once() {
        let (probe, drops) = Probe::new();
        let handle = Shared::new(probe);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clone_chain_conserves_references() {
        let (probe, drops) = Probe::new();
        let first = Shared::new(probe);
        let mut handles = Vec::new();
        // Deep enough to exhaust the split-in-half path and hit the
        // main-counter fallback repeatedly.
        for _ in 0..(3 * POOL_FULL + 3) {
            handles.push(first.clone());
        }
        for h in &handles {
            assert!(h.ptr_eq(&first));
        }
        drop(handles);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(first);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn store_then_load_round_trip() {
        let slot = AtomicShared::null();
        assert!(slot.load().is_none());
        assert!(slot.is_null());

        let handle = Shared::new(42u32);
        let payload = handle.as_ptr();
        slot.store(Some(handle));
        let loaded = slot.load().unwrap();
        assert_eq!(*loaded, 42);
        assert!(ptr::eq(loaded.as_ptr(), payload));
        assert!(ptr::eq(slot.observe(), payload));
    }

    #[test]
    fn exchange_returns_previous() {
        let (probe, drops) = Probe::new();
        let slot = AtomicShared::new(Some(Shared::new(probe)));
        let prev = slot.exchange(None).unwrap();
        assert!(slot.is_null());
        assert!(slot.observe().is_null());
        drop(prev);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_refills_exhausted_pool() {
        let (probe, drops) = Probe::new();
        let slot = AtomicShared::new(Some(Shared::new(probe)));
        // Drain the embedded pool past empty several times over.
        for _ in 0..(3 * POOL_FULL + 3) {
            let h = slot.load().unwrap();
            drop(h);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(slot);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_of_slot_releases_value() {
        let (probe, drops) = Probe::new();
        {
            let _slot = AtomicShared::new(Some(Shared::new(probe)));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_load_store_is_never_torn() {
        let slot = Arc::new(AtomicShared::new(Some(Shared::new(0u64))));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let slot = slot.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..20_000 {
                    if let Some(h) = slot.load() {
                        // Generation values are installed whole.
                        assert!(*h < 1_000);
                    }
                }
            }));
        }
        let writer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for generation in 1..1_000u64 {
                    slot.store(Some(Shared::new(generation)));
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        writer.join().unwrap();
    }
}
