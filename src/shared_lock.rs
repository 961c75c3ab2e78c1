// Copyright (c) 2025 The emu-sync Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A fair, mostly-lock-free reader/writer lock.
//!
//! All coordination state lives in one atomic word packing the reader
//! count, a writer-held bit and two "waiters queued" bits. Uncontended
//! acquire and release are a single compare-and-swap on that word. Only
//! contended callers touch the fallback mutex, where they register in a
//! bounded waiter counter and park on one of three condition variables:
//! a reader gate, a writer gate (mutual exclusion among queued writers)
//! and a drain gate (the winning writer waits for in-flight readers to
//! finish).
//!
//! Fairness: the moment a writer is queued, the reader fast path refuses
//! new read leases, so a continuous stream of readers cannot starve the
//! writer. Write release prefers queued writers, then wakes all queued
//! readers.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::sl;

/// Bits 0..31 of the control word: number of read leases held.
const READERS_MASK: u64 = 0x7fff_ffff;
/// Set while a writer owns the lock.
const WRITER_BIT: u64 = 1 << 31;
/// Set while at least one reader is registered as waiting.
const READERS_QUEUED_BIT: u64 = 1 << 32;
/// Set while at least one writer is registered as waiting.
const WRITERS_QUEUED_BIT: u64 = 1 << 33;

/// Packed snapshot of the lock control word.
///
/// Transition predicates are pure functions on this type; the atomic
/// retry loop lives in [`update`] alone.
#[derive(Clone, Copy, PartialEq, Eq)]
struct LockWord(u64);

impl LockWord {
    fn readers(self) -> u64 {
        self.0 & READERS_MASK
    }

    fn writer_held(self) -> bool {
        self.0 & WRITER_BIT != 0
    }

    fn readers_queued(self) -> bool {
        self.0 & READERS_QUEUED_BIT != 0
    }

    fn writers_queued(self) -> bool {
        self.0 & WRITERS_QUEUED_BIT != 0
    }

    /// A new read lease may be granted: no writer holds the lock, no
    /// writer is queued ahead of us, and the reader count has headroom.
    fn can_acquire_shared(self) -> bool {
        !self.writer_held() && !self.writers_queued() && self.readers() < READERS_MASK
    }

    fn acquire_shared(self) -> Self {
        LockWord(self.0 + 1)
    }

    fn release_shared(self) -> Self {
        LockWord(self.0 - 1)
    }

    fn acquire_writer(self) -> Self {
        LockWord(self.0 | WRITER_BIT)
    }

    fn release_writer(self) -> Self {
        LockWord(self.0 & !WRITER_BIT)
    }

    fn with_readers_queued(self, queued: bool) -> Self {
        if queued {
            LockWord(self.0 | READERS_QUEUED_BIT)
        } else {
            LockWord(self.0 & !READERS_QUEUED_BIT)
        }
    }

    fn with_writers_queued(self, queued: bool) -> Self {
        if queued {
            LockWord(self.0 | WRITERS_QUEUED_BIT)
        } else {
            LockWord(self.0 & !WRITERS_QUEUED_BIT)
        }
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockWord")
            .field("readers", &self.readers())
            .field("writer_held", &self.writer_held())
            .field("readers_queued", &self.readers_queued())
            .field("writers_queued", &self.writers_queued())
            .finish()
    }
}

/// Read-compute-CAS retry loop over the packed word.
///
/// Returns the previous word on success, or the word that made the
/// transition closure bail out.
fn update<F>(word: &AtomicU64, transition: F) -> Result<LockWord, LockWord>
where
    F: FnMut(LockWord) -> Option<LockWord>,
{
    let mut transition = transition;
    word.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
        transition(LockWord(w)).map(|n| n.0)
    })
    .map(LockWord)
    .map_err(LockWord)
}

/// Bounded announce/deregister bookkeeping for one class of waiters.
#[derive(Debug, Default)]
struct WaitCounter(u16);

impl WaitCounter {
    /// Register one waiter. Fails when the counter is saturated.
    fn announce(&mut self, limit: u16) -> bool {
        if self.0 == limit {
            false
        } else {
            self.0 += 1;
            true
        }
    }

    /// Remove one waiter; true when this was the last one queued.
    fn deregister(&mut self) -> bool {
        debug_assert!(self.0 > 0);
        self.0 -= 1;
        self.0 == 0
    }

    fn count(&self) -> u16 {
        self.0
    }
}

#[derive(Debug, Default)]
struct Waiters {
    readers: WaitCounter,
    writers: WaitCounter,
}

/// A fair reader/writer lock owning the value it protects.
///
/// The API mirrors [`std::sync::RwLock`]: [`read`](Self::read) and
/// [`write`](Self::write) return RAII guards whose drop releases the
/// lease. Unlike `std`, the lock never poisons, writers cannot be starved
/// by readers, and the uncontended paths are a single compare-and-swap.
pub struct SharedLock<T: ?Sized> {
    word: AtomicU64,
    wait: Mutex<Waiters>,
    reader_gate: Condvar,
    writer_gate: Condvar,
    drain_gate: Condvar,
    max_waiters: u16,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SharedLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedLock<T> {}

impl<T> SharedLock<T> {
    /// Create a lock protecting `value`, with the default waiter capacity.
    pub fn new(value: T) -> Self {
        Self::with_max_waiters(value, u16::MAX)
    }

    /// Create a lock with a custom bound on simultaneously queued waiters
    /// per class.
    ///
    /// Exceeding the bound is treated as a fatal invariant violation and
    /// panics: a workload queuing that many threads on a single lock is
    /// broken by design, not unlucky.
    pub fn with_max_waiters(value: T, max_waiters: u16) -> Self {
        SharedLock {
            word: AtomicU64::new(0),
            wait: Mutex::new(Waiters::default()),
            reader_gate: Condvar::new(),
            writer_gate: Condvar::new(),
            drain_gate: Condvar::new(),
            max_waiters,
            data: UnsafeCell::new(value),
        }
    }

    /// Consume the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedLock<T> {
    /// Acquire a read lease, blocking while a writer holds or awaits the
    /// lock.
    pub fn read(&self) -> SharedReadGuard<'_, T> {
        if !self.try_acquire_shared() {
            self.lock_shared_slow();
        }
        SharedReadGuard { lock: self }
    }

    /// Acquire exclusive ownership, blocking until all readers drain.
    pub fn write(&self) -> SharedWriteGuard<'_, T> {
        // Fast path: fully idle to writer-held in one CAS.
        if self
            .word
            .compare_exchange(0, WRITER_BIT, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.lock_slow();
        }
        SharedWriteGuard { lock: self }
    }

    /// Single CAS attempt at a read lease; never blocks.
    pub fn try_read(&self) -> Option<SharedReadGuard<'_, T>> {
        let w = LockWord(self.word.load(Ordering::SeqCst));
        if !w.can_acquire_shared() {
            return None;
        }
        self.word
            .compare_exchange(
                w.0,
                w.acquire_shared().0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()
            .map(|_| SharedReadGuard { lock: self })
    }

    /// Single CAS attempt at exclusive ownership; never blocks.
    pub fn try_write(&self) -> Option<SharedWriteGuard<'_, T>> {
        self.word
            .compare_exchange(0, WRITER_BIT, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SharedWriteGuard { lock: self })
    }

    /// Snapshot: true while any reader or writer holds the lock.
    pub fn is_locked(&self) -> bool {
        let w = LockWord(self.word.load(Ordering::SeqCst));
        w.writer_held() || w.readers() > 0
    }

    /// Mutable access without locking; the exclusive borrow is proof of
    /// exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn try_acquire_shared(&self) -> bool {
        update(&self.word, |w| {
            if w.can_acquire_shared() {
                Some(w.acquire_shared())
            } else {
                None
            }
        })
        .is_ok()
    }

    #[cold]
    fn lock_shared_slow(&self) {
        let mut wait = self.wait.lock().unwrap();
        if !wait.readers.announce(self.max_waiters) {
            error!(
                sl!(),
                "waiting-reader counter saturated at {}", self.max_waiters
            );
            panic!("SharedLock waiting-reader counter overflow");
        }
        let _ = update(&self.word, |w| Some(w.with_readers_queued(true)));
        loop {
            if self.try_acquire_shared() {
                break;
            }
            wait = self.reader_gate.wait(wait).unwrap();
        }
        if wait.readers.deregister() {
            // Last queued reader out: clear the flag eagerly so the fast
            // path stays branch-free for the next arrivals.
            let _ = update(&self.word, |w| Some(w.with_readers_queued(false)));
        }
    }

    #[cold]
    fn lock_slow(&self) {
        let mut wait = self.wait.lock().unwrap();
        if !wait.writers.announce(self.max_waiters) {
            error!(
                sl!(),
                "waiting-writer counter saturated at {}", self.max_waiters
            );
            panic!("SharedLock waiting-writer counter overflow");
        }
        let _ = update(&self.word, |w| Some(w.with_writers_queued(true)));
        // Claim the writer bit: mutual exclusion among queued writers.
        loop {
            let claimed = update(&self.word, |w| {
                if w.writer_held() {
                    None
                } else {
                    Some(w.acquire_writer())
                }
            });
            if claimed.is_ok() {
                break;
            }
            wait = self.writer_gate.wait(wait).unwrap();
        }
        // Wait for in-flight readers to finish.
        while LockWord(self.word.load(Ordering::SeqCst)).readers() > 0 {
            wait = self.drain_gate.wait(wait).unwrap();
        }
        if wait.writers.deregister() {
            let _ = update(&self.word, |w| Some(w.with_writers_queued(false)));
        }
    }

    fn unlock_shared(&self) {
        let prev = update(&self.word, |w| {
            if w.readers() > 0 {
                Some(w.release_shared())
            } else {
                None
            }
        })
        .unwrap_or_else(|_| panic!("SharedLock::unlock_shared without a read lease"));
        let now = prev.release_shared();
        if now.readers() == 0 && now.writers_queued() {
            // Last reader out with a writer parked on the drain gate.
            let _wait = self.wait.lock().unwrap();
            self.drain_gate.notify_one();
        } else if now.readers_queued() && prev.readers() == READERS_MASK {
            // Reader count was saturated; one slot just freed up.
            let _wait = self.wait.lock().unwrap();
            self.reader_gate.notify_one();
        }
    }

    fn unlock(&self) {
        update(&self.word, |w| {
            if w.writer_held() {
                Some(w.release_writer())
            } else {
                None
            }
        })
        .unwrap_or_else(|_| panic!("SharedLock::unlock without write ownership"));
        let wait = self.wait.lock().unwrap();
        if wait.writers.count() > 0 {
            self.writer_gate.notify_one();
        } else if wait.readers.count() > 0 {
            self.reader_gate.notify_all();
        }
    }
}

impl<T: Default> Default for SharedLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_struct("SharedLock").field("data", &&*guard).finish(),
            None => f.debug_struct("SharedLock").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII read lease; dropping it releases the shared lock.
pub struct SharedReadGuard<'a, T: ?Sized> {
    lock: &'a SharedLock<T>,
}

impl<T: ?Sized> Deref for SharedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// RAII exclusive lease; dropping it releases the lock and wakes waiters.
pub struct SharedWriteGuard<'a, T: ?Sized> {
    lock: &'a SharedLock<T>,
}

impl<T: ?Sized> Deref for SharedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_write_basic() {
        let lock = SharedLock::new(7u32);
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!((*a, *b), (7, 7));
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        *lock.write() = 8;
        assert_eq!(*lock.read(), 8);
        assert_eq!(lock.into_inner(), 8);
    }

    #[test]
    fn try_variants_respect_holders() {
        let lock = SharedLock::new(());
        let r = lock.read();
        assert!(lock.try_read().is_some());
        assert!(lock.try_write().is_none());
        drop(r);

        let w = lock.write();
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(w);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn get_mut_without_locking() {
        let mut lock = SharedLock::new(1u32);
        *lock.get_mut() += 1;
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(SharedLock::new(0u64));
        let in_write = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let in_write = in_write.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.read();
                    assert!(!in_write.load(Ordering::SeqCst));
                }
            }));
        }
        for _ in 0..2 {
            let lock = lock.clone();
            let in_write = in_write.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let mut g = lock.write();
                    in_write.store(true, Ordering::SeqCst);
                    *g += 1;
                    in_write.store(false, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 1000);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let lock = Arc::new(SharedLock::new(()));
        let reader = lock.read();

        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                let _g = lock.write();
            })
        };
        // Give the writer time to announce itself.
        thread::sleep(Duration::from_millis(50));
        assert!(lock.try_read().is_none());

        drop(reader);
        writer.join().unwrap();
        assert!(lock.try_read().is_some());
    }
}
