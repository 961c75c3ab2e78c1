// Copyright (c) 2025 The emu-sync Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Fixed-capacity concurrent FIFO for ordered work hand-off.
//!
//! The head position, occupancy count and two single-bit section locks
//! (one for the in-flight push, one for the in-flight pop) are packed
//! into a single atomic word, so one push and one pop can run
//! concurrently on disjoint slots while the word serializes each class.
//! Slot storage is allocated once for the lifetime of the queue.
//!
//! Blocking `push`/`pop`/`peek` first spin briefly on the word, then park
//! on a condition variable with a bounded poll interval so the caller's
//! abort predicate is re-evaluated periodically; an emulator shutdown
//! never needs a dedicated wakeup signal to drain waiters. `process` and
//! `clear` claim both section locks for full exclusivity over the live
//! window.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Canceled, PushCanceled};
use crate::sl;

/// Width of the head-position and occupancy-count fields.
const INDEX_BITS: u32 = 24;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const COUNT_SHIFT: u32 = INDEX_BITS;
const PUSH_LOCK_BIT: u64 = 1 << 62;
const POP_LOCK_BIT: u64 = 1 << 63;

/// Largest usable capacity: the count field must be able to hold `N`.
pub const MAX_CAPACITY: usize = INDEX_MASK as usize;

/// CAS attempts on the sync word before a blocking caller parks.
const SPIN_ATTEMPTS: u32 = 64;
/// Default bound on one parked wait, after which the abort predicate is
/// re-checked even without a wakeup.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Packed snapshot of the queue sync word.
#[derive(Clone, Copy, PartialEq, Eq)]
struct QueueWord(u64);

impl QueueWord {
    /// Index of the oldest occupied slot.
    fn pos(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// Number of occupied slots.
    fn count(self) -> usize {
        ((self.0 >> COUNT_SHIFT) & INDEX_MASK) as usize
    }

    fn push_locked(self) -> bool {
        self.0 & PUSH_LOCK_BIT != 0
    }

    fn pop_locked(self) -> bool {
        self.0 & POP_LOCK_BIT != 0
    }

    fn can_begin_push(self, capacity: usize) -> bool {
        !self.push_locked() && self.count() < capacity
    }

    fn begin_push(self) -> Self {
        QueueWord(self.0 | PUSH_LOCK_BIT)
    }

    /// Release the push section and make the written slot visible.
    fn end_push(self) -> Self {
        QueueWord((self.0 & !PUSH_LOCK_BIT) + (1 << COUNT_SHIFT))
    }

    fn can_begin_pop(self, least: usize) -> bool {
        !self.pop_locked() && self.count() > least
    }

    fn begin_pop(self) -> Self {
        QueueWord(self.0 | POP_LOCK_BIT)
    }

    /// Release the pop section, advancing the head past the taken slot.
    fn end_pop(self, capacity: usize) -> Self {
        let pos = ((self.pos() + 1) % capacity) as u64;
        let without_head = self.0 & !(POP_LOCK_BIT | INDEX_MASK);
        QueueWord((without_head | pos) - (1 << COUNT_SHIFT))
    }

    /// Release the pop section without consuming anything.
    fn end_peek(self) -> Self {
        QueueWord(self.0 & !POP_LOCK_BIT)
    }

    fn can_begin_exclusive(self) -> bool {
        !self.push_locked() && !self.pop_locked()
    }

    fn begin_exclusive(self) -> Self {
        QueueWord(self.0 | PUSH_LOCK_BIT | POP_LOCK_BIT)
    }

    fn end_exclusive(self) -> Self {
        QueueWord(self.0 & !(PUSH_LOCK_BIT | POP_LOCK_BIT))
    }

    fn with_empty_window(self) -> Self {
        QueueWord(self.0 & !(INDEX_MASK << COUNT_SHIFT))
    }
}

impl fmt::Debug for QueueWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWord")
            .field("pos", &self.pos())
            .field("count", &self.count())
            .field("push_locked", &self.push_locked())
            .field("pop_locked", &self.pop_locked())
            .finish()
    }
}

/// Read-compute-CAS retry loop over the sync word, returning the previous
/// word on success.
fn update<F>(word: &AtomicU64, transition: F) -> Result<QueueWord, QueueWord>
where
    F: FnMut(QueueWord) -> Option<QueueWord>,
{
    let mut transition = transition;
    word.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
        transition(QueueWord(w)).map(|n| n.0)
    })
    .map(QueueWord)
    .map_err(QueueWord)
}

/// Fixed-capacity concurrent FIFO with blocking, abortable hand-off.
pub struct BoundedQueue<T> {
    word: AtomicU64,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    poll_interval: Duration,
    gate: Mutex<()>,
    readable: Condvar,
    writable: Condvar,
}

unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Create a queue of fixed `capacity`, with the default poll interval.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero or exceeds [`MAX_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        Self::with_poll_interval(capacity, DEFAULT_POLL_INTERVAL)
    }

    /// Create a queue with a custom bound on one parked wait; shorter
    /// intervals re-check the abort predicate more eagerly at the price
    /// of more spurious wakeups.
    pub fn with_poll_interval(capacity: usize, poll_interval: Duration) -> Self {
        assert!(
            capacity > 0 && capacity <= MAX_CAPACITY,
            "capacity {} outside 1..={}",
            capacity,
            MAX_CAPACITY
        );
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        BoundedQueue {
            word: AtomicU64::new(0),
            slots: slots.into_boxed_slice(),
            poll_interval,
            gate: Mutex::new(()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Fixed number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Snapshot of the number of occupied slots.
    pub fn len(&self) -> usize {
        QueueWord(self.word.load(Ordering::SeqCst)).count()
    }

    /// Snapshot: no occupied slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot: every slot occupied.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Append `value`, blocking while the queue is full.
    ///
    /// `should_abort` is re-evaluated on every wakeup; when it returns
    /// true the wait is abandoned and the value handed back.
    pub fn push<F>(&self, value: T, mut should_abort: F) -> Result<(), PushCanceled<T>>
    where
        F: FnMut() -> bool,
    {
        let capacity = self.capacity();
        let mut parked = false;
        loop {
            for _ in 0..SPIN_ATTEMPTS {
                if let Ok(claimed) = update(&self.word, |w| {
                    if w.can_begin_push(capacity) {
                        Some(w.begin_push())
                    } else {
                        None
                    }
                }) {
                    let slot = (claimed.pos() + claimed.count()) % capacity;
                    unsafe { self.slots[slot].get().write(MaybeUninit::new(value)) };
                    let _ = update(&self.word, |w| Some(w.end_push()));
                    self.notify(&self.readable);
                    return Ok(());
                }
                std::hint::spin_loop();
            }
            if should_abort() {
                if parked {
                    debug!(sl!(), "push wait canceled");
                }
                return Err(PushCanceled(value));
            }
            self.park(&self.writable);
            parked = true;
        }
    }

    /// Take the oldest item, blocking while the queue is empty.
    pub fn pop<F>(&self, mut should_abort: F) -> Result<T, Canceled>
    where
        F: FnMut() -> bool,
    {
        let capacity = self.capacity();
        let mut parked = false;
        loop {
            for _ in 0..SPIN_ATTEMPTS {
                if let Ok(claimed) = update(&self.word, |w| {
                    if w.can_begin_pop(0) {
                        Some(w.begin_pop())
                    } else {
                        None
                    }
                }) {
                    let slot = claimed.pos();
                    let value = unsafe { self.slots[slot].get().read().assume_init() };
                    let _ = update(&self.word, |w| Some(w.end_pop(capacity)));
                    self.notify(&self.writable);
                    return Ok(value);
                }
                std::hint::spin_loop();
            }
            if should_abort() {
                if parked {
                    debug!(sl!(), "pop wait canceled");
                }
                return Err(Canceled);
            }
            self.park(&self.readable);
            parked = true;
        }
    }

    /// Copy out the item `offset` positions behind the head without
    /// consuming it, blocking until that many items are pending.
    pub fn peek<F>(&self, offset: usize, mut should_abort: F) -> Result<T, Canceled>
    where
        T: Clone,
        F: FnMut() -> bool,
    {
        let capacity = self.capacity();
        let mut parked = false;
        loop {
            for _ in 0..SPIN_ATTEMPTS {
                if let Ok(claimed) = update(&self.word, |w| {
                    if w.can_begin_pop(offset) {
                        Some(w.begin_pop())
                    } else {
                        None
                    }
                }) {
                    let slot = (claimed.pos() + offset) % capacity;
                    // Holding the pop section keeps the slot occupied and
                    // stable; a concurrent push only touches free slots.
                    let value = unsafe { (*self.slots[slot].get()).assume_init_ref().clone() };
                    let _ = update(&self.word, |w| Some(w.end_peek()));
                    return Ok(value);
                }
                std::hint::spin_loop();
            }
            if should_abort() {
                if parked {
                    debug!(sl!(), "peek wait canceled");
                }
                return Err(Canceled);
            }
            self.park(&self.readable);
            parked = true;
        }
    }

    /// Single attempt at a push; never parks.
    pub fn try_push(&self, value: T) -> Result<(), PushCanceled<T>> {
        self.push(value, || true)
    }

    /// Single attempt at a pop; never parks.
    pub fn try_pop(&self) -> Option<T> {
        self.pop(|| true).ok()
    }

    /// Single attempt at a peek; never parks.
    pub fn try_peek(&self, offset: usize) -> Option<T>
    where
        T: Clone,
    {
        self.peek(offset, || true).ok()
    }

    /// Run `f` over every pending item in FIFO order, holding both
    /// section locks for full exclusivity.
    pub fn process<F>(&self, mut f: F)
    where
        F: FnMut(&mut T),
    {
        let capacity = self.capacity();
        let claimed = self.begin_exclusive();
        for i in 0..claimed.count() {
            let slot = (claimed.pos() + i) % capacity;
            unsafe { f((*self.slots[slot].get()).assume_init_mut()) };
        }
        let _ = update(&self.word, |w| Some(w.end_exclusive()));
    }

    /// Drop every pending item and reset the queue to empty.
    pub fn clear(&self) {
        let capacity = self.capacity();
        let claimed = self.begin_exclusive();
        for i in 0..claimed.count() {
            let slot = (claimed.pos() + i) % capacity;
            unsafe { self.slots[slot].get().read().assume_init() };
        }
        let _ = update(&self.word, |w| Some(w.end_exclusive().with_empty_window()));
        self.notify_all(&self.writable);
    }

    /// Claim both section locks, spinning out any in-flight push or pop.
    fn begin_exclusive(&self) -> QueueWord {
        loop {
            if let Ok(claimed) = update(&self.word, |w| {
                if w.can_begin_exclusive() {
                    Some(w.begin_exclusive())
                } else {
                    None
                }
            }) {
                return claimed;
            }
            std::hint::spin_loop();
        }
    }

    /// Park on `gate` until notified or the poll interval elapses.
    fn park(&self, which: &Condvar) {
        let guard = self.gate.lock().unwrap();
        let _ = which.wait_timeout(guard, self.poll_interval).unwrap();
    }

    fn notify(&self, which: &Condvar) {
        // Take the gate so a waiter between its last word check and the
        // park cannot miss this wakeup entirely.
        let _guard = self.gate.lock().unwrap();
        which.notify_one();
    }

    fn notify_all(&self, which: &Condvar) {
        let _guard = self.gate.lock().unwrap();
        which.notify_all();
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: drain whatever is still occupied.
        let word = QueueWord(*self.word.get_mut());
        let capacity = self.capacity();
        for i in 0..word.count() {
            let slot = (word.pos() + i) % capacity;
            unsafe { self.slots[slot].get().read().assume_init() };
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = QueueWord(self.word.load(Ordering::SeqCst));
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("len", &word.count())
            .field("pos", &word.pos())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn never() -> bool {
        false
    }

    #[test]
    fn fifo_order_single_thread() {
        crate::test_logging::init();
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            queue.push(i, never).unwrap();
        }
        assert_eq!(queue.len(), 5);
        for i in 0..5 {
            assert_eq!(queue.pop(never).unwrap(), i);
        }
        assert!(queue.is_empty());
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(7)]
    fn wraparound_returns_to_empty(#[case] capacity: usize) {
        crate::test_logging::init();
        let queue = BoundedQueue::new(capacity);
        for round in 0..3 {
            for i in 0..capacity {
                queue.push(round * capacity + i, never).unwrap();
            }
            assert!(queue.is_full());
            assert!(queue.try_push(usize::MAX).is_err());
            for i in 0..capacity {
                assert_eq!(queue.pop(never).unwrap(), round * capacity + i);
            }
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn peek_does_not_consume() {
        crate::test_logging::init();
        let queue = BoundedQueue::new(4);
        queue.push(10, never).unwrap();
        queue.push(20, never).unwrap();
        assert_eq!(queue.peek(0, never).unwrap(), 10);
        assert_eq!(queue.peek(1, never).unwrap(), 20);
        assert!(queue.try_peek(2).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(never).unwrap(), 10);
    }

    #[test]
    fn canceled_waits_leave_state_consistent() {
        crate::test_logging::init();
        let queue = BoundedQueue::new(2);
        assert_eq!(queue.pop(|| true), Err(Canceled));
        queue.push(1, never).unwrap();
        queue.push(2, never).unwrap();
        let rejected = queue.push(3, || true).unwrap_err();
        assert_eq!(rejected.into_inner(), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(never).unwrap(), 1);
    }

    #[test]
    fn process_visits_live_window_in_order() {
        crate::test_logging::init();
        let queue = BoundedQueue::new(4);
        // Wrap the window around the end of the buffer first.
        queue.push(0, never).unwrap();
        queue.push(0, never).unwrap();
        queue.pop(never).unwrap();
        queue.pop(never).unwrap();
        for i in 1..=3 {
            queue.push(i, never).unwrap();
        }
        let mut seen = Vec::new();
        queue.process(|v| {
            seen.push(*v);
            *v += 10;
        });
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(queue.pop(never).unwrap(), 11);
    }

    #[test]
    fn clear_drops_pending_items() {
        crate::test_logging::init();
        let drops = Arc::new(AtomicU64::new(0));
        struct Item(Arc<AtomicU64>);
        impl Drop for Item {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let queue = BoundedQueue::new(4);
        for _ in 0..3 {
            queue.push(Item(drops.clone()), never).unwrap();
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn full_push_blocks_until_slot_frees() {
        crate::test_logging::init();
        let queue = Arc::new(BoundedQueue::new(4));
        for i in 1..=4 {
            queue.push(i, never).unwrap();
        }
        let popped_first = Arc::new(AtomicBool::new(false));

        let consumer = {
            let queue = queue.clone();
            let popped_first = popped_first.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                // Set before popping: the push below can only complete
                // after this pop frees a slot.
                popped_first.store(true, Ordering::SeqCst);
                queue.pop(never).unwrap()
            })
        };
        // Blocks until the consumer frees a slot.
        queue.push(5, never).unwrap();
        assert!(popped_first.load(Ordering::SeqCst));
        assert_eq!(consumer.join().unwrap(), 1);
        for i in 2..=5 {
            assert_eq!(queue.pop(never).unwrap(), i);
        }
    }
}
