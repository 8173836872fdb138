//! Bounded-concurrency locking over half-open stripe ranges.
//!
//! A fixed pool of `max_threads` lock slots bounds the number of in-flight
//! operations; a request whose range overlaps a granted lock blocks until the
//! holder releases it. The slot index handed back by [`RangeLocker::lock`]
//! doubles as the caller's thread id for indexing per-thread scratch buffers.

use std::sync::{Condvar, Mutex, MutexGuard};


/// Slot life cycle: `Free -> Locked -> UnlockedWaiting -> Free`.
///
/// A slot skips `UnlockedWaiting` when nobody is blocked on it. The invariant
/// maintained throughout: a slot returns to the free stack exactly once, by
/// the unlocker when the waiter count is zero, otherwise by the last waiter
/// to observe `UnlockedWaiting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Locked,
    UnlockedWaiting,
}

#[derive(Debug)]
struct Slot {
    low: u64,
    high: u64,
    state: SlotState,
    waiters: u32,
}

#[derive(Debug)]
struct LockerState {
    slots: Vec<Slot>,
    /// Stack of free slot indices.
    free: Vec<usize>,
    /// Indices of slots currently granted (state `Locked`).
    active: Vec<usize>,
}

/// `RangeLocker` serializes overlapping stripe-range accesses while letting
/// disjoint ones proceed in parallel.
///
/// No fairness is promised: a wide range can starve under a steady stream of
/// narrow ones. There are no timeouts and no cancellation; operations run to
/// completion.
pub struct RangeLocker {
    state: Mutex<LockerState>,
    /// Signalled when a slot returns to the free stack.
    pool_free: Condvar,
    /// One condition per slot, signalled on unlock.
    slot_conds: Vec<Condvar>,
}

impl RangeLocker {
    /// Create a locker admitting at most `max_threads` concurrent holders.
    ///
    /// # Panics
    /// Panics if `max_threads` is zero.
    #[must_use]
    pub fn new(max_threads: usize) -> Self {
        assert!(max_threads > 0, "locker needs at least one slot");
        let slots = (0..max_threads)
            .map(|_| Slot {
                low: 0,
                high: 0,
                state: SlotState::Free,
                waiters: 0,
            })
            .collect();
        Self {
            state: Mutex::new(LockerState {
                slots,
                free: (0..max_threads).rev().collect(),
                active: Vec::with_capacity(max_threads),
            }),
            pool_free: Condvar::new(),
            slot_conds: (0..max_threads).map(|_| Condvar::new()).collect(),
        }
    }

    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.slot_conds.len()
    }

    /// Acquire a lock on `[low, high)`, blocking while any granted lock
    /// overlaps it or the slot pool is exhausted.
    ///
    /// # Returns
    /// The slot index, in `[0, max_threads)`, to pass to [`Self::unlock`].
    pub fn lock(&self, low: u64, high: u64) -> usize {
        let mut st = self.state.lock().unwrap();
        loop {
            while st.free.is_empty() {
                st = self.pool_free.wait(st).unwrap();
            }
            // Half-open overlap test against every granted lock. After a
            // wait the whole list must be re-inspected: the wake-up only
            // says one conflicting holder went away.
            let conflict = st.active.iter().copied().find(|&i| {
                let s = &st.slots[i];
                s.state == SlotState::Locked && high > s.low && low < s.high
            });
            let Some(i) = conflict else { break };
            st = self.wait_for_unlock(st, i);
        }

        let id = st.free.pop().expect("free slot available");
        let slot = &mut st.slots[id];
        slot.low = low;
        slot.high = high;
        slot.state = SlotState::Locked;
        slot.waiters = 0;
        st.active.push(id);
        id
    }

    /// Release a granted lock and wake every thread blocked on it.
    ///
    /// # Panics
    /// Panics if `id` does not refer to a granted lock.
    pub fn unlock(&self, id: usize) {
        let mut st = self.state.lock().unwrap();
        assert_eq!(
            st.slots[id].state,
            SlotState::Locked,
            "unlock of a lock that is not held"
        );
        let pos = st
            .active
            .iter()
            .position(|&a| a == id)
            .expect("granted lock is in the active list");
        st.active.swap_remove(pos);

        if st.slots[id].waiters == 0 {
            self.release(&mut st, id);
        } else {
            st.slots[id].state = SlotState::UnlockedWaiting;
            self.slot_conds[id].notify_all();
        }
    }

    /// Block until slot `i` leaves the `Locked` state; the last waiter to
    /// drain puts the slot back on the free stack.
    fn wait_for_unlock<'a>(
        &'a self,
        mut st: MutexGuard<'a, LockerState>,
        i: usize,
    ) -> MutexGuard<'a, LockerState> {
        st.slots[i].waiters += 1;
        while st.slots[i].state != SlotState::UnlockedWaiting {
            st = self.slot_conds[i].wait(st).unwrap();
        }
        st.slots[i].waiters -= 1;
        if st.slots[i].waiters == 0 {
            self.release(&mut st, i);
        }
        st
    }

    fn release(&self, st: &mut LockerState, id: usize) {
        st.slots[id].state = SlotState::Free;
        st.free.push(id);
        self.pool_free.notify_one();
    }
}

/// RAII guard pairing a granted range lock with its release.
pub struct RangeGuard<'a> {
    locker: &'a RangeLocker,
    id: usize,
}

impl<'a> RangeGuard<'a> {
    /// Lock `[low, high)` on `locker`, releasing on drop.
    #[must_use]
    pub fn acquire(locker: &'a RangeLocker, low: u64, high: u64) -> Self {
        let id = locker.lock(low, high);
        Self { locker, id }
    }

    /// The slot index, usable as a thread id for per-thread scratch.
    #[must_use]
    pub fn thread_id(&self) -> usize {
        self.id
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        self.locker.unlock(self.id);
    }
}
