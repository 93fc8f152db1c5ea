//! Lock-free open-addressing hashmap keyed by FST state.
//!
//! Used once per frame to group the main queue's tokens by next state:
//! value is `(count, min cost, argmin queue index)`, accumulated with one
//! `fetch_add` and one `fetch_min` per token. Linear probing; the table is
//! sized at twice the main-queue capacity so the load factor stays at or
//! below one half and probes terminate quickly.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering::Relaxed};

use crate::cost::{pack_cost_and_index, unpack_cost_and_index, IntCost};

const NO_KEY: i32 = -1;

#[derive(Debug)]
pub struct StateHashmap {
    keys: Vec<AtomicI32>,
    counts: Vec<AtomicI32>,
    min_and_argmin: Vec<AtomicU64>,
    extras_offsets: Vec<AtomicI32>,
    fill_idx: Vec<AtomicI32>,
    /// Slots claimed this frame, so teardown touches only what was used.
    used_slots: Vec<AtomicI32>,
    n_used: AtomicI32,
    mask: usize,
}

impl StateHashmap {
    /// `min_capacity` is the largest number of distinct keys a frame can
    /// insert; the table is sized to at least twice that, rounded up to a
    /// power of two.
    pub fn new(min_capacity: usize) -> Self {
        let capacity = (min_capacity.max(1) * 2).next_power_of_two();
        Self {
            keys: (0..capacity).map(|_| AtomicI32::new(NO_KEY)).collect(),
            counts: (0..capacity).map(|_| AtomicI32::new(0)).collect(),
            min_and_argmin: (0..capacity).map(|_| AtomicU64::new(u64::MAX)).collect(),
            extras_offsets: (0..capacity).map(|_| AtomicI32::new(-1)).collect(),
            fill_idx: (0..capacity).map(|_| AtomicI32::new(0)).collect(),
            used_slots: (0..capacity).map(|_| AtomicI32::new(0)).collect(),
            n_used: AtomicI32::new(0),
            mask: capacity - 1,
        }
    }

    #[inline]
    fn hash(&self, state: i32) -> usize {
        (state as u32).wrapping_mul(0x9e37_79b1) as usize & self.mask
    }

    fn slot_for_insert(&self, state: i32) -> usize {
        let mut i = self.hash(state);
        loop {
            let key = self.keys[i].load(Relaxed);
            if key == state {
                return i;
            }
            if key == NO_KEY {
                match self.keys[i].compare_exchange(NO_KEY, state, Relaxed, Relaxed) {
                    Ok(_) => {
                        let j = self.n_used.fetch_add(1, Relaxed);
                        self.used_slots[j as usize].store(i as i32, Relaxed);
                        return i;
                    }
                    Err(existing) if existing == state => return i,
                    Err(_) => {}
                }
            }
            i = (i + 1) & self.mask;
        }
    }

    /// Accumulates one token into its state's group and returns the slot.
    pub fn insert(&self, state: i32, int_cost: IntCost, queue_idx: i32) -> usize {
        let slot = self.slot_for_insert(state);
        self.counts[slot].fetch_add(1, Relaxed);
        self.min_and_argmin[slot].fetch_min(pack_cost_and_index(int_cost, queue_idx), Relaxed);
        slot
    }

    /// Slot holding `state`; the key must have been inserted this frame.
    pub fn find(&self, state: i32) -> usize {
        let mut i = self.hash(state);
        loop {
            debug_assert_ne!(self.keys[i].load(Relaxed), NO_KEY, "lookup of absent state");
            if self.keys[i].load(Relaxed) == state {
                return i;
            }
            i = (i + 1) & self.mask;
        }
    }

    pub fn count(&self, slot: usize) -> i32 {
        self.counts[slot].load(Relaxed)
    }

    /// `(min int cost, queue index of the minimum)`; ties resolve to the
    /// lowest queue index by construction of the packed order.
    pub fn min_and_argmin(&self, slot: usize) -> (IntCost, i32) {
        unpack_cost_and_index(self.min_and_argmin[slot].load(Relaxed))
    }

    pub fn extras_offset(&self, slot: usize) -> i32 {
        self.extras_offsets[slot].load(Relaxed)
    }

    pub fn set_extras_offset(&self, slot: usize, offset: i32) {
        self.extras_offsets[slot].store(offset, Relaxed);
    }

    /// Hands out consecutive local indices within a group.
    pub fn next_fill_index(&self, slot: usize) -> i32 {
        self.fill_idx[slot].fetch_add(1, Relaxed)
    }

    /// Returns every slot claimed this frame to its idle state.
    pub fn reset(&self) {
        let n = self.n_used.load(Relaxed);
        for j in 0..n {
            let slot = self.used_slots[j as usize].load(Relaxed) as usize;
            self.counts[slot].store(0, Relaxed);
            self.min_and_argmin[slot].store(u64::MAX, Relaxed);
            self.extras_offsets[slot].store(-1, Relaxed);
            self.fill_idx[slot].store(0, Relaxed);
            self.keys[slot].store(NO_KEY, Relaxed);
        }
        self.n_used.store(0, Relaxed);
    }
}
