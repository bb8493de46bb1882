//! Clock-PRO eviction, one shard's worth.
//!
//! Entries live on a circular ring and carry one of three states:
//!
//! - **hot**: resident, recently useful.
//! - **cold**: resident, on probation.
//! - **test**: non-resident ghost; only the key remains, so a quick
//!   re-reference can be detected and the cold budget adapted.
//!
//! Three hands sweep the ring. The cold hand evicts unreferenced cold
//! pages (demoting them to test) and promotes referenced ones to hot. The
//! hot hand clears reference bits and demotes idle hot pages back to
//! cold. The test hand retires ghosts that were never re-referenced and
//! shrinks the cold budget as it does. A test-entry hit grows the cold
//! budget and re-admits the page directly as hot.
//!
//! A hit only sets the reference bit; the ring is untouched, so lookups
//! do no list surgery under the shard lock.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

/// Lower bound on the adaptive cold budget, as a divisor of capacity.
const MIN_COLD_DIV: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Hot,
    Cold,
    Test,
}

struct Slot<K, V> {
    key: K,
    value: Option<V>,
    charge: usize,
    status: Status,
    referenced: bool,
    prev: usize,
    next: usize,
}

pub struct ClockShard<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
    head: usize,
    hand_hot: usize,
    hand_cold: usize,
    hand_test: usize,
    capacity: usize,
    cold_target: usize,
    used: usize,
    used_cold: usize,
    resident_count: usize,
    test_count: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> ClockShard<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            hand_hot: NIL,
            hand_cold: NIL,
            hand_test: NIL,
            capacity,
            cold_target: (capacity / MIN_COLD_DIV).max(1),
            used: 0,
            used_cold: 0,
            resident_count: 0,
            test_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn resident_count(&self) -> usize {
        self.resident_count
    }

    /// Looks up a resident entry, setting its reference bit on a hit.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let idx = *self.map.get(key)?;
        let slot = &mut self.slots[idx];
        let value = slot.value.clone()?;
        slot.referenced = true;
        Some(value)
    }

    /// Inserts or replaces an entry with the given resident charge.
    pub fn insert(&mut self, key: K, value: V, charge: usize) {
        let charge = charge.max(1);
        if let Some(&idx) = self.map.get(&key) {
            match self.slots[idx].status {
                Status::Hot | Status::Cold => {
                    let old = self.slots[idx].charge;
                    self.used = self.used - old + charge;
                    if self.slots[idx].status == Status::Cold {
                        self.used_cold = self.used_cold - old + charge;
                    }
                    let slot = &mut self.slots[idx];
                    slot.value = Some(value);
                    slot.charge = charge;
                    slot.referenced = true;
                }
                Status::Test => {
                    // A ghost hit: cold pages are being evicted too early,
                    // so widen the cold budget and re-admit as hot.
                    self.cold_target = (self.cold_target + charge).min(self.capacity);
                    let slot = &mut self.slots[idx];
                    slot.value = Some(value);
                    slot.charge = charge;
                    slot.status = Status::Hot;
                    slot.referenced = false;
                    self.test_count -= 1;
                    self.resident_count += 1;
                    self.used += charge;
                }
            }
        } else {
            let idx = self.alloc_slot(key.clone(), value, charge);
            self.ring_attach(idx);
            self.map.insert(key, idx);
            self.resident_count += 1;
            self.used += charge;
            self.used_cold += charge;
        }
        self.evict_to_capacity();
        while self.test_count > self.resident_count {
            self.run_hand_test();
        }
    }

    /// Removes an entry regardless of status, returning a resident value.
    pub fn erase(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.remove_slot(idx)
    }

    /// Removes every entry whose key matches the predicate. Used when a
    /// file is deleted and its blocks must leave the cache.
    pub fn erase_matching(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let victims: Vec<K> = self.map.keys().filter(|k| pred(k)).cloned().collect();
        let count = victims.len();
        for key in victims {
            self.erase(&key);
        }
        count
    }

    fn alloc_slot(&mut self, key: K, value: V, charge: usize) -> usize {
        let slot = Slot {
            key,
            value: Some(value),
            charge,
            status: Status::Cold,
            referenced: false,
            prev: NIL,
            next: NIL,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        }
    }

    /// Links a new page into the ring just behind the hot hand, which is
    /// where the cold hand will reach it last.
    fn ring_attach(&mut self, idx: usize) {
        if self.head == NIL {
            self.slots[idx].prev = idx;
            self.slots[idx].next = idx;
            self.head = idx;
            self.hand_hot = idx;
            self.hand_cold = idx;
            self.hand_test = idx;
            return;
        }
        let at = if self.hand_hot != NIL { self.hand_hot } else { self.head };
        let prev = self.slots[at].prev;
        self.slots[idx].prev = prev;
        self.slots[idx].next = at;
        self.slots[prev].next = idx;
        self.slots[at].prev = idx;
    }

    fn ring_detach(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if next == idx {
            self.head = NIL;
            self.hand_hot = NIL;
            self.hand_cold = NIL;
            self.hand_test = NIL;
            return;
        }
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
        if self.head == idx {
            self.head = next;
        }
        if self.hand_hot == idx {
            self.hand_hot = next;
        }
        if self.hand_cold == idx {
            self.hand_cold = next;
        }
        if self.hand_test == idx {
            self.hand_test = next;
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Option<V> {
        match self.slots[idx].status {
            Status::Hot => {
                self.used -= self.slots[idx].charge;
                self.resident_count -= 1;
            }
            Status::Cold => {
                self.used -= self.slots[idx].charge;
                self.used_cold -= self.slots[idx].charge;
                self.resident_count -= 1;
            }
            Status::Test => self.test_count -= 1,
        }
        self.ring_detach(idx);
        self.free.push(idx);
        self.slots[idx].value.take()
    }

    fn evict_to_capacity(&mut self) {
        while self.used > self.capacity && self.resident_count > 0 {
            if self.used_cold == 0 {
                self.run_hand_hot();
                continue;
            }
            self.run_hand_cold();
        }
    }

    fn hot_used(&self) -> usize {
        self.used - self.used_cold
    }

    fn advance(&self, idx: usize) -> usize {
        self.slots[idx].next
    }

    /// Moves the cold hand to the next cold page and acts on it:
    /// referenced pages are promoted to hot, idle ones demoted to test.
    fn run_hand_cold(&mut self) {
        debug_assert!(self.used_cold > 0);
        let mut idx = self.hand_cold;
        while self.slots[idx].status != Status::Cold {
            idx = self.advance(idx);
        }
        let next = self.advance(idx);
        if self.slots[idx].referenced {
            let slot = &mut self.slots[idx];
            slot.referenced = false;
            slot.status = Status::Hot;
            self.used_cold -= self.slots[idx].charge;
            let hot_budget = self.capacity.saturating_sub(self.cold_target).max(1);
            while self.hot_used() > hot_budget && self.used_cold < self.used {
                if !self.run_hand_hot() {
                    break;
                }
            }
        } else {
            let slot = &mut self.slots[idx];
            slot.value = None;
            slot.status = Status::Test;
            let charge = slot.charge;
            self.used -= charge;
            self.used_cold -= charge;
            self.resident_count -= 1;
            self.test_count += 1;
        }
        self.hand_cold = next;
    }

    /// Demotes one idle hot page to cold, clearing reference bits on the
    /// way. Returns false if no hot page exists.
    fn run_hand_hot(&mut self) -> bool {
        if self.hot_used() == 0 {
            return false;
        }
        let mut idx = self.hand_hot;
        // Two sweeps bound the walk: the first may only clear bits.
        for _ in 0..2 * self.map.len() {
            if self.slots[idx].status == Status::Hot {
                if self.slots[idx].referenced {
                    self.slots[idx].referenced = false;
                } else {
                    self.slots[idx].status = Status::Cold;
                    self.used_cold += self.slots[idx].charge;
                    self.hand_hot = self.advance(idx);
                    return true;
                }
            }
            idx = self.advance(idx);
        }
        self.hand_hot = idx;
        false
    }

    /// Retires one ghost entry and shrinks the cold budget.
    fn run_hand_test(&mut self) {
        if self.test_count == 0 {
            return;
        }
        let mut idx = self.hand_test;
        while self.slots[idx].status != Status::Test {
            idx = self.advance(idx);
        }
        let charge = self.slots[idx].charge;
        let floor = (self.capacity / MIN_COLD_DIV).max(1);
        self.cold_target = self.cold_target.saturating_sub(charge).max(floor);
        let key = self.slots[idx].key.clone();
        self.map.remove(&key);
        self.remove_slot(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(cap: usize) -> ClockShard<u64, u64> {
        ClockShard::new(cap)
    }

    #[test]
    fn test_insert_and_get() {
        let mut s = shard(10);
        s.insert(1, 100, 1);
        s.insert(2, 200, 1);
        assert_eq!(s.get(&1), Some(100));
        assert_eq!(s.get(&2), Some(200));
        assert_eq!(s.get(&3), None);
        assert_eq!(s.resident_count(), 2);
    }

    #[test]
    fn test_eviction_under_pressure() {
        let mut s = shard(4);
        for i in 0..16 {
            s.insert(i, i, 1);
        }
        assert!(s.used() <= 4, "used {} exceeds capacity", s.used());
        assert!(s.resident_count() <= 4);
        // The most recent inserts should still be resident.
        assert_eq!(s.get(&15), Some(15));
    }

    #[test]
    fn test_hit_survives_sweep() {
        let mut s = shard(4);
        for i in 0..4 {
            s.insert(i, i, 1);
        }
        // Reference key 0 so the cold hand promotes instead of evicting.
        assert_eq!(s.get(&0), Some(0));
        for i in 4..7 {
            s.insert(i, i, 1);
        }
        assert_eq!(s.get(&0), Some(0), "referenced entry was evicted");
    }

    #[test]
    fn test_ghost_readmission_is_hot() {
        let mut s = shard(2);
        s.insert(1, 1, 1);
        s.insert(2, 2, 1);
        s.insert(3, 3, 1); // pushes key 1 out to test
        assert_eq!(s.get(&1), None);
        let cold_before = s.cold_target;
        s.insert(1, 1, 1); // ghost hit: re-admitted, budget adapted
        assert!(s.cold_target >= cold_before);
        assert_eq!(s.get(&1), Some(1));
    }

    #[test]
    fn test_erase() {
        let mut s = shard(4);
        s.insert(1, 10, 1);
        assert_eq!(s.erase(&1), Some(10));
        assert_eq!(s.get(&1), None);
        assert_eq!(s.erase(&1), None);
        assert_eq!(s.used(), 0);
    }

    #[test]
    fn test_erase_matching() {
        let mut s = shard(8);
        for i in 0..8 {
            s.insert(i, i, 1);
        }
        let removed = s.erase_matching(|k| k % 2 == 0);
        assert_eq!(removed, 4);
        assert_eq!(s.get(&2), None);
        assert_eq!(s.get(&3), Some(3));
    }

    #[test]
    fn test_oversize_entry_does_not_stick() {
        let mut s = shard(4);
        s.insert(1, 1, 100);
        // The oversize page cycles straight through cold and out.
        assert!(s.used() <= 4);
    }

    #[test]
    fn test_charge_replacement() {
        let mut s = shard(10);
        s.insert(1, 1, 2);
        s.insert(1, 2, 5);
        assert_eq!(s.used(), 5);
        assert_eq!(s.get(&1), Some(2));
    }
}
