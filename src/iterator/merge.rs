//! Heap merge over child iterators.
//!
//! Children are supplied newest source first: the indexed batch (if
//! any), memtables newest to oldest, level-0 tables newest to oldest,
//! then one iterator per lower level. The heap orders by internal key,
//! breaking exact ties toward the newer source.
//!
//! Snapshot visibility is enforced here: records with a sequence number
//! above the captured visible sequence are skipped at the child level,
//! before they can reach the heap. Batch-local records (batch bit set)
//! are always visible, since only their owning iterator can see them.

use std::cmp::Ordering;

use super::InternalIterator;
use crate::error::Result;
use crate::key::{decode_key, is_visible, InternalKeyCmp, SeqNum};

/// Forward probes attempted before a seek falls back to a full re-seek.
const SEEK_USING_NEXT_LIMIT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct MergingIter<'a> {
    children: Vec<Box<dyn InternalIterator + 'a>>,
    cmp: InternalKeyCmp,
    visible: SeqNum,
    /// Child indices with a current entry, heap-ordered with the winner
    /// at the root.
    heap: Vec<usize>,
    direction: Direction,
}

impl<'a> MergingIter<'a> {
    pub fn new(
        children: Vec<Box<dyn InternalIterator + 'a>>,
        cmp: InternalKeyCmp,
        visible: SeqNum,
    ) -> Self {
        Self {
            children,
            cmp,
            visible,
            heap: Vec::new(),
            direction: Direction::Forward,
        }
    }

    pub fn visible(&self) -> SeqNum {
        self.visible
    }

    /// Forwards the child past records the snapshot cannot see.
    fn skip_invisible_forward(&mut self, idx: usize) -> Result<()> {
        while self.children[idx].valid() {
            let (_, seq, _) = decode_key(self.children[idx].key())?;
            if is_visible(seq, self.visible) {
                break;
            }
            self.children[idx].next()?;
        }
        Ok(())
    }

    fn skip_invisible_reverse(&mut self, idx: usize) -> Result<()> {
        while self.children[idx].valid() {
            let (_, seq, _) = decode_key(self.children[idx].key())?;
            if is_visible(seq, self.visible) {
                break;
            }
            self.children[idx].prev()?;
        }
        Ok(())
    }

    /// True if child `a` should sort above child `b` in the heap.
    fn wins(&self, a: usize, b: usize) -> bool {
        let ord = self.cmp.compare(self.children[a].key(), self.children[b].key());
        let ord = match self.direction {
            Direction::Forward => ord,
            Direction::Reverse => ord.reverse(),
        };
        match ord {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a < b,
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap.clear();
        for idx in 0..self.children.len() {
            if self.children[idx].valid() {
                self.heap.push(idx);
            }
        }
        if self.heap.len() > 1 {
            for i in (0..self.heap.len() / 2).rev() {
                self.sift_down(i);
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                return;
            }
            let right = left + 1;
            let mut best = left;
            if right < self.heap.len() && self.wins(self.heap[right], self.heap[left]) {
                best = right;
            }
            if self.wins(self.heap[best], self.heap[pos]) {
                self.heap.swap(best, pos);
                pos = best;
            } else {
                return;
            }
        }
    }

    /// Re-heapifies after the root child moved, dropping it if exhausted.
    fn fix_root(&mut self) {
        if self.heap.is_empty() {
            return;
        }
        let root = self.heap[0];
        if self.children[root].valid() {
            self.sift_down(0);
        } else {
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
            self.sift_down(0);
        }
    }
}

impl InternalIterator for MergingIter<'_> {
    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        // Monotone re-seek: when already positioned before the target,
        // a bounded number of forward probes often beats a full seek of
        // every child.
        if self.direction == Direction::Forward && self.valid() {
            if self.cmp.compare(self.key(), key) == Ordering::Less {
                for _ in 0..SEEK_USING_NEXT_LIMIT {
                    self.next()?;
                    if !self.valid() {
                        return Ok(());
                    }
                    if self.cmp.compare(self.key(), key) != Ordering::Less {
                        return Ok(());
                    }
                }
            } else {
                // Already at or past the target; a full seek is still
                // required to find the first such key.
            }
        }
        self.direction = Direction::Forward;
        for idx in 0..self.children.len() {
            self.children[idx].seek_ge(key)?;
            self.skip_invisible_forward(idx)?;
        }
        self.rebuild_heap();
        Ok(())
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        self.direction = Direction::Reverse;
        for idx in 0..self.children.len() {
            self.children[idx].seek_lt(key)?;
            self.skip_invisible_reverse(idx)?;
        }
        self.rebuild_heap();
        Ok(())
    }

    fn first(&mut self) -> Result<()> {
        self.direction = Direction::Forward;
        for idx in 0..self.children.len() {
            self.children[idx].first()?;
            self.skip_invisible_forward(idx)?;
        }
        self.rebuild_heap();
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        self.direction = Direction::Reverse;
        for idx in 0..self.children.len() {
            self.children[idx].last()?;
            self.skip_invisible_reverse(idx)?;
        }
        self.rebuild_heap();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if self.heap.is_empty() {
            return Ok(());
        }
        if self.direction == Direction::Reverse {
            // Direction change: re-anchor on the current key.
            let anchor = self.key().to_vec();
            self.seek_ge(&anchor)?;
            if !self.valid() {
                return Ok(());
            }
        }
        let root = self.heap[0];
        self.children[root].next()?;
        self.skip_invisible_forward(root)?;
        self.fix_root();
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if self.heap.is_empty() {
            return Ok(());
        }
        if self.direction == Direction::Forward {
            let anchor = self.key().to_vec();
            self.seek_lt(&anchor)?;
            return Ok(());
        }
        let root = self.heap[0];
        self.children[root].prev()?;
        self.skip_invisible_reverse(root)?;
        self.fix_root();
        Ok(())
    }

    fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.heap[0]].key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.heap[0]].value()
    }

    fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8]) -> Result<()> {
        self.direction = Direction::Forward;
        for idx in 0..self.children.len() {
            self.children[idx].seek_prefix_ge(prefix, key)?;
            self.skip_invisible_forward(idx)?;
        }
        self.rebuild_heap();
        Ok(())
    }
}
