//! Timeout heap: binary min-heap of requests keyed by deadline.
//!
//! The heap stores arena indices and mirrors each element's position into
//! `Aiocb::heap_idx`, so a request that completes before its deadline can
//! be removed in O(log n) without a scan. Only requests with a deadline
//! ever enter the heap, and only while they sit in some waitlist.

use std::time::Instant;

use crate::request::{CbArena, NIL};

pub(crate) struct TimedHeap {
    items: Vec<usize>,
}

impl TimedHeap {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Arena index of the request with the earliest deadline.
    pub fn peek(&self) -> Option<usize> {
        self.items.first().copied()
    }

    pub fn peek_deadline(&self, arena: &CbArena) -> Option<Instant> {
        self.peek().map(|idx| deadline(arena, idx))
    }

    pub fn push(&mut self, arena: &mut CbArena, idx: usize) {
        self.items.push(idx);
        let pos = self.items.len() - 1;
        arena.get_mut(idx).heap_idx = pos;
        self.sift_up(arena, pos);
    }

    /// Pop the earliest-deadline request.
    pub fn pop(&mut self, arena: &mut CbArena) -> Option<usize> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.remove_at(arena, 0))
        }
    }

    /// Remove a request wherever it sits. No-op if it is not in the heap.
    pub fn remove(&mut self, arena: &mut CbArena, idx: usize) {
        let pos = arena.get(idx).heap_idx;
        if pos != NIL {
            debug_assert_eq!(self.items[pos], idx);
            self.remove_at(arena, pos);
        }
    }

    fn remove_at(&mut self, arena: &mut CbArena, pos: usize) -> usize {
        let last = self.items.len() - 1;
        self.items.swap(pos, last);
        let removed = self.items.pop().expect("heap underflow");
        arena.get_mut(removed).heap_idx = NIL;
        if pos < self.items.len() {
            arena.get_mut(self.items[pos]).heap_idx = pos;
            self.sift_down(arena, pos);
            self.sift_up(arena, pos);
        }
        removed
    }

    fn sift_up(&mut self, arena: &mut CbArena, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if deadline(arena, self.items[pos]) >= deadline(arena, self.items[parent]) {
                break;
            }
            self.swap_slots(arena, pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, arena: &mut CbArena, mut pos: usize) {
        loop {
            let mut min = pos;
            for child in [2 * pos + 1, 2 * pos + 2] {
                if child < self.items.len()
                    && deadline(arena, self.items[child]) < deadline(arena, self.items[min])
                {
                    min = child;
                }
            }
            if min == pos {
                break;
            }
            self.swap_slots(arena, pos, min);
            pos = min;
        }
    }

    fn swap_slots(&mut self, arena: &mut CbArena, a: usize, b: usize) {
        self.items.swap(a, b);
        arena.get_mut(self.items[a]).heap_idx = a;
        arena.get_mut(self.items[b]).heap_idx = b;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

fn deadline(arena: &CbArena, idx: usize) -> Instant {
    arena.get(idx).deadline.expect("request in heap without deadline")
}
