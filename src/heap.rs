//! Free-space max-heap over arenas, keyed by `weight` (spec §3, §4.3).
//!
//! A plain remove-and-reinsert heap is an acceptable translation of the
//! original's in-place-update heap (spec §9 Design Notes); heap positions are
//! not tracked externally, only arena-id membership.

use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Entry {
    weight: i64,
    arena_id: u32,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on weight; ties broken by arena id (spec §3).
        self.weight.cmp(&other.weight).then_with(|| self.arena_id.cmp(&other.arena_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap over arena ids. Membership is tracked alongside the heap so an
/// arena can be removed or have its weight refreshed without scanning.
#[derive(Debug, Default)]
pub struct FreeSpaceHeap {
    heap: BinaryHeap<Entry>,
    member: std::collections::HashSet<u32>,
}

impl FreeSpaceHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, arena_id: u32) -> bool {
        self.member.contains(&arena_id)
    }

    /// Insert or update `arena_id`'s weight. If already present with a stale
    /// weight, this pushes a fresh entry; stale entries are filtered lazily
    /// on pop via `member` membership checks.
    pub fn upsert(&mut self, arena_id: u32, weight: i64) {
        self.member.insert(arena_id);
        self.heap.push(Entry { weight, arena_id });
    }

    /// Remove `arena_id` from the heap (e.g. while it is pinned by a
    /// reservation, or marked `inactive`). Lazy: the stale heap entry is
    /// dropped the next time it would be popped.
    pub fn remove(&mut self, arena_id: u32) {
        self.member.remove(&arena_id);
    }

    /// Peek the highest-weight arena still considered a member, discarding
    /// any stale entries for arenas that were removed since being pushed.
    pub fn peek_root(&mut self) -> Option<u32> {
        while let Some(top) = self.heap.peek() {
            if self.member.contains(&top.arena_id) {
                return Some(top.arena_id);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.member.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_highest_weight() {
        let mut heap = FreeSpaceHeap::new();
        heap.upsert(1, 10);
        heap.upsert(2, 50);
        heap.upsert(3, 30);
        assert_eq!(heap.peek_root(), Some(2));
    }

    #[test]
    fn removed_arena_is_not_returned() {
        let mut heap = FreeSpaceHeap::new();
        heap.upsert(1, 10);
        heap.upsert(2, 50);
        heap.remove(2);
        assert_eq!(heap.peek_root(), Some(1));
    }

    #[test]
    fn ties_break_by_arena_id() {
        let mut heap = FreeSpaceHeap::new();
        heap.upsert(5, 10);
        heap.upsert(2, 10);
        // Higher arena id wins the tie per Entry::cmp ordering.
        assert_eq!(heap.peek_root(), Some(5));
    }
}
