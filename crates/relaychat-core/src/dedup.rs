//! Per-subscription admission of event ids.
//!
//! The same event usually arrives once per relay. Each subscription owns one
//! `SeenEvents`, so an id is admitted at most once per handle while other
//! subscriptions may still receive it. The set is bounded: once `capacity`
//! ids are held the least recently seen one is evicted.

use std::num::NonZeroUsize;

use lru::LruCache;
use nostr_sdk::EventId;

/// Default number of ids remembered per subscription.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct SeenEvents {
    cache: LruCache<EventId, ()>,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// `true` exactly once per id (within the capacity window).
    pub fn admit(&mut self, id: EventId) -> bool {
        if self.cache.get(&id).is_some() {
            return false;
        }
        self.cache.put(id, ());
        true
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.cache.contains(id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{build_event, EventDraft};
    use nostr_sdk::Keys;

    fn ids(n: usize) -> Vec<EventId> {
        let keys = Keys::generate();
        (0..n)
            .map(|i| {
                build_event(&keys, EventDraft::new(4, format!("m{i}")).created_at(i as u64))
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn admits_each_id_once() {
        let mut seen = SeenEvents::default();
        let ids = ids(2);
        assert!(seen.admit(ids[0]));
        assert!(!seen.admit(ids[0]));
        assert!(!seen.admit(ids[0]));
        assert!(seen.admit(ids[1]));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn separate_sets_are_independent() {
        let id = ids(1)[0];
        let mut a = SeenEvents::default();
        let mut b = SeenEvents::default();
        assert!(a.admit(id));
        assert!(b.admit(id));
    }

    #[test]
    fn evicts_least_recent_when_full() {
        let ids = ids(3);
        let mut seen = SeenEvents::new(2);
        assert!(seen.admit(ids[0]));
        assert!(seen.admit(ids[1]));
        // Touch ids[0] so ids[1] becomes the eviction candidate.
        assert!(!seen.admit(ids[0]));
        assert!(seen.admit(ids[2]));
        assert!(seen.contains(&ids[0]));
        assert!(!seen.contains(&ids[1]));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut seen = SeenEvents::new(0);
        let id = ids(1)[0];
        assert!(seen.admit(id));
        assert!(!seen.admit(id));
    }
}
