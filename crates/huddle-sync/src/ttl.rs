//! Generic time-boxed storage.
//!
//! Entries carry their insertion time and lifetime. A read after the lifetime
//! has elapsed treats the entry as absent and evicts it. Time comes from
//! [`tokio::time::Instant`] so paused-clock tests can drive expiry.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::Identified;

/// A cached value with its insertion time and lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: Instant,
    pub lifetime: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, lifetime: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            lifetime,
        }
    }

    /// Expired strictly after `lifetime` has elapsed.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.lifetime
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before the entry expires.
    pub fn remaining(&self) -> Duration {
        self.lifetime
            .saturating_sub(Instant::now().saturating_duration_since(self.inserted_at))
    }
}

/// Keyed TTL store with expiry-on-read.
pub struct TtlMap<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Run `f` against a live entry, evicting it instead if it has expired.
    fn with_live<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired() => return Some(f(&entry.value)),
            Some(_) => {}
        }
        // Only evict if it is still expired; a fresh put may have raced in.
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    /// Get a value, or `None` if absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        self.with_live(key, V::clone)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.with_live(key, |_| ()).is_some()
    }

    /// Get the full entry, including its timing.
    pub fn entry(&self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.get(key)?.value().clone();
        if entry.is_expired() {
            self.entries.remove_if(key, |_, entry| entry.is_expired());
            return None;
        }
        Some(entry)
    }

    /// Insert or overwrite unconditionally.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    /// Remove regardless of TTL. Returns whether anything was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Mutate a live value in place. The original insertion time is kept.
    ///
    /// Returns false (and evicts) if the entry is absent or expired.
    pub fn update_in_place(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        match self.entries.get_mut(key) {
            None => return false,
            Some(mut entry) if !entry.is_expired() => {
                f(&mut entry.value);
                return true;
            }
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        false
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<K, V> Default for TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Parent key → ordered list, newest first.
///
/// Lists are only ever created whole by `put`. Single-item operations never
/// create a list for an uncached parent, so a cached list is never partial.
pub struct TtlListMap<K, T> {
    lists: TtlMap<K, Vec<T>>,
}

impl<K, T> TtlListMap<K, T>
where
    K: Eq + Hash + Clone,
    T: Identified + Clone,
{
    pub fn new() -> Self {
        Self {
            lists: TtlMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<Vec<T>> {
        self.lists.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lists.contains(key)
    }

    /// Find a single item in a cached list.
    pub fn find(&self, key: &K, id: Uuid) -> Option<T> {
        self.lists
            .with_live(key, |list| list.iter().find(|item| item.id() == id).cloned())
            .flatten()
    }

    pub fn put(&self, key: K, items: Vec<T>, ttl: Duration) {
        self.lists.put(key, items, ttl);
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.lists.invalidate(key)
    }

    /// Prepend `item` to a cached list.
    ///
    /// No-op if the parent is not cached. If an item with the same id is
    /// already present it is replaced where it stands instead of duplicated.
    pub fn append_front(&self, key: &K, item: T) -> bool {
        self.lists.update_in_place(key, |list| {
            match list.iter().position(|existing| existing.id() == item.id()) {
                Some(pos) => list[pos] = item,
                None => list.insert(0, item),
            }
        })
    }

    /// Remove an item by id. Returns whether the item was present.
    pub fn remove_item(&self, key: &K, id: Uuid) -> bool {
        let mut removed = false;
        self.lists.update_in_place(key, |list| {
            let before = list.len();
            list.retain(|item| item.id() != id);
            removed = list.len() != before;
        });
        removed
    }

    /// Replace a pending item with its authoritative version.
    ///
    /// The authoritative item takes the pending item's position. Any copy of
    /// the authoritative id already in the list (delivered by the change feed)
    /// is collapsed into that single slot. If the pending item is gone, an
    /// existing authoritative copy is replaced in place, otherwise the item is
    /// prepended. No-op if the parent is not cached.
    pub fn reconcile(&self, key: &K, pending_id: Uuid, item: T) -> bool {
        self.lists.update_in_place(key, |list| {
            let item_id = item.id();
            let pending_pos = list.iter().position(|existing| existing.id() == pending_id);
            let existing_pos = list.iter().position(|existing| existing.id() == item_id);

            match (pending_pos, existing_pos) {
                (Some(pending), Some(existing)) if pending != existing => {
                    list[pending] = item;
                    list.remove(existing);
                }
                (Some(pending), _) => list[pending] = item,
                (None, Some(existing)) => list[existing] = item,
                (None, None) => list.insert(0, item),
            }
        })
    }

    pub fn purge_expired(&self) -> usize {
        self.lists.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn clear(&self) {
        self.lists.clear();
    }
}

impl<K, T> Default for TtlListMap<K, T>
where
    K: Eq + Hash + Clone,
    T: Identified + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A single unkeyed TTL slot.
pub struct TtlSlot<T> {
    slot: TtlMap<(), T>,
}

impl<T: Clone> TtlSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: TtlMap::new(),
        }
    }

    pub fn get(&self) -> Option<T> {
        self.slot.get(&())
    }

    pub fn put(&self, value: T, ttl: Duration) {
        self.slot.put((), value, ttl);
    }

    pub fn invalidate(&self) -> bool {
        self.slot.invalidate(&())
    }

    pub fn update_in_place(&self, f: impl FnOnce(&mut T)) -> bool {
        self.slot.update_in_place(&(), f)
    }
}

impl<T: Clone> Default for TtlSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
