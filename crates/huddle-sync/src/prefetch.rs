//! Prefetch coordination.
//!
//! Warms the cache ahead of the scroll position. A key already cached or
//! already being fetched is skipped; failures are logged and otherwise ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cache::SyncCache;
use crate::error::SyncError;
use crate::store::Repository;
use crate::types::{Comment, Party, Profile};

/// Something that can be prefetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefetchKey {
    Party(Uuid),
    Profile(Uuid),
    /// A party's comment list.
    Comments(Uuid),
}

struct InFlight {
    /// Distinguishes a restarted fetch from the one it replaced.
    generation: u64,
    abort: AbortHandle,
}

/// Deduplicating prefetcher.
pub struct PrefetchCoordinator {
    cache: Arc<SyncCache>,
    repo: Repository,
    fanout: usize,
    in_flight: Arc<DashMap<PrefetchKey, InFlight>>,
    next_generation: AtomicU64,
}

impl PrefetchCoordinator {
    pub fn new(cache: Arc<SyncCache>, repo: Repository, fanout: usize) -> Self {
        Self {
            cache,
            repo,
            fanout,
            in_flight: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn is_cached(&self, key: PrefetchKey) -> bool {
        match key {
            PrefetchKey::Party(id) => self.cache.parties().contains(id),
            PrefetchKey::Profile(id) => self.cache.profiles().contains(id),
            PrefetchKey::Comments(party_id) => self.cache.comments().contains(party_id),
        }
    }

    /// Start fetching `key` in the background. Returns whether a fetch started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn prefetch(&self, key: PrefetchKey) -> bool {
        if self.is_cached(key) {
            trace!(target: "huddle::network", ?key, "prefetch skipped, cached");
            return false;
        }

        match self.in_flight.entry(key) {
            Entry::Occupied(_) => {
                trace!(target: "huddle::network", ?key, "prefetch skipped, in flight");
                false
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn(run_prefetch(
                    key,
                    generation,
                    self.cache.clone(),
                    self.repo.clone(),
                    self.in_flight.clone(),
                ));
                slot.insert(InFlight {
                    generation,
                    abort: task.abort_handle(),
                });
                true
            }
        }
    }

    /// Prefetch at most `fanout` keys from the front of `keys`. Returns how many started.
    pub fn prefetch_many(&self, keys: impl IntoIterator<Item = PrefetchKey>) -> usize {
        keys.into_iter()
            .take(self.fanout)
            .filter(|key| self.prefetch(*key))
            .count()
    }

    /// Abort every outstanding fetch and clear the in-flight set.
    pub fn cancel_all(&self) {
        self.in_flight.retain(|_, flight| {
            flight.abort.abort();
            false
        });
        debug!(target: "huddle::network", "prefetches cancelled");
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: PrefetchKey) -> bool {
        self.in_flight.contains_key(&key)
    }
}

impl Drop for PrefetchCoordinator {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_prefetch(
    key: PrefetchKey,
    generation: u64,
    cache: Arc<SyncCache>,
    repo: Repository,
    in_flight: Arc<DashMap<PrefetchKey, InFlight>>,
) {
    if let Err(e) = fetch_into_cache(key, &cache, &repo).await {
        debug!(target: "huddle::network", ?key, error = %e, "prefetch failed");
    }
    in_flight.remove_if(&key, |_, flight| flight.generation == generation);
}

async fn fetch_into_cache(
    key: PrefetchKey,
    cache: &SyncCache,
    repo: &Repository,
) -> Result<(), SyncError> {
    match key {
        PrefetchKey::Party(id) => cache.parties().put(repo.fetch_one::<Party>(id).await?),
        PrefetchKey::Profile(id) => cache.profiles().put(repo.fetch_one::<Profile>(id).await?),
        PrefetchKey::Comments(party_id) => cache
            .comments()
            .put(party_id, repo.fetch_children::<Comment>(party_id).await?),
    }
    trace!(target: "huddle::network", ?key, "prefetched");
    Ok(())
}
