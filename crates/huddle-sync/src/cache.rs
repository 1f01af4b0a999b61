//! In-memory cache for party data.
//!
//! One [`SyncCache`] is constructed per process and handed to every component
//! that needs it. Each entity kind gets a typed accessor with its lifetime
//! fixed by [`CachePolicy`]; callers never choose a TTL. Every mutation is
//! announced on a broadcast channel so views can re-read what changed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::config::CachePolicy;
use crate::feed::{ChangeAction, ChangeEvent};
use crate::ttl::{TtlListMap, TtlMap, TtlSlot};
use crate::types::{
    Comment, Identified, MediaItem, Notification, Party, PartyStatus, Poll, PollVote, Profile,
};

/// Default broadcast channel capacity for cache updates.
pub const DEFAULT_UPDATE_CAPACITY: usize = 1_024;

/// The kinds of entity the cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Profile,
    Party,
    Comments,
    Statuses,
    Media,
    Polls,
    Votes,
    Notifications,
    HomeFeed,
}

/// What happened to a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// The whole value or list was written.
    Replaced,
    /// An item was added to a list.
    Inserted,
    /// An item was changed in place.
    Updated,
    /// An item was removed from a list.
    Removed,
    /// The slot was dropped.
    Invalidated,
}

/// Update event for cache subscribers.
///
/// `key` is the entity id for maps, the parent id for lists and `None` for the home feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdate {
    pub kind: EntityKind,
    pub key: Option<Uuid>,
    pub change: UpdateKind,
}

#[derive(Clone)]
struct Notifier {
    tx: broadcast::Sender<CacheUpdate>,
}

impl Notifier {
    fn send(&self, kind: EntityKind, key: Option<Uuid>, change: UpdateKind) {
        trace!(target: "huddle::cache", ?kind, ?key, ?change, "cache updated");
        if self
            .tx
            .send(CacheUpdate { kind, key, change })
            .is_err()
        {
            trace!(target: "huddle::cache", "no subscribers for cache update");
        }
    }
}

/// Single records keyed by id.
pub struct CachedMap<T> {
    kind: EntityKind,
    ttl: Duration,
    map: TtlMap<Uuid, T>,
    notifier: Notifier,
}

impl<T: Identified + Clone> CachedMap<T> {
    fn new(kind: EntityKind, ttl: Duration, notifier: Notifier) -> Self {
        Self {
            kind,
            ttl,
            map: TtlMap::new(),
            notifier,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<T> {
        self.map.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.map.contains(&id)
    }

    pub fn put(&self, value: T) {
        let id = value.id();
        self.map.put(id, value, self.ttl);
        self.notifier.send(self.kind, Some(id), UpdateKind::Replaced);
    }

    pub fn invalidate(&self, id: Uuid) -> bool {
        let removed = self.map.invalidate(&id);
        if removed {
            self.notifier
                .send(self.kind, Some(id), UpdateKind::Invalidated);
        }
        removed
    }

    /// Replace a cached record with a newer version. No-op if not cached.
    pub fn replace_if_cached(&self, value: T) -> bool {
        let id = value.id();
        let replaced = self.map.update_in_place(&id, |current| *current = value);
        if replaced {
            self.notifier.send(self.kind, Some(id), UpdateKind::Updated);
        }
        replaced
    }

    /// Apply a change event: inserts and updates refresh a cached record, deletes drop it.
    pub fn apply(&self, event: ChangeEvent<T>) -> bool {
        match event.action {
            ChangeAction::Insert | ChangeAction::Update => self.replace_if_cached(event.record),
            ChangeAction::Delete => self.invalidate(event.record.id()),
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.map.purge_expired()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

/// Newest-first lists keyed by parent id.
pub struct CachedList<T> {
    kind: EntityKind,
    ttl: Duration,
    lists: TtlListMap<Uuid, T>,
    notifier: Notifier,
}

impl<T: Identified + Clone> CachedList<T> {
    fn new(kind: EntityKind, ttl: Duration, notifier: Notifier) -> Self {
        Self {
            kind,
            ttl,
            lists: TtlListMap::new(),
            notifier,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn get(&self, parent: Uuid) -> Option<Vec<T>> {
        self.lists.get(&parent)
    }

    pub fn contains(&self, parent: Uuid) -> bool {
        self.lists.contains(&parent)
    }

    pub fn find(&self, parent: Uuid, id: Uuid) -> Option<T> {
        self.lists.find(&parent, id)
    }

    pub fn put(&self, parent: Uuid, items: Vec<T>) {
        self.lists.put(parent, items, self.ttl);
        self.notifier
            .send(self.kind, Some(parent), UpdateKind::Replaced);
    }

    pub fn invalidate(&self, parent: Uuid) -> bool {
        let removed = self.lists.invalidate(&parent);
        if removed {
            self.notifier
                .send(self.kind, Some(parent), UpdateKind::Invalidated);
        }
        removed
    }

    /// Prepend to a cached list; no-op if the parent is not cached.
    pub fn append_front(&self, parent: Uuid, item: T) -> bool {
        let applied = self.lists.append_front(&parent, item);
        if applied {
            self.notifier
                .send(self.kind, Some(parent), UpdateKind::Inserted);
        }
        applied
    }

    pub fn remove_item(&self, parent: Uuid, id: Uuid) -> bool {
        let removed = self.lists.remove_item(&parent, id);
        if removed {
            self.notifier
                .send(self.kind, Some(parent), UpdateKind::Removed);
        }
        removed
    }

    /// Swap a pending item for its authoritative version (see [`TtlListMap::reconcile`]).
    pub fn reconcile(&self, parent: Uuid, pending_id: Uuid, item: T) -> bool {
        let applied = self.lists.reconcile(&parent, pending_id, item);
        if applied {
            self.notifier
                .send(self.kind, Some(parent), UpdateKind::Updated);
        }
        applied
    }

    /// Apply a change event in place.
    ///
    /// Inserts and updates go through `append_front`, which replaces an item
    /// with the same id where it stands; deletes remove by id.
    pub fn apply(&self, parent: Uuid, event: ChangeEvent<T>) -> bool {
        match event.action {
            ChangeAction::Insert | ChangeAction::Update => self.append_front(parent, event.record),
            ChangeAction::Delete => self.remove_item(parent, event.record.id()),
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.lists.purge_expired()
    }

    pub fn clear(&self) {
        self.lists.clear();
    }
}

/// A single unkeyed value.
pub struct CachedSlot<T> {
    kind: EntityKind,
    ttl: Duration,
    slot: TtlSlot<T>,
    notifier: Notifier,
}

impl<T: Clone> CachedSlot<T> {
    fn new(kind: EntityKind, ttl: Duration, notifier: Notifier) -> Self {
        Self {
            kind,
            ttl,
            slot: TtlSlot::new(),
            notifier,
        }
    }

    pub fn get(&self) -> Option<T> {
        self.slot.get()
    }

    pub fn put(&self, value: T) {
        self.slot.put(value, self.ttl);
        self.notifier.send(self.kind, None, UpdateKind::Replaced);
    }

    pub fn invalidate(&self) -> bool {
        let removed = self.slot.invalidate();
        if removed {
            self.notifier.send(self.kind, None, UpdateKind::Invalidated);
        }
        removed
    }

    fn update_in_place(&self, f: impl FnOnce(&mut T)) -> bool {
        let updated = self.slot.update_in_place(f);
        if updated {
            self.notifier.send(self.kind, None, UpdateKind::Updated);
        }
        updated
    }

    pub fn clear(&self) {
        self.slot.invalidate();
    }
}

/// In-memory cache for everything the client shows.
///
/// Thread-safe: every mutation of a single slot happens under that slot's
/// shard lock, and no method holds a lock across an await point.
pub struct SyncCache {
    policy: CachePolicy,
    profiles: CachedMap<Profile>,
    parties: CachedMap<Party>,
    comments: CachedList<Comment>,
    statuses: CachedList<PartyStatus>,
    media: CachedList<MediaItem>,
    polls: CachedList<Poll>,
    /// Votes keyed by poll id.
    votes: CachedList<PollVote>,
    /// Notifications keyed by user id.
    notifications: CachedList<Notification>,
    home_feed: CachedSlot<Vec<Party>>,
    /// Poll id → party id for every poll loaded locally.
    poll_index: DashMap<Uuid, Uuid>,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl SyncCache {
    /// Create a new empty cache.
    pub fn new(policy: CachePolicy) -> Arc<Self> {
        Self::with_capacity(policy, DEFAULT_UPDATE_CAPACITY)
    }

    /// Create a new empty cache with a custom update channel capacity.
    pub fn with_capacity(policy: CachePolicy, capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(policy, capacity))
    }

    fn build(policy: CachePolicy, capacity: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        let notifier = Notifier {
            tx: updates_tx.clone(),
        };
        Self {
            profiles: CachedMap::new(EntityKind::Profile, policy.profile_ttl(), notifier.clone()),
            parties: CachedMap::new(EntityKind::Party, policy.party_ttl(), notifier.clone()),
            comments: CachedList::new(
                EntityKind::Comments,
                policy.comments_ttl(),
                notifier.clone(),
            ),
            statuses: CachedList::new(
                EntityKind::Statuses,
                policy.statuses_ttl(),
                notifier.clone(),
            ),
            media: CachedList::new(EntityKind::Media, policy.media_ttl(), notifier.clone()),
            polls: CachedList::new(EntityKind::Polls, policy.polls_ttl(), notifier.clone()),
            votes: CachedList::new(EntityKind::Votes, policy.votes_ttl(), notifier.clone()),
            notifications: CachedList::new(
                EntityKind::Notifications,
                policy.notifications_ttl(),
                notifier.clone(),
            ),
            home_feed: CachedSlot::new(EntityKind::HomeFeed, policy.home_feed_ttl(), notifier),
            poll_index: DashMap::new(),
            updates_tx,
            policy,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Subscribe to cache updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn profiles(&self) -> &CachedMap<Profile> {
        &self.profiles
    }

    pub fn parties(&self) -> &CachedMap<Party> {
        &self.parties
    }

    pub fn comments(&self) -> &CachedList<Comment> {
        &self.comments
    }

    pub fn statuses(&self) -> &CachedList<PartyStatus> {
        &self.statuses
    }

    pub fn media(&self) -> &CachedList<MediaItem> {
        &self.media
    }

    pub fn polls(&self) -> &CachedList<Poll> {
        &self.polls
    }

    pub fn votes(&self) -> &CachedList<PollVote> {
        &self.votes
    }

    pub fn notifications(&self) -> &CachedList<Notification> {
        &self.notifications
    }

    pub fn home_feed(&self) -> &CachedSlot<Vec<Party>> {
        &self.home_feed
    }

    /// Cache a party's polls and remember which party each poll belongs to.
    pub fn put_polls(&self, party_id: Uuid, polls: Vec<Poll>) {
        self.index_polls(&polls);
        self.polls.put(party_id, polls);
    }

    /// Remember the owning party of each poll.
    pub fn index_polls(&self, polls: &[Poll]) {
        for poll in polls {
            self.poll_index.insert(poll.id, poll.party_id);
        }
    }

    /// The party a locally known poll belongs to.
    pub fn poll_party(&self, poll_id: Uuid) -> Option<Uuid> {
        self.poll_index.get(&poll_id).map(|r| *r.value())
    }

    /// Forget the poll ownership index for one party.
    pub fn forget_polls(&self, party_id: Uuid) {
        self.poll_index.retain(|_, party| *party != party_id);
    }

    /// Apply a change to a party row: the party entry and any home feed copy
    /// are refreshed in place, deletes drop both.
    pub fn apply_party_change(&self, event: ChangeEvent<Party>) {
        let id = event.record.id;
        match event.action {
            ChangeAction::Insert | ChangeAction::Update => {
                let party = event.record.clone();
                self.home_feed.update_in_place(|feed| {
                    if let Some(slot) = feed.iter_mut().find(|p| p.id == id) {
                        *slot = party;
                    }
                });
            }
            ChangeAction::Delete => {
                self.home_feed
                    .update_in_place(|feed| feed.retain(|p| p.id != id));
            }
        }
        self.parties.apply(event);
    }

    /// Drop every expired entry across all kinds.
    pub fn purge_expired(&self) -> usize {
        self.profiles.purge_expired()
            + self.parties.purge_expired()
            + self.comments.purge_expired()
            + self.statuses.purge_expired()
            + self.media.purge_expired()
            + self.polls.purge_expired()
            + self.votes.purge_expired()
            + self.notifications.purge_expired()
    }

    /// Wipe everything (process-wide teardown).
    pub fn clear(&self) {
        self.profiles.clear();
        self.parties.clear();
        self.comments.clear();
        self.statuses.clear();
        self.media.clear();
        self.polls.clear();
        self.votes.clear();
        self.notifications.clear();
        self.home_feed.clear();
        self.poll_index.clear();
    }
}

impl Default for SyncCache {
    fn default() -> Self {
        Self::build(CachePolicy::default(), DEFAULT_UPDATE_CAPACITY)
    }
}
