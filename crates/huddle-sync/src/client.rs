//! The sync core's front door.
//!
//! [`HuddleSync`] owns the cache, the subscription manager, the prefetcher,
//! the optimistic writer and the presence hub. Reads go cache-first; opening a
//! party attaches its live topic so later changes land in the cache in place.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheUpdate, SyncCache};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::feed::ChangeSource;
use crate::optimistic::OptimisticWriter;
use crate::prefetch::{PrefetchCoordinator, PrefetchKey};
use crate::presence::{PresenceChannel, PresenceHub};
use crate::store::{Filter, Order, Query, RemoteStore, Repository};
use crate::subscription::{ConnectionStatus, SubscriptionManager, TopicKey};
use crate::timing::Debouncer;
use crate::topics::{notifications_topic, party_topic};
use crate::types::{
    Comment, MediaItem, Notification, Party, PartyStatus, PartyUpdate, Poll, PollVote, Profile,
};

/// How many parties the home feed shows.
pub const HOME_FEED_LIMIT: usize = 50;
/// How many parties a search returns.
pub const SEARCH_LIMIT: usize = 20;

/// Latest party search outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub query: String,
    pub parties: Vec<Party>,
    pub error: Option<String>,
}

/// Realtime sync and caching core for the party client.
pub struct HuddleSync {
    config: SyncConfig,
    cache: Arc<SyncCache>,
    repo: Repository,
    subscriptions: SubscriptionManager,
    prefetch: PrefetchCoordinator,
    writer: OptimisticWriter,
    presence: PresenceHub,
    search: Debouncer,
    search_tx: Arc<watch::Sender<SearchResults>>,
}

impl HuddleSync {
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SyncCache> {
        &self.cache
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn presence(&self) -> &PresenceHub {
        &self.presence
    }

    pub fn prefetcher(&self) -> &PrefetchCoordinator {
        &self.prefetch
    }

    /// Subscribe to cache updates.
    pub fn cache_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.cache.subscribe()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// A party, from cache or the store.
    pub async fn load_party(&self, party_id: Uuid) -> Result<Party, SyncError> {
        if let Some(party) = self.cache.parties().get(party_id) {
            return Ok(party);
        }
        let party: Party = self.repo.fetch_one(party_id).await?;
        self.cache.parties().put(party.clone());
        Ok(party)
    }

    pub async fn load_profile(&self, user_id: Uuid) -> Result<Profile, SyncError> {
        if let Some(profile) = self.cache.profiles().get(user_id) {
            return Ok(profile);
        }
        let profile: Profile = self.repo.fetch_one(user_id).await?;
        self.cache.profiles().put(profile.clone());
        Ok(profile)
    }

    /// A party's comments, newest first.
    pub async fn party_comments(&self, party_id: Uuid) -> Result<Vec<Comment>, SyncError> {
        if let Some(comments) = self.cache.comments().get(party_id) {
            return Ok(comments);
        }
        let comments: Vec<Comment> = self.repo.fetch_children(party_id).await?;
        self.cache.comments().put(party_id, comments.clone());
        Ok(comments)
    }

    pub async fn party_statuses(&self, party_id: Uuid) -> Result<Vec<PartyStatus>, SyncError> {
        if let Some(statuses) = self.cache.statuses().get(party_id) {
            return Ok(statuses);
        }
        let statuses: Vec<PartyStatus> = self.repo.fetch_children(party_id).await?;
        self.cache.statuses().put(party_id, statuses.clone());
        Ok(statuses)
    }

    pub async fn party_media(&self, party_id: Uuid) -> Result<Vec<MediaItem>, SyncError> {
        if let Some(media) = self.cache.media().get(party_id) {
            return Ok(media);
        }
        let media: Vec<MediaItem> = self.repo.fetch_children(party_id).await?;
        self.cache.media().put(party_id, media.clone());
        Ok(media)
    }

    /// A party's polls. Loading them is what lets their live votes through.
    pub async fn party_polls(&self, party_id: Uuid) -> Result<Vec<Poll>, SyncError> {
        if let Some(polls) = self.cache.polls().get(party_id) {
            self.cache.index_polls(&polls);
            return Ok(polls);
        }
        let polls: Vec<Poll> = self.repo.fetch_children(party_id).await?;
        self.cache.put_polls(party_id, polls.clone());
        Ok(polls)
    }

    pub async fn poll_votes(&self, poll_id: Uuid) -> Result<Vec<PollVote>, SyncError> {
        if let Some(votes) = self.cache.votes().get(poll_id) {
            return Ok(votes);
        }
        let votes: Vec<PollVote> = self.repo.fetch_children(poll_id).await?;
        self.cache.votes().put(poll_id, votes.clone());
        Ok(votes)
    }

    /// Upcoming parties.
    pub async fn home_feed(&self) -> Result<Vec<Party>, SyncError> {
        if let Some(feed) = self.cache.home_feed().get() {
            return Ok(feed);
        }
        self.fetch_home_feed().await
    }

    /// Drop the cached home feed and fetch it again.
    pub async fn refresh_home_feed(&self) -> Result<Vec<Party>, SyncError> {
        self.cache.home_feed().invalidate();
        self.fetch_home_feed().await
    }

    async fn fetch_home_feed(&self) -> Result<Vec<Party>, SyncError> {
        let query = Query::of::<Party>()
            .order(Order::ascending("starts_at"))
            .limit(HOME_FEED_LIMIT);
        let parties: Vec<Party> = self.repo.fetch_where(query).await?;
        self.cache.home_feed().put(parties.clone());
        Ok(parties)
    }

    // =========================================================================
    // Live topics
    // =========================================================================

    /// Load a party, attach its live topic and warm its lists.
    ///
    /// List warm-up failures are logged; the lists load again on first read.
    pub async fn open_party(&self, party_id: Uuid) -> Result<Party, SyncError> {
        let party = self.load_party(party_id).await?;
        self.subscriptions
            .subscribe(party_topic(&self.cache, party_id))
            .await?;

        let (comments, statuses, media, polls) = tokio::join!(
            self.party_comments(party_id),
            self.party_statuses(party_id),
            self.party_media(party_id),
            self.party_polls(party_id),
        );
        for (list, result) in [
            ("comments", comments.err()),
            ("statuses", statuses.err()),
            ("media", media.err()),
            ("polls", polls.err()),
        ] {
            if let Some(e) = result {
                warn!(
                    target: "huddle::network",
                    %party_id,
                    list,
                    error = %e,
                    "failed to warm party list"
                );
            }
        }

        info!(target: "huddle::realtime", %party_id, title = %party.title, "party opened");
        Ok(party)
    }

    /// Detach a party's live topic and leave its presence channel.
    pub async fn close_party(&self, party_id: Uuid) {
        let key = TopicKey::party(party_id);
        self.subscriptions.unsubscribe(&key).await;
        self.presence.leave(key.as_str()).await;
        self.cache.forget_polls(party_id);
    }

    /// Load a user's notifications and keep them live.
    pub async fn watch_notifications(&self, user_id: Uuid) -> Result<Vec<Notification>, SyncError> {
        let notifications: Vec<Notification> = self.repo.fetch_children(user_id).await?;
        self.cache.notifications().put(user_id, notifications.clone());
        self.subscriptions
            .subscribe(notifications_topic(&self.cache, user_id))
            .await?;
        Ok(notifications)
    }

    pub async fn unwatch_notifications(&self, user_id: Uuid) {
        self.subscriptions
            .unsubscribe(&TopicKey::notifications(user_id))
            .await;
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.subscriptions.connection_status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.subscriptions.watch_connection()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Patch a party, then drop the cached copies that depend on it.
    pub async fn update_party(
        &self,
        party_id: Uuid,
        update: &PartyUpdate,
    ) -> Result<Party, SyncError> {
        if update.is_empty() {
            return Err(SyncError::Write("party update has no fields".to_string()));
        }
        let party: Party = self.repo.patch(party_id, update).await?;
        self.cache.parties().invalidate(party_id);
        self.cache.home_feed().invalidate();
        debug!(target: "huddle::network", %party_id, "party updated");
        Ok(party)
    }

    pub async fn post_comment(
        &self,
        party_id: Uuid,
        author_id: Uuid,
        body: impl Into<String>,
    ) -> Result<Comment, SyncError> {
        self.writer.post_comment(party_id, author_id, body).await
    }

    pub async fn post_status(
        &self,
        party_id: Uuid,
        user_id: Uuid,
        body: impl Into<String>,
    ) -> Result<PartyStatus, SyncError> {
        self.writer.post_status(party_id, user_id, body).await
    }

    pub async fn cast_vote(
        &self,
        poll_id: Uuid,
        user_id: Uuid,
        option_index: u32,
    ) -> Result<PollVote, SyncError> {
        self.writer.cast_vote(poll_id, user_id, option_index).await
    }

    // =========================================================================
    // Search, prefetch, presence
    // =========================================================================

    /// Search parties by title once typing pauses. Results arrive on [`Self::watch_search`].
    pub fn search_parties(&self, query: impl Into<String>) {
        let query = query.into();
        if query.trim().is_empty() {
            self.search.cancel();
            self.search_tx.send_replace(SearchResults::default());
            return;
        }

        let repo = self.repo.clone();
        let results_tx = self.search_tx.clone();
        self.search.schedule(move || async move {
            let search = Query::of::<Party>()
                .filter(Filter::contains("title", query.trim()))
                .order(Order::ascending("starts_at"))
                .limit(SEARCH_LIMIT);
            let results = match repo.fetch_where::<Party>(search).await {
                Ok(parties) => SearchResults {
                    query,
                    parties,
                    error: None,
                },
                Err(e) => {
                    warn!(target: "huddle::ui", query = %query, error = %e, "party search failed");
                    SearchResults {
                        error: Some(e.to_string()),
                        query,
                        parties: Vec::new(),
                    }
                }
            };
            debug!(
                target: "huddle::ui",
                query = %results.query,
                hits = results.parties.len(),
                "search results ready"
            );
            results_tx.send_replace(results);
        });
    }

    pub fn watch_search(&self) -> watch::Receiver<SearchResults> {
        self.search_tx.subscribe()
    }

    /// Warm the parties about to scroll into view. Returns how many fetches started.
    pub fn prefetch_parties(&self, party_ids: &[Uuid]) -> usize {
        self.prefetch
            .prefetch_many(party_ids.iter().copied().map(PrefetchKey::Party))
    }

    /// Broadcast a throttled typing indicator on a party.
    pub async fn notify_typing(&self, party_id: Uuid) -> bool {
        self.presence
            .notify_typing(TopicKey::party(party_id).as_str())
            .await
    }

    /// Tear everything down: subscriptions, presence, pending work and the cache.
    pub async fn shutdown(&self) {
        self.search.cancel();
        self.prefetch.cancel_all();
        self.subscriptions.unsubscribe_all().await;
        self.presence.leave_all().await;
        self.cache.clear();
        info!(target: "huddle::realtime", "sync core shut down");
    }
}

/// Builder for [`HuddleSync`].
pub struct HuddleSyncBuilder {
    store: Arc<dyn RemoteStore>,
    source: Arc<dyn ChangeSource>,
    presence: Arc<dyn PresenceChannel>,
    config: SyncConfig,
    cache: Option<Arc<SyncCache>>,
}

impl HuddleSyncBuilder {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        source: Arc<dyn ChangeSource>,
        presence: Arc<dyn PresenceChannel>,
    ) -> Self {
        Self {
            store,
            source,
            presence,
            config: SyncConfig::default(),
            cache: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing cache instead of building one from the config.
    pub fn cache(mut self, cache: Arc<SyncCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> HuddleSync {
        let config = self.config;
        let cache = self.cache.unwrap_or_else(|| {
            SyncCache::with_capacity(config.cache.clone(), config.update_channel_capacity)
        });
        let repo = Repository::new(self.store);
        let (search_tx, _) = watch::channel(SearchResults::default());

        HuddleSync {
            subscriptions: SubscriptionManager::new(self.source),
            prefetch: PrefetchCoordinator::new(cache.clone(), repo.clone(), config.prefetch_fanout),
            writer: OptimisticWriter::new(cache.clone(), repo.clone()),
            presence: PresenceHub::new(
                self.presence,
                config.typing_throttle(),
                config.typing_expiry(),
                config.update_channel_capacity,
            ),
            search: Debouncer::new(config.search_debounce()),
            search_tx: Arc::new(search_tx),
            cache,
            repo,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LocalFeed, MemoryStore};
    use crate::subscription::TopicState;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn party(title: &str, starts_in_hours: i64) -> Party {
        Party {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            location: None,
            starts_at: Utc::now() + ChronoDuration::hours(starts_in_hours),
            ends_at: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn setup() -> (HuddleSync, Arc<MemoryStore>, Arc<LocalFeed>) {
        let feed = LocalFeed::new();
        let store = MemoryStore::with_feed(feed.clone());
        let config = SyncConfig {
            search_debounce_ms: 50,
            ..SyncConfig::default()
        };
        let sync = HuddleSyncBuilder::new(store.clone(), feed.clone(), feed.clone())
            .config(config)
            .build();
        (sync, store, feed)
    }

    #[test]
    fn test_builder_uses_config() {
        let feed = LocalFeed::new();
        let config = SyncConfig {
            prefetch_fanout: 2,
            ..SyncConfig::default()
        };
        let sync = HuddleSyncBuilder::new(MemoryStore::new(), feed.clone(), feed)
            .config(config.clone())
            .build();
        assert_eq!(sync.config(), &config);
    }

    #[tokio::test]
    async fn test_load_party_is_cache_first() {
        let (sync, store, _feed) = setup();
        let p = party("Picnic", 24);
        store.seed("parties", &p).unwrap();

        assert_eq!(sync.load_party(p.id).await.unwrap(), p);
        assert_eq!(sync.load_party(p.id).await.unwrap(), p);
        assert_eq!(store.select_count(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_party_is_not_found() {
        let (sync, _store, _feed) = setup();
        let result = sync.load_party(Uuid::new_v4()).await;
        assert!(matches!(result, Err(SyncError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_home_feed_order_and_refresh() {
        let (sync, store, _feed) = setup();
        let later = party("Later", 48);
        let sooner = party("Sooner", 2);
        store.seed("parties", &later).unwrap();
        store.seed("parties", &sooner).unwrap();

        let feed = sync.home_feed().await.unwrap();
        assert_eq!(feed, vec![sooner.clone(), later.clone()]);

        let added = party("Added", 10);
        store.seed("parties", &added).unwrap();
        assert_eq!(sync.home_feed().await.unwrap().len(), 2);
        assert_eq!(sync.refresh_home_feed().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_party_invalidates() {
        let (sync, store, _feed) = setup();
        let p = party("Potluck", 5);
        store.seed("parties", &p).unwrap();
        sync.load_party(p.id).await.unwrap();
        sync.home_feed().await.unwrap();

        let updated = sync
            .update_party(
                p.id,
                &PartyUpdate {
                    location: Some("Backyard".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.location.as_deref(), Some("Backyard"));
        assert!(sync.cache().parties().get(p.id).is_none());
        assert!(sync.cache().home_feed().get().is_none());

        assert!(matches!(
            sync.update_party(p.id, &PartyUpdate::default()).await,
            Err(SyncError::Write(_))
        ));
    }

    #[tokio::test]
    async fn test_open_and_close_party() {
        let (sync, store, feed) = setup();
        let p = party("Karaoke", 3);
        store.seed("parties", &p).unwrap();

        sync.open_party(p.id).await.unwrap();
        let key = TopicKey::party(p.id);
        assert_eq!(sync.subscriptions().topic_state(&key), TopicState::Active);
        assert!(sync.cache().comments().contains(p.id));
        assert!(sync.cache().polls().contains(p.id));

        sync.close_party(p.id).await;
        assert_eq!(sync.subscriptions().topic_state(&key), TopicState::Unsubscribed);
        assert!(!feed.is_open(key.as_str()));
    }

    #[tokio::test]
    async fn test_search_is_debounced() {
        let (sync, store, _feed) = setup();
        store.seed("parties", &party("Rooftop Social", 4)).unwrap();
        store.seed("parties", &party("Roof Repair Day", 6)).unwrap();
        store.seed("parties", &party("Beach Day", 8)).unwrap();
        let mut results = sync.watch_search();

        sync.search_parties("r");
        sync.search_parties("ro");
        sync.search_parties("roof");

        tokio::time::timeout(Duration::from_secs(2), results.changed())
            .await
            .unwrap()
            .unwrap();
        let latest = results.borrow_and_update().clone();
        assert_eq!(latest.query, "roof");
        assert_eq!(latest.parties.len(), 2);
        assert_eq!(store.select_count(), 1);

        sync.search_parties("  ");
        assert_eq!(results.borrow_and_update().clone(), SearchResults::default());
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let (sync, store, feed) = setup();
        let p = party("Bonfire", 1);
        store.seed("parties", &p).unwrap();
        sync.open_party(p.id).await.unwrap();

        sync.shutdown().await;
        assert!(sync.subscriptions().active_topics().is_empty());
        assert!(sync.cache().parties().get(p.id).is_none());
        assert!(!feed.is_open(TopicKey::party(p.id).as_str()));
    }
}
