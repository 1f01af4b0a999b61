//! Optimistic writes.
//!
//! A locally synthesized record goes into the list cache before the remote
//! write starts. Once the store answers, the local record is swapped for the
//! persisted one by id; if the write fails (or the caller gives up on it) the
//! local record is removed.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CachedList, SyncCache};
use crate::error::SyncError;
use crate::store::Repository;
use crate::types::{Comment, Identified, NewComment, NewStatus, NewVote, PartyStatus, PollVote};

/// A record shown locally before the store has confirmed it.
#[derive(Debug, Clone)]
pub struct PendingWrite<T> {
    local_id: Uuid,
    record: T,
}

impl<T: Identified> PendingWrite<T> {
    /// Build a pending record from a fresh local id and the current time.
    pub fn new(build: impl FnOnce(Uuid, DateTime<Utc>) -> T) -> Self {
        let local_id = Uuid::new_v4();
        Self {
            local_id,
            record: build(local_id, Utc::now()),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn record(&self) -> &T {
        &self.record
    }
}

/// Removes the pending record unless the write was reconciled.
struct PendingGuard<'a, T: Identified + Clone> {
    list: &'a CachedList<T>,
    parent: Uuid,
    local_id: Uuid,
    armed: bool,
}

impl<T: Identified + Clone> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.list.remove_item(self.parent, self.local_id);
        }
    }
}

/// Runs user-initiated writes optimistically against the cache.
pub struct OptimisticWriter {
    cache: Arc<SyncCache>,
    repo: Repository,
}

impl OptimisticWriter {
    pub fn new(cache: Arc<SyncCache>, repo: Repository) -> Self {
        Self { cache, repo }
    }

    /// Show `synthesize()` at the front of `list[parent]`, run `commit`, then
    /// reconcile.
    ///
    /// On success the pending record is replaced by the committed one, wherever
    /// either currently sits. On failure the pending record is removed and the
    /// error returned. Nothing is shown if the parent's list is not cached.
    pub async fn perform<T, S, C, Fut>(
        &self,
        list: &CachedList<T>,
        parent: Uuid,
        synthesize: S,
        commit: C,
    ) -> Result<T, SyncError>
    where
        T: Identified + Clone,
        S: FnOnce() -> PendingWrite<T>,
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let pending = synthesize();
        let local_id = pending.local_id;
        let shown = list.append_front(parent, pending.record);
        let mut guard = PendingGuard {
            list,
            parent,
            local_id,
            armed: shown,
        };

        match commit().await {
            Ok(record) => {
                guard.armed = false;
                list.reconcile(parent, local_id, record.clone());
                debug!(
                    target: "huddle::network",
                    kind = ?list.kind(),
                    %local_id,
                    id = %record.id(),
                    "optimistic write confirmed"
                );
                Ok(record)
            }
            Err(e) => {
                warn!(
                    target: "huddle::network",
                    kind = ?list.kind(),
                    %local_id,
                    error = %e,
                    "optimistic write failed, rolling back"
                );
                drop(guard);
                Err(e)
            }
        }
    }

    pub async fn post_comment(
        &self,
        party_id: Uuid,
        author_id: Uuid,
        body: impl Into<String>,
    ) -> Result<Comment, SyncError> {
        let request = NewComment {
            party_id,
            author_id,
            body: non_empty(body.into(), "comment")?,
        };
        self.perform(
            self.cache.comments(),
            party_id,
            || {
                PendingWrite::new(|id, now| Comment {
                    id,
                    party_id,
                    author_id,
                    body: request.body.clone(),
                    created_at: now,
                })
            },
            || self.repo.create(&request),
        )
        .await
    }

    pub async fn post_status(
        &self,
        party_id: Uuid,
        user_id: Uuid,
        body: impl Into<String>,
    ) -> Result<PartyStatus, SyncError> {
        let request = NewStatus {
            party_id,
            user_id,
            body: non_empty(body.into(), "status")?,
        };
        self.perform(
            self.cache.statuses(),
            party_id,
            || {
                PendingWrite::new(|id, now| PartyStatus {
                    id,
                    party_id,
                    user_id,
                    body: request.body.clone(),
                    created_at: now,
                })
            },
            || self.repo.create(&request),
        )
        .await
    }

    /// Vote on a poll. Rejected locally if the option does not exist on a cached poll.
    pub async fn cast_vote(
        &self,
        poll_id: Uuid,
        user_id: Uuid,
        option_index: u32,
    ) -> Result<PollVote, SyncError> {
        if let Some(poll) = self
            .cache
            .poll_party(poll_id)
            .and_then(|party_id| self.cache.polls().find(party_id, poll_id))
        {
            if option_index as usize >= poll.options.len() {
                return Err(SyncError::Write(format!(
                    "poll {} has no option {}",
                    poll_id, option_index
                )));
            }
        }

        let request = NewVote {
            poll_id,
            user_id,
            option_index,
        };
        self.perform(
            self.cache.votes(),
            poll_id,
            || {
                PendingWrite::new(|id, now| PollVote {
                    id,
                    poll_id,
                    user_id,
                    option_index,
                    created_at: now,
                })
            },
            || self.repo.create(&request),
        )
        .await
    }
}

fn non_empty(body: String, what: &str) -> Result<String, SyncError> {
    if body.trim().is_empty() {
        return Err(SyncError::Write(format!("{} body is empty", what)));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;
    use crate::memory::MemoryStore;
    use crate::types::Poll;
    use std::cell::Cell;
    use std::time::Duration;

    fn setup() -> (Arc<SyncCache>, Arc<MemoryStore>, OptimisticWriter) {
        let cache = SyncCache::new(CachePolicy::default());
        let store = MemoryStore::new();
        let writer = OptimisticWriter::new(cache.clone(), Repository::new(store.clone()));
        (cache, store, writer)
    }

    fn comment(id: Uuid, party_id: Uuid, body: &str) -> Comment {
        Comment {
            id,
            party_id,
            author_id: Uuid::new_v4(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    fn ids(list: &[Comment]) -> Vec<Uuid> {
        list.iter().map(|c| c.id).collect()
    }

    #[tokio::test]
    async fn test_success_replaces_local_id_with_server_id() {
        let (cache, _store, writer) = setup();
        let party_id = Uuid::new_v4();
        let existing = comment(Uuid::new_v4(), party_id, "earlier");
        cache.comments().put(party_id, vec![existing.clone()]);
        let y = Uuid::new_v4();
        let x = Cell::new(None);

        let saved = writer
            .perform(
                cache.comments(),
                party_id,
                || {
                    let pending = PendingWrite::new(|id, _| comment(id, party_id, "hi"));
                    x.set(Some(pending.local_id()));
                    pending
                },
                || async {
                    // The pending record is visible while the write is in flight.
                    let list = cache.comments().get(party_id).unwrap();
                    assert_eq!(Some(list[0].id), x.get());
                    Ok(comment(y, party_id, "hi"))
                },
            )
            .await
            .unwrap();

        assert_eq!(saved.id, y);
        let list = cache.comments().get(party_id).unwrap();
        assert_eq!(ids(&list), vec![y, existing.id]);
    }

    #[tokio::test]
    async fn test_failure_leaves_neither_record() {
        let (cache, _store, writer) = setup();
        let party_id = Uuid::new_v4();
        cache.comments().put(party_id, Vec::new());
        let y = Uuid::new_v4();

        let result = writer
            .perform(
                cache.comments(),
                party_id,
                || PendingWrite::new(|id, _| comment(id, party_id, "hi")),
                || async { Err::<Comment, _>(SyncError::Write("offline".into())) },
            )
            .await;

        assert!(matches!(result, Err(SyncError::Write(_))));
        let list = cache.comments().get(party_id).unwrap();
        assert!(list.is_empty());
        assert!(cache.comments().find(party_id, y).is_none());
    }

    #[tokio::test]
    async fn test_feed_event_before_reconcile_is_not_duplicated() {
        let (cache, _store, writer) = setup();
        let party_id = Uuid::new_v4();
        cache.comments().put(party_id, Vec::new());
        let y = Uuid::new_v4();

        writer
            .perform(
                cache.comments(),
                party_id,
                || PendingWrite::new(|id, _| comment(id, party_id, "hi")),
                || async {
                    // The insert event for the persisted row wins the race.
                    cache.comments().append_front(party_id, comment(y, party_id, "hi"));
                    Ok(comment(y, party_id, "hi"))
                },
            )
            .await
            .unwrap();

        assert_eq!(ids(&cache.comments().get(party_id).unwrap()), vec![y]);
    }

    #[tokio::test]
    async fn test_uncached_parent_shows_nothing() {
        let (cache, _store, writer) = setup();
        let party_id = Uuid::new_v4();

        writer
            .perform(
                cache.comments(),
                party_id,
                || PendingWrite::new(|id, _| comment(id, party_id, "hi")),
                || async { Ok(comment(Uuid::new_v4(), party_id, "hi")) },
            )
            .await
            .unwrap();

        assert!(!cache.comments().contains(party_id));
    }

    #[tokio::test]
    async fn test_abandoned_write_is_rolled_back() {
        let (cache, store, writer) = setup();
        let party_id = Uuid::new_v4();
        cache.comments().put(party_id, Vec::new());
        store.set_latency(Duration::from_secs(60));

        let write = writer.post_comment(party_id, Uuid::new_v4(), "slow");
        let timed_out = tokio::time::timeout(Duration::from_millis(20), write).await;

        assert!(timed_out.is_err());
        assert!(cache.comments().get(party_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_comment_against_store() {
        let (cache, store, writer) = setup();
        let party_id = Uuid::new_v4();
        cache.comments().put(party_id, Vec::new());

        let saved = writer
            .post_comment(party_id, Uuid::new_v4(), "see you at 8")
            .await
            .unwrap();
        assert_eq!(cache.comments().get(party_id).unwrap(), vec![saved]);

        store.fail_writes(true);
        let failed = writer.post_status(party_id, Uuid::new_v4(), "late").await;
        assert!(failed.is_err());
        cache.statuses().put(party_id, Vec::new());
        assert!(writer.post_status(party_id, Uuid::new_v4(), "late").await.is_err());
        assert!(cache.statuses().get(party_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_comment_rejected() {
        let (_cache, store, writer) = setup();
        let result = writer.post_comment(Uuid::new_v4(), Uuid::new_v4(), "   ").await;
        assert!(matches!(result, Err(SyncError::Write(_))));
        assert!(store.rows("comments").is_empty());
    }

    #[tokio::test]
    async fn test_vote_out_of_range_rejected_locally() {
        let (cache, store, writer) = setup();
        let party_id = Uuid::new_v4();
        let poll = Poll {
            id: Uuid::new_v4(),
            party_id,
            question: "Theme?".into(),
            options: vec!["80s".into(), "masquerade".into()],
            created_at: Utc::now(),
        };
        cache.put_polls(party_id, vec![poll.clone()]);
        cache.votes().put(poll.id, Vec::new());

        let rejected = writer.cast_vote(poll.id, Uuid::new_v4(), 2).await;
        assert!(matches!(rejected, Err(SyncError::Write(_))));
        assert!(store.rows("poll_votes").is_empty());

        let vote = writer.cast_vote(poll.id, Uuid::new_v4(), 1).await.unwrap();
        assert_eq!(cache.votes().get(poll.id).unwrap(), vec![vote]);
    }
}
