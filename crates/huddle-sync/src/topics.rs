//! Topic wiring: which streams a topic listens to and how each lands in the cache.

use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use crate::cache::{CachedList, SyncCache};
use crate::feed::{ChangeAction, ChangeEvent, StreamSpec};
use crate::subscription::{TopicKey, TopicSpec};
use crate::types::{
    COMMENTS_TABLE, ChildRecord, Comment, MEDIA_TABLE, MediaItem, NOTIFICATIONS_TABLE,
    Notification, PARTIES_TABLE, POLLS_TABLE, Party, PartyStatus, Poll, PollVote, STATUSES_TABLE,
    VOTES_TABLE,
};

/// Route child-record changes into a list cache, ignoring records of other parents.
fn list_handler<T: ChildRecord>(
    cache: &Arc<SyncCache>,
    parent_id: Uuid,
    list: fn(&SyncCache) -> &CachedList<T>,
) -> impl Fn(ChangeEvent<T>) + Send + Sync + 'static {
    let cache = cache.clone();
    move |event: ChangeEvent<T>| {
        if event.record.parent_id() != parent_id {
            trace!(
                target: "huddle::realtime",
                table = T::TABLE,
                "ignoring change for another parent"
            );
            return;
        }
        list(&cache).apply(parent_id, event);
    }
}

/// Everything live about one party: the row itself, its comments, statuses,
/// media, polls and the votes on those polls.
///
/// The votes stream cannot be filtered by party at the source, so votes are
/// checked against the polls known locally. Votes for a poll that has not
/// been loaded are discarded; the vote list is fetched with the poll.
pub fn party_topic(cache: &Arc<SyncCache>, party_id: Uuid) -> TopicSpec {
    let party_cache = cache.clone();
    let poll_cache = cache.clone();
    let vote_cache = cache.clone();

    TopicSpec::new(TopicKey::party(party_id))
        .bind::<Party, _>(
            StreamSpec::filtered(PARTIES_TABLE, "id", party_id),
            move |event: ChangeEvent<Party>| party_cache.apply_party_change(event),
        )
        .bind::<Comment, _>(
            StreamSpec::filtered(COMMENTS_TABLE, "party_id", party_id),
            list_handler(cache, party_id, SyncCache::comments),
        )
        .bind::<PartyStatus, _>(
            StreamSpec::filtered(STATUSES_TABLE, "party_id", party_id),
            list_handler(cache, party_id, SyncCache::statuses),
        )
        .bind::<MediaItem, _>(
            StreamSpec::filtered(MEDIA_TABLE, "party_id", party_id),
            list_handler(cache, party_id, SyncCache::media),
        )
        .bind::<Poll, _>(
            StreamSpec::filtered(POLLS_TABLE, "party_id", party_id),
            move |event: ChangeEvent<Poll>| {
                if event.record.party_id != party_id {
                    return;
                }
                if event.action != ChangeAction::Delete {
                    poll_cache.index_polls(std::slice::from_ref(&event.record));
                }
                poll_cache.polls().apply(party_id, event);
            },
        )
        .bind::<PollVote, _>(
            StreamSpec::table(VOTES_TABLE),
            move |event: ChangeEvent<PollVote>| {
                let poll_id = event.record.poll_id;
                if vote_cache.poll_party(poll_id) != Some(party_id) {
                    trace!(
                        target: "huddle::realtime",
                        %poll_id,
                        "discarding vote for untracked poll"
                    );
                    return;
                }
                vote_cache.votes().apply(poll_id, event);
            },
        )
}

/// A user's notification inbox.
pub fn notifications_topic(cache: &Arc<SyncCache>, user_id: Uuid) -> TopicSpec {
    TopicSpec::new(TopicKey::notifications(user_id)).bind::<Notification, _>(
        StreamSpec::filtered(NOTIFICATIONS_TABLE, "user_id", user_id),
        list_handler(cache, user_id, SyncCache::notifications),
    )
}
