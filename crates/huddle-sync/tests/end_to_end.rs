//! End-to-end flows through the public API, backed by the in-process store and feed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use huddle_sync::topics::party_topic;
use huddle_sync::{
    COMMENTS_TABLE, ChangeAction, Comment, ConnectionState, EntityKind, HuddleSync,
    HuddleSyncBuilder, LocalFeed, MemoryStore, Party, RawChange, SyncConfig, SyncError, TopicKey,
    UpdateKind,
};

fn party(title: &str) -> Party {
    Party {
        id: Uuid::new_v4(),
        host_id: Uuid::new_v4(),
        title: title.into(),
        description: Some("Bring a dish".into()),
        location: Some("Community hall".into()),
        starts_at: Utc::now() + ChronoDuration::days(2),
        ends_at: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}

fn comment(party_id: Uuid, body: &str) -> Comment {
    Comment {
        id: Uuid::new_v4(),
        party_id,
        author_id: Uuid::new_v4(),
        body: body.into(),
        created_at: Utc::now(),
    }
}

fn inserted(comment: &Comment) -> RawChange {
    RawChange::new(
        COMMENTS_TABLE,
        ChangeAction::Insert,
        serde_json::to_value(comment).unwrap(),
    )
}

fn ids(comments: &[Comment]) -> Vec<Uuid> {
    comments.iter().map(|c| c.id).collect()
}

fn setup() -> (HuddleSync, Arc<MemoryStore>, Arc<LocalFeed>) {
    let feed = LocalFeed::new();
    let store = MemoryStore::with_feed(feed.clone());
    let sync = HuddleSyncBuilder::new(store.clone(), feed.clone(), feed.clone())
        .config(SyncConfig::default())
        .build();
    (sync, store, feed)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

#[tokio::test]
async fn test_fetch_subscribe_apply_unsubscribe() {
    let (sync, store, feed) = setup();
    let p1 = party("Midsummer");
    let older = comment(p1.id, "can't wait");
    store.seed("parties", &p1).unwrap();
    store.seed("comments", &older).unwrap();

    // Cache miss goes to the store, then the party is cached.
    assert!(sync.cache().parties().get(p1.id).is_none());
    assert_eq!(sync.load_party(p1.id).await.unwrap(), p1);
    assert_eq!(sync.cache().parties().get(p1.id), Some(p1.clone()));

    sync.open_party(p1.id).await.unwrap();
    assert_eq!(sync.connection_status().state, ConnectionState::Connected);
    assert_eq!(ids(&sync.party_comments(p1.id).await.unwrap()), vec![older.id]);

    let newer = comment(p1.id, "on my way");
    feed.publish(inserted(&newer));
    wait_until(|| {
        sync.cache()
            .comments()
            .get(p1.id)
            .is_some_and(|list| list.len() == 2)
    })
    .await;
    let list = sync.cache().comments().get(p1.id).unwrap();
    assert_eq!(ids(&list), vec![newer.id, older.id]);

    sync.close_party(p1.id).await;
    assert_eq!(sync.connection_status().state, ConnectionState::Disconnected);

    feed.publish(inserted(&comment(p1.id, "too late")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sync.cache().comments().get(p1.id).unwrap(), list);
}

#[tokio::test(start_paused = true)]
async fn test_party_cache_expires_after_its_lifetime() {
    let (sync, store, _feed) = setup();
    let p1 = party("Garden party");
    store.seed("parties", &p1).unwrap();

    sync.load_party(p1.id).await.unwrap();
    tokio::time::advance(Duration::from_secs(59)).await;
    sync.load_party(p1.id).await.unwrap();
    assert_eq!(store.select_count(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(sync.cache().parties().get(p1.id).is_none());
    sync.load_party(p1.id).await.unwrap();
    assert_eq!(store.select_count(), 2);
}

#[tokio::test]
async fn test_double_subscribe_dispatches_once() {
    let (sync, store, feed) = setup();
    let p1 = party("Game night");
    store.seed("parties", &p1).unwrap();
    sync.party_comments(p1.id).await.unwrap();

    let topic = TopicKey::party(p1.id);
    sync.subscriptions()
        .subscribe(party_topic(sync.cache(), p1.id))
        .await
        .unwrap();
    let streams = feed.open_streams(topic.as_str());
    sync.subscriptions()
        .subscribe(party_topic(sync.cache(), p1.id))
        .await
        .unwrap();
    assert_eq!(feed.open_streams(topic.as_str()), streams);
    assert_eq!(sync.subscriptions().active_topics(), vec![topic]);

    let mut updates = sync.cache_updates();
    let c = comment(p1.id, "first!");
    feed.publish(inserted(&c));
    wait_until(|| sync.cache().comments().find(p1.id, c.id).is_some()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut inserts = 0;
    while let Ok(update) = updates.try_recv() {
        if update.kind == EntityKind::Comments && update.change == UpdateKind::Inserted {
            inserts += 1;
        }
    }
    assert_eq!(inserts, 1);
}

#[tokio::test]
async fn test_optimistic_comment_confirmed() {
    let (sync, store, _feed) = setup();
    let p1 = party("Book club");
    store.seed("parties", &p1).unwrap();
    sync.open_party(p1.id).await.unwrap();

    let saved = sync
        .post_comment(p1.id, Uuid::new_v4(), "I'll bring snacks")
        .await
        .unwrap();

    // The store's echo may land before or after the reply; either way one copy remains.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let list = sync.cache().comments().get(p1.id).unwrap();
    assert_eq!(ids(&list), vec![saved.id]);
    assert_eq!(list[0].body, "I'll bring snacks");
    assert_eq!(store.rows("comments").len(), 1);
}

#[tokio::test]
async fn test_optimistic_comment_rolled_back() {
    let (sync, store, _feed) = setup();
    let p1 = party("Book club");
    let existing = comment(p1.id, "chapter 3?");
    store.seed("parties", &p1).unwrap();
    store.seed("comments", &existing).unwrap();
    sync.open_party(p1.id).await.unwrap();

    store.fail_writes(true);
    let result = sync.post_comment(p1.id, Uuid::new_v4(), "never lands").await;

    assert!(matches!(result, Err(SyncError::Write(_))));
    assert_eq!(
        ids(&sync.cache().comments().get(p1.id).unwrap()),
        vec![existing.id]
    );
}

#[tokio::test]
async fn test_no_writes_after_unsubscribe_returns() {
    let (sync, store, feed) = setup();
    let p1 = party("Launch party");
    store.seed("parties", &p1).unwrap();
    sync.open_party(p1.id).await.unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let publisher = {
        let feed = feed.clone();
        let running = running.clone();
        let party_id = p1.id;
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                feed.publish(inserted(&comment(party_id, "spam")));
                tokio::task::yield_now().await;
            }
        })
    };

    wait_until(|| {
        sync.cache()
            .comments()
            .get(p1.id)
            .is_some_and(|list| list.len() >= 10)
    })
    .await;
    sync.close_party(p1.id).await;
    let snapshot = sync.cache().comments().get(p1.id).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    running.store(false, Ordering::SeqCst);
    publisher.await.unwrap();

    assert_eq!(sync.cache().comments().get(p1.id).unwrap(), snapshot);
}

#[tokio::test]
async fn test_stream_error_reports_disconnected() {
    let (sync, store, feed) = setup();
    let p1 = party("Pool day");
    store.seed("parties", &p1).unwrap();
    sync.open_party(p1.id).await.unwrap();
    let mut connection = sync.watch_connection();

    feed.inject_error(TopicKey::party(p1.id).as_str(), "socket closed");
    connection
        .wait_for(|status| status.state == ConnectionState::Disconnected)
        .await
        .unwrap();

    let status = sync.connection_status();
    assert_eq!(status.error.as_deref(), Some("change stream error: socket closed"));

    // Resubscribing recovers the topic.
    sync.open_party(p1.id).await.unwrap();
    assert_eq!(sync.connection_status().state, ConnectionState::Connected);
}
