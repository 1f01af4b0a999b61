//! Simulate command: one party's lifecycle against in-process collaborators.
//!
//! Fetches a party on a cold cache, opens its live topic, publishes comments
//! through the feed, closes the topic and checks that later changes no longer
//! reach the cache.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use miette::Result;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_sync::{
    COMMENTS_TABLE, ChangeAction, Comment, HuddleSyncBuilder, LocalFeed, MemoryStore, Party,
    RawChange, SyncConfig,
};

/// How long to wait for a published change to land in the cache.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(config: SyncConfig, comments: usize, print_updates: bool) -> Result<()> {
    let feed = LocalFeed::new();
    let store = MemoryStore::with_feed(feed.clone());
    let sync = HuddleSyncBuilder::new(store.clone(), feed.clone(), feed.clone())
        .config(config)
        .build();

    let party = Party {
        id: Uuid::new_v4(),
        host_id: Uuid::new_v4(),
        title: "Rooftop social".to_string(),
        description: Some("Bring a friend".to_string()),
        location: Some("Building C roof".to_string()),
        starts_at: Utc::now() + ChronoDuration::days(1),
        ends_at: None,
        created_at: Utc::now(),
        updated_at: None,
    };
    store
        .seed("parties", &party)
        .map_err(|e| miette::miette!("failed to seed party: {}", e))?;

    let printer = print_updates.then(|| {
        let mut updates = sync.cache_updates();
        tokio::spawn(async move {
            while let Ok(update) = updates.recv().await {
                println!("{:?} {:?} {:?}", update.kind, update.change, update.key);
            }
        })
    });

    // 1. Cold fetch.
    let fetched = sync
        .load_party(party.id)
        .await
        .map_err(|e| miette::miette!("failed to load party: {}", e))?;
    info!(
        party_id = %fetched.id,
        ttl_secs = sync.config().cache.party_ttl_secs,
        "party fetched and cached"
    );

    // 2. Attach the live topic.
    sync.open_party(party.id)
        .await
        .map_err(|e| miette::miette!("failed to open party: {}", e))?;
    info!(party_id = %party.id, state = ?sync.connection_status().state, "party topic attached");

    // 3. Live comments land at the front of the list.
    for n in 0..comments {
        let comment = Comment {
            id: Uuid::new_v4(),
            party_id: party.id,
            author_id: Uuid::new_v4(),
            body: format!("live comment #{}", n + 1),
            created_at: Utc::now(),
        };
        publish_comment(&feed, &comment)?;

        let landed = settle(|| {
            sync.cache()
                .comments()
                .get(party.id)
                .is_some_and(|list| list.first().map(|c| c.id) == Some(comment.id))
        })
        .await;
        if !landed {
            return Err(miette::miette!("comment {} never reached the cache", comment.id));
        }
        info!(comment_id = %comment.id, "comment applied at index 0");
    }

    // 4. Detach; later changes must not reach the cache.
    sync.close_party(party.id).await;
    let before = sync.cache().comments().get(party.id);
    info!(party_id = %party.id, "party topic detached");

    let straggler = Comment {
        id: Uuid::new_v4(),
        party_id: party.id,
        author_id: Uuid::new_v4(),
        body: "after close".to_string(),
        created_at: Utc::now(),
    };
    publish_comment(&feed, &straggler)?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    if sync.cache().comments().get(party.id) != before {
        return Err(miette::miette!("cache changed after the topic was detached"));
    }
    info!(
        comments = before.map(|list| list.len()).unwrap_or(0),
        "cache unchanged after detach"
    );

    sync.shutdown().await;
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

fn publish_comment(feed: &LocalFeed, comment: &Comment) -> Result<()> {
    let row = serde_json::to_value(comment)
        .map_err(|e| miette::miette!("failed to encode comment: {}", e))?;
    if feed.publish(RawChange::new(COMMENTS_TABLE, ChangeAction::Insert, row)) == 0 {
        warn!(comment_id = %comment.id, "no open streams received the change");
    }
    Ok(())
}

/// Poll `condition` until it holds or the settle timeout passes.
async fn settle(mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
