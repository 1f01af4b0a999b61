//! Presence and ephemeral broadcast.
//!
//! Nothing here touches the cache. Online lists and typing indicators are
//! transient state rebuilt from the channel, and every failure is swallowed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::SyncError;
use crate::timing::Throttle;

/// Event name used for typing indicators.
pub const TYPING_EVENT: &str = "typing";

/// What a client announces about itself when joining a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: Uuid,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

impl PresenceMeta {
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            joined_at: Utc::now(),
        }
    }
}

/// A fire-and-forget message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralMessage {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Something that happened on a presence channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EphemeralEvent {
    Join(PresenceMeta),
    Leave { user_id: Uuid },
    Broadcast(EphemeralMessage),
}

/// Transport for presence and broadcasts (the remote store's realtime channel).
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn track(&self, topic: &str, meta: PresenceMeta) -> Result<(), SyncError>;

    async fn untrack(&self, topic: &str, user_id: Uuid) -> Result<(), SyncError>;

    async fn send(&self, topic: &str, message: EphemeralMessage) -> Result<(), SyncError>;

    /// Events for a topic, starting with a join for everyone already present.
    async fn events(&self, topic: &str) -> Result<BoxStream<'static, EphemeralEvent>, SyncError>;
}

/// Change notification for presence observers.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub topic: String,
    pub change: PresenceChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    /// The online count changed.
    Online(usize),
    /// Someone started typing.
    Typing(Uuid),
    /// Any other broadcast.
    Message(EphemeralMessage),
}

#[derive(Default)]
struct RoomState {
    online: DashMap<Uuid, PresenceMeta>,
    typing: DashMap<Uuid, Instant>,
}

struct Room {
    me: PresenceMeta,
    state: Arc<RoomState>,
    typing_throttle: Throttle,
    listener: JoinHandle<()>,
}

/// Tracks presence for every joined topic.
pub struct PresenceHub {
    channel: Arc<dyn PresenceChannel>,
    rooms: DashMap<String, Room>,
    typing_throttle: Duration,
    typing_expiry: Duration,
    updates_tx: broadcast::Sender<PresenceUpdate>,
}

impl PresenceHub {
    pub fn new(
        channel: Arc<dyn PresenceChannel>,
        typing_throttle: Duration,
        typing_expiry: Duration,
        capacity: usize,
    ) -> Self {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            channel,
            rooms: DashMap::new(),
            typing_throttle,
            typing_expiry,
            updates_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.updates_tx.subscribe()
    }

    /// Announce presence on a topic. Joining again replaces the previous join.
    pub async fn join(&self, topic: &str, me: PresenceMeta) {
        self.leave(topic).await;

        let events = match self.channel.events(topic).await {
            Ok(events) => events,
            Err(e) => {
                debug!(target: "huddle::realtime", topic, error = %e, "presence join failed");
                return;
            }
        };
        if let Err(e) = self.channel.track(topic, me.clone()).await {
            debug!(target: "huddle::realtime", topic, error = %e, "presence track failed");
        }

        let state = Arc::new(RoomState::default());
        state.online.insert(me.user_id, me.clone());
        let listener = tokio::spawn(run_room(
            topic.to_string(),
            me.user_id,
            events,
            state.clone(),
            self.updates_tx.clone(),
        ));

        self.rooms.insert(
            topic.to_string(),
            Room {
                me,
                state,
                typing_throttle: Throttle::new(self.typing_throttle),
                listener,
            },
        );
        trace!(target: "huddle::realtime", topic, "joined presence");
    }

    /// Retract presence from a topic. No-op when not joined.
    pub async fn leave(&self, topic: &str) {
        let Some((_, room)) = self.rooms.remove(topic) else {
            return;
        };
        room.listener.abort();
        if let Err(e) = self.channel.untrack(topic, room.me.user_id).await {
            debug!(target: "huddle::realtime", topic, error = %e, "presence untrack failed");
        }
        trace!(target: "huddle::realtime", topic, "left presence");
    }

    pub async fn leave_all(&self) {
        let topics: Vec<String> = self.rooms.iter().map(|r| r.key().clone()).collect();
        for topic in topics {
            self.leave(&topic).await;
        }
    }

    pub fn is_joined(&self, topic: &str) -> bool {
        self.rooms.contains_key(topic)
    }

    /// Send a message to everyone on the topic. No acknowledgement, no retry.
    pub async fn broadcast(&self, topic: &str, event: &str, payload: serde_json::Value) {
        let message = EphemeralMessage {
            event: event.to_string(),
            payload,
        };
        if let Err(e) = self.channel.send(topic, message).await {
            debug!(target: "huddle::realtime", topic, event, error = %e, "broadcast dropped");
        }
    }

    /// Tell the topic we are typing, at most once per throttle interval.
    ///
    /// Returns whether a broadcast went out.
    pub async fn notify_typing(&self, topic: &str) -> bool {
        let user_id = match self.rooms.get(topic) {
            Some(room) if room.typing_throttle.claim() => room.me.user_id,
            _ => return false,
        };
        self.broadcast(topic, TYPING_EVENT, serde_json::json!({ "user_id": user_id }))
            .await;
        true
    }

    /// Everyone currently on a topic, including us.
    pub fn online(&self, topic: &str) -> Vec<PresenceMeta> {
        let Some(room) = self.rooms.get(topic) else {
            return Vec::new();
        };
        let mut members: Vec<_> = room.state.online.iter().map(|m| m.value().clone()).collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.username.cmp(&b.username)));
        members
    }

    pub fn online_count(&self, topic: &str) -> usize {
        self.rooms
            .get(topic)
            .map(|room| room.state.online.len())
            .unwrap_or(0)
    }

    /// Users with a typing indicator younger than the expiry.
    pub fn typing(&self, topic: &str) -> Vec<Uuid> {
        let Some(room) = self.rooms.get(topic) else {
            return Vec::new();
        };
        let expiry = self.typing_expiry;
        room.state.typing.retain(|_, at| at.elapsed() < expiry);
        room.state.typing.iter().map(|entry| *entry.key()).collect()
    }
}

impl Drop for PresenceHub {
    fn drop(&mut self) {
        for room in self.rooms.iter() {
            room.listener.abort();
        }
    }
}

async fn run_room(
    topic: String,
    me: Uuid,
    mut events: BoxStream<'static, EphemeralEvent>,
    state: Arc<RoomState>,
    updates_tx: broadcast::Sender<PresenceUpdate>,
) {
    let notify = |change: PresenceChange| {
        let _ = updates_tx.send(PresenceUpdate {
            topic: topic.clone(),
            change,
        });
    };

    while let Some(event) = events.next().await {
        match event {
            EphemeralEvent::Join(meta) => {
                state.online.insert(meta.user_id, meta);
                notify(PresenceChange::Online(state.online.len()));
            }
            EphemeralEvent::Leave { user_id } => {
                state.online.remove(&user_id);
                state.typing.remove(&user_id);
                notify(PresenceChange::Online(state.online.len()));
            }
            EphemeralEvent::Broadcast(message) if message.event == TYPING_EVENT => {
                let Some(user_id) = typing_user(&message.payload) else {
                    trace!(
                        target: "huddle::realtime",
                        topic = %topic,
                        "ignoring malformed typing event"
                    );
                    continue;
                };
                if user_id != me {
                    state.typing.insert(user_id, Instant::now());
                    notify(PresenceChange::Typing(user_id));
                }
            }
            EphemeralEvent::Broadcast(message) => notify(PresenceChange::Message(message)),
        }
    }
    trace!(target: "huddle::realtime", topic = %topic, "presence stream ended");
}

fn typing_user(payload: &serde_json::Value) -> Option<Uuid> {
    payload.get("user_id")?.as_str()?.parse().ok()
}
