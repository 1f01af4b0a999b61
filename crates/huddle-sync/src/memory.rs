//! In-process collaborators: a JSON row store and a change/presence feed.
//!
//! Used by tests and by `huddle simulate`. The store behaves like the remote
//! one where it matters: it assigns its own ids and timestamps and publishes
//! every write to the feed.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::SyncError;
use crate::feed::{ChangeAction, ChangeSource, ChangeStream, RawChange, StreamSpec};
use crate::presence::{EphemeralEvent, EphemeralMessage, PresenceChannel, PresenceMeta};
use crate::store::{Query, RemoteStore};

const FEED_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
enum FeedMessage {
    Change(RawChange),
    Error { topic: String, message: String },
}

/// In-process change and presence feed.
pub struct LocalFeed {
    changes: broadcast::Sender<FeedMessage>,
    presence: broadcast::Sender<(String, EphemeralEvent)>,
    /// Open stream count per topic channel.
    channels: DashMap<String, usize>,
    members: DashMap<String, Vec<PresenceMeta>>,
    fail_opens: AtomicBool,
    fail_broadcasts: AtomicBool,
}

impl LocalFeed {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        let (presence, _) = broadcast::channel(FEED_CAPACITY);
        Arc::new(Self {
            changes,
            presence,
            channels: DashMap::new(),
            members: DashMap::new(),
            fail_opens: AtomicBool::new(false),
            fail_broadcasts: AtomicBool::new(false),
        })
    }

    /// Push a change to every open stream it matches. Returns the receiver count.
    pub fn publish(&self, change: RawChange) -> usize {
        trace!(
            target: "huddle::realtime",
            table = %change.table,
            action = ?change.change_type,
            "publishing change"
        );
        self.changes.send(FeedMessage::Change(change)).unwrap_or(0)
    }

    /// Fail every stream open under `topic`.
    pub fn inject_error(&self, topic: &str, message: &str) {
        let _ = self.changes.send(FeedMessage::Error {
            topic: topic.to_string(),
            message: message.to_string(),
        });
    }

    /// Make subsequent `open` calls fail.
    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent broadcasts fail.
    pub fn fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }

    /// Streams opened under a topic and not yet released.
    pub fn open_streams(&self, topic: &str) -> usize {
        self.channels.get(topic).map(|count| *count).unwrap_or(0)
    }

    pub fn is_open(&self, topic: &str) -> bool {
        self.open_streams(topic) > 0
    }
}

#[async_trait]
impl ChangeSource for LocalFeed {
    async fn open(&self, topic: &str, spec: &StreamSpec) -> Result<ChangeStream, SyncError> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(SyncError::Stream(format!("channel {} refused", topic)));
        }
        *self.channels.entry(topic.to_string()).or_insert(0) += 1;

        let topic = topic.to_string();
        let spec = spec.clone();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |message| {
            let item = match message {
                Ok(FeedMessage::Change(change)) if spec.matches(&change) => Some(Ok(change)),
                Ok(FeedMessage::Change(_)) => None,
                Ok(FeedMessage::Error { topic: target, message }) if target == topic => {
                    Some(Err(SyncError::Stream(message)))
                }
                Ok(FeedMessage::Error { .. }) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(SyncError::Stream(
                    format!("listener lagged, {} changes skipped", skipped),
                ))),
            };
            async move { item }
        });
        Ok(stream.boxed())
    }

    async fn release(&self, topic: &str) {
        if self.channels.remove(topic).is_some() {
            debug!(target: "huddle::realtime", topic, "channel released");
        }
    }
}

#[async_trait]
impl PresenceChannel for LocalFeed {
    async fn track(&self, topic: &str, meta: PresenceMeta) -> Result<(), SyncError> {
        {
            let mut members = self.members.entry(topic.to_string()).or_default();
            members.retain(|m| m.user_id != meta.user_id);
            members.push(meta.clone());
        }
        let _ = self
            .presence
            .send((topic.to_string(), EphemeralEvent::Join(meta)));
        Ok(())
    }

    async fn untrack(&self, topic: &str, user_id: Uuid) -> Result<(), SyncError> {
        if let Some(mut members) = self.members.get_mut(topic) {
            members.retain(|m| m.user_id != user_id);
        }
        let _ = self
            .presence
            .send((topic.to_string(), EphemeralEvent::Leave { user_id }));
        Ok(())
    }

    async fn send(&self, topic: &str, message: EphemeralMessage) -> Result<(), SyncError> {
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(SyncError::Stream("broadcast refused".to_string()));
        }
        let _ = self
            .presence
            .send((topic.to_string(), EphemeralEvent::Broadcast(message)));
        Ok(())
    }

    async fn events(&self, topic: &str) -> Result<BoxStream<'static, EphemeralEvent>, SyncError> {
        // Subscribe before taking the snapshot so no join falls in between.
        let live = BroadcastStream::new(self.presence.subscribe());
        let present: Vec<_> = self
            .members
            .get(topic)
            .map(|members| members.iter().cloned().map(EphemeralEvent::Join).collect())
            .unwrap_or_default();

        let topic = topic.to_string();
        let live = live.filter_map(move |message| {
            let item = match message {
                Ok((target, event)) if target == topic => Some(event),
                _ => None,
            };
            async move { item }
        });
        Ok(stream::iter(present).chain(live).boxed())
    }
}

/// In-process row store.
pub struct MemoryStore {
    tables: DashMap<String, Vec<Value>>,
    feed: Option<Arc<LocalFeed>>,
    fail_writes: AtomicBool,
    latency_ms: AtomicU64,
    selects: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// A store that publishes every write to `feed`.
    pub fn with_feed(feed: Arc<LocalFeed>) -> Arc<Self> {
        Arc::new(Self::build(Some(feed)))
    }

    fn build(feed: Option<Arc<LocalFeed>>) -> Self {
        Self {
            tables: DashMap::new(),
            feed,
            fail_writes: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            selects: AtomicUsize::new(0),
        }
    }

    /// Insert a row directly, without publishing a change.
    pub fn seed<T: Serialize>(&self, table: &str, record: &T) -> Result<(), SyncError> {
        let row = serde_json::to_value(record)?;
        self.tables.entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    /// Make subsequent writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of selects served so far.
    pub fn select_count(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Write("rejected by store".to_string()));
        }
        Ok(())
    }

    fn publish(&self, table: &str, action: ChangeAction, row: &Value) {
        if let Some(feed) = &self.feed {
            feed.publish(RawChange::new(table, action, row.clone()));
        }
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_id(row: &Value) -> Option<Uuid> {
    row.get("id")?.as_str()?.parse().ok()
}

fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (a.parse::<DateTime<Utc>>(), b.parse::<DateTime<Utc>>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, SyncError> {
        self.simulate_latency().await;
        self.selects.fetch_add(1, Ordering::SeqCst);

        let mut rows: Vec<Value> = self
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_cells(a.get(&order.column), b.get(&order.column));
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Value) -> Result<Value, SyncError> {
        self.simulate_latency().await;
        self.check_writable()?;

        let Value::Object(fields) = &mut row else {
            return Err(SyncError::Write(format!("{} row must be an object", table)));
        };
        fields.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(now_text()));

        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        self.publish(table, ChangeAction::Insert, &row);
        Ok(row)
    }

    async fn update(&self, table: &str, id: Uuid, patch: Value) -> Result<Value, SyncError> {
        self.simulate_latency().await;
        self.check_writable()?;

        let Value::Object(patch) = patch else {
            return Err(SyncError::Write(format!("{} patch must be an object", table)));
        };
        let updated = {
            let mut rows = self.tables.get_mut(table).ok_or_else(|| SyncError::NotFound {
                table: table.to_string(),
                id,
            })?;
            let row = rows
                .iter_mut()
                .find(|row| row_id(row) == Some(id))
                .ok_or_else(|| SyncError::NotFound {
                    table: table.to_string(),
                    id,
                })?;
            if let Value::Object(fields) = row {
                fields.extend(patch);
                fields.insert("updated_at".to_string(), Value::String(now_text()));
            }
            row.clone()
        };
        self.publish(table, ChangeAction::Update, &updated);
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), SyncError> {
        self.simulate_latency().await;
        self.check_writable()?;

        let removed = {
            let mut rows = self.tables.get_mut(table).ok_or_else(|| SyncError::NotFound {
                table: table.to_string(),
                id,
            })?;
            let index = rows
                .iter()
                .position(|row| row_id(row) == Some(id))
                .ok_or_else(|| SyncError::NotFound {
                    table: table.to_string(),
                    id,
                })?;
            rows.remove(index)
        };
        self.publish(table, ChangeAction::Delete, &removed);
        Ok(())
    }
}
