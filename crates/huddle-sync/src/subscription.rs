//! Change-feed subscription manager.
//!
//! A topic multiplexes several filtered change streams for one entity. Each
//! stream gets its own listener task that decodes payloads and hands them to
//! the caller's handler. Topics are replaced, never duplicated, on
//! re-subscribe, and cancelled listeners drop whatever event they were holding.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::feed::{ChangeEvent, ChangeSource, ChangeStream, RawChange, StreamSpec};
use crate::types::Record;

/// Identifies a topic, e.g. `party:<id>` or `notifications:<user id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(String);

impl TopicKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn party(party_id: Uuid) -> Self {
        Self(format!("party:{}", party_id))
    }

    pub fn notifications(user_id: Uuid) -> Self {
        Self(format!("notifications:{}", user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TopicState {
    Unsubscribed = 0,
    Subscribing = 1,
    Active = 2,
    Unsubscribing = 3,
    /// A stream failed. The topic stays down until subscribed again.
    Disconnected = 4,
}

impl TopicState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TopicState::Subscribing,
            2 => TopicState::Active,
            3 => TopicState::Unsubscribing,
            4 => TopicState::Disconnected,
            _ => TopicState::Unsubscribed,
        }
    }
}

/// Overall connectivity across all topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity plus the last stream error, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
}

/// Receives decoded changes for one stream.
pub trait ChangeHandler<T>: Send + Sync + 'static {
    fn on_change(&self, event: ChangeEvent<T>);
}

impl<T, F> ChangeHandler<T> for F
where
    F: Fn(ChangeEvent<T>) + Send + Sync + 'static,
{
    fn on_change(&self, event: ChangeEvent<T>) {
        self(event)
    }
}

type Dispatch = Arc<dyn Fn(&RawChange) -> Result<(), SyncError> + Send + Sync>;

/// A stream plus the typed handler its changes go to.
pub struct StreamBinding {
    spec: StreamSpec,
    dispatch: Dispatch,
}

impl StreamBinding {
    pub fn new<T, H>(spec: StreamSpec, handler: H) -> Self
    where
        T: Record,
        H: ChangeHandler<T>,
    {
        let dispatch: Dispatch = Arc::new(move |raw: &RawChange| {
            let event = raw.decode::<T>()?;
            handler.on_change(event);
            Ok(())
        });
        Self { spec, dispatch }
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }
}

impl std::fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBinding")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Everything needed to subscribe a topic.
#[derive(Debug)]
pub struct TopicSpec {
    pub key: TopicKey,
    pub bindings: Vec<StreamBinding>,
}

impl TopicSpec {
    pub fn new(key: TopicKey) -> Self {
        Self {
            key,
            bindings: Vec::new(),
        }
    }

    /// Add a stream and its handler.
    pub fn bind<T, H>(mut self, spec: StreamSpec, handler: H) -> Self
    where
        T: Record,
        H: ChangeHandler<T>,
    {
        self.bindings.push(StreamBinding::new::<T, H>(spec, handler));
        self
    }
}

struct TopicHandle {
    state: Arc<AtomicU8>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
}

/// Topic states shared with the listeners, and the connection status derived from them.
struct Connectivity {
    states: DashMap<TopicKey, Arc<AtomicU8>>,
    /// Last stream error of each `Disconnected` topic.
    errors: DashMap<TopicKey, String>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Connectivity {
    fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            states: DashMap::new(),
            errors: DashMap::new(),
            status_tx,
        }
    }

    /// Record a stream failure for `key` and recompute the status.
    fn fail(&self, key: &TopicKey, state: &AtomicU8, reason: String) {
        self.errors.insert(key.clone(), reason);
        state.store(TopicState::Disconnected as u8, Ordering::Release);
        self.refresh();
    }

    /// Forget a topic that has been torn down.
    fn forget(&self, key: &TopicKey) {
        self.states.remove(key);
        self.errors.remove(key);
        self.refresh();
    }

    /// Recompute the status from every topic.
    ///
    /// Any `Disconnected` topic makes the whole connection `Disconnected`,
    /// carrying that topic's error. `Connected` needs every topic `Active`.
    fn refresh(&self) {
        // Runs under the channel's write lock so concurrent refreshes apply in order.
        self.status_tx.send_if_modified(|status| {
            let next = self.derive();
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
    }

    fn derive(&self) -> ConnectionStatus {
        let mut failed: Option<TopicKey> = None;
        let mut pending = false;
        let mut live = 0;
        for entry in self.states.iter() {
            match TopicState::from_u8(entry.value().load(Ordering::Acquire)) {
                TopicState::Disconnected => {
                    if failed.as_ref().is_none_or(|first| entry.key() < first) {
                        failed = Some(entry.key().clone());
                    }
                }
                TopicState::Subscribing => pending = true,
                TopicState::Active => {}
                TopicState::Unsubscribing | TopicState::Unsubscribed => continue,
            }
            live += 1;
        }

        if let Some(key) = failed {
            let error = self.errors.get(&key).map(|reason| reason.clone());
            return ConnectionStatus {
                state: ConnectionState::Disconnected,
                error,
            };
        }
        let state = match (pending, live) {
            (true, _) => ConnectionState::Connecting,
            (false, 0) => ConnectionState::Disconnected,
            (false, _) => ConnectionState::Connected,
        };
        ConnectionStatus { state, error: None }
    }
}

/// Owns every live topic and its listener tasks.
pub struct SubscriptionManager {
    source: Arc<dyn ChangeSource>,
    /// Serializes subscribe/unsubscribe.
    topics: Mutex<HashMap<TopicKey, TopicHandle>>,
    /// Lock-free view of topic states for readers and listeners.
    connectivity: Arc<Connectivity>,
}

impl SubscriptionManager {
    pub fn new(source: Arc<dyn ChangeSource>) -> Self {
        Self {
            source,
            topics: Mutex::new(HashMap::new()),
            connectivity: Arc::new(Connectivity::new()),
        }
    }

    /// Subscribe a topic, replacing any live subscription under the same key.
    ///
    /// The previous listeners are cancelled and awaited before the new ones
    /// start, so one event is never dispatched twice.
    pub async fn subscribe(&self, spec: TopicSpec) -> Result<(), SyncError> {
        let TopicSpec { key, bindings } = spec;
        let mut topics = self.topics.lock().await;

        if let Some(existing) = topics.remove(&key) {
            debug!(target: "huddle::realtime", topic = %key, "replacing existing subscription");
            self.teardown(&key, existing).await;
        }

        let state = Arc::new(AtomicU8::new(TopicState::Subscribing as u8));
        self.connectivity.states.insert(key.clone(), state.clone());
        self.connectivity.refresh();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut listeners = Vec::with_capacity(bindings.len());

        for binding in bindings {
            match self.source.open(key.as_str(), &binding.spec).await {
                Ok(stream) => {
                    debug!(
                        target: "huddle::realtime",
                        topic = %key,
                        stream = %binding.spec,
                        "stream opened"
                    );
                    listeners.push(tokio::spawn(listen(
                        key.clone(),
                        binding,
                        stream,
                        shutdown_rx.clone(),
                        state.clone(),
                        self.connectivity.clone(),
                    )));
                }
                Err(e) => {
                    warn!(
                        target: "huddle::realtime",
                        topic = %key,
                        stream = %binding.spec,
                        error = %e,
                        "failed to open stream"
                    );
                    let _ = shutdown_tx.send(true);
                    for listener in listeners {
                        let _ = listener.await;
                    }
                    self.source.release(key.as_str()).await;
                    self.connectivity.forget(&key);
                    return Err(SyncError::Subscription {
                        topic: key.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // A listener may already have failed; keep Disconnected in that case.
        let _ = state.compare_exchange(
            TopicState::Subscribing as u8,
            TopicState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.connectivity.refresh();

        info!(target: "huddle::realtime", topic = %key, streams = listeners.len(), "subscribed");
        topics.insert(
            key,
            TopicHandle {
                state,
                shutdown_tx,
                listeners,
            },
        );
        Ok(())
    }

    /// Cancel a topic's listeners and release its channel. No-op when not subscribed.
    pub async fn unsubscribe(&self, key: &TopicKey) {
        let mut topics = self.topics.lock().await;
        let Some(handle) = topics.remove(key) else {
            trace!(target: "huddle::realtime", topic = %key, "unsubscribe of inactive topic");
            return;
        };
        self.teardown(key, handle).await;
        info!(target: "huddle::realtime", topic = %key, "unsubscribed");
    }

    /// Tear down every topic and reset connectivity to disconnected.
    pub async fn unsubscribe_all(&self) {
        let mut topics = self.topics.lock().await;
        let drained: Vec<_> = topics.drain().collect();
        for (key, handle) in drained {
            self.teardown(&key, handle).await;
        }
        self.connectivity.errors.clear();
        self.connectivity.refresh();
        info!(target: "huddle::realtime", "all topics unsubscribed");
    }

    async fn teardown(&self, key: &TopicKey, handle: TopicHandle) {
        handle
            .state
            .store(TopicState::Unsubscribing as u8, Ordering::Release);
        let _ = handle.shutdown_tx.send(true);
        for listener in handle.listeners {
            if let Err(e) = listener.await {
                if e.is_panic() {
                    error!(target: "huddle::realtime", topic = %key, "listener task panicked");
                }
            }
        }
        self.source.release(key.as_str()).await;
        handle
            .state
            .store(TopicState::Unsubscribed as u8, Ordering::Release);
        self.connectivity.forget(key);
    }

    pub fn topic_state(&self, key: &TopicKey) -> TopicState {
        self.connectivity
            .states
            .get(key)
            .map(|state| TopicState::from_u8(state.load(Ordering::Acquire)))
            .unwrap_or(TopicState::Unsubscribed)
    }

    pub fn is_subscribed(&self, key: &TopicKey) -> bool {
        self.connectivity.states.contains_key(key)
    }

    /// Keys of every subscribed topic, sorted.
    pub fn active_topics(&self) -> Vec<TopicKey> {
        let mut keys: Vec<_> = self
            .connectivity
            .states
            .iter()
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connectivity.status_tx.borrow().clone()
    }

    /// Watch connectivity changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connectivity.status_tx.subscribe()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        // Listeners exit on their own once they see the signal.
        if let Ok(topics) = self.topics.try_lock() {
            for handle in topics.values() {
                let _ = handle.shutdown_tx.send(true);
            }
        }
    }
}

/// Listener loop for one stream of a topic.
async fn listen(
    key: TopicKey,
    binding: StreamBinding,
    mut stream: ChangeStream,
    mut shutdown_rx: watch::Receiver<bool>,
    state: Arc<AtomicU8>,
    connectivity: Arc<Connectivity>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    trace!(
                        target: "huddle::realtime",
                        topic = %key,
                        stream = %binding.spec,
                        "listener stopping"
                    );
                    return;
                }
            }

            next = stream.next() => {
                // Cancellation may have landed while this event was in flight.
                if *shutdown_rx.borrow() {
                    trace!(
                        target: "huddle::realtime",
                        topic = %key,
                        "dropping event for cancelled topic"
                    );
                    return;
                }
                match next {
                    Some(Ok(raw)) => dispatch(&key, &binding, &raw),
                    Some(Err(e)) => {
                        warn!(
                            target: "huddle::realtime",
                            topic = %key,
                            stream = %binding.spec,
                            error = %e,
                            "change stream failed"
                        );
                        connectivity.fail(&key, &state, e.to_string());
                        return;
                    }
                    None => {
                        info!(
                            target: "huddle::realtime",
                            topic = %key,
                            stream = %binding.spec,
                            "change stream closed"
                        );
                        let reason = format!("stream {} closed", binding.spec);
                        connectivity.fail(&key, &state, reason);
                        return;
                    }
                }
            }
        }
    }
}

fn dispatch(key: &TopicKey, binding: &StreamBinding, raw: &RawChange) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| (binding.dispatch)(raw))) {
        Ok(Ok(())) => {
            trace!(
                target: "huddle::realtime",
                topic = %key,
                table = %raw.table,
                action = ?raw.change_type,
                "change applied"
            );
        }
        Ok(Err(e)) => {
            warn!(
                target: "huddle::realtime",
                topic = %key,
                table = %raw.table,
                error = %e,
                "dropping undecodable change"
            );
        }
        Err(_) => {
            error!(
                target: "huddle::realtime",
                topic = %key,
                table = %raw.table,
                "change handler panicked"
            );
        }
    }
}
