//! Realtime sync and caching core for the Huddle party client.
//!
//! This crate keeps a local, time-boxed view of a remote party database and
//! folds the database's change feed into it, so screens can read from memory
//! and see other users' edits as they happen.
//!
//! ## Features
//!
//! - **Cache**: Per-entity TTL caches with a broadcast channel of updates
//! - **Subscriptions**: Named live topics over the change feed with idempotent subscribe
//! - **Optimistic writes**: Locally shown records reconciled against the store's answer
//! - **Prefetch**: Deduplicated background cache warming
//! - **Presence**: Online lists, typing indicators and ephemeral broadcasts
//! - **Store**: REST adapter for the remote database, plus in-memory doubles for tests

pub mod cache;
mod client;
mod config;
mod error;
pub mod feed;
pub mod memory;
pub mod optimistic;
pub mod prefetch;
pub mod presence;
mod rest;
pub mod store;
pub mod subscription;
pub mod timing;
pub mod topics;
pub mod ttl;
mod types;

pub use cache::{CacheUpdate, CachedList, CachedMap, CachedSlot, EntityKind, SyncCache, UpdateKind};
pub use client::{HOME_FEED_LIMIT, HuddleSync, HuddleSyncBuilder, SEARCH_LIMIT, SearchResults};
pub use config::{CachePolicy, SyncConfig};
pub use error::SyncError;
pub use feed::{ChangeAction, ChangeEvent, ChangeSource, ChangeStream, RawChange, StreamSpec};
pub use memory::{LocalFeed, MemoryStore};
pub use prefetch::{PrefetchCoordinator, PrefetchKey};
pub use presence::{PresenceChange, PresenceChannel, PresenceHub, PresenceMeta, PresenceUpdate};
pub use rest::RestStore;
pub use store::{Filter, Order, Query, RemoteStore, Repository};
pub use subscription::{
    ConnectionState, ConnectionStatus, SubscriptionManager, TopicKey, TopicSpec, TopicState,
};
pub use types::*;
