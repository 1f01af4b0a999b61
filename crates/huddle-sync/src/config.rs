//! Configuration for the sync core.
//!
//! Cache lifetimes are fixed per entity kind. Nothing outside [`crate::cache::SyncCache`]
//! reads them, so callers cannot pass ad hoc TTLs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifetimes for each cached entity kind, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Identity/profile data.
    pub profile_ttl_secs: u64,
    /// Single party rows.
    pub party_ttl_secs: u64,
    pub comments_ttl_secs: u64,
    pub statuses_ttl_secs: u64,
    pub polls_ttl_secs: u64,
    pub votes_ttl_secs: u64,
    pub media_ttl_secs: u64,
    pub notifications_ttl_secs: u64,
    /// The home feed listing.
    pub home_feed_ttl_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            profile_ttl_secs: 300,
            party_ttl_secs: 60,
            comments_ttl_secs: 30,
            statuses_ttl_secs: 30,
            polls_ttl_secs: 30,
            votes_ttl_secs: 30,
            media_ttl_secs: 60,
            notifications_ttl_secs: 30,
            home_feed_ttl_secs: 60,
        }
    }
}

impl CachePolicy {
    pub fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_ttl_secs)
    }

    pub fn party_ttl(&self) -> Duration {
        Duration::from_secs(self.party_ttl_secs)
    }

    pub fn comments_ttl(&self) -> Duration {
        Duration::from_secs(self.comments_ttl_secs)
    }

    pub fn statuses_ttl(&self) -> Duration {
        Duration::from_secs(self.statuses_ttl_secs)
    }

    pub fn polls_ttl(&self) -> Duration {
        Duration::from_secs(self.polls_ttl_secs)
    }

    pub fn votes_ttl(&self) -> Duration {
        Duration::from_secs(self.votes_ttl_secs)
    }

    pub fn media_ttl(&self) -> Duration {
        Duration::from_secs(self.media_ttl_secs)
    }

    pub fn notifications_ttl(&self) -> Duration {
        Duration::from_secs(self.notifications_ttl_secs)
    }

    pub fn home_feed_ttl(&self) -> Duration {
        Duration::from_secs(self.home_feed_ttl_secs)
    }
}

/// Top-level configuration for [`crate::HuddleSync`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cache: CachePolicy,
    /// How many keys a single `prefetch_many` call may start.
    pub prefetch_fanout: usize,
    /// Quiet period before a search query is sent.
    pub search_debounce_ms: u64,
    /// Minimum spacing between outgoing typing broadcasts per topic.
    pub typing_throttle_ms: u64,
    /// How long a received typing indicator stays visible.
    pub typing_expiry_ms: u64,
    /// Capacity of the cache and presence update channels.
    pub update_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CachePolicy::default(),
            prefetch_fanout: 5,
            search_debounce_ms: 300,
            typing_throttle_ms: 2_000,
            typing_expiry_ms: 5_000,
            update_channel_capacity: 1_024,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn typing_throttle(&self) -> Duration {
        Duration::from_millis(self.typing_throttle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }
}
