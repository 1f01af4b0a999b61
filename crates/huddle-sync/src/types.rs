//! Core record types for the party client.
//!
//! Field names match the remote store's snake_case columns, and timestamps are
//! ISO-8601 strings on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Table holding user profiles.
pub const PROFILES_TABLE: &str = "profiles";
/// Table holding parties.
pub const PARTIES_TABLE: &str = "parties";
/// Table holding party comments.
pub const COMMENTS_TABLE: &str = "comments";
/// Table holding party status posts.
pub const STATUSES_TABLE: &str = "party_statuses";
/// Table holding party media metadata.
pub const MEDIA_TABLE: &str = "party_media";
/// Table holding polls.
pub const POLLS_TABLE: &str = "polls";
/// Table holding poll votes. Its change stream cannot be filtered by party.
pub const VOTES_TABLE: &str = "poll_votes";
/// Table holding per-user notifications.
pub const NOTIFICATIONS_TABLE: &str = "notifications";

/// Anything with a stable record id.
pub trait Identified {
    fn id(&self) -> Uuid;
}

/// A record that lives in a remote store table.
pub trait Record: Identified + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table the record is stored in.
    const TABLE: &'static str;
}

/// A record listed under a parent record (comments under a party, votes under a poll).
pub trait ChildRecord: Record {
    /// Column holding the parent id.
    const PARENT_COLUMN: &'static str;

    fn parent_id(&self) -> Uuid;
}

/// A typed write payload. Each operation gets its own request struct.
pub trait WriteRequest: Serialize + Send + Sync {
    /// The record the store returns once the write is persisted.
    type Output: Record;
}

macro_rules! impl_record {
    ($type:ty, $table:expr, $parent_column:literal => $parent:ident) => {
        impl_record!($type, $table);

        impl ChildRecord for $type {
            const PARENT_COLUMN: &'static str = $parent_column;

            fn parent_id(&self) -> Uuid {
                self.$parent
            }
        }
    };
    ($type:ty, $table:expr) => {
        impl Identified for $type {
            fn id(&self) -> Uuid {
                self.id
            }
        }

        impl Record for $type {
            const TABLE: &'static str = $table;
        }
    };
}

/// A user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A party (event) users coordinate around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub id: Uuid,
    pub host_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A comment on a party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub party_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A short status post on a party ("running late", "bringing snacks").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyStatus {
    pub id: Uuid,
    pub party_id: Uuid,
    pub user_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Metadata for a photo or video attached to a party. The blob itself lives in object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub party_id: Uuid,
    pub uploader_id: Uuid,
    pub storage_path: String,
    #[serde(default)]
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A poll attached to a party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: Uuid,
    pub party_id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A single vote on a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollVote {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub user_id: Uuid,
    pub option_index: u32,
    pub created_at: DateTime<Utc>,
}

/// Kind of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Invite,
    Comment,
    Status,
    Poll,
    Reminder,
    #[serde(other)]
    Other,
}

/// A notification addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    #[serde(default)]
    pub party_id: Option<Uuid>,
    pub body: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl_record!(Profile, PROFILES_TABLE);
impl_record!(Party, PARTIES_TABLE);
impl_record!(Comment, COMMENTS_TABLE, "party_id" => party_id);
impl_record!(PartyStatus, STATUSES_TABLE, "party_id" => party_id);
impl_record!(MediaItem, MEDIA_TABLE, "party_id" => party_id);
impl_record!(Poll, POLLS_TABLE, "party_id" => party_id);
impl_record!(PollVote, VOTES_TABLE, "poll_id" => poll_id);
impl_record!(Notification, NOTIFICATIONS_TABLE, "user_id" => user_id);

// =============================================================================
// Write requests
// =============================================================================

/// Request to post a comment.
#[derive(Debug, Clone, Serialize)]
pub struct NewComment {
    pub party_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
}

impl WriteRequest for NewComment {
    type Output = Comment;
}

/// Request to post a status.
#[derive(Debug, Clone, Serialize)]
pub struct NewStatus {
    pub party_id: Uuid,
    pub user_id: Uuid,
    pub body: String,
}

impl WriteRequest for NewStatus {
    type Output = PartyStatus;
}

/// Request to vote on a poll.
#[derive(Debug, Clone, Serialize)]
pub struct NewVote {
    pub poll_id: Uuid,
    pub user_id: Uuid,
    pub option_index: u32,
}

impl WriteRequest for NewVote {
    type Output = PollVote;
}

/// Partial update of a party. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartyUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
}

impl PartyUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
    }
}
