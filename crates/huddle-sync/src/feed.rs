//! Raw change payloads and the change-stream collaborator.
//!
//! The remote store pushes one JSON payload per row change. Payloads are
//! decoded into typed [`ChangeEvent`]s at the listener, never earlier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::Record;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// A change payload as received from a change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// Table the row belongs to.
    pub table: String,
    #[serde(rename = "type")]
    pub change_type: ChangeAction,
    /// The row after the change. Empty for deletes.
    #[serde(default)]
    pub record: serde_json::Value,
    /// The row before the change, sent for deletes.
    #[serde(default)]
    pub old_record: Option<serde_json::Value>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RawChange {
    pub fn new(
        table: impl Into<String>,
        change_type: ChangeAction,
        row: serde_json::Value,
    ) -> Self {
        let (record, old_record) = match change_type {
            ChangeAction::Delete => (serde_json::Value::Null, Some(row)),
            _ => (row, None),
        };
        Self {
            table: table.into(),
            change_type,
            record,
            old_record,
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// Decode into a typed event.
    ///
    /// Deletes carry the pre-delete row in `old_record`; some streams send it
    /// in `record` instead, so that is the fallback.
    pub fn decode<T: Record>(&self) -> Result<ChangeEvent<T>, SyncError> {
        if self.table != T::TABLE {
            return Err(SyncError::Decode {
                table: self.table.clone(),
                reason: format!("expected a {} change", T::TABLE),
            });
        }

        let row = match (self.change_type, &self.old_record) {
            (ChangeAction::Delete, Some(old)) if !old.is_null() => old,
            _ => &self.record,
        };

        let record = T::deserialize(row).map_err(|e| SyncError::Decode {
            table: self.table.clone(),
            reason: e.to_string(),
        })?;

        Ok(ChangeEvent {
            action: self.change_type,
            record,
        })
    }
}

/// A decoded change to a single record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    pub action: ChangeAction,
    pub record: T,
}

impl<T> ChangeEvent<T> {
    pub fn insert(record: T) -> Self {
        Self {
            action: ChangeAction::Insert,
            record,
        }
    }

    pub fn update(record: T) -> Self {
        Self {
            action: ChangeAction::Update,
            record,
        }
    }

    pub fn delete(record: T) -> Self {
        Self {
            action: ChangeAction::Delete,
            record,
        }
    }
}

/// Server-side row filter for a change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamFilter {
    pub column: String,
    pub value: String,
}

impl StreamFilter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Whether a JSON row passes this filter.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl std::fmt::Display for StreamFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// One underlying change stream: a table plus an optional filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamSpec {
    pub table: String,
    pub filter: Option<StreamFilter>,
}

impl StreamSpec {
    /// Every change on a table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    /// Changes on a table where `column` equals `value`.
    pub fn filtered(
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        Self {
            table: table.into(),
            filter: Some(StreamFilter::eq(column, value)),
        }
    }

    /// Whether a raw change belongs to this stream.
    pub fn matches(&self, change: &RawChange) -> bool {
        if change.table != self.table {
            return false;
        }
        let Some(filter) = &self.filter else {
            return true;
        };
        let row = match (change.change_type, &change.old_record) {
            (ChangeAction::Delete, Some(old)) if !old.is_null() => old,
            _ => &change.record,
        };
        filter.matches(row)
    }
}

impl std::fmt::Display for StreamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}?{}", self.table, filter),
            None => f.write_str(&self.table),
        }
    }
}

/// An open change stream. Dropping it closes the stream.
pub type ChangeStream = BoxStream<'static, Result<RawChange, SyncError>>;

/// Source of live change streams (the remote store's realtime channel).
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open one filtered stream under a topic's channel.
    async fn open(&self, topic: &str, spec: &StreamSpec) -> Result<ChangeStream, SyncError>;

    /// Release the topic's underlying channel once every stream is dropped.
    async fn release(&self, topic: &str);
}
