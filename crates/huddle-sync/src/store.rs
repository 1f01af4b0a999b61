//! Remote store collaborator and the typed repository over it.
//!
//! The store speaks JSON rows; [`Repository`] turns them into records. No
//! layer here retries: callers decide what to do with a failure.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::SyncError;
use crate::types::{ChildRecord, Record, WriteRequest};

/// A row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `column = value`
    Eq { column: String, value: String },
    /// `column` is one of `values`
    In { column: String, values: Vec<String> },
    /// Case-insensitive substring match on a text column.
    Contains { column: String, pattern: String },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn one_of<V: ToString>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In {
            column: column.into(),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn contains(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Contains {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. }
            | Filter::In { column, .. }
            | Filter::Contains { column, .. } => column,
        }
    }

    /// Evaluate against a JSON row (used by in-process stores).
    pub fn matches(&self, row: &Value) -> bool {
        let Some(cell) = row.get(self.column()).and_then(cell_text) else {
            return false;
        };
        match self {
            Filter::Eq { value, .. } => cell == *value,
            Filter::In { values, .. } => values.contains(&cell),
            Filter::Contains { pattern, .. } => {
                cell.to_lowercase().contains(&pattern.to_lowercase())
            }
        }
    }
}

fn cell_text(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Result ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

impl Order {
    /// `created_at` descending: the order every list cache keeps.
    pub fn newest_first() -> Self {
        Self {
            column: "created_at".to_string(),
            descending: true,
        }
    }

    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }
}

/// A select against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Select from the table a record type lives in.
    pub fn of<T: Record>() -> Self {
        Self::table(T::TABLE)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Fetch/write API of the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, SyncError>;

    /// Insert a row and return it as persisted (server id and timestamps filled in).
    async fn insert(&self, table: &str, row: Value) -> Result<Value, SyncError>;

    /// Patch a row by id and return it as persisted.
    async fn update(&self, table: &str, id: Uuid, patch: Value) -> Result<Value, SyncError>;

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), SyncError>;
}

/// Typed access to a [`RemoteStore`].
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn RemoteStore>,
}

impl Repository {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Fetch a single record by id.
    pub async fn fetch_one<T: Record>(&self, id: Uuid) -> Result<T, SyncError> {
        debug!(target: "huddle::network", table = T::TABLE, %id, "fetching record");
        let query = Query::of::<T>().filter(Filter::eq("id", id)).limit(1);
        let row = self
            .store
            .select(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound {
                table: T::TABLE.to_string(),
                id,
            })?;
        decode_row(row)
    }

    /// Fetch every child of a parent, newest first.
    pub async fn fetch_children<T: ChildRecord>(
        &self,
        parent_id: Uuid,
    ) -> Result<Vec<T>, SyncError> {
        debug!(
            target: "huddle::network",
            table = T::TABLE,
            parent = %parent_id,
            "fetching children"
        );
        let query = Query::of::<T>()
            .filter(Filter::eq(T::PARENT_COLUMN, parent_id))
            .order(Order::newest_first());
        self.fetch_where(query).await
    }

    /// Run an arbitrary select and decode every row.
    pub async fn fetch_where<T: Record>(&self, query: Query) -> Result<Vec<T>, SyncError> {
        self.store
            .select(&query)
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    /// Perform a typed write and return the persisted record.
    pub async fn create<R: WriteRequest>(&self, request: &R) -> Result<R::Output, SyncError> {
        let table = <R::Output as Record>::TABLE;
        debug!(target: "huddle::network", table, "creating record");
        let row = self.store.insert(table, serde_json::to_value(request)?).await?;
        decode_row(row)
    }

    /// Patch a record by id.
    pub async fn patch<T: Record>(&self, id: Uuid, patch: &impl Serialize) -> Result<T, SyncError> {
        debug!(target: "huddle::network", table = T::TABLE, %id, "patching record");
        let row = self
            .store
            .update(T::TABLE, id, serde_json::to_value(patch)?)
            .await?;
        decode_row(row)
    }

    pub async fn remove<T: Record>(&self, id: Uuid) -> Result<(), SyncError> {
        debug!(target: "huddle::network", table = T::TABLE, %id, "deleting record");
        self.store.delete(T::TABLE, id).await
    }
}

fn decode_row<T: Record>(row: Value) -> Result<T, SyncError> {
    serde_json::from_value(row).map_err(|e| SyncError::Decode {
        table: T::TABLE.to_string(),
        reason: e.to_string(),
    })
}
