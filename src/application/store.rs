//! Contract of the remote table store consumed by the accessor.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::application::query::{CmpOp, Filter, OrderSpec};
use crate::domain::record::{ID_COLUMN, Record};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("store request timed out")]
    Timeout,
    #[error("store rejected credentials: {message}")]
    Unauthorized { message: String },
    #[error("conflicting record violates `{constraint}`")]
    Conflict { constraint: String },
    #[error("store returned status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("could not decode store response: {0}")]
    Decode(String),
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    pub fn request(err: impl std::fmt::Display) -> Self {
        Self::Request(err.to_string())
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}

/// A query against one table, built up in call order.
///
/// Order entries keep the sequence they were added in; the first is the
/// primary sort key.
#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderSpec>,
    pub limit: Option<usize>,
    pub range: Option<(usize, usize)>,
}

impl TableQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            range: None,
        }
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn in_list(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(Filter::in_list(column, values));
        self
    }

    pub fn cmp(mut self, column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::cmp(column, op, value));
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push(OrderSpec {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive row window `[start, end]`.
    pub fn range(mut self, start: usize, end: usize) -> Self {
        self.range = Some((start, end));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Comma-separated conflict columns.
    pub on_conflict: String,
    pub ignore_duplicates: bool,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            on_conflict: ID_COLUMN.to_string(),
            ignore_duplicates: false,
        }
    }
}

impl UpsertOptions {
    pub fn on(columns: impl Into<String>) -> Self {
        Self {
            on_conflict: columns.into(),
            ..Self::default()
        }
    }

    pub fn conflict_columns(&self) -> impl Iterator<Item = &str> {
        self.on_conflict
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Record>,
    pub old: Option<Record>,
}

/// Narrows which changes a subscriber hears about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeFilter {
    pub kind: Option<ChangeKind>,
    pub row: Option<Filter>,
}

impl ChangeFilter {
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if self.kind.is_some_and(|kind| kind != event.kind) {
            return false;
        }
        match &self.row {
            None => true,
            Some(filter) => event
                .new
                .iter()
                .chain(event.old.iter())
                .any(|row| filter.matches(row)),
        }
    }
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle for an active change subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub channel: String,
}

#[async_trait]
pub trait RemoteTableClient: Send + Sync {
    async fn select(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError>;

    /// Exact row count for the query's filters; ordering and windows are ignored.
    async fn count(&self, query: &TableQuery) -> Result<u64, StoreError>;

    async fn insert(&self, table: &str, rows: Vec<Record>) -> Result<Vec<Record>, StoreError>;

    async fn update(&self, query: &TableQuery, patch: Record) -> Result<Vec<Record>, StoreError>;

    async fn delete(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError>;

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Record>,
        options: &UpsertOptions,
    ) -> Result<Vec<Record>, StoreError>;

    async fn subscribe(
        &self,
        table: &str,
        filter: ChangeFilter,
        callback: ChangeCallback,
    ) -> Result<Subscription, StoreError>;

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), StoreError>;
}
