//! Generic per-table accessor.
//!
//! Turns [`QueryOptions`] into [`TableQuery`] calls against the remote store,
//! counts every operation, and reports failures through logs, metrics and the
//! `app:error` bus event. Expected failures come back as `Err`, never as panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::application::events::{
    APP_ERROR, EventBus, RECORD_CREATED, RECORD_DELETED, RECORD_UPDATED, RECORD_UPSERTED,
};
use crate::application::query::{Filter, QueryOptions};
use crate::application::store::{
    ChangeCallback, ChangeFilter, RemoteTableClient, StoreError, Subscription, TableQuery,
    UpsertOptions,
};
use crate::domain::record::Record;
use crate::util::lock::mutex_guard;
use crate::util::{Clock, format_timestamp};

const SOURCE: &str = "application::accessor";

pub const METRIC_STORE_OPERATIONS: &str = "sitecms_store_operations_total";
pub const METRIC_STORE_ERRORS: &str = "sitecms_store_errors_total";
pub const METRIC_STORE_LATENCY_MS: &str = "sitecms_store_latency_ms";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AccessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl AccessError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Select,
    Insert,
    Update,
    Delete,
    Upsert,
    Count,
    Subscribe,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Select => "select",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Upsert => "upsert",
            OperationKind::Count => "count",
            OperationKind::Subscribe => "subscribe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastOperation {
    pub kind: OperationKind,
    pub timestamp: OffsetDateTime,
}

/// Point-in-time copy of an accessor's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub operations: u64,
    pub errors: u64,
    pub last_operation: Option<LastOperation>,
}

/// Monotonic, advisory counters owned by one accessor.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    operations: AtomicU64,
    errors: AtomicU64,
    last_operation: Mutex<Option<LastOperation>>,
}

impl OperationMetrics {
    fn record_operation(&self, kind: OperationKind, at: OffsetDateTime) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        *mutex_guard(&self.last_operation, SOURCE, "record_operation") = Some(LastOperation {
            kind,
            timestamp: at,
        });
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_operation: *mutex_guard(&self.last_operation, SOURCE, "snapshot"),
        }
    }
}

/// Options for [`TableAccessor::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub filter: ChangeFilter,
}

/// Uniform access to one table.
pub struct TableAccessor {
    service: &'static str,
    table: String,
    client: Arc<dyn RemoteTableClient>,
    bus: Weak<EventBus>,
    clock: Arc<dyn Clock>,
    metrics: OperationMetrics,
}

impl TableAccessor {
    pub fn new(
        service: &'static str,
        table: impl Into<String>,
        client: Arc<dyn RemoteTableClient>,
        bus: &Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            table: table.into(),
            client,
            bus: Arc::downgrade(bus),
            clock,
            metrics: OperationMetrics::default(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn select(&self, options: &QueryOptions) -> Result<Vec<Record>, AccessError> {
        let started = self.begin(OperationKind::Select);
        let result = match self.build_select(options) {
            Ok(query) => self.client.select(&query).await.map_err(AccessError::from),
            Err(err) => Err(err),
        };
        self.finish(OperationKind::Select, started, result)
    }

    /// Insert one or many rows, returning the store's canonical rows.
    pub async fn insert(&self, rows: Vec<Record>) -> Result<Vec<Record>, AccessError> {
        let started = self.begin(OperationKind::Insert);
        let result = match ensure_rows(&rows) {
            Ok(()) => self
                .client
                .insert(&self.table, rows)
                .await
                .map_err(AccessError::from),
            Err(err) => Err(err),
        };
        let result = self.finish(OperationKind::Insert, started, result);
        if let Ok(written) = &result {
            self.notify(RECORD_CREATED, written);
        }
        result
    }

    /// Apply `patch` to the rows matching every equality filter.
    pub async fn update(
        &self,
        patch: Record,
        filters: &[Filter],
    ) -> Result<Vec<Record>, AccessError> {
        let started = self.begin(OperationKind::Update);
        let result = match self.build_match(filters) {
            Ok(_) if patch.is_empty() => Err(AccessError::invalid("update patch is empty")),
            Ok(query) => self
                .client
                .update(&query, patch)
                .await
                .map_err(AccessError::from),
            Err(err) => Err(err),
        };
        let result = self.finish(OperationKind::Update, started, result);
        if let Ok(written) = &result {
            self.notify(RECORD_UPDATED, written);
        }
        result
    }

    /// Delete the rows matching every equality filter and return them.
    pub async fn delete(&self, filters: &[Filter]) -> Result<Vec<Record>, AccessError> {
        let started = self.begin(OperationKind::Delete);
        let result = match self.build_match(filters) {
            Ok(query) => self.client.delete(&query).await.map_err(AccessError::from),
            Err(err) => Err(err),
        };
        let result = self.finish(OperationKind::Delete, started, result);
        if let Ok(removed) = &result {
            self.notify(RECORD_DELETED, removed);
        }
        result
    }

    pub async fn upsert(
        &self,
        rows: Vec<Record>,
        options: &UpsertOptions,
    ) -> Result<Vec<Record>, AccessError> {
        let started = self.begin(OperationKind::Upsert);
        let checked = ensure_rows(&rows).and_then(|()| {
            if options.conflict_columns().next().is_none() {
                Err(AccessError::invalid("upsert needs at least one conflict column"))
            } else {
                Ok(())
            }
        });
        let result = match checked {
            Ok(()) => self
                .client
                .upsert(&self.table, rows, options)
                .await
                .map_err(AccessError::from),
            Err(err) => Err(err),
        };
        let result = self.finish(OperationKind::Upsert, started, result);
        if let Ok(written) = &result {
            self.notify(RECORD_UPSERTED, written);
        }
        result
    }

    /// Head-only cardinality query with the same filter rules as `select`.
    pub async fn count(&self, filters: &[Filter]) -> Result<u64, AccessError> {
        let started = self.begin(OperationKind::Count);
        let result = match self.apply_filters(TableQuery::new(&self.table), filters) {
            Ok(query) => self.client.count(&query).await.map_err(AccessError::from),
            Err(err) => Err(err),
        };
        self.finish(OperationKind::Count, started, result)
    }

    /// Forward a change subscription to the store. Best effort: failures are
    /// reported like any other operation and yield `None`.
    pub async fn subscribe(
        &self,
        callback: ChangeCallback,
        options: SubscribeOptions,
    ) -> Option<Subscription> {
        let started = self.begin(OperationKind::Subscribe);
        let result = self
            .client
            .subscribe(&self.table, options.filter, callback)
            .await
            .map_err(AccessError::from);
        self.finish(OperationKind::Subscribe, started, result).ok()
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) {
        if let Err(err) = self.client.unsubscribe(subscription).await {
            debug!(
                table = %self.table,
                channel = %subscription.channel,
                error = %err,
                "Unsubscribe failed; ignoring"
            );
        }
    }

    fn build_select(&self, options: &QueryOptions) -> Result<TableQuery, AccessError> {
        let mut query = self.apply_filters(TableQuery::new(&self.table), &options.filters)?;

        for spec in &options.order_by {
            if spec.column.trim().is_empty() {
                return Err(AccessError::invalid("order column must not be empty"));
            }
            query = query.order(spec.column.clone(), spec.ascending);
        }

        if options.limit == Some(0) {
            return Err(AccessError::invalid("limit must be greater than zero"));
        }

        match (options.offset, options.limit) {
            (Some(offset), _) => {
                let (start, end) = options.range_window().ok_or_else(|| {
                    AccessError::invalid(format!("offset {offset} overflows the row window"))
                })?;
                query = query.range(start, end);
            }
            (None, Some(limit)) => query = query.limit(limit),
            (None, None) => {}
        }

        Ok(query)
    }

    /// Write paths only accept equality filters, and at least one of them.
    fn build_match(&self, filters: &[Filter]) -> Result<TableQuery, AccessError> {
        if filters.is_empty() {
            return Err(AccessError::invalid(
                "writes require at least one equality filter",
            ));
        }
        if let Some(other) = filters.iter().find(|f| !matches!(f, Filter::Eq { .. })) {
            return Err(AccessError::invalid(format!(
                "writes accept equality filters only (got a non-equality filter on `{}`)",
                other.column()
            )));
        }
        self.apply_filters(TableQuery::new(&self.table), filters)
    }

    fn apply_filters(
        &self,
        mut query: TableQuery,
        filters: &[Filter],
    ) -> Result<TableQuery, AccessError> {
        for filter in filters {
            if filter.column().trim().is_empty() {
                return Err(AccessError::invalid("filter column must not be empty"));
            }
            query = match filter {
                Filter::Eq { column, value } => query.eq(column.clone(), value.clone()),
                Filter::In { column, values } => {
                    if values.is_empty() {
                        return Err(AccessError::invalid(format!(
                            "membership filter on `{column}` has no values"
                        )));
                    }
                    query.in_list(column.clone(), values.clone())
                }
                Filter::Cmp { column, op, value } => query.cmp(column.clone(), *op, value.clone()),
            };
        }
        Ok(query)
    }

    fn begin(&self, kind: OperationKind) -> Instant {
        self.metrics.record_operation(kind, self.clock.now_utc());
        counter!(
            METRIC_STORE_OPERATIONS,
            "table" => self.table.clone(),
            "operation" => kind.as_str()
        )
        .increment(1);
        Instant::now()
    }

    fn finish<T>(
        &self,
        kind: OperationKind,
        started: Instant,
        result: Result<T, AccessError>,
    ) -> Result<T, AccessError> {
        histogram!(
            METRIC_STORE_LATENCY_MS,
            "table" => self.table.clone(),
            "operation" => kind.as_str()
        )
        .record(started.elapsed().as_secs_f64() * 1000.0);

        if let Err(err) = &result {
            self.report_failure(kind, err);
        }
        result
    }

    fn report_failure(&self, kind: OperationKind, err: &AccessError) {
        self.metrics.record_error();
        counter!(
            METRIC_STORE_ERRORS,
            "table" => self.table.clone(),
            "operation" => kind.as_str()
        )
        .increment(1);

        let timestamp = format_timestamp(self.clock.now_utc());
        error!(
            service = self.service,
            table = %self.table,
            operation = kind.as_str(),
            error = %err,
            timestamp = %timestamp,
            "Store operation failed"
        );

        if let Some(bus) = self.bus.upgrade() {
            bus.emit(
                APP_ERROR,
                json!({
                    "service": self.service,
                    "table": self.table,
                    "operation": kind.as_str(),
                    "error": err.to_string(),
                    "timestamp": timestamp,
                }),
            );
        }
    }

    fn notify(&self, event: &str, rows: &[Record]) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let records: Vec<Value> = rows.iter().cloned().map(Record::into_value).collect();
        bus.emit(
            event,
            json!({
                "service": self.service,
                "table": self.table,
                "records": records,
                "timestamp": format_timestamp(self.clock.now_utc()),
            }),
        );
    }
}

fn ensure_rows(rows: &[Record]) -> Result<(), AccessError> {
    if rows.is_empty() {
        return Err(AccessError::invalid("no rows supplied"));
    }
    Ok(())
}
