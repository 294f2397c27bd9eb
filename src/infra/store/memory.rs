//! In-process [`RemoteTableClient`].
//!
//! Applies filters, ordering and windows with the same semantics as the query
//! model, so it stands in for the hosted store in tests and local runs. Every
//! call is counted per table and operation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::application::query::{compare_records, matches_all};
use crate::application::store::{
    ChangeCallback, ChangeEvent, ChangeFilter, ChangeKind, RemoteTableClient, StoreError,
    Subscription, TableQuery, UpsertOptions,
};
use crate::domain::record::{CREATED_AT_COLUMN, ID_COLUMN, Record, UPDATED_AT_COLUMN, value_key};
use crate::util::lock::{mutex_guard, read_guard, write_guard};
use crate::util::{Clock, SystemClock, format_timestamp};

const SOURCE: &str = "infra::store::memory";

#[derive(Default)]
struct MemoryTable {
    rows: Vec<Record>,
    last_int_id: u64,
}

struct Subscriber {
    id: u64,
    table: String,
    filter: ChangeFilter,
    callback: ChangeCallback,
}

pub struct MemoryTableClient {
    tables: RwLock<HashMap<String, MemoryTable>>,
    integer_ids: HashSet<String>,
    calls: DashMap<(String, &'static str), u64>,
    fail_next: Mutex<Option<StoreError>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryTableClient {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            integer_ids: HashSet::new(),
            calls: DashMap::new(),
            fail_next: Mutex::new(None),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            clock,
        }
    }

    /// Rows inserted into `table` without an id get sequential integers instead of UUIDs.
    pub fn with_integer_ids(mut self, table: impl Into<String>) -> Self {
        self.integer_ids.insert(table.into());
        self
    }

    /// Load rows directly, bypassing call counters and change notifications.
    pub fn seed(&self, table: &str, rows: Vec<Record>) -> Vec<Record> {
        let now = format_timestamp(self.clock.now_utc());
        let mut tables = write_guard(&self.tables, SOURCE, "seed");
        let entry = tables.entry(table.to_string()).or_default();
        rows.into_iter()
            .map(|mut row| {
                self.assign_id(table, entry, &mut row);
                for column in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
                    if row.field(column).is_null() {
                        row.insert(column, now.clone());
                    }
                }
                entry.rows.push(row.clone());
                row
            })
            .collect()
    }

    /// Make the next operation, whatever it is, fail with `error`.
    pub fn fail_next(&self, error: StoreError) {
        *mutex_guard(&self.fail_next, SOURCE, "fail_next") = Some(error);
    }

    /// Calls of `operation` across all tables.
    pub fn calls(&self, operation: &str) -> u64 {
        self.calls
            .iter()
            .filter(|entry| entry.key().1 == operation)
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn table_calls(&self, table: &str, operation: &str) -> u64 {
        self.calls
            .iter()
            .filter(|entry| entry.key().0 == table && entry.key().1 == operation)
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    pub fn reset_calls(&self) {
        self.calls.clear();
    }

    /// Current contents of `table` in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        read_guard(&self.tables, SOURCE, "rows")
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn begin(&self, table: &str, operation: &'static str) -> Result<(), StoreError> {
        *self
            .calls
            .entry((table.to_string(), operation))
            .or_insert(0) += 1;
        trace!(table, operation, "Memory store call");

        match mutex_guard(&self.fail_next, SOURCE, "begin").take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn assign_id(&self, table: &str, entry: &mut MemoryTable, row: &mut Record) {
        match row.id().cloned() {
            Some(Value::Number(number)) => {
                if let Some(id) = number.as_u64() {
                    entry.last_int_id = entry.last_int_id.max(id);
                }
            }
            Some(_) => {}
            None if self.integer_ids.contains(table) => {
                entry.last_int_id += 1;
                row.insert(ID_COLUMN, entry.last_int_id);
            }
            None => {
                row.insert(ID_COLUMN, Uuid::new_v4().to_string());
            }
        }
    }

    fn matching(&self, query: &TableQuery) -> Vec<Record> {
        let tables = read_guard(&self.tables, SOURCE, "matching");
        let Some(table) = tables.get(&query.table) else {
            return Vec::new();
        };
        table
            .rows
            .iter()
            .filter(|row| matches_all(&query.filters, row))
            .cloned()
            .collect()
    }

    fn notify(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let targets: Vec<(ChangeFilter, ChangeCallback, String)> =
            read_guard(&self.subscribers, SOURCE, "notify")
                .iter()
                .map(|s| (s.filter.clone(), Arc::clone(&s.callback), s.table.clone()))
                .collect();

        for event in &events {
            for (filter, callback, table) in &targets {
                if *table == event.table && filter.accepts(event) {
                    callback(event);
                }
            }
        }
    }

    fn insert_rows(
        &self,
        table: &str,
        rows: Vec<Record>,
    ) -> Result<(Vec<Record>, Vec<ChangeEvent>), StoreError> {
        let now = format_timestamp(self.clock.now_utc());
        let mut tables = write_guard(&self.tables, SOURCE, "insert");
        let entry = tables.entry(table.to_string()).or_default();

        let mut written = Vec::with_capacity(rows.len());
        for mut row in rows {
            self.assign_id(table, entry, &mut row);
            let key = row.id_key();
            let duplicate = entry
                .rows
                .iter()
                .chain(written.iter())
                .any(|existing| existing.id_key() == key);
            if duplicate {
                return Err(StoreError::Conflict {
                    constraint: format!("{table}_pkey"),
                });
            }
            row.insert(CREATED_AT_COLUMN, now.clone());
            row.insert(UPDATED_AT_COLUMN, now.clone());
            written.push(row);
        }
        // All-or-nothing, like a single statement.
        entry.rows.extend(written.iter().cloned());

        let events = written
            .iter()
            .map(|row| change(table, ChangeKind::Insert, Some(row.clone()), None))
            .collect();
        Ok((written, events))
    }
}

impl Default for MemoryTableClient {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl RemoteTableClient for MemoryTableClient {
    async fn select(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        self.begin(&query.table, "select")?;
        let mut rows = self.matching(query);

        if !query.order.is_empty() {
            rows.sort_by(|left, right| compare_records(left, right, &query.order));
        }

        let rows = match (query.range, query.limit) {
            (Some((start, end)), _) => rows
                .into_iter()
                .skip(start)
                .take(end.saturating_sub(start).saturating_add(1))
                .collect(),
            (None, Some(limit)) => rows.into_iter().take(limit).collect(),
            (None, None) => rows,
        };
        debug!(table = %query.table, rows = rows.len(), "Memory select");
        Ok(rows)
    }

    async fn count(&self, query: &TableQuery) -> Result<u64, StoreError> {
        self.begin(&query.table, "count")?;
        Ok(self.matching(query).len() as u64)
    }

    async fn insert(&self, table: &str, rows: Vec<Record>) -> Result<Vec<Record>, StoreError> {
        self.begin(table, "insert")?;
        let (written, events) = self.insert_rows(table, rows)?;
        self.notify(events);
        Ok(written)
    }

    async fn update(&self, query: &TableQuery, patch: Record) -> Result<Vec<Record>, StoreError> {
        self.begin(&query.table, "update")?;
        let now = format_timestamp(self.clock.now_utc());

        let mut events = Vec::new();
        let mut updated = Vec::new();
        {
            let mut tables = write_guard(&self.tables, SOURCE, "update");
            if let Some(table) = tables.get_mut(&query.table) {
                for row in table
                    .rows
                    .iter_mut()
                    .filter(|row| matches_all(&query.filters, row))
                {
                    let old = row.clone();
                    row.merge(&patch);
                    row.insert(UPDATED_AT_COLUMN, now.clone());
                    updated.push(row.clone());
                    events.push(change(&query.table, ChangeKind::Update, Some(row.clone()), Some(old)));
                }
            }
        }

        self.notify(events);
        Ok(updated)
    }

    async fn delete(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        self.begin(&query.table, "delete")?;

        let mut removed = Vec::new();
        {
            let mut tables = write_guard(&self.tables, SOURCE, "delete");
            if let Some(table) = tables.get_mut(&query.table) {
                let (gone, kept): (Vec<Record>, Vec<Record>) = table
                    .rows
                    .drain(..)
                    .partition(|row| matches_all(&query.filters, row));
                table.rows = kept;
                removed = gone;
            }
        }

        self.notify(
            removed
                .iter()
                .map(|row| change(&query.table, ChangeKind::Delete, None, Some(row.clone())))
                .collect(),
        );
        Ok(removed)
    }

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Record>,
        options: &UpsertOptions,
    ) -> Result<Vec<Record>, StoreError> {
        self.begin(table, "upsert")?;
        let conflict: Vec<&str> = options.conflict_columns().collect();
        let now = format_timestamp(self.clock.now_utc());

        let mut written = Vec::new();
        let mut events = Vec::new();
        let mut fresh = Vec::new();
        {
            let mut tables = write_guard(&self.tables, SOURCE, "upsert");
            let entry = tables.entry(table.to_string()).or_default();

            for row in rows {
                let existing = entry.rows.iter_mut().find(|candidate| {
                    conflict.iter().all(|column| {
                        let wanted = row.field(column);
                        !wanted.is_null() && value_key(candidate.field(column)) == value_key(wanted)
                    })
                });
                match existing {
                    Some(_) if options.ignore_duplicates => {}
                    Some(current) => {
                        let old = current.clone();
                        current.merge(&row);
                        current.insert(UPDATED_AT_COLUMN, now.clone());
                        written.push(current.clone());
                        events.push(change(table, ChangeKind::Update, Some(current.clone()), Some(old)));
                    }
                    None => fresh.push(row),
                }
            }
        }

        if !fresh.is_empty() {
            let (inserted, inserted_events) = self.insert_rows(table, fresh)?;
            written.extend(inserted);
            events.extend(inserted_events);
        }

        self.notify(events);
        Ok(written)
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: ChangeFilter,
        callback: ChangeCallback,
    ) -> Result<Subscription, StoreError> {
        self.begin(table, "subscribe")?;
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        write_guard(&self.subscribers, SOURCE, "subscribe").push(Subscriber {
            id,
            table: table.to_string(),
            filter,
            callback,
        });
        Ok(Subscription {
            id,
            channel: format!("{table}-changes-{id}"),
        })
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), StoreError> {
        write_guard(&self.subscribers, SOURCE, "unsubscribe")
            .retain(|subscriber| subscriber.id != subscription.id);
        Ok(())
    }
}

fn change(table: &str, kind: ChangeKind, new: Option<Record>, old: Option<Record>) -> ChangeEvent {
    ChangeEvent {
        table: table.to_string(),
        kind,
        new,
        old,
    }
}
