//! Entity services: one accessor plus one cache overlay per entity, with the
//! entity's validation, normalization and domain events supplied by an
//! [`EntitySchema`].

mod articles;
mod lesson_status;
mod social_posts;
mod validate;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::application::accessor::{AccessError, SubscribeOptions, TableAccessor};
use crate::application::events::EventBus;
use crate::application::query::{Filter, OrderSpec, QueryOptions, QueryShape};
use crate::application::store::{ChangeCallback, Subscription, UpsertOptions};
use crate::cache::EntityCacheOverlay;
use crate::domain::record::{CREATED_AT_COLUMN, ID_COLUMN, Record, UPDATED_AT_COLUMN};
use crate::util::{Clock, format_timestamp};

pub use articles::{ArticleScope, ArticleSchema};
pub use lesson_status::LessonStatusSchema;
pub use social_posts::{SocialPostSchema, SocialPostScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

/// One named count in an entity's statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StatBucket {
    pub key: String,
    pub filters: Vec<Filter>,
}

impl StatBucket {
    pub fn new(key: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            key: key.into(),
            filters,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub total: u64,
    pub buckets: BTreeMap<String, u64>,
}

impl EntityStats {
    pub fn get(&self, key: &str) -> u64 {
        self.buckets.get(key).copied().unwrap_or(0)
    }
}

/// Entity-specific rules plugged into [`EntityService`].
pub trait EntitySchema: Send + Sync + 'static {
    /// Event prefix and payload key, e.g. `article` for `article:created`.
    fn entity(&self) -> &'static str;

    fn table(&self) -> &'static str;

    /// Name reported in accessor logs and `app:error` payloads.
    fn service(&self) -> &'static str;

    fn baseline_filters(&self) -> Vec<Filter>;

    fn baseline_order(&self) -> Vec<OrderSpec>;

    /// Parse a caller-supplied id, or `None` when it is malformed.
    fn parse_id(&self, raw: &str) -> Option<Value>;

    fn validate(&self, data: &Record, mode: WriteMode) -> Vec<String>;

    /// Apply defaults and derived columns. Must be idempotent.
    ///
    /// For updates `data` is the patch and `previous` the stored row.
    fn normalize(&self, data: Record, previous: Option<&Record>, now: OffsetDateTime) -> Record;

    fn stats_plan(&self) -> Vec<StatBucket>;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Backend(#[from] AccessError),
    #[error("not found")]
    NotFound,
    #[error("invalid id")]
    InvalidId,
}

pub struct EntityService<S: EntitySchema> {
    schema: S,
    accessor: Arc<TableAccessor>,
    overlay: Arc<EntityCacheOverlay>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    remote_watch: Mutex<Option<Subscription>>,
}

impl<S: EntitySchema> EntityService<S> {
    pub fn new(
        schema: S,
        accessor: Arc<TableAccessor>,
        overlay: Arc<EntityCacheOverlay>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schema,
            accessor,
            overlay,
            bus,
            clock,
            remote_watch: Mutex::new(None),
        }
    }

    pub fn schema(&self) -> &S {
        &self.schema
    }

    pub fn accessor(&self) -> &TableAccessor {
        &self.accessor
    }

    pub fn overlay(&self) -> &EntityCacheOverlay {
        &self.overlay
    }

    /// The entity's default read.
    pub fn baseline_options(&self) -> QueryOptions {
        QueryOptions::new()
            .with_filters(self.schema.baseline_filters())
            .with_order(self.schema.baseline_order())
    }

    /// Read records. The baseline filters always apply; `options` may narrow,
    /// reorder or page on top of them.
    #[instrument(skip_all, fields(entity = self.schema.entity()))]
    pub async fn read(&self, options: QueryOptions) -> Result<Vec<Record>, ServiceError> {
        let baseline = self.schema.baseline_filters();
        let order = self.schema.baseline_order();
        let options = scoped(options, &baseline, &order);

        match options.shape(&baseline, &order) {
            QueryShape::Baseline => self.read_baseline(&options, &baseline).await,
            QueryShape::Paginated => {
                if let Some(rows) = self.overlay.lookup(&options, &baseline) {
                    return Ok(rows);
                }
                Ok(self.accessor.select(&options).await?)
            }
            // Extra narrowing never touches the cache.
            QueryShape::Custom => Ok(self.accessor.select(&options).await?),
        }
    }

    async fn read_baseline(
        &self,
        options: &QueryOptions,
        baseline: &[Filter],
    ) -> Result<Vec<Record>, ServiceError> {
        if let Some(rows) = self.overlay.lookup(options, baseline) {
            return Ok(rows);
        }

        let _refill = self.overlay.refill_lock().await;
        if let Some(rows) = self.overlay.read_filtered(options, baseline) {
            debug!(
                entity = self.schema.entity(),
                "Served by a refill that finished while waiting"
            );
            return Ok(rows);
        }

        let generation = self.overlay.generation();
        let rows = self.accessor.select(options).await?;
        self.overlay.populate_if_current(rows.clone(), generation);
        Ok(rows)
    }

    /// Point read under the baseline scope. Never served from the cache.
    #[instrument(skip_all, fields(entity = self.schema.entity(), id = raw_id))]
    pub async fn get_by_id(&self, raw_id: &str) -> Result<Record, ServiceError> {
        let id = self.schema.parse_id(raw_id).ok_or(ServiceError::InvalidId)?;
        let options = QueryOptions::new()
            .with_filters(self.schema.baseline_filters())
            .filter(Filter::eq(ID_COLUMN, id))
            .limit(1);
        first_row(self.accessor.select(&options).await?)
    }

    #[instrument(skip_all, fields(entity = self.schema.entity()))]
    pub async fn create(&self, data: Record) -> Result<Record, ServiceError> {
        let errors = self.schema.validate(&data, WriteMode::Create);
        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }

        let row = self
            .schema
            .normalize(strip_managed(data), None, self.clock.now_utc());
        let created = first_row(self.accessor.insert(vec![row]).await?)?;

        self.overlay.invalidate();
        self.announce("created", &created, None);
        info!(
            entity = self.schema.entity(),
            id = ?created.id(),
            "Record created"
        );
        Ok(created)
    }

    #[instrument(skip_all, fields(entity = self.schema.entity(), id = raw_id))]
    pub async fn update(&self, raw_id: &str, data: Record) -> Result<Record, ServiceError> {
        let id = self.schema.parse_id(raw_id).ok_or(ServiceError::InvalidId)?;
        let errors = self.schema.validate(&data, WriteMode::Update);
        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }

        let previous = self.fetch_current(&id).await?;
        let patch = self
            .schema
            .normalize(strip_managed(data), Some(&previous), self.clock.now_utc());
        if patch.is_empty() {
            return Ok(previous);
        }

        let updated = first_row(
            self.accessor
                .update(patch, &[Filter::eq(ID_COLUMN, id)])
                .await?,
        )?;

        self.overlay.invalidate();
        self.announce("updated", &updated, Some(&previous));
        info!(entity = self.schema.entity(), id = raw_id, "Record updated");
        Ok(updated)
    }

    /// Delete one record. Deleting an id that no longer exists is `NotFound`.
    #[instrument(skip_all, fields(entity = self.schema.entity(), id = raw_id))]
    pub async fn delete(&self, raw_id: &str) -> Result<(), ServiceError> {
        let id = self.schema.parse_id(raw_id).ok_or(ServiceError::InvalidId)?;
        let previous = self.fetch_current(&id).await?;

        let removed = self.accessor.delete(&[Filter::eq(ID_COLUMN, id)]).await?;
        if removed.is_empty() {
            return Err(ServiceError::NotFound);
        }

        self.overlay.invalidate();
        self.announce("deleted", &previous, None);
        info!(entity = self.schema.entity(), id = raw_id, "Record deleted");
        Ok(())
    }

    /// Insert-or-update on `conflict` columns. Announced as `updated` when a
    /// row already matched `existing`, otherwise as `created`.
    pub(crate) async fn upsert_on(
        &self,
        data: Record,
        conflict: &str,
        existing: Option<Record>,
    ) -> Result<Record, ServiceError> {
        let errors = self.schema.validate(&data, WriteMode::Create);
        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }

        let row = self.schema.normalize(
            strip_managed(data),
            existing.as_ref(),
            self.clock.now_utc(),
        );
        let written = first_row(
            self.accessor
                .upsert(vec![row], &UpsertOptions::on(conflict))
                .await?,
        )?;

        self.overlay.invalidate();
        match existing.as_ref() {
            Some(previous) => self.announce("updated", &written, Some(previous)),
            None => self.announce("created", &written, None),
        }
        Ok(written)
    }

    /// Count buckets straight from the store.
    #[instrument(skip_all, fields(entity = self.schema.entity()))]
    pub async fn get_stats(&self) -> Result<EntityStats, ServiceError> {
        let plan = self.schema.stats_plan();
        let total = self.accessor.count(&[]);
        let buckets = try_join_all(
            plan.iter()
                .map(|bucket| self.accessor.count(&bucket.filters)),
        );
        let (total, counts) = futures::try_join!(total, buckets)?;

        Ok(EntityStats {
            total,
            buckets: plan
                .into_iter()
                .map(|bucket| bucket.key)
                .zip(counts)
                .collect(),
        })
    }

    /// Subscribe to store-side change notifications and invalidate on each one.
    ///
    /// Best effort: returns `false` when the store cannot stream changes.
    /// The lock is held across the subscribe call so concurrent callers share
    /// one subscription.
    pub async fn watch_remote_changes(&self) -> bool {
        let mut watch = self.remote_watch.lock().await;
        if watch.is_some() {
            return true;
        }

        let overlay = Arc::downgrade(&self.overlay);
        let callback: ChangeCallback = Arc::new(move |change| {
            if let Some(overlay) = overlay.upgrade() {
                debug!(table = %change.table, kind = ?change.kind, "Remote change observed");
                overlay.invalidate();
            }
        });

        match self
            .accessor
            .subscribe(callback, SubscribeOptions::default())
            .await
        {
            Some(subscription) => {
                *watch = Some(subscription);
                true
            }
            None => false,
        }
    }

    pub async fn stop_watching(&self) {
        let subscription = self.remote_watch.lock().await.take();
        if let Some(subscription) = subscription {
            self.accessor.unsubscribe(&subscription).await;
        }
    }

    /// Unscoped point read used by the write paths.
    pub(crate) async fn fetch_current(&self, id: &Value) -> Result<Record, ServiceError> {
        let options = QueryOptions::new()
            .filter(Filter::eq(ID_COLUMN, id.clone()))
            .limit(1);
        first_row(self.accessor.select(&options).await?)
    }

    pub(crate) async fn find_one(&self, filters: Vec<Filter>) -> Result<Option<Record>, ServiceError> {
        let options = QueryOptions::new().with_filters(filters).limit(1);
        Ok(self.accessor.select(&options).await?.into_iter().next())
    }

    fn announce(&self, action: &str, record: &Record, previous: Option<&Record>) {
        let entity = self.schema.entity();
        let mut payload = Map::new();
        payload.insert(
            format!("{entity}Id"),
            record.id().cloned().unwrap_or(Value::Null),
        );
        payload.insert(entity.to_string(), record.clone().into_value());
        if let Some(previous) = previous {
            payload.insert("previousData".to_string(), previous.clone().into_value());
        }
        payload.insert(
            "timestamp".to_string(),
            Value::String(format_timestamp(self.clock.now_utc())),
        );
        self.bus
            .emit(&format!("{entity}:{action}"), Value::Object(payload));
    }
}

/// Object-safe surface used where the entity is picked at runtime.
#[async_trait]
pub trait EntityOperations: Send + Sync {
    fn entity(&self) -> &'static str;

    async fn read(&self, options: QueryOptions) -> Result<Vec<Record>, ServiceError>;

    async fn get_by_id(&self, id: &str) -> Result<Record, ServiceError>;

    async fn create(&self, data: Record) -> Result<Record, ServiceError>;

    async fn update(&self, id: &str, data: Record) -> Result<Record, ServiceError>;

    async fn delete(&self, id: &str) -> Result<(), ServiceError>;

    async fn get_stats(&self) -> Result<EntityStats, ServiceError>;
}

#[async_trait]
impl<S: EntitySchema> EntityOperations for EntityService<S> {
    fn entity(&self) -> &'static str {
        self.schema.entity()
    }

    async fn read(&self, options: QueryOptions) -> Result<Vec<Record>, ServiceError> {
        EntityService::read(self, options).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Record, ServiceError> {
        EntityService::get_by_id(self, id).await
    }

    async fn create(&self, data: Record) -> Result<Record, ServiceError> {
        EntityService::create(self, data).await
    }

    async fn update(&self, id: &str, data: Record) -> Result<Record, ServiceError> {
        EntityService::update(self, id, data).await
    }

    async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        EntityService::delete(self, id).await
    }

    async fn get_stats(&self) -> Result<EntityStats, ServiceError> {
        EntityService::get_stats(self).await
    }
}

/// Merge the baseline filters in and fall back to the baseline order.
fn scoped(mut options: QueryOptions, baseline: &[Filter], order: &[OrderSpec]) -> QueryOptions {
    let mut filters = baseline.to_vec();
    for filter in options.filters.drain(..) {
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }
    options.filters = filters;
    if options.order_by.is_empty() {
        options.order_by = order.to_vec();
    }
    options
}

/// Callers never write ids or store-managed timestamps directly.
fn strip_managed(mut data: Record) -> Record {
    for column in [ID_COLUMN, CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
        data.remove(column);
    }
    data
}

fn first_row(rows: Vec<Record>) -> Result<Record, ServiceError> {
    rows.into_iter().next().ok_or(ServiceError::NotFound)
}
