//! Entity services over the in-memory store: cache correctness, TTL expiry,
//! cross-service invalidation and the read/write contract.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sitecms::application::entity::ServiceError;
use sitecms::application::query::{Filter, OrderSpec, QueryOptions};
use sitecms::application::registry::ServiceRegistry;
use sitecms::application::store::{
    ChangeCallback, ChangeFilter, RemoteTableClient, StoreError, Subscription, TableQuery,
    UpsertOptions,
};
use sitecms::cache::{CacheConfig, CacheState};
use sitecms::domain::Record;
use sitecms::infra::store::MemoryTableClient;
use sitecms::util::{Clock, ManualClock};

fn record(value: Value) -> Record {
    Record::try_from(value).expect("object literal")
}

struct Harness {
    store: Arc<MemoryTableClient>,
    clock: Arc<ManualClock>,
    registry: ServiceRegistry,
}

fn harness(cache: CacheConfig) -> Harness {
    let clock = Arc::new(ManualClock::at_epoch());
    let store = Arc::new(
        MemoryTableClient::new(clock.clone() as Arc<dyn Clock>).with_integer_ids("lesson_status"),
    );
    let registry = ServiceRegistry::build(
        store.clone() as Arc<dyn RemoteTableClient>,
        &cache,
        clock.clone() as Arc<dyn Clock>,
    );
    Harness {
        store,
        clock,
        registry,
    }
}

fn titles(rows: &[Record]) -> Vec<String> {
    rows.iter()
        .map(|row| row.str_field("title").unwrap_or_default().to_string())
        .collect()
}

fn id_of(row: &Record) -> String {
    match row.id() {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => panic!("record without id: {row}"),
    }
}

/// Ten published articles; featured ones are 0, 3, 6 and 9.
fn seed_ten_articles(store: &MemoryTableClient) {
    let rows = (0..10)
        .map(|i| {
            record(json!({
                "title": format!("article-{i}"),
                "content": "body",
                "status": "published",
                "category": "general",
                "featured": i % 3 == 0,
                "published_at": format!("2024-01-{:02}T00:00:00Z", 10 + i),
            }))
        })
        .collect();
    store.seed("articles", rows);
}

#[tokio::test]
async fn draft_article_appears_publicly_once_published() {
    let h = harness(CacheConfig::default());
    let public = &h.registry.articles;
    let admin = &h.registry.admin_articles;

    let created = admin
        .create(record(json!({"title": "A", "content": "hello", "status": "draft"})))
        .await
        .expect("create draft");
    assert!(created.field("published_at").is_null());

    assert!(public.read(QueryOptions::new()).await.expect("read").is_empty());

    let updated = admin
        .update(&id_of(&created), record(json!({"status": "published"})))
        .await
        .expect("publish");
    assert!(updated.str_field("published_at").is_some());

    let visible = public.read(QueryOptions::new()).await.expect("read");
    assert_eq!(titles(&visible), vec!["A".to_string()]);
}

#[tokio::test]
async fn hiding_a_social_post_refreshes_the_visible_list() {
    let h = harness(CacheConfig::default());
    let service = &h.registry.social_posts;

    let seeded = h.store.seed(
        "social_posts",
        (0..5)
            .map(|i| {
                record(json!({
                    "platform": "instagram",
                    "post_url": format!("https://instagram.com/p/{i}"),
                    "is_visible": true,
                    "is_featured": false,
                    "display_order": i,
                }))
            })
            .collect(),
    );

    let warm = service.read(QueryOptions::new()).await.expect("warm read");
    assert_eq!(warm.len(), 5);
    assert_eq!(h.store.calls("select"), 1);

    let hidden_id = id_of(&seeded[2]);
    service
        .update(&hidden_id, record(json!({"is_visible": false})))
        .await
        .expect("hide post");

    let before = h.store.calls("select");
    let visible = service.read(QueryOptions::new()).await.expect("read again");
    assert_eq!(h.store.calls("select") - before, 1);
    assert_eq!(visible.len(), 4);
    assert!(visible.iter().all(|row| id_of(row) != hidden_id));
}

#[tokio::test]
async fn pagination_returns_the_requested_window_cold_and_warm() {
    let h = harness(CacheConfig::default());
    seed_ten_articles(&h.store);
    let service = &h.registry.articles;
    let expected: Vec<String> = [8, 7, 5, 4]
        .iter()
        .map(|i| format!("article-{i}"))
        .collect();

    let cold = service
        .read(QueryOptions::new().offset(4).limit(4))
        .await
        .expect("cold page");
    assert_eq!(titles(&cold), expected);
    assert_eq!(h.store.calls("select"), 1);

    let full = service.read(QueryOptions::new()).await.expect("baseline");
    assert_eq!(
        titles(&full),
        [9, 6, 3, 0, 8, 7, 5, 4, 2, 1]
            .iter()
            .map(|i| format!("article-{i}"))
            .collect::<Vec<_>>()
    );
    assert_eq!(h.store.calls("select"), 2);

    let warm = service
        .read(QueryOptions::new().offset(4).limit(4))
        .await
        .expect("warm page");
    assert_eq!(titles(&warm), expected);
    assert_eq!(h.store.calls("select"), 2);
}

#[tokio::test]
async fn baseline_reads_respect_the_ttl() {
    let h = harness(CacheConfig::uniform(5000));
    seed_ten_articles(&h.store);
    let service = &h.registry.articles;

    service.read(QueryOptions::new()).await.expect("t=0");
    assert_eq!(h.store.calls("select"), 1);

    h.clock.set_ms(2000);
    service.read(QueryOptions::new()).await.expect("t=2000");
    assert_eq!(h.store.calls("select"), 1);
    assert_eq!(service.overlay().state(), CacheState::Warm);

    h.clock.set_ms(6000);
    assert_eq!(service.overlay().state(), CacheState::Stale);
    service.read(QueryOptions::new()).await.expect("t=6000");
    assert_eq!(h.store.calls("select"), 2);
}

#[tokio::test]
async fn malformed_ids_never_reach_the_store() {
    let h = harness(CacheConfig::default());

    let err = h
        .registry
        .articles
        .get_by_id("not-an-id-format")
        .await
        .expect_err("invalid id");
    assert_eq!(err, ServiceError::InvalidId);
    assert_eq!(err.to_string(), "invalid id");

    let err = h
        .registry
        .lesson_status
        .delete("abc")
        .await
        .expect_err("invalid id");
    assert_eq!(err, ServiceError::InvalidId);

    assert_eq!(h.store.total_calls(), 0);
}

#[tokio::test]
async fn admin_writes_retire_the_public_cache() {
    let h = harness(CacheConfig::default());
    seed_ten_articles(&h.store);

    h.registry
        .articles
        .read(QueryOptions::new())
        .await
        .expect("warm public");
    assert_eq!(h.registry.articles.overlay().state(), CacheState::Warm);

    let target = h.store.rows("articles")[0].clone();
    h.registry
        .admin_articles
        .update(&id_of(&target), record(json!({"status": "archived"})))
        .await
        .expect("archive");

    assert_eq!(h.registry.articles.overlay().state(), CacheState::Empty);
    let visible = h
        .registry
        .articles
        .read(QueryOptions::new())
        .await
        .expect("re-read");
    assert_eq!(visible.len(), 9);
    assert!(visible.iter().all(|row| row.id() != target.id()));
}

#[tokio::test]
async fn failed_writes_keep_the_cache_warm() {
    let h = harness(CacheConfig::default());
    seed_ten_articles(&h.store);
    let service = &h.registry.admin_articles;
    service.read(QueryOptions::new()).await.expect("warm");

    let err = service
        .create(record(json!({"title": ""})))
        .await
        .expect_err("validation");
    assert!(matches!(err, ServiceError::Validation(_)));
    assert_eq!(service.overlay().state(), CacheState::Warm);

    h.store.fail_next(StoreError::Timeout);
    let err = service
        .create(record(json!({"title": "B", "content": "x"})))
        .await
        .expect_err("backend");
    assert!(matches!(err, ServiceError::Backend(_)));
    assert_eq!(service.overlay().state(), CacheState::Warm);
    assert_eq!(h.store.rows("articles").len(), 10);
}

#[tokio::test]
async fn update_patches_cannot_null_required_columns() {
    let h = harness(CacheConfig::default());
    seed_ten_articles(&h.store);
    let target = h.store.rows("articles")[0].clone();

    let err = h
        .registry
        .admin_articles
        .update(
            &id_of(&target),
            record(json!({"title": null, "content": null, "status": null})),
        )
        .await
        .expect_err("null patch");
    let ServiceError::Validation(messages) = err else {
        panic!("expected validation error, got {err:?}");
    };
    assert_eq!(messages.len(), 3);

    let post = h
        .registry
        .admin_social_posts
        .create(record(json!({"platform": "instagram", "post_url": "https://instagram.com/p/1"})))
        .await
        .expect("create post");
    let err = h
        .registry
        .admin_social_posts
        .update(
            &id_of(&post),
            record(json!({"platform": null, "post_url": null, "is_visible": null})),
        )
        .await
        .expect_err("null patch");
    assert!(matches!(err, ServiceError::Validation(ref messages) if messages.len() == 3));

    assert_eq!(h.store.calls("update"), 0);
    let stored = h.store.rows("articles")[0].clone();
    assert_eq!(stored.str_field("status"), Some("published"));
    assert!(stored.str_field("published_at").is_some());
}

#[tokio::test]
async fn deleting_twice_reports_not_found() {
    let h = harness(CacheConfig::default());
    let service = &h.registry.admin_social_posts;
    let post = service
        .create(record(json!({"platform": "tiktok", "post_url": "https://tiktok.com/@x/1"})))
        .await
        .expect("create");
    let id = id_of(&post);

    service.read(QueryOptions::new()).await.expect("warm");
    service.delete(&id).await.expect("first delete");
    assert_eq!(service.overlay().state(), CacheState::Empty);

    let err = service.delete(&id).await.expect_err("second delete");
    assert_eq!(err, ServiceError::NotFound);
    assert!(service.read(QueryOptions::new()).await.expect("read").is_empty());
}

#[tokio::test]
async fn extra_filters_compose_with_the_baseline() {
    let h = harness(CacheConfig::default());
    h.store.seed(
        "articles",
        vec![
            record(json!({"title": "n1", "status": "published", "category": "news", "featured": false, "published_at": "2024-02-01T00:00:00Z"})),
            record(json!({"title": "n2", "status": "draft", "category": "news", "featured": false})),
            record(json!({"title": "t1", "status": "published", "category": "tips", "featured": true, "published_at": "2024-02-02T00:00:00Z"})),
        ],
    );
    let service = &h.registry.articles;

    let news = service
        .read(QueryOptions::new().filter(Filter::eq("category", "news")))
        .await
        .expect("news");
    assert_eq!(titles(&news), vec!["n1".to_string()]);

    service.read(QueryOptions::new()).await.expect("warm");
    let selects = h.store.calls("select");
    let featured = service
        .read(QueryOptions::new().filter(Filter::eq("featured", true)).limit(10))
        .await
        .expect("featured");
    assert_eq!(titles(&featured), vec!["t1".to_string()]);
    assert_eq!(h.store.calls("select"), selects + 1);
    assert_eq!(service.overlay().len(), 2);

    let oldest_first = service
        .read(QueryOptions::new().order(OrderSpec::asc("published_at")))
        .await
        .expect("custom order");
    assert_eq!(titles(&oldest_first), vec!["n1".to_string(), "t1".to_string()]);
    assert_eq!(h.store.calls("select"), selects + 2);
}

#[tokio::test]
async fn public_point_reads_stay_in_scope() {
    let h = harness(CacheConfig::default());
    let rows = h.store.seed(
        "articles",
        vec![record(json!({"title": "secret", "status": "draft"}))],
    );
    let id = id_of(&rows[0]);

    assert_eq!(
        h.registry.articles.get_by_id(&id).await,
        Err(ServiceError::NotFound)
    );
    let found = h
        .registry
        .admin_articles
        .get_by_id(&id)
        .await
        .expect("admin sees drafts");
    assert_eq!(found.str_field("title"), Some("secret"));
}

#[tokio::test]
async fn lesson_status_upserts_one_row_per_date() {
    let h = harness(CacheConfig::default());
    let service = &h.registry.lesson_status;

    let first = service
        .upsert_for_date("2024-07-01", record(json!({"status": "running"})))
        .await
        .expect("first upsert");
    assert_eq!(first.id(), Some(&json!(1)));

    let second = service
        .upsert_for_date(
            "2024-07-01",
            record(json!({"status": "cancelled", "message": "Storm warning", "is_visible": false})),
        )
        .await
        .expect("second upsert");
    assert_eq!(second.id(), first.id());
    assert_eq!(h.store.rows("lesson_status").len(), 1);

    let stored = service.for_date("2024-07-01").await.expect("for date");
    assert_eq!(stored.str_field("status"), Some("cancelled"));
    assert!(service.read(QueryOptions::new()).await.expect("read").is_empty());

    assert_eq!(
        service.for_date("2024-07-02").await,
        Err(ServiceError::NotFound)
    );
    assert!(matches!(
        service.upsert_for_date("July 1st", Record::new()).await,
        Err(ServiceError::Validation(_))
    ));
}

#[tokio::test]
async fn stats_count_by_bucket() {
    let h = harness(CacheConfig::default());
    seed_ten_articles(&h.store);
    h.store.seed(
        "articles",
        vec![record(json!({"title": "d", "status": "draft", "category": "news", "featured": false}))],
    );

    let stats = h.registry.admin_articles.get_stats().await.expect("stats");
    assert_eq!(stats.total, 11);
    assert_eq!(stats.get("status:published"), 10);
    assert_eq!(stats.get("status:draft"), 1);
    assert_eq!(stats.get("status:archived"), 0);
    assert_eq!(stats.get("category:news"), 1);
    assert_eq!(stats.get("featured"), 4);
    assert_eq!(h.store.calls("select"), 0);
}

#[tokio::test]
async fn domain_events_carry_the_record_and_previous_data() {
    let h = harness(CacheConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["socialPost:created", "socialPost:updated", "socialPost:deleted"] {
        let seen = Arc::clone(&seen);
        h.registry.bus.on(name, move |event| {
            seen.lock()
                .expect("events lock")
                .push((event.name.clone(), event.payload.clone()));
        });
    }

    let service = &h.registry.admin_social_posts;
    let post = service
        .create(record(json!({"platform": "youtube", "post_url": "https://youtube.com/watch?v=1"})))
        .await
        .expect("create");
    let id = id_of(&post);
    service
        .update(&id, record(json!({"caption": "new"})))
        .await
        .expect("update");
    service.delete(&id).await.expect("delete");

    let seen = seen.lock().expect("events lock");
    let names: Vec<&str> = seen.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        vec!["socialPost:created", "socialPost:updated", "socialPost:deleted"]
    );
    assert_eq!(seen[0].1["socialPostId"], json!(id));
    assert!(seen[0].1.get("previousData").is_none());
    assert_eq!(seen[1].1["socialPost"]["caption"], json!("new"));
    assert!(seen[1].1["previousData"]["caption"].is_null());
    assert_eq!(seen[2].1["socialPost"]["id"], json!(id));
    assert!(seen[2].1["timestamp"].is_string());
}

#[tokio::test]
async fn remote_changes_invalidate_when_watched() {
    let h = harness(CacheConfig::default());
    seed_ten_articles(&h.store);
    let service = &h.registry.articles;
    assert!(service.watch_remote_changes().await);

    service.read(QueryOptions::new()).await.expect("warm");
    h.store
        .insert(
            "articles",
            vec![record(json!({"title": "external", "status": "published"}))],
        )
        .await
        .expect("out-of-band insert");
    assert_eq!(service.overlay().state(), CacheState::Empty);

    service.stop_watching().await;
    service.read(QueryOptions::new()).await.expect("warm again");
    h.store
        .insert("articles", vec![record(json!({"title": "unseen", "status": "draft"}))])
        .await
        .expect("second insert");
    assert_eq!(service.overlay().state(), CacheState::Warm);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_watch_requests_share_one_subscription() {
    let h = harness(CacheConfig::default());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&h.registry.articles);
            tokio::spawn(async move { service.watch_remote_changes().await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.expect("join"));
    }
    assert_eq!(h.store.calls("subscribe"), 1);
}

#[tokio::test]
async fn disabled_cache_always_reads_through() {
    let h = harness(CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    });
    seed_ten_articles(&h.store);

    for _ in 0..3 {
        h.registry
            .articles
            .read(QueryOptions::new())
            .await
            .expect("read");
    }
    assert_eq!(h.store.calls("select"), 3);
}

/// Delegates to the in-memory store but makes every select take a while.
struct SlowSelects {
    inner: Arc<MemoryTableClient>,
}

#[async_trait]
impl RemoteTableClient for SlowSelects {
    async fn select(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        tokio::time::sleep(StdDuration::from_millis(25)).await;
        self.inner.select(query).await
    }

    async fn count(&self, query: &TableQuery) -> Result<u64, StoreError> {
        self.inner.count(query).await
    }

    async fn insert(&self, table: &str, rows: Vec<Record>) -> Result<Vec<Record>, StoreError> {
        self.inner.insert(table, rows).await
    }

    async fn update(&self, query: &TableQuery, patch: Record) -> Result<Vec<Record>, StoreError> {
        self.inner.update(query, patch).await
    }

    async fn delete(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        self.inner.delete(query).await
    }

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Record>,
        options: &UpsertOptions,
    ) -> Result<Vec<Record>, StoreError> {
        self.inner.upsert(table, rows, options).await
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: ChangeFilter,
        callback: ChangeCallback,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe(table, filter, callback).await
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.inner.unsubscribe(subscription).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_baseline_misses_share_one_fetch() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
    let store = Arc::new(MemoryTableClient::new(Arc::clone(&clock)));
    seed_ten_articles(&store);
    let registry = Arc::new(ServiceRegistry::build(
        Arc::new(SlowSelects {
            inner: Arc::clone(&store),
        }),
        &CacheConfig::default(),
        clock,
    ));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.articles.read(QueryOptions::new()).await })
        })
        .collect();

    for reader in readers {
        let rows = reader.await.expect("join").expect("read");
        assert_eq!(rows.len(), 10);
    }
    assert_eq!(store.calls("select"), 1);
}
