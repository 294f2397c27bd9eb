use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::query::{Filter, OrderSpec};
use crate::domain::record::Record;
use crate::domain::types::{ArticleCategory, ArticleStatus};
use crate::util::format_timestamp;

use super::validate::FieldChecks;
use super::{EntitySchema, StatBucket, WriteMode};

const TITLE_MAX: usize = 200;
const EXCERPT_MAX: usize = 500;

/// Which audience an article service reads for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleScope {
    /// Published articles only, featured first.
    Public,
    /// Every article, most recently edited first.
    Admin,
}

#[derive(Debug, Clone, Copy)]
pub struct ArticleSchema {
    scope: ArticleScope,
}

impl ArticleSchema {
    pub fn new(scope: ArticleScope) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> ArticleScope {
        self.scope
    }
}

impl EntitySchema for ArticleSchema {
    fn entity(&self) -> &'static str {
        "article"
    }

    fn table(&self) -> &'static str {
        "articles"
    }

    fn service(&self) -> &'static str {
        match self.scope {
            ArticleScope::Public => "articles",
            ArticleScope::Admin => "admin_articles",
        }
    }

    fn baseline_filters(&self) -> Vec<Filter> {
        match self.scope {
            ArticleScope::Public => vec![Filter::eq("status", ArticleStatus::Published.as_str())],
            ArticleScope::Admin => Vec::new(),
        }
    }

    fn baseline_order(&self) -> Vec<OrderSpec> {
        match self.scope {
            ArticleScope::Public => vec![OrderSpec::desc("featured"), OrderSpec::desc("published_at")],
            ArticleScope::Admin => vec![OrderSpec::desc("updated_at")],
        }
    }

    fn parse_id(&self, raw: &str) -> Option<Value> {
        Uuid::parse_str(raw.trim())
            .ok()
            .map(|id| Value::String(id.to_string()))
    }

    fn validate(&self, data: &Record, mode: WriteMode) -> Vec<String> {
        let mut checks = FieldChecks::new(data, mode);
        checks
            .required_text("title")
            .max_chars("title", TITLE_MAX)
            .max_chars("slug", TITLE_MAX)
            .max_chars("excerpt", EXCERPT_MAX)
            .required_text("content")
            .one_of::<ArticleCategory>("category", false)
            .one_of::<ArticleStatus>("status", false)
            .flag("featured");
        checks.finish()
    }

    fn normalize(&self, mut data: Record, previous: Option<&Record>, now: OffsetDateTime) -> Record {
        if let Some(title) = data.str_field("title").map(|t| t.trim().to_string()) {
            data.insert("title", title);
        }

        let explicit_slug = data
            .str_field("slug")
            .map(slug::slugify)
            .filter(|slug| !slug.is_empty());
        match explicit_slug {
            Some(slug) => {
                data.insert("slug", slug);
            }
            None if previous.is_none() => {
                if let Some(slug) = data.str_field("title").map(slug::slugify) {
                    data.insert("slug", slug);
                }
            }
            None => {
                data.remove("slug");
            }
        }

        if previous.is_none() {
            default_to(&mut data, "category", ArticleCategory::General.as_str());
            default_to(&mut data, "status", ArticleStatus::Draft.as_str());
            default_to(&mut data, "featured", false);
        }

        stamp_publication(&mut data, previous, now);
        data
    }

    fn stats_plan(&self) -> Vec<StatBucket> {
        let statuses = ArticleStatus::ALL.iter().map(|status| {
            StatBucket::new(
                format!("status:{}", status.as_str()),
                vec![Filter::eq("status", status.as_str())],
            )
        });
        let categories = ArticleCategory::ALL.iter().map(|category| {
            StatBucket::new(
                format!("category:{}", category.as_str()),
                vec![Filter::eq("category", category.as_str())],
            )
        });
        statuses
            .chain(categories)
            .chain([StatBucket::new("featured", vec![Filter::eq("featured", true)])])
            .collect()
    }
}

fn default_to(data: &mut Record, column: &str, value: impl Into<Value>) {
    if data.field(column).is_null() {
        data.insert(column, value);
    }
}

/// `published_at` is stamped when an article becomes published and cleared
/// when it leaves that state. An explicit timestamp on a publishing write wins.
fn stamp_publication(data: &mut Record, previous: Option<&Record>, now: OffsetDateTime) {
    let Some(status) = data.str_field("status").map(str::to_string) else {
        return;
    };
    let was_published = previous
        .and_then(|row| row.str_field("status"))
        .is_some_and(|status| status == ArticleStatus::Published.as_str());

    if status == ArticleStatus::Published.as_str() {
        if data.field("published_at").is_null() && !was_published {
            data.insert("published_at", format_timestamp(now));
        }
    } else {
        data.insert("published_at", Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn record(value: Value) -> Record {
        Record::try_from(value).expect("object literal")
    }

    fn schema() -> ArticleSchema {
        ArticleSchema::new(ArticleScope::Public)
    }

    #[test]
    fn create_defaults_and_slug() {
        let now = datetime!(2024-06-01 09:00 UTC);
        let row = schema().normalize(
            record(json!({"title": "  Summer Camp Opens!  ", "content": "..."})),
            None,
            now,
        );

        assert_eq!(row.str_field("title"), Some("Summer Camp Opens!"));
        assert_eq!(row.str_field("slug"), Some("summer-camp-opens"));
        assert_eq!(row.str_field("category"), Some("general"));
        assert_eq!(row.str_field("status"), Some("draft"));
        assert_eq!(row.bool_field("featured"), Some(false));
        assert!(row.field("published_at").is_null());
    }

    #[test]
    fn publishing_stamps_and_unpublishing_clears() {
        let now = datetime!(2024-06-01 09:00 UTC);
        let draft = record(json!({"id": "x", "status": "draft", "published_at": null}));

        let patch = schema().normalize(record(json!({"status": "published"})), Some(&draft), now);
        assert_eq!(
            patch.str_field("published_at"),
            Some("2024-06-01T09:00:00Z")
        );

        let published = record(json!({"id": "x", "status": "published", "published_at": "2024-05-01T00:00:00Z"}));
        let patch = schema().normalize(record(json!({"status": "published"})), Some(&published), now);
        assert!(!patch.contains("published_at"));

        let patch = schema().normalize(record(json!({"status": "archived"})), Some(&published), now);
        assert_eq!(patch.get("published_at"), Some(&Value::Null));
    }

    #[test]
    fn normalization_is_idempotent() {
        let now = datetime!(2024-06-01 09:00 UTC);
        let later = datetime!(2024-06-02 09:00 UTC);
        let inputs = [
            record(json!({"title": "A", "content": "x", "status": "published"})),
            record(json!({"title": " B ", "content": "x", "slug": "Custom Slug", "featured": true})),
            record(json!({"title": "C", "content": "x", "status": "archived", "published_at": "2024-01-01T00:00:00Z"})),
        ];

        for input in inputs {
            let once = schema().normalize(input, None, now);
            let twice = schema().normalize(once.clone(), None, later);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn validation_reports_each_problem() {
        let errors = schema().validate(
            &record(json!({"title": "", "category": "sport", "excerpt": "x".repeat(501)})),
            WriteMode::Create,
        );
        assert_eq!(
            errors,
            vec![
                "title is required".to_string(),
                "excerpt must be at most 500 characters".to_string(),
                "content is required".to_string(),
                "category must be one of: news, events, tips, general".to_string(),
            ]
        );

        assert!(
            schema()
                .validate(&record(json!({"featured": true})), WriteMode::Update)
                .is_empty()
        );
    }

    #[test]
    fn ids_must_be_uuids() {
        assert!(schema().parse_id("not-an-id-format").is_none());
        assert_eq!(
            schema().parse_id(" 67E55044-10B1-426F-9247-BB680E5FE0C8 "),
            Some(json!("67e55044-10b1-426f-9247-bb680e5fe0c8"))
        );
    }

    #[test]
    fn scopes_differ_in_baseline() {
        assert_eq!(
            schema().baseline_filters(),
            vec![Filter::eq("status", "published")]
        );
        let admin = ArticleSchema::new(ArticleScope::Admin);
        assert!(admin.baseline_filters().is_empty());
        assert_eq!(admin.baseline_order(), vec![OrderSpec::desc("updated_at")]);
        assert_eq!(admin.service(), "admin_articles");
    }

    #[test]
    fn stats_cover_status_category_and_featured() {
        let keys: Vec<_> = schema()
            .stats_plan()
            .into_iter()
            .map(|bucket| bucket.key)
            .collect();
        assert_eq!(keys.len(), 8);
        assert!(keys.contains(&"status:published".to_string()));
        assert!(keys.contains(&"category:tips".to_string()));
        assert!(keys.contains(&"featured".to_string()));
    }
}
