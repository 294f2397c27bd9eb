use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::query::{Filter, OrderSpec};
use crate::domain::record::Record;
use crate::domain::types::SocialPlatform;

use super::validate::FieldChecks;
use super::{EntitySchema, StatBucket, WriteMode};

const CAPTION_MAX: usize = 500;
const EMBED_HTML_MAX: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialPostScope {
    /// Visible posts only.
    Public,
    Admin,
}

#[derive(Debug, Clone, Copy)]
pub struct SocialPostSchema {
    scope: SocialPostScope,
}

impl SocialPostSchema {
    pub fn new(scope: SocialPostScope) -> Self {
        Self { scope }
    }
}

impl EntitySchema for SocialPostSchema {
    fn entity(&self) -> &'static str {
        "socialPost"
    }

    fn table(&self) -> &'static str {
        "social_posts"
    }

    fn service(&self) -> &'static str {
        match self.scope {
            SocialPostScope::Public => "social_posts",
            SocialPostScope::Admin => "admin_social_posts",
        }
    }

    fn baseline_filters(&self) -> Vec<Filter> {
        match self.scope {
            SocialPostScope::Public => vec![Filter::eq("is_visible", true)],
            SocialPostScope::Admin => Vec::new(),
        }
    }

    fn baseline_order(&self) -> Vec<OrderSpec> {
        vec![
            OrderSpec::desc("is_featured"),
            OrderSpec::asc("display_order"),
            OrderSpec::desc("created_at"),
        ]
    }

    fn parse_id(&self, raw: &str) -> Option<Value> {
        Uuid::parse_str(raw.trim())
            .ok()
            .map(|id| Value::String(id.to_string()))
    }

    fn validate(&self, data: &Record, mode: WriteMode) -> Vec<String> {
        let mut checks = FieldChecks::new(data, mode);
        checks
            .one_of::<SocialPlatform>("platform", true)
            .required_text("post_url")
            .http_url("post_url")
            .max_chars("embed_html", EMBED_HTML_MAX)
            .max_chars("caption", CAPTION_MAX)
            .flag("is_visible")
            .flag("is_featured")
            .non_negative_integer("display_order");
        checks.finish()
    }

    fn normalize(&self, mut data: Record, previous: Option<&Record>, _now: OffsetDateTime) -> Record {
        if let Some(url) = data.str_field("post_url").map(|u| u.trim().to_string()) {
            data.insert("post_url", url);
        }

        if previous.is_none() {
            for (column, default) in [
                ("is_visible", Value::Bool(true)),
                ("is_featured", Value::Bool(false)),
                ("display_order", Value::from(0)),
            ] {
                if data.field(column).is_null() {
                    data.insert(column, default);
                }
            }
        }
        data
    }

    fn stats_plan(&self) -> Vec<StatBucket> {
        let visibility = [
            StatBucket::new("visible", vec![Filter::eq("is_visible", true)]),
            StatBucket::new("hidden", vec![Filter::eq("is_visible", false)]),
        ];
        let platforms = SocialPlatform::ALL.iter().map(|platform| {
            StatBucket::new(
                format!("platform:{}", platform.as_str()),
                vec![Filter::eq("platform", platform.as_str())],
            )
        });
        visibility.into_iter().chain(platforms).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        Record::try_from(value).expect("object literal")
    }

    fn schema() -> SocialPostSchema {
        SocialPostSchema::new(SocialPostScope::Public)
    }

    #[test]
    fn create_fills_flags_and_order() {
        let row = schema().normalize(
            record(json!({"platform": "instagram", "post_url": " https://instagram.com/p/abc "})),
            None,
            OffsetDateTime::UNIX_EPOCH,
        );

        assert_eq!(row.str_field("post_url"), Some("https://instagram.com/p/abc"));
        assert_eq!(row.bool_field("is_visible"), Some(true));
        assert_eq!(row.bool_field("is_featured"), Some(false));
        assert_eq!(row.get("display_order"), Some(&json!(0)));

        let again = schema().normalize(row.clone(), None, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(again, row);
    }

    #[test]
    fn update_patches_are_not_padded_with_defaults() {
        let previous = record(json!({"id": "p", "is_visible": true}));
        let patch = schema().normalize(
            record(json!({"is_visible": false})),
            Some(&previous),
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_eq!(patch, record(json!({"is_visible": false})));
    }

    #[test]
    fn validation_covers_platform_url_and_order() {
        let errors = schema().validate(
            &record(json!({"platform": "myspace", "post_url": "not a url", "display_order": 1.5})),
            WriteMode::Create,
        );
        assert_eq!(
            errors,
            vec![
                "platform must be one of: instagram, facebook, tiktok, youtube, twitter".to_string(),
                "post_url must be an absolute http(s) URL".to_string(),
                "display_order must be a non-negative integer".to_string(),
            ]
        );

        let missing = schema().validate(&Record::new(), WriteMode::Create);
        assert_eq!(missing.len(), 2);
        assert!(schema().validate(&Record::new(), WriteMode::Update).is_empty());
    }

    #[test]
    fn stats_split_visibility_and_platforms() {
        let plan = schema().stats_plan();
        assert_eq!(plan.len(), 2 + SocialPlatform::ALL.len());
        assert_eq!(plan[1].key, "hidden");
        assert_eq!(plan[1].filters, vec![Filter::eq("is_visible", false)]);
    }
}
