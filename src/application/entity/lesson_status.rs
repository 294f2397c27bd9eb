use serde_json::Value;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::application::query::{Filter, OrderSpec};
use crate::domain::record::Record;
use crate::domain::types::LessonState;

use super::validate::{FieldChecks, parse_date};
use super::{EntitySchema, EntityService, ServiceError, StatBucket, WriteMode};

const MESSAGE_MAX: usize = 500;
const DATE_COLUMN: &str = "lesson_date";

/// Daily lesson status. Rows use sequential integer ids and one row per date.
#[derive(Debug, Clone, Copy, Default)]
pub struct LessonStatusSchema;

impl EntitySchema for LessonStatusSchema {
    fn entity(&self) -> &'static str {
        "lessonStatus"
    }

    fn table(&self) -> &'static str {
        "lesson_status"
    }

    fn service(&self) -> &'static str {
        "lesson_status"
    }

    fn baseline_filters(&self) -> Vec<Filter> {
        vec![Filter::eq("is_visible", true)]
    }

    fn baseline_order(&self) -> Vec<OrderSpec> {
        vec![OrderSpec::desc(DATE_COLUMN), OrderSpec::desc("updated_at")]
    }

    fn parse_id(&self, raw: &str) -> Option<Value> {
        raw.trim()
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .map(Value::from)
    }

    fn validate(&self, data: &Record, mode: WriteMode) -> Vec<String> {
        let mut checks = FieldChecks::new(data, mode);
        checks
            .required_text(DATE_COLUMN)
            .calendar_date(DATE_COLUMN)
            .one_of::<LessonState>("status", true)
            .max_chars("message", MESSAGE_MAX)
            .flag("is_visible");
        checks.finish()
    }

    fn normalize(&self, mut data: Record, previous: Option<&Record>, _now: OffsetDateTime) -> Record {
        if let Some(date) = data.str_field(DATE_COLUMN).and_then(canonical_date) {
            data.insert(DATE_COLUMN, date);
        }
        if previous.is_none() && data.field("is_visible").is_null() {
            data.insert("is_visible", true);
        }
        data
    }

    fn stats_plan(&self) -> Vec<StatBucket> {
        LessonState::ALL
            .iter()
            .map(|state| {
                StatBucket::new(
                    format!("status:{}", state.as_str()),
                    vec![Filter::eq("status", state.as_str())],
                )
            })
            .collect()
    }
}

impl EntityService<LessonStatusSchema> {
    /// Write the status for `date`, replacing any row already stored for it.
    pub async fn upsert_for_date(&self, date: &str, data: Record) -> Result<Record, ServiceError> {
        let date = canonical_date(date).ok_or_else(invalid_date)?;
        let existing = self
            .find_one(vec![Filter::eq(DATE_COLUMN, date.clone())])
            .await?;
        self.upsert_on(data.with(DATE_COLUMN, date), DATE_COLUMN, existing)
            .await
    }

    /// The status stored for `date`, visible or not. Never served from the cache.
    pub async fn for_date(&self, date: &str) -> Result<Record, ServiceError> {
        let date = canonical_date(date).ok_or_else(invalid_date)?;
        self.find_one(vec![Filter::eq(DATE_COLUMN, date)])
            .await?
            .ok_or(ServiceError::NotFound)
    }
}

fn canonical_date(raw: &str) -> Option<String> {
    parse_date(raw)?
        .format(format_description!("[year]-[month]-[day]"))
        .ok()
}

fn invalid_date() -> ServiceError {
    ServiceError::Validation(vec![format!(
        "{DATE_COLUMN} must be a date in YYYY-MM-DD form"
    )])
}
