//! Field-level checks shared by the entity schemas.
//!
//! Each check appends a message instead of failing fast, so a caller sees
//! every problem with its input at once.

use serde_json::Value;
use time::Date;
use time::macros::format_description;

use crate::domain::record::Record;
use crate::domain::types::TextEnum;

use super::WriteMode;

pub(crate) struct FieldChecks<'a> {
    data: &'a Record,
    mode: WriteMode,
    errors: Vec<String>,
}

impl<'a> FieldChecks<'a> {
    pub(crate) fn new(data: &'a Record, mode: WriteMode) -> Self {
        Self {
            data,
            mode,
            errors: Vec::new(),
        }
    }

    /// Non-blank text. Required on create; an update may omit it but never clear it.
    pub(crate) fn required_text(&mut self, column: &str) -> &mut Self {
        match self.data.get(column) {
            None if self.mode == WriteMode::Update => {}
            Some(Value::String(text)) if !text.trim().is_empty() => {}
            Some(Value::String(_)) | None | Some(Value::Null) => {
                self.errors.push(format!("{column} is required"));
            }
            Some(_) => self.errors.push(format!("{column} must be text")),
        }
        self
    }

    pub(crate) fn max_chars(&mut self, column: &str, max: usize) -> &mut Self {
        match self.data.get(column) {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) if text.chars().count() <= max => {}
            Some(Value::String(_)) => self
                .errors
                .push(format!("{column} must be at most {max} characters")),
            Some(_) => self.errors.push(format!("{column} must be text")),
        }
        self
    }

    /// `required` only matters on create. Optional columns get a default there,
    /// so an update may leave them out but may not null them.
    pub(crate) fn one_of<E: TextEnum>(&mut self, column: &str, required: bool) -> &mut Self {
        match self.data.get(column) {
            None if !required || self.mode == WriteMode::Update => {}
            Some(Value::Null) if !required && self.mode == WriteMode::Create => {}
            Some(Value::String(text)) if E::parse(text).is_some() => {}
            _ => self
                .errors
                .push(format!("{column} must be one of: {}", E::allowed())),
        }
        self
    }

    pub(crate) fn flag(&mut self, column: &str) -> &mut Self {
        match self.data.get(column) {
            None | Some(Value::Bool(_)) => {}
            Some(Value::Null) if self.mode == WriteMode::Create => {}
            Some(_) => self.errors.push(format!("{column} must be true or false")),
        }
        self
    }

    pub(crate) fn non_negative_integer(&mut self, column: &str) -> &mut Self {
        match self.data.get(column) {
            None => {}
            Some(Value::Null) if self.mode == WriteMode::Create => {}
            Some(Value::Number(number)) if number.as_u64().is_some() => {}
            Some(_) => self
                .errors
                .push(format!("{column} must be a non-negative integer")),
        }
        self
    }

    pub(crate) fn http_url(&mut self, column: &str) -> &mut Self {
        let Some(Value::String(text)) = self.data.get(column) else {
            return self;
        };
        let valid = url::Url::parse(text.trim())
            .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.has_host())
            .unwrap_or(false);
        if !valid {
            self.errors
                .push(format!("{column} must be an absolute http(s) URL"));
        }
        self
    }

    pub(crate) fn calendar_date(&mut self, column: &str) -> &mut Self {
        let Some(Value::String(text)) = self.data.get(column) else {
            return self;
        };
        if parse_date(text).is_none() {
            self.errors
                .push(format!("{column} must be a date in YYYY-MM-DD form"));
        }
        self
    }

    pub(crate) fn finish(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }
}

pub(crate) fn parse_date(text: &str) -> Option<Date> {
    Date::parse(text.trim(), format_description!("[year]-[month]-[day]")).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::types::ArticleStatus;

    fn record(value: Value) -> Record {
        Record::try_from(value).expect("object literal")
    }

    #[test]
    fn create_requires_what_update_tolerates_missing() {
        let data = record(json!({"status": "draft"}));

        let errors = FieldChecks::new(&data, WriteMode::Create)
            .required_text("title")
            .finish();
        assert_eq!(errors, vec!["title is required".to_string()]);

        let errors = FieldChecks::new(&data, WriteMode::Update)
            .required_text("title")
            .finish();
        assert!(errors.is_empty());

        let blank = record(json!({"title": "   "}));
        let errors = FieldChecks::new(&blank, WriteMode::Update)
            .required_text("title")
            .finish();
        assert_eq!(errors, vec!["title is required".to_string()]);
    }

    #[test]
    fn update_cannot_null_required_columns() {
        let data = record(json!({"title": null, "status": null, "featured": null}));

        let errors = FieldChecks::new(&data, WriteMode::Update)
            .required_text("title")
            .one_of::<ArticleStatus>("status", false)
            .flag("featured")
            .finish();

        assert_eq!(
            errors,
            vec![
                "title is required".to_string(),
                "status must be one of: draft, published, archived".to_string(),
                "featured must be true or false".to_string(),
            ]
        );

        let errors = FieldChecks::new(&data, WriteMode::Create)
            .one_of::<ArticleStatus>("status", false)
            .flag("featured")
            .finish();
        assert!(errors.is_empty());
    }

    #[test]
    fn collects_every_failure() {
        let data = record(json!({
            "title": "x".repeat(201),
            "status": "live",
            "featured": "yes",
            "display_order": -1,
        }));

        let errors = FieldChecks::new(&data, WriteMode::Create)
            .max_chars("title", 200)
            .one_of::<ArticleStatus>("status", false)
            .flag("featured")
            .non_negative_integer("display_order")
            .finish();

        assert_eq!(
            errors,
            vec![
                "title must be at most 200 characters".to_string(),
                "status must be one of: draft, published, archived".to_string(),
                "featured must be true or false".to_string(),
                "display_order must be a non-negative integer".to_string(),
            ]
        );
    }

    #[test]
    fn urls_and_dates_are_checked_when_present() {
        let good = record(json!({"post_url": "https://instagram.com/p/1", "lesson_date": "2024-07-01"}));
        let errors = FieldChecks::new(&good, WriteMode::Create)
            .http_url("post_url")
            .calendar_date("lesson_date")
            .finish();
        assert!(errors.is_empty());

        let bad = record(json!({"post_url": "ftp://example.com", "lesson_date": "2024-02-30"}));
        let errors = FieldChecks::new(&bad, WriteMode::Create)
            .http_url("post_url")
            .calendar_date("lesson_date")
            .finish();
        assert_eq!(errors.len(), 2);
    }
}
