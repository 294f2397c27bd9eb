//! [`RemoteTableClient`] over a PostgREST endpoint.
//!
//! Query translation lives in free functions so it can be checked without a
//! server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::application::query::{Filter, OrderSpec};
use crate::application::store::{
    ChangeCallback, ChangeFilter, RemoteTableClient, StoreError, Subscription, TableQuery,
    UpsertOptions,
};
use crate::config::StoreSettings;
use crate::domain::record::Record;
use crate::infra::error::InfraError;

const RETURN_REPRESENTATION: &str = "return=representation";

#[derive(Clone, Debug)]
pub struct PostgrestClient {
    client: Client,
    base: Url,
    schema: String,
}

impl PostgrestClient {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        schema: &str,
        timeout: Duration,
    ) -> Result<Self, InfraError> {
        let mut base = Url::parse(base_url).map_err(|source| InfraError::InvalidStoreUrl {
            url: base_url.to_string(),
            source,
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let invalid = |_| InfraError::InvalidApiKey;
            headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
            );
        }

        let client = Client::builder()
            .user_agent(concat!("sitecms/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(InfraError::ClientBuild)?;

        Ok(Self {
            client,
            base,
            schema: schema.to_string(),
        })
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self, InfraError> {
        let url = settings
            .url
            .as_deref()
            .ok_or(InfraError::MissingStoreUrl)?;
        Self::new(
            url,
            settings.api_key.as_deref(),
            &settings.schema,
            settings.timeout,
        )
    }

    fn table_url(&self, table: &str, pairs: &[(String, String)]) -> Result<Url, StoreError> {
        let mut url = self.base.join(table).map_err(StoreError::request)?;
        if !pairs.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in pairs {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Reads name the schema with `Accept-Profile`, writes with `Content-Profile`.
    fn read(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Accept-Profile", self.schema.as_str())
    }

    fn write(&self, builder: RequestBuilder, prefer: &str) -> RequestBuilder {
        builder
            .header("Content-Profile", self.schema.as_str())
            .header("Prefer", prefer)
    }

    async fn rows(builder: RequestBuilder) -> Result<Vec<Record>, StoreError> {
        let response = builder.send().await.map_err(transport_error)?;
        let response = ensure_success(response).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(StoreError::decode)
    }
}

#[async_trait]
impl RemoteTableClient for PostgrestClient {
    async fn select(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        let url = self.table_url(&query.table, &select_pairs(query))?;
        debug!(table = %query.table, %url, "PostgREST select");
        Self::rows(self.read(self.client.get(url))).await
    }

    async fn count(&self, query: &TableQuery) -> Result<u64, StoreError> {
        let mut pairs = vec![("select".to_string(), query.columns.clone())];
        pairs.extend(query.filters.iter().map(filter_pair));
        let url = self.table_url(&query.table, &pairs)?;

        let response = self
            .read(self.client.head(url))
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response).await?;

        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| StoreError::decode("missing or malformed Content-Range header"))
    }

    async fn insert(&self, table: &str, rows: Vec<Record>) -> Result<Vec<Record>, StoreError> {
        let url = self.table_url(table, &[])?;
        Self::rows(
            self.write(self.client.post(url), RETURN_REPRESENTATION)
                .json(&rows),
        )
        .await
    }

    async fn update(&self, query: &TableQuery, patch: Record) -> Result<Vec<Record>, StoreError> {
        let pairs: Vec<_> = query.filters.iter().map(filter_pair).collect();
        let url = self.table_url(&query.table, &pairs)?;
        Self::rows(
            self.write(self.client.patch(url), RETURN_REPRESENTATION)
                .json(&patch),
        )
        .await
    }

    async fn delete(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        let pairs: Vec<_> = query.filters.iter().map(filter_pair).collect();
        let url = self.table_url(&query.table, &pairs)?;
        Self::rows(self.write(self.client.delete(url), RETURN_REPRESENTATION)).await
    }

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Record>,
        options: &UpsertOptions,
    ) -> Result<Vec<Record>, StoreError> {
        let conflict: Vec<&str> = options.conflict_columns().collect();
        let url = self.table_url(table, &[("on_conflict".to_string(), conflict.join(","))])?;
        Self::rows(
            self.write(self.client.post(url), &upsert_preference(options))
                .json(&rows),
        )
        .await
    }

    async fn subscribe(
        &self,
        _table: &str,
        _filter: ChangeFilter,
        _callback: ChangeCallback,
    ) -> Result<Subscription, StoreError> {
        Err(StoreError::Unsupported("realtime change streams"))
    }

    async fn unsubscribe(&self, _subscription: &Subscription) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Query-string pairs for a select: columns, filters, order, then window.
pub fn select_pairs(query: &TableQuery) -> Vec<(String, String)> {
    let mut pairs = vec![("select".to_string(), query.columns.clone())];
    pairs.extend(query.filters.iter().map(filter_pair));
    if let Some(order) = encode_order(&query.order) {
        pairs.push(("order".to_string(), order));
    }
    match (query.range, query.limit) {
        (Some((start, end)), _) => {
            pairs.push(("offset".to_string(), start.to_string()));
            pairs.push((
                "limit".to_string(),
                end.saturating_sub(start).saturating_add(1).to_string(),
            ));
        }
        (None, Some(limit)) => pairs.push(("limit".to_string(), limit.to_string())),
        (None, None) => {}
    }
    pairs
}

/// `column=op.value`, with `in.(a,b)` for membership.
pub fn filter_pair(filter: &Filter) -> (String, String) {
    let encoded = match filter {
        Filter::Eq { value, .. } => format!("eq.{}", scalar(value)),
        Filter::In { values, .. } => {
            let items: Vec<String> = values.iter().map(list_item).collect();
            format!("in.({})", items.join(","))
        }
        Filter::Cmp { op, value, .. } => format!("{}.{}", op.as_str(), scalar(value)),
    };
    (filter.column().to_string(), encoded)
}

pub fn encode_order(order: &[OrderSpec]) -> Option<String> {
    if order.is_empty() {
        return None;
    }
    Some(
        order
            .iter()
            .map(|spec| {
                let direction = if spec.ascending { "asc" } else { "desc" };
                format!("{}.{direction}", spec.column)
            })
            .collect::<Vec<_>>()
            .join(","),
    )
}

pub fn upsert_preference(options: &UpsertOptions) -> String {
    let resolution = if options.ignore_duplicates {
        "ignore-duplicates"
    } else {
        "merge-duplicates"
    };
    format!("resolution={resolution},{RETURN_REPRESENTATION}")
}

/// Total from `Content-Range: 0-24/3573` or `*/0`.
pub fn parse_content_range(header: &str) -> Option<u64> {
    let (_, total) = header.trim().rsplit_once('/')?;
    total.parse().ok()
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Items inside `in.(...)` are quoted when they contain reserved characters.
fn list_item(value: &Value) -> String {
    let text = scalar(value);
    if text.contains([',', '(', ')', '"', '\\', ' ']) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text
    }
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Option<String>,
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(status_error(status, &text))
}

pub(crate) fn status_error(status: StatusCode, body: &str) -> StoreError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        body.trim().to_string()
    } else {
        parsed.message
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized { message },
        StatusCode::CONFLICT => StoreError::Conflict {
            constraint: quoted_name(&message)
                .or_else(|| parsed.details.as_deref().and_then(quoted_name))
                .unwrap_or(message),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StoreError::Timeout,
        _ => StoreError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

fn quoted_name(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let len = text[start..].find('"')?;
    Some(text[start..start + len].to_string())
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::request(err)
    }
}
