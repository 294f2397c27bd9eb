//! Declarative query model shared by the accessor, the cache overlay and the store adapters.
//!
//! Filter and ordering semantics live here once so the in-memory store and the
//! cache overlay agree with each other on what a query returns.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::record::{Record, value_key};
use crate::util::parse_timestamp;

/// Window size assumed when a caller pages with `offset` but no `limit`.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Comparison operators beyond plain equality and membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    Is,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Neq => "neq",
            CmpOp::Gt => "gt",
            CmpOp::Gte => "gte",
            CmpOp::Lt => "lt",
            CmpOp::Lte => "lte",
            CmpOp::Like => "like",
            CmpOp::Ilike => "ilike",
            CmpOp::Is => "is",
        }
    }

    pub fn evaluate(self, left: &Value, right: &Value) -> bool {
        match self {
            CmpOp::Is => left == right,
            CmpOp::Neq => !left.is_null() && !values_equal(left, right),
            CmpOp::Gt => ordered(left, right).is_some_and(Ordering::is_gt),
            CmpOp::Gte => ordered(left, right).is_some_and(Ordering::is_ge),
            CmpOp::Lt => ordered(left, right).is_some_and(Ordering::is_lt),
            CmpOp::Lte => ordered(left, right).is_some_and(Ordering::is_le),
            CmpOp::Like => match (left.as_str(), right.as_str()) {
                (Some(text), Some(pattern)) => like_match(text, pattern),
                _ => false,
            },
            CmpOp::Ilike => match (left.as_str(), right.as_str()) {
                (Some(text), Some(pattern)) => {
                    like_match(&text.to_lowercase(), &pattern.to_lowercase())
                }
                _ => false,
            },
        }
    }
}

impl TryFrom<&str> for CmpOp {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "neq" => Ok(CmpOp::Neq),
            "gt" => Ok(CmpOp::Gt),
            "gte" => Ok(CmpOp::Gte),
            "lt" => Ok(CmpOp::Lt),
            "lte" => Ok(CmpOp::Lte),
            "like" => Ok(CmpOp::Like),
            "ilike" => Ok(CmpOp::Ilike),
            "is" => Ok(CmpOp::Is),
            _ => Err(()),
        }
    }
}

/// One column predicate. Filters in a query combine with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    Cmp { column: String, op: CmpOp, value: Value },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn in_list<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn cmp(column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. } | Filter::In { column, .. } | Filter::Cmp { column, .. } => {
                column
            }
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.field(self.column());
        match self {
            Filter::Eq { value, .. } => values_equal(actual, value),
            Filter::In { values, .. } => values.iter().any(|value| values_equal(actual, value)),
            Filter::Cmp { op, value, .. } => op.evaluate(actual, value),
        }
    }

    /// `Some(flag)` when this is an equality test against a boolean.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Filter::Eq {
                value: Value::Bool(flag),
                ..
            } => Some(*flag),
            _ => None,
        }
    }
}

pub fn matches_all(filters: &[Filter], record: &Record) -> bool {
    filters.iter().all(|filter| filter.matches(record))
}

/// One sort key; earlier keys take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub column: String,
    pub ascending: bool,
}

impl OrderSpec {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// Compare two rows under `order`, falling back to the id so the order is total.
///
/// Nulls sort last ascending and first descending, as Postgres does by default.
pub fn compare_records(left: &Record, right: &Record, order: &[OrderSpec]) -> Ordering {
    for spec in order {
        let ordering = sort_values(left.field(&spec.column), right.field(&spec.column));
        let ordering = if spec.ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    let left_id = left.id().map(value_key);
    let right_id = right.id().map(value_key);
    left_id.cmp(&right_id)
}

pub fn sort_records(records: &mut [Record], order: &[OrderSpec]) {
    records.sort_by(|left, right| compare_records(left, right, order));
}

/// Declarative read options: `{filters, order_by, limit, offset}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn order(mut self, spec: OrderSpec) -> Self {
        self.order_by.push(spec);
        self
    }

    pub fn with_order(mut self, order_by: Vec<OrderSpec>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn is_paginated(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// Inclusive `[start, end]` row window when an offset is present.
    ///
    /// Returns `None` when the query is unbounded or only limited. Callers must
    /// reject `limit == 0` beforehand; overflow yields `None` too.
    pub fn range_window(&self) -> Option<(usize, usize)> {
        let offset = self.offset?;
        let size = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let end = offset.checked_add(size)?.checked_sub(1)?;
        Some((offset, end))
    }

    /// Classify these options against an entity's baseline read.
    pub fn shape(&self, baseline_filters: &[Filter], baseline_order: &[OrderSpec]) -> QueryShape {
        let same_filters = self.filters.len() == baseline_filters.len()
            && baseline_filters
                .iter()
                .all(|filter| self.filters.contains(filter));
        let same_order = self.order_by.is_empty() || self.order_by == baseline_order;

        match (same_filters && same_order, self.is_paginated()) {
            (true, false) => QueryShape::Baseline,
            (true, true) => QueryShape::Paginated,
            (false, _) => QueryShape::Custom,
        }
    }
}

/// How a read relates to the entity's cached baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    /// Exactly the default read: may be served from and populate the cache.
    Baseline,
    /// The default read with `limit`/`offset`: may be served from a warm cache only.
    Paginated,
    /// Anything narrower or differently ordered: always goes to the store.
    Custom,
}

/// Apply `offset`/`limit` by slicing, with the same default page size as the store window.
pub fn paginate(records: Vec<Record>, offset: Option<usize>, limit: Option<usize>) -> Vec<Record> {
    let take = match (offset, limit) {
        (_, Some(limit)) => limit,
        (Some(_), None) => DEFAULT_PAGE_SIZE,
        (None, None) => usize::MAX,
    };
    records
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(take)
        .collect()
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => ordered(left, right) == Some(Ordering::Equal),
        _ => left == right,
    }
}

/// Ordering for comparison operators: defined only between like-typed scalars.
fn ordered(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(compare_text(a, b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total ordering for sorting, with null greater than every value.
fn sort_values(left: &Value, right: &Value) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => ordered(left, right).unwrap_or_else(|| {
            type_rank(left)
                .cmp(&type_rank(right))
                .then_with(|| left.to_string().cmp(&right.to_string()))
        }),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Timestamps compare chronologically even when their fractional digits differ.
fn compare_text(left: &str, right: &str) -> Ordering {
    match (parse_timestamp(left), parse_timestamp(right)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => left.cmp(right),
    }
}

/// SQL `LIKE`: `%` matches any run, `_` exactly one character.
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}
