//! Filter operator registry.
//!
//! A two-level mapping from data type to operator name to predicate
//! compiler. A predicate compiler is a pure function of a quoted column
//! expression and a JSON value that emits a parameterized SQL predicate.
//!
//! Comparison, text, timestamp and array predicates carry explicit
//! `IS NULL` / `IS NOT NULL` guards instead of relying on SQL three-valued
//! logic: positive operators exclude NULL rows, negative operators include
//! them. Compound predicates are parenthesized so they compose under
//! AND/OR.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::metadata::DataType;
use crate::sql::{BindValue, SqlExpr};

// ---------- operator names ----------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterOperator(String);

impl FilterOperator {
    pub fn new(s: impl Into<String>) -> Self {
        FilterOperator(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FilterOperator {
    fn from(s: &str) -> Self {
        FilterOperator(s.to_string())
    }
}

// ---------- errors ----------

#[derive(Debug)]
pub enum FilterError {
    /// The operator is not registered for the column's data type.
    UnsupportedOperation {
        operator: FilterOperator,
        data_type: DataType,
    },
    /// The value does not have the kind the operator requires.
    InvalidValue { expected: &'static str },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::UnsupportedOperation { operator, data_type } => {
                write!(f, "unsupported filter operation '{operator}' for data type '{data_type}'")
            }
            FilterError::InvalidValue { expected } => {
                write!(f, "argument must be {expected}")
            }
        }
    }
}

impl std::error::Error for FilterError {}

// ---------- registry ----------

/// Compiles a quoted column expression and a value into a predicate.
pub type PredicateFn = Arc<dyn Fn(&str, &JsonValue) -> Result<SqlExpr, FilterError> + Send + Sync>;

/// Registry of predicate compilers, outer-keyed by data type, inner-keyed
/// by operator name.
#[derive(Clone, Default)]
pub struct FilterOperations(BTreeMap<DataType, BTreeMap<FilterOperator, PredicateFn>>);

impl FilterOperations {
    pub fn new() -> Self {
        FilterOperations(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn register(
        &mut self,
        data_type: impl Into<DataType>,
        operator: impl Into<FilterOperator>,
        compiler: PredicateFn,
    ) {
        self.0
            .entry(data_type.into())
            .or_default()
            .insert(operator.into(), compiler);
    }

    /// Register the equality pair for a user-defined enum type. Enum values
    /// travel as their labels, so the string coercion applies.
    pub fn register_equality(&mut self, data_type: impl Into<DataType>) {
        let data_type = data_type.into();
        self.register(data_type.clone(), "equals", equals_op(text_value));
        self.register(data_type, "notEquals", not_equals_op(text_value));
    }

    pub fn lookup(&self, data_type: &DataType, operator: &FilterOperator) -> Option<&PredicateFn> {
        self.0.get(data_type)?.get(operator)
    }

    pub fn is_registered(&self, data_type: &DataType, operator: &FilterOperator) -> bool {
        self.lookup(data_type, operator).is_some()
    }

    /// Operator names registered for a data type, lexically sorted.
    pub fn operators_for(&self, data_type: &DataType) -> Vec<FilterOperator> {
        self.0
            .get(data_type)
            .map(|ops| ops.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The default operator catalog: equality for scalar types, null-safe
    /// comparisons for numbers, case-insensitive pattern matching for text,
    /// before/after for timestamps, membership and cardinality for `text[]`.
    pub fn defaults() -> Self {
        let mut r = FilterOperations::new();

        for dt in ["bigint", "integer", "real", "double precision"] {
            r.register(dt, "equals", equals_op(number_value));
            r.register(dt, "notEquals", not_equals_op(number_value));
            r.register(dt, "greater", compare_op(">"));
            r.register(dt, "greaterOrEquals", compare_op(">="));
            r.register(dt, "less", compare_op("<"));
            r.register(dt, "lessOrEquals", compare_op("<="));
            // NULL and 0 both mean "not specified" for numbers
            r.register(dt, "isSpecified", unbound_op("({c} IS NOT NULL AND {c} <> 0)"));
            r.register(dt, "isNotSpecified", unbound_op("({c} IS NULL OR {c} = 0)"));
        }

        r.register("text", "equals", equals_op(text_value));
        r.register("text", "notEquals", not_equals_op(text_value));
        r.register("text", "contains", ilike_op(|v| format!("%{v}%")));
        r.register("text", "startsWith", ilike_op(|v| format!("{v}%")));
        r.register("text", "endsWith", ilike_op(|v| format!("%{v}")));
        r.register("text", "notContains", not_ilike_op(|v| format!("%{v}%")));
        // the empty string also means "not specified" for text
        r.register("text", "isSpecified", unbound_op("({c} IS NOT NULL AND {c} <> '')"));
        r.register("text", "isNotSpecified", unbound_op("({c} IS NULL OR {c} = '')"));

        r.register("uuid", "equals", equals_op(uuid_value));
        r.register("uuid", "notEquals", not_equals_op(uuid_value));

        for dt in ["timestamp without time zone", "timestamp with time zone"] {
            r.register(dt, "before", timestamp_op("<"));
            r.register(dt, "after", timestamp_op(">"));
            // timestamps have no empty sentinel
            r.register(dt, "isSpecified", unbound_op("{c} IS NOT NULL"));
            r.register(dt, "isNotSpecified", unbound_op("{c} IS NULL"));
        }

        r.register("text[]", "equals", equals_op(text_array_value));
        r.register("text[]", "notEquals", not_equals_op(text_array_value));
        r.register("text[]", "containsElement", contains_element_op());
        r.register("text[]", "notContainsElement", not_contains_element_op());
        r.register("text[]", "hasAnyElement", unbound_op("({c} IS NOT NULL AND cardinality({c}) > 0)"));
        r.register("text[]", "hasNoElements", unbound_op("({c} IS NULL OR cardinality({c}) = 0)"));

        r
    }
}

impl fmt::Debug for FilterOperations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (dt, ops) in &self.0 {
            map.entry(dt, &ops.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}

// ---------- value coercion ----------

fn number_value(value: &JsonValue) -> Result<BindValue, FilterError> {
    match value {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(BindValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(BindValue::Float(f))
            } else {
                Err(FilterError::InvalidValue { expected: "a number" })
            }
        }
        _ => Err(FilterError::InvalidValue { expected: "a number" }),
    }
}

fn text_value(value: &JsonValue) -> Result<BindValue, FilterError> {
    match value {
        JsonValue::String(s) => Ok(BindValue::Text(s.clone())),
        _ => Err(FilterError::InvalidValue { expected: "a string" }),
    }
}

fn uuid_value(value: &JsonValue) -> Result<BindValue, FilterError> {
    let s = value
        .as_str()
        .ok_or(FilterError::InvalidValue { expected: "a UUID string" })?;
    let parsed = uuid::Uuid::parse_str(s)
        .map_err(|_| FilterError::InvalidValue { expected: "a UUID string" })?;
    Ok(BindValue::Uuid(parsed))
}

fn timestamp_value(value: &JsonValue) -> Result<DateTime<Utc>, FilterError> {
    let s = value.as_str().ok_or(FilterError::InvalidValue {
        expected: "an RFC 3339 timestamp string",
    })?;
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| FilterError::InvalidValue {
            expected: "an RFC 3339 timestamp string",
        })
}

fn text_array_value(value: &JsonValue) -> Result<BindValue, FilterError> {
    let items = value.as_array().ok_or(FilterError::InvalidValue {
        expected: "an array of strings",
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(
            item.as_str()
                .ok_or(FilterError::InvalidValue { expected: "an array of strings" })?
                .to_string(),
        );
    }
    Ok(BindValue::TextArray(out))
}

// ---------- predicate compilers ----------

type Coercer = fn(&JsonValue) -> Result<BindValue, FilterError>;

/// `c = $n`; a null value becomes `c IS NULL`.
fn equals_op(coerce: Coercer) -> PredicateFn {
    Arc::new(move |column, value| {
        if value.is_null() {
            return Ok(SqlExpr::unbound(format!("{column} IS NULL")));
        }
        Ok(SqlExpr::new(format!("{column} = ?"), vec![coerce(value)?]))
    })
}

/// `c <> $n`; a null value becomes `c IS NOT NULL`. Standard comparison
/// semantics already exclude NULL rows from `<>`.
fn not_equals_op(coerce: Coercer) -> PredicateFn {
    Arc::new(move |column, value| {
        if value.is_null() {
            return Ok(SqlExpr::unbound(format!("{column} IS NOT NULL")));
        }
        Ok(SqlExpr::new(format!("{column} <> ?"), vec![coerce(value)?]))
    })
}

/// Null-safe numeric comparison: `(c IS NOT NULL AND c <op> $n)`.
fn compare_op(op: &'static str) -> PredicateFn {
    Arc::new(move |column, value| {
        let bind = number_value(value)?;
        Ok(SqlExpr::new(
            format!("({column} IS NOT NULL AND {column} {op} ?)"),
            vec![bind],
        ))
    })
}

/// Null-safe timestamp comparison: `(c IS NOT NULL AND c <op> $n)`.
fn timestamp_op(op: &'static str) -> PredicateFn {
    Arc::new(move |column, value| {
        let ts = timestamp_value(value)?;
        Ok(SqlExpr::new(
            format!("({column} IS NOT NULL AND {column} {op} ?)"),
            vec![BindValue::Timestamp(ts)],
        ))
    })
}

/// Positive case-insensitive match: `(c IS NOT NULL AND c ILIKE $n)`.
fn ilike_op(pattern: fn(&str) -> String) -> PredicateFn {
    Arc::new(move |column, value| {
        let s = match value {
            JsonValue::String(s) => s,
            _ => return Err(FilterError::InvalidValue { expected: "a string" }),
        };
        Ok(SqlExpr::new(
            format!("({column} IS NOT NULL AND {column} ILIKE ?)"),
            vec![BindValue::Text(pattern(s))],
        ))
    })
}

/// Negative case-insensitive match includes NULL rows:
/// `(c IS NULL OR c NOT ILIKE $n)`.
fn not_ilike_op(pattern: fn(&str) -> String) -> PredicateFn {
    Arc::new(move |column, value| {
        let s = match value {
            JsonValue::String(s) => s,
            _ => return Err(FilterError::InvalidValue { expected: "a string" }),
        };
        Ok(SqlExpr::new(
            format!("({column} IS NULL OR {column} NOT ILIKE ?)"),
            vec![BindValue::Text(pattern(s))],
        ))
    })
}

/// `(c IS NOT NULL AND $n = ANY(c))`.
fn contains_element_op() -> PredicateFn {
    Arc::new(move |column, value| {
        let bind = text_value(value)?;
        Ok(SqlExpr::new(
            format!("({column} IS NOT NULL AND ? = ANY({column}))"),
            vec![bind],
        ))
    })
}

/// `(c IS NULL OR NOT ($n = ANY(c)))`.
fn not_contains_element_op() -> PredicateFn {
    Arc::new(move |column, value| {
        let bind = text_value(value)?;
        Ok(SqlExpr::new(
            format!("({column} IS NULL OR NOT (? = ANY({column})))"),
            vec![bind],
        ))
    })
}

/// Predicate without binds; `{c}` stands for the quoted column.
fn unbound_op(template: &'static str) -> PredicateFn {
    Arc::new(move |column, _value| Ok(SqlExpr::unbound(template.replace("{c}", column))))
}
