//! Query planning and execution.
//!
//! [`Api::query`] turns a selector-based read query into a pair of SQL
//! statements: the page query (SELECT list, JOINs, WHERE, ORDER BY, LIMIT,
//! OFFSET) and the total query (`count(*)` under the same FROM, JOINs and
//! WHERE). Joins are synthesized from every full selector in use, one per
//! distinct path prefix, with the dotted prefix as the alias; a join is
//! INNER only while every relation on the path so far is non-null. Both
//! statements run pipelined in one read-only transaction, total first, and
//! rows decode into JSON objects keyed by the caller's original selectors.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_postgres::types::{Kind, ToSql, Type};
use tokio_postgres::{Client, Row};
use tokio_util::sync::CancellationToken;

use crate::discover::Api;
use crate::expr::{ExprError, WhereExpression};
use crate::metadata::{MetadataError, TablesMetadata};
use crate::selector::{ColumnSelector, ColumnSelectorFull, Table};
use crate::sql::{number_placeholders, BindValue, EnumLabel, SqlExpr};

// ---------- model ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByExpression {
    pub column: ColumnSelector,
    #[serde(default)]
    pub is_descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Selectors to return, in output order.
    pub select: Vec<ColumnSelector>,
    pub from: Table,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<WhereExpression>,
    #[serde(default)]
    pub order_by: Vec<OrderByExpression>,
    /// Page size. Unset takes the configured default; zero is rejected.
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
}

impl Query {
    fn validate(&self) -> Result<(), QueryError> {
        if self.select.is_empty() {
            return Err(QueryError::Invalid("missing select".to_string()));
        }
        for selector in &self.select {
            if !selector.is_valid() {
                return Err(QueryError::Invalid(format!(
                    "invalid column selector '{selector}'"
                )));
            }
        }
        if !self.from.is_valid() {
            return Err(QueryError::Invalid(format!("invalid from: '{}'", self.from)));
        }
        if let Some(where_clause) = &self.where_clause {
            where_clause.validate().map_err(QueryError::Expr)?;
        }
        for order in &self.order_by {
            if !order.column.is_valid() {
                return Err(QueryError::Invalid(format!(
                    "invalid order by column selector '{}'",
                    order.column
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(QueryError::Invalid("invalid limit: 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// One object per row, keyed by the original selector strings of
    /// `select`, in `select` order.
    pub data: Vec<serde_json::Map<String, JsonValue>>,
    /// Effective page size.
    pub limit: u64,
    /// Total number of rows matching the query, ignoring limit and offset.
    pub total: u64,
}

/// Both generated statements with their bind values, for logging and
/// debugging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryDebug {
    pub page_sql: String,
    pub page_args: Vec<BindValue>,
    pub total_sql: String,
    pub total_args: Vec<BindValue>,
}

/// A finalized statement: dollar-numbered SQL plus its binds.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BuiltQuery {
    pub(crate) sql: String,
    pub(crate) binds: Vec<BindValue>,
}

// ---------- joins ----------

#[derive(Debug, Clone, PartialEq)]
struct Join {
    use_left_join: bool,
    from: ColumnSelectorFull,
    /// One level deeper than `from`, with the trailing column replaced by
    /// the foreign key's target column.
    to: ColumnSelectorFull,
}

impl Join {
    fn clause(&self) -> String {
        let (to_prefix, _) = self.to.split_at_last_column();
        let kind = if self.use_left_join { "LEFT" } else { "INNER" };
        format!(
            " {} JOIN \"{}\" AS \"{}\" ON {} = {}",
            kind,
            self.to.last_table(),
            to_prefix,
            self.from.quoted(),
            self.to.quoted()
        )
    }
}

/// One join per distinct path prefix across all selectors in use. The
/// left-join flag is monotone: once a nullable relation is crossed on a
/// path, every deeper join on that path is LEFT as well.
fn process_joins(
    tables: &TablesMetadata,
    columns_used: &BTreeSet<ColumnSelectorFull>,
) -> Result<Vec<Join>, QueryError> {
    let mut result = Vec::new();
    let mut already_joined: BTreeSet<String> = BTreeSet::new();

    for selector in columns_used {
        let (path_tables, path_columns) = selector.breakdown();
        if path_tables.len() == 1 {
            continue;
        }

        let mut crossed_nullable = false;
        for i in 0..path_tables.len() - 1 {
            let source_table = tables.get(&path_tables[i]).ok_or_else(|| {
                QueryError::Metadata(MetadataError::UnknownTable {
                    table: path_tables[i].clone(),
                    context: format!("joining for selector '{selector}'"),
                })
            })?;
            let source_column = source_table
                .columns
                .get(&path_columns[i])
                .ok_or_else(|| {
                    QueryError::Metadata(MetadataError::UnknownColumn {
                        table: path_tables[i].clone(),
                        column: path_columns[i].clone(),
                    })
                })?;
            let relation = source_column.relation.as_ref().ok_or_else(|| {
                QueryError::Metadata(MetadataError::MissingRelation {
                    table: path_tables[i].clone(),
                    column: path_columns[i].clone(),
                })
            })?;
            if relation.table != path_tables[i + 1] {
                return Err(QueryError::Invalid(format!(
                    "relation of column '{}' in table '{}' targets '{}', not '{}'",
                    path_columns[i],
                    path_tables[i],
                    relation.table,
                    path_tables[i + 1]
                )));
            }

            crossed_nullable = crossed_nullable || source_column.is_nullable;

            let target = ColumnSelectorFull::rebuild(&path_tables[..i + 2], &path_columns[..i + 2]);
            let (to_prefix, _) = target.split_at_last_column();
            if !already_joined.insert(to_prefix.to_string()) {
                continue;
            }

            result.push(Join {
                use_left_join: crossed_nullable,
                from: ColumnSelectorFull::rebuild(&path_tables[..i + 1], &path_columns[..i + 1]),
                to: target.replace_last_column(&relation.column),
            });
        }
    }
    Ok(result)
}

// ---------- planning ----------

impl Api {
    /// Emit the paired page/total statements for a validated query.
    pub(crate) fn convert_query(
        &self,
        tables: &TablesMetadata,
        query: &Query,
    ) -> Result<(BuiltQuery, BuiltQuery, u64), QueryError> {
        let limit = query.limit.unwrap_or(self.config.default_limit);

        let mut columns_used: BTreeSet<ColumnSelectorFull> = BTreeSet::new();
        let mut select_quoted = Vec::with_capacity(query.select.len());
        for selector in &query.select {
            let full = tables
                .convert_column_selector(&query.from, selector)
                .map_err(QueryError::Metadata)?;
            select_quoted.push(full.quoted());
            columns_used.insert(full);
        }

        let mut where_expr: Option<SqlExpr> = None;
        if let Some(where_clause) = &query.where_clause {
            let (predicate, used) = where_clause
                .to_sql(tables, &query.from, &self.config.filter_operations)
                .map_err(QueryError::Expr)?;
            columns_used.extend(used);
            where_expr = Some(predicate);
        }

        let joins = process_joins(tables, &columns_used)?;

        let mut order_parts = Vec::with_capacity(query.order_by.len());
        for order in &query.order_by {
            let full = tables
                .convert_column_selector(&query.from, &order.column)
                .map_err(QueryError::Metadata)?;
            if !columns_used.contains(&full) {
                return Err(QueryError::Invalid(format!(
                    "order by column selector '{}' is not used in select",
                    order.column
                )));
            }
            if order.is_descending {
                order_parts.push(format!("{} DESC", full.quoted()));
            } else {
                order_parts.push(full.quoted());
            }
        }

        let mut page = format!(
            "SELECT {} FROM {}",
            select_quoted.join(", "),
            query.from.quoted()
        );
        let mut total = format!("SELECT count(*) FROM {}", query.from.quoted());

        for join in &joins {
            let clause = join.clause();
            page.push_str(&clause);
            total.push_str(&clause);
        }

        let mut binds = Vec::new();
        if let Some(where_expr) = where_expr {
            page.push_str(" WHERE ");
            page.push_str(&where_expr.sql);
            total.push_str(" WHERE ");
            total.push_str(&where_expr.sql);
            binds = where_expr.binds;
        }

        if !order_parts.is_empty() {
            page.push_str(" ORDER BY ");
            page.push_str(&order_parts.join(", "));
        }
        page.push_str(&format!(" LIMIT {} OFFSET {}", limit, query.offset));

        Ok((
            BuiltQuery {
                sql: number_placeholders(&page),
                binds: binds.clone(),
            },
            BuiltQuery {
                sql: number_placeholders(&total),
                binds,
            },
            limit,
        ))
    }

    /// Execute a read query against the discovered catalog: both statements
    /// are sent pipelined in one read-only transaction, total first, and
    /// read back in the same order.
    pub async fn query(
        &self,
        cancel: &CancellationToken,
        client: &mut Client,
        tables: &TablesMetadata,
        query: &Query,
    ) -> Result<(QueryResult, QueryDebug), QueryError> {
        query.validate()?;
        let (page, total, limit) = self.convert_query(tables, query)?;
        let query_debug = QueryDebug {
            page_sql: page.sql.clone(),
            page_args: page.binds.clone(),
            total_sql: total.sql.clone(),
            total_args: total.binds.clone(),
        };
        tracing::debug!(
            page_sql = %query_debug.page_sql,
            page_args = ?query_debug.page_args,
            total_sql = %query_debug.total_sql,
            "executing query"
        );

        let tx = tokio::select! {
            res = client.build_transaction().read_only(true).start() => {
                res.map_err(|source| QueryError::Db { context: "failed to begin transaction", source })?
            }
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
        };

        let total_params: Vec<&(dyn ToSql + Sync)> =
            total.binds.iter().map(|b| b as &(dyn ToSql + Sync)).collect();
        let page_params: Vec<&(dyn ToSql + Sync)> =
            page.binds.iter().map(|b| b as &(dyn ToSql + Sync)).collect();

        let (total_row, page_rows) = tokio::select! {
            res = async {
                tokio::try_join!(
                    tx.query_one(&total.sql, &total_params),
                    tx.query(&page.sql, &page_params),
                )
            } => res.map_err(|source| QueryError::Db { context: "query failed", source })?,
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
        };

        let total_count: i64 = total_row
            .try_get(0)
            .map_err(|source| QueryError::Db { context: "failed to scan total", source })?;

        let mut data = Vec::with_capacity(page_rows.len());
        for row in &page_rows {
            let mut object = serde_json::Map::new();
            for (idx, selector) in query.select.iter().enumerate() {
                let value = decode_value(row, idx).map_err(|message| QueryError::Decode {
                    column: selector.clone(),
                    message,
                })?;
                object.insert(selector.to_string(), value);
            }
            data.push(object);
        }

        tokio::select! {
            res = tx.commit() => {
                res.map_err(|source| QueryError::Db { context: "failed to commit transaction", source })?
            }
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
        };

        Ok((
            QueryResult {
                data,
                limit,
                total: total_count as u64,
            },
            query_debug,
        ))
    }
}

// ---------- row decoding ----------

/// Decode one result cell into JSON based on its wire type. NULL decodes to
/// JSON null for every supported type.
fn decode_value(row: &Row, idx: usize) -> Result<JsonValue, String> {
    let ty = row.columns()[idx].type_().clone();
    let db = |e: tokio_postgres::Error| e.to_string();

    let value = if ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map_err(db)?
            .map(|v| JsonValue::from(f64::from(v)))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::NUMERIC {
        use rust_decimal::prelude::ToPrimitive;
        row.try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .map_err(db)?
            .map(|d| match d.to_f64() {
                Some(f) => JsonValue::from(f),
                None => JsonValue::from(d.to_string()),
            })
    } else if ty == Type::TEXT || ty == Type::VARCHAR || ty == Type::BPCHAR || ty == Type::NAME {
        row.try_get::<_, Option<String>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(idx)
            .map_err(db)?
            .map(|u| JsonValue::from(u.to_string()))
    } else if ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map_err(db)?
            .map(|t| JsonValue::from(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
    } else if ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map_err(db)?
            .map(|t| JsonValue::from(t.to_rfc3339()))
    } else if ty == Type::DATE {
        row.try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map_err(db)?
            .map(|d| JsonValue::from(d.to_string()))
    } else if ty == Type::JSON || ty == Type::JSONB {
        row.try_get::<_, Option<JsonValue>>(idx).map_err(db)?
    } else if ty == Type::TEXT_ARRAY || ty == Type::VARCHAR_ARRAY {
        row.try_get::<_, Option<Vec<String>>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::INT4_ARRAY {
        row.try_get::<_, Option<Vec<i32>>>(idx).map_err(db)?.map(JsonValue::from)
    } else if ty == Type::INT8_ARRAY {
        row.try_get::<_, Option<Vec<i64>>>(idx).map_err(db)?.map(JsonValue::from)
    } else if matches!(ty.kind(), Kind::Enum(_)) {
        row.try_get::<_, Option<EnumLabel>>(idx)
            .map_err(db)?
            .map(|label| JsonValue::from(label.0))
    } else {
        return Err(format!("unsupported data type '{ty}'"));
    };

    Ok(value.unwrap_or(JsonValue::Null))
}

// ---------- errors ----------

#[derive(Debug)]
pub enum QueryError {
    Invalid(String),
    Metadata(MetadataError),
    Expr(ExprError),
    Db { context: &'static str, source: tokio_postgres::Error },
    Decode { column: ColumnSelector, message: String },
    Cancelled,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Invalid(msg) => write!(f, "invalid query: {msg}"),
            QueryError::Metadata(e) => write!(f, "invalid query: {e}"),
            QueryError::Expr(e) => write!(f, "invalid query: {e}"),
            QueryError::Db { context, source } => write!(f, "{context}: {source}"),
            QueryError::Decode { column, message } => {
                write!(f, "failed to decode column '{column}': {message}")
            }
            QueryError::Cancelled => write!(f, "query cancelled"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Metadata(e) => Some(e),
            QueryError::Expr(e) => Some(e),
            QueryError::Db { source, .. } => Some(source),
            _ => None,
        }
    }
}
