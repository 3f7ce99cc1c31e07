//! Parameterized SQL fragments.
//!
//! Predicate compilers and the query planner assemble SQL with `?`
//! placeholders and an ordered bind list; [`number_placeholders`] turns the
//! final statement into the dollar-numbered form the wire protocol expects.
//! [`BindValue`] carries a typed bind and dispatches on the concrete wire
//! type at encode time, so a JSON number can be bound against `smallint`,
//! `integer`, `bigint`, `real`, `double precision` or `numeric` columns
//! alike.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};

// ---------- fragments ----------

/// SQL text with `?` placeholders plus the binds filling them, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlExpr {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

impl SqlExpr {
    pub fn new(sql: impl Into<String>, binds: Vec<BindValue>) -> Self {
        SqlExpr { sql: sql.into(), binds }
    }

    pub fn unbound(sql: impl Into<String>) -> Self {
        SqlExpr { sql: sql.into(), binds: Vec::new() }
    }

    /// Parenthesized conjunction of the parts, binds concatenated in order.
    pub fn and(parts: Vec<SqlExpr>) -> Self {
        Self::combine(parts, " AND ")
    }

    /// Parenthesized disjunction of the parts, binds concatenated in order.
    pub fn or(parts: Vec<SqlExpr>) -> Self {
        Self::combine(parts, " OR ")
    }

    fn combine(parts: Vec<SqlExpr>, separator: &str) -> Self {
        let sql = format!(
            "({})",
            parts
                .iter()
                .map(|p| p.sql.as_str())
                .collect::<Vec<_>>()
                .join(separator)
        );
        let binds = parts.into_iter().flat_map(|p| p.binds).collect();
        SqlExpr { sql, binds }
    }
}

/// Replace each `?` with `$1`, `$2`, … in order. Identifiers are restricted
/// to `[a-zA-Z0-9_]` and values are always bound, so a literal `?` cannot
/// occur outside a placeholder position.
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

// ---------- bind values ----------

/// A typed query parameter. Encoding dispatches on the wire type the server
/// inferred for the placeholder, which is only known at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(uuid::Uuid),
    Timestamp(DateTime<Utc>),
    TextArray(Vec<String>),
}

fn is_text_like(ty: &Type) -> bool {
    *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
}

fn bind_error(value: &BindValue, ty: &Type) -> Box<dyn std::error::Error + Sync + Send> {
    format!("cannot bind {value:?} to a column of type {ty}").into()
}

impl ToSql for BindValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            BindValue::Null => Ok(IsNull::Yes),
            BindValue::Bool(v) => v.to_sql(ty, out),
            BindValue::Int(v) => {
                if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    v.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*v as f64).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from(*v).to_sql(ty, out)
                } else {
                    Err(bind_error(self, ty))
                }
            }
            BindValue::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    v.to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from_f64(*v)
                        .ok_or_else(|| bind_error(self, ty))?
                        .to_sql(ty, out)
                } else {
                    Err(bind_error(self, ty))
                }
            }
            BindValue::Text(v) => {
                if is_text_like(ty) || *ty == Type::UNKNOWN {
                    v.as_str().to_sql(ty, out)
                } else if matches!(ty.kind(), Kind::Enum(_)) {
                    // enum send format is the bare label
                    out.extend_from_slice(v.as_bytes());
                    Ok(IsNull::No)
                } else {
                    Err(bind_error(self, ty))
                }
            }
            BindValue::Uuid(v) => v.to_sql(ty, out),
            BindValue::Timestamp(v) => {
                if *ty == Type::TIMESTAMPTZ {
                    v.to_sql(ty, out)
                } else if *ty == Type::TIMESTAMP {
                    v.naive_utc().to_sql(ty, out)
                } else {
                    Err(bind_error(self, ty))
                }
            }
            BindValue::TextArray(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // dispatch happens in to_sql; a mismatch errors there with context
        true
    }

    to_sql_checked!();
}

// ---------- enum decode ----------

/// Decodes a user-defined enum value as its label. `String` does not accept
/// enum types, so row decoding goes through this wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumLabel(pub String);

impl<'a> FromSql<'a> for EnumLabel {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(EnumLabel(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_))
    }
}
