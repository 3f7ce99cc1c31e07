//! Where-expression tree and its compiler.
//!
//! [`WhereExpression`] is a sealed variant: a node is exactly one of a
//! filter leaf, a conjunction or a disjunction. The externally tagged serde
//! form matches the wire shape (`{"filter": …}`, `{"and": […]}`,
//! `{"or": […]}`); a JSON object with several keys set does not parse.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;

use crate::filter::{FilterError, FilterOperations, FilterOperator};
use crate::metadata::{MetadataError, TablesMetadata};
use crate::selector::{ColumnSelector, ColumnSelectorFull, Table};
use crate::sql::SqlExpr;

// ---------- model ----------

/// A single predicate: column selector, operator name and argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub column: ColumnSelector,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WhereExpression {
    Filter(Filter),
    And(Vec<WhereExpression>),
    Or(Vec<WhereExpression>),
}

impl WhereExpression {
    /// Structural validation. Violations are reported with the dotted path
    /// of the offending node, e.g. `.and[2].or[0]`.
    pub fn validate(&self) -> Result<(), ExprError> {
        self.validate_at("")
    }

    fn validate_at(&self, path: &str) -> Result<(), ExprError> {
        match self {
            WhereExpression::Filter(filter) => {
                if !filter.column.is_valid() {
                    return Err(ExprError::Structure {
                        path: path.to_string(),
                        reason: format!("invalid column '{}'", filter.column),
                    });
                }
                if filter.operator.is_empty() {
                    return Err(ExprError::Structure {
                        path: path.to_string(),
                        reason: "missing operator".to_string(),
                    });
                }
                Ok(())
            }
            WhereExpression::And(parts) => {
                if parts.is_empty() {
                    return Err(ExprError::Structure {
                        path: path.to_string(),
                        reason: "empty 'and' expression".to_string(),
                    });
                }
                for (idx, part) in parts.iter().enumerate() {
                    part.validate_at(&format!("{path}.and[{idx}]"))?;
                }
                Ok(())
            }
            WhereExpression::Or(parts) => {
                if parts.is_empty() {
                    return Err(ExprError::Structure {
                        path: path.to_string(),
                        reason: "empty 'or' expression".to_string(),
                    });
                }
                for (idx, part) in parts.iter().enumerate() {
                    part.validate_at(&format!("{path}.or[{idx}]"))?;
                }
                Ok(())
            }
        }
    }

    /// Compile to a parameterized predicate plus the set of full selectors
    /// referenced anywhere inside the expression. Filter columns are
    /// resolved against the catalog; the operator is looked up under the
    /// resolved column's data type.
    pub fn to_sql(
        &self,
        tables: &TablesMetadata,
        base_table: &Table,
        registry: &FilterOperations,
    ) -> Result<(SqlExpr, BTreeSet<ColumnSelectorFull>), ExprError> {
        match self {
            WhereExpression::Filter(filter) => {
                let full = tables
                    .convert_column_selector(base_table, &filter.column)
                    .map_err(ExprError::Metadata)?;
                let data_type = tables.data_type_of(&full).map_err(ExprError::Metadata)?;

                let compiler = registry.lookup(&data_type, &filter.operator).ok_or_else(|| {
                    ExprError::Filter {
                        column: filter.column.clone(),
                        source: FilterError::UnsupportedOperation {
                            operator: filter.operator.clone(),
                            data_type: data_type.clone(),
                        },
                    }
                })?;

                let predicate =
                    compiler(&full.quoted(), &filter.value).map_err(|source| ExprError::Filter {
                        column: filter.column.clone(),
                        source,
                    })?;

                let mut columns = BTreeSet::new();
                columns.insert(full);
                Ok((predicate, columns))
            }
            WhereExpression::And(parts) => {
                Self::combine(parts, tables, base_table, registry, SqlExpr::and)
            }
            WhereExpression::Or(parts) => {
                Self::combine(parts, tables, base_table, registry, SqlExpr::or)
            }
        }
    }

    fn combine(
        parts: &[WhereExpression],
        tables: &TablesMetadata,
        base_table: &Table,
        registry: &FilterOperations,
        join: fn(Vec<SqlExpr>) -> SqlExpr,
    ) -> Result<(SqlExpr, BTreeSet<ColumnSelectorFull>), ExprError> {
        let mut compiled = Vec::with_capacity(parts.len());
        let mut columns = BTreeSet::new();
        for part in parts {
            let (predicate, used) = part.to_sql(tables, base_table, registry)?;
            compiled.push(predicate);
            columns.extend(used);
        }
        Ok((join(compiled), columns))
    }
}

// ---------- errors ----------

#[derive(Debug)]
pub enum ExprError {
    Structure { path: String, reason: String },
    Filter { column: ColumnSelector, source: FilterError },
    Metadata(MetadataError),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::Structure { path, reason } => {
                if path.is_empty() {
                    write!(f, "invalid where expression: {reason}")
                } else {
                    write!(f, "invalid where expression at {path}: {reason}")
                }
            }
            ExprError::Filter { column, source } => {
                write!(f, "filter on column '{column}': {source}")
            }
            ExprError::Metadata(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ExprError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExprError::Filter { source, .. } => Some(source),
            ExprError::Metadata(e) => Some(e),
            ExprError::Structure { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        ColumnBehavior, ColumnMetadata, ColumnRelation, DataType, TableBehavior, TableMetadata,
    };
    use crate::selector::Column;
    use crate::sql::BindValue;
    use serde_json::json;

    fn catalog() -> TablesMetadata {
        let mut t1 = TableMetadata {
            name: Table::from("table1"),
            columns: Default::default(),
            behavior: TableBehavior::default(),
        };
        for (name, dt, relation) in [
            ("id", "integer", None),
            ("name", "text", None),
            ("age", "integer", None),
            (
                "other",
                "integer",
                Some(ColumnRelation {
                    table: Table::from("table2"),
                    column: Column::from("id"),
                }),
            ),
        ] {
            t1.columns.insert(
                Column::from(name),
                ColumnMetadata {
                    name: Column::from(name),
                    table: t1.name.clone(),
                    data_type: DataType::from(dt),
                    is_nullable: false,
                    relation,
                    behavior: ColumnBehavior::default(),
                },
            );
        }

        let mut t2 = TableMetadata {
            name: Table::from("table2"),
            columns: Default::default(),
            behavior: TableBehavior::default(),
        };
        for (name, dt) in [("id", "integer"), ("label", "text")] {
            t2.columns.insert(
                Column::from(name),
                ColumnMetadata {
                    name: Column::from(name),
                    table: t2.name.clone(),
                    data_type: DataType::from(dt),
                    is_nullable: false,
                    relation: None,
                    behavior: ColumnBehavior::default(),
                },
            );
        }

        TablesMetadata(
            [t1, t2]
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        )
    }

    fn filter(column: &str, operator: &str, value: JsonValue) -> WhereExpression {
        WhereExpression::Filter(Filter {
            column: ColumnSelector::from(column),
            operator: FilterOperator::from(operator),
            value,
        })
    }

    #[test]
    fn test_leaf_compiles_and_reports_column() {
        let catalog = catalog();
        let registry = FilterOperations::defaults();
        let expr = filter("name", "equals", json!("Bob"));

        let (predicate, used) = expr
            .to_sql(&catalog, &Table::from("table1"), &registry)
            .unwrap();
        assert_eq!(predicate.sql, "\"table1\".\"name\" = ?");
        assert_eq!(predicate.binds, vec![BindValue::Text("Bob".into())]);
        assert_eq!(
            used.into_iter().collect::<Vec<_>>(),
            vec![ColumnSelectorFull::from("table1.name")]
        );
    }

    #[test]
    fn test_related_column_resolves_through_relation() {
        let catalog = catalog();
        let registry = FilterOperations::defaults();
        let expr = filter("other.label", "contains", json!("x"));

        let (predicate, used) = expr
            .to_sql(&catalog, &Table::from("table1"), &registry)
            .unwrap();
        assert_eq!(
            predicate.sql,
            "(\"table1.other.table2\".\"label\" IS NOT NULL AND \"table1.other.table2\".\"label\" ILIKE ?)"
        );
        assert!(used.contains(&ColumnSelectorFull::from("table1.other.table2.label")));
    }

    #[test]
    fn test_and_or_nesting() {
        let catalog = catalog();
        let registry = FilterOperations::defaults();
        let expr = WhereExpression::Or(vec![
            filter("other.id", "equals", JsonValue::Null),
            WhereExpression::And(vec![
                filter("name", "equals", json!("Bob")),
                filter("age", "greater", json!(30)),
            ]),
        ]);

        let (predicate, used) = expr
            .to_sql(&catalog, &Table::from("table1"), &registry)
            .unwrap();
        assert_eq!(
            predicate.sql,
            "(\"table1.other.table2\".\"id\" IS NULL OR (\"table1\".\"name\" = ? AND (\"table1\".\"age\" IS NOT NULL AND \"table1\".\"age\" > ?)))"
        );
        assert_eq!(
            predicate.binds,
            vec![BindValue::Text("Bob".into()), BindValue::Int(30)]
        );
        assert_eq!(used.len(), 3);
    }

    #[test]
    fn test_unsupported_operation() {
        let catalog = catalog();
        let registry = FilterOperations::defaults();
        let expr = filter("name", "greater", json!(1));

        let err = expr
            .to_sql(&catalog, &Table::from("table1"), &registry)
            .unwrap_err();
        assert!(
            err.to_string().contains("unsupported filter operation"),
            "got: {err}"
        );
    }

    #[test]
    fn test_unknown_column() {
        let catalog = catalog();
        let registry = FilterOperations::defaults();
        let expr = filter("missing", "equals", json!(1));

        let err = expr
            .to_sql(&catalog, &Table::from("table1"), &registry)
            .unwrap_err();
        assert!(matches!(err, ExprError::Metadata(_)), "got: {err}");
    }

    #[test]
    fn test_validate_paths() {
        let expr = WhereExpression::And(vec![
            filter("name", "equals", json!("x")),
            WhereExpression::Or(vec![]),
        ]);
        let err = expr.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid where expression at .and[1]: empty 'or' expression"
        );

        let expr = WhereExpression::And(vec![filter("", "equals", json!("x"))]);
        let err = expr.validate().unwrap_err();
        assert!(err.to_string().contains(".and[0]"), "got: {err}");

        let expr = filter("name", "", json!("x"));
        let err = expr.validate().unwrap_err();
        assert!(err.to_string().contains("missing operator"), "got: {err}");
    }

    #[test]
    fn test_serde_shape() {
        let expr: WhereExpression = serde_json::from_value(json!({
            "or": [
                {"filter": {"column": "other.id", "operator": "equals", "value": null}},
                {"filter": {"column": "other.id", "operator": "notEquals", "value": 1}},
            ]
        }))
        .unwrap();
        assert!(matches!(expr, WhereExpression::Or(ref parts) if parts.len() == 2));

        // a node with several variants set does not parse
        let result: Result<WhereExpression, _> = serde_json::from_value(json!({
            "and": [], "filter": {"column": "id", "operator": "equals", "value": 1}
        }));
        assert!(result.is_err());
    }
}
