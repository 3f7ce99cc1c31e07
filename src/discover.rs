//! Metadata resolver: recursive foreign-key closure over the catalog.
//!
//! For every table, three read-only catalog statements run pipelined inside
//! one transaction: the table lookup (`pg_class` joined to `pg_namespace`,
//! regular tables only), the column listing (`pg_attribute` with
//! `format_type`, nullability and comment, in attribute order) and the
//! FOREIGN KEY listing from `information_schema`. Table and column comments
//! are parsed as JSON and merged against the configured per-data-type
//! defaults.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError, DEFAULT_LIMIT, DEFAULT_SCHEMA};
use crate::filter::FilterOperator;
use crate::metadata::{
    ColumnBehavior, ColumnMetadata, ColumnRelation, DataType, MetadataError, TableBehavior,
    TableMetadata, TablesMetadata,
};
use crate::selector::{Column, ColumnSelector, Table};

// ---------- catalog statements ----------

const TABLE_INFO_SQL: &str = "SELECT c.relname, pg_catalog.obj_description(c.oid, 'pg_class') \
     FROM pg_catalog.pg_class c \
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r'";

const COLUMNS_SQL: &str = "SELECT a.attname, \
     pg_catalog.format_type(a.atttypid, a.atttypmod), \
     NOT a.attnotnull, \
     pg_catalog.col_description(a.attrelid, a.attnum) \
     FROM pg_catalog.pg_attribute a \
     JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2 \
     AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";

const FOREIGN_KEYS_SQL: &str = "SELECT kcu.column_name::text, \
     ccu.table_schema::text, ccu.table_name::text, ccu.column_name::text \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
     ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     JOIN information_schema.constraint_column_usage ccu \
     ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' \
     AND tc.table_schema = $1 AND tc.table_name = $2";

// ---------- api ----------

/// Entry point for discovery and querying. Holds the validated
/// configuration; connections are borrowed per call and never stored.
#[derive(Debug)]
pub struct Api {
    pub(crate) config: Config,
}

impl Api {
    /// Fills in the schema (`public`) and default limit (200) when unset
    /// and validates the configuration.
    pub fn new(mut config: Config) -> Result<Api, ConfigError> {
        if config.schema.is_empty() {
            config.schema = DEFAULT_SCHEMA.to_string();
        }
        if config.default_limit == 0 {
            config.default_limit = DEFAULT_LIMIT;
        }
        config.validate()?;
        Ok(Api { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Discover the base table and every table transitively reachable from
    /// it via foreign keys, within the configured schema.
    pub async fn discover(
        &self,
        cancel: &CancellationToken,
        client: &mut Client,
        base_table: &Table,
    ) -> Result<DiscoverResult, DiscoverError> {
        if !base_table.is_valid() {
            return Err(DiscoverError::InvalidBaseTable(base_table.clone()));
        }

        let mut known = TablesMetadata::default();
        let mut pending = vec![base_table.clone()];
        while let Some(table) = pending.pop() {
            if known.0.contains_key(&table) {
                continue;
            }
            let foreign_tables = self.discover_single(cancel, client, &mut known, &table).await?;
            for foreign in foreign_tables {
                if !known.0.contains_key(&foreign) {
                    pending.push(foreign);
                }
            }
        }

        known.validate().map_err(DiscoverError::Integrity)?;
        let columns_metadata = known
            .flatten_columns(base_table)
            .map_err(DiscoverError::Integrity)?;

        Ok(DiscoverResult {
            base_table: base_table.clone(),
            tables_metadata: known,
            columns_metadata,
        })
    }

    /// Reflect one table: three catalog statements pipelined in a read-only
    /// transaction. Inserts the table's metadata into `known` and returns
    /// the set of foreign tables its columns reference.
    async fn discover_single(
        &self,
        cancel: &CancellationToken,
        client: &mut Client,
        known: &mut TablesMetadata,
        table: &Table,
    ) -> Result<BTreeSet<Table>, DiscoverError> {
        tracing::debug!(schema = %self.config.schema, table = %table, "discovering table");

        let tx = tokio::select! {
            res = client.build_transaction().read_only(true).start() => {
                res.map_err(|source| DiscoverError::Db { context: "failed to begin transaction", source })?
            }
            _ = cancel.cancelled() => return Err(DiscoverError::Cancelled),
        };

        let table_name = table.as_str();
        let params: [&(dyn ToSql + Sync); 2] = [&self.config.schema, &table_name];

        let (info_row, column_rows, fk_rows) = tokio::select! {
            res = async {
                tokio::try_join!(
                    tx.query_opt(TABLE_INFO_SQL, &params),
                    tx.query(COLUMNS_SQL, &params),
                    tx.query(FOREIGN_KEYS_SQL, &params),
                )
            } => res.map_err(|source| DiscoverError::Db { context: "catalog lookup failed", source })?,
            _ = cancel.cancelled() => return Err(DiscoverError::Cancelled),
        };

        // table info
        let info_row = info_row.ok_or_else(|| DiscoverError::TableNotFound {
            schema: self.config.schema.clone(),
            table: table.clone(),
        })?;
        let name: String = info_row
            .try_get(0)
            .map_err(|source| DiscoverError::Db { context: "failed to scan table info", source })?;
        let comment: Option<String> = info_row
            .try_get(1)
            .map_err(|source| DiscoverError::Db { context: "failed to scan table info", source })?;
        let name = Table::new(name);
        let behavior = parse_table_behavior(&name, comment.as_deref())?;

        // columns
        let mut columns: BTreeMap<Column, ColumnMetadata> = BTreeMap::new();
        for row in &column_rows {
            let scan = |source| DiscoverError::Db { context: "failed to scan column details", source };
            let column_name: String = row.try_get(0).map_err(scan)?;
            let data_type: String = row.try_get(1).map_err(scan)?;
            let is_nullable: bool = row.try_get(2).map_err(scan)?;
            let comment: Option<String> = row.try_get(3).map_err(scan)?;

            let column_name = Column::new(column_name);
            let data_type = DataType::new(data_type);
            let behavior = self.parse_and_merge_column_behavior(
                &name,
                &column_name,
                &data_type,
                comment.as_deref(),
            )?;

            columns.insert(
                column_name.clone(),
                ColumnMetadata {
                    name: column_name,
                    table: name.clone(),
                    data_type,
                    is_nullable,
                    relation: None,
                    behavior,
                },
            );
        }

        // foreign keys
        let mut other_tables = BTreeSet::new();
        for row in &fk_rows {
            let scan = |source| DiscoverError::Db { context: "failed to scan foreign key details", source };
            let local_column: String = row.try_get(0).map_err(scan)?;
            let foreign_schema: String = row.try_get(1).map_err(scan)?;
            let foreign_table: String = row.try_get(2).map_err(scan)?;
            let foreign_column: String = row.try_get(3).map_err(scan)?;

            if foreign_schema != self.config.schema {
                tracing::warn!(
                    table = %name,
                    column = %local_column,
                    foreign_schema = %foreign_schema,
                    "skipping foreign key outside the configured schema"
                );
                continue;
            }

            let local_column = Column::new(local_column);
            let foreign_table = Table::new(foreign_table);
            let column = columns
                .get_mut(&local_column)
                .ok_or_else(|| DiscoverError::UnknownFkColumn {
                    table: name.clone(),
                    column: local_column.clone(),
                })?;
            column.relation = Some(ColumnRelation {
                table: foreign_table.clone(),
                column: Column::new(foreign_column),
            });
            other_tables.insert(foreign_table);
        }

        // nothing was written; committing releases the snapshot
        tokio::select! {
            res = tx.commit() => {
                res.map_err(|source| DiscoverError::Db { context: "failed to commit transaction", source })?
            }
            _ = cancel.cancelled() => return Err(DiscoverError::Cancelled),
        };

        known.0.insert(
            name.clone(),
            TableMetadata { name, columns, behavior },
        );

        Ok(other_tables)
    }

    /// Merge a column's comment JSON against the data-type default.
    ///
    /// Keys absent from the comment take the default's value; unless
    /// `omitDefaultFilterOperations` ends up set, the default operations are
    /// appended. The final list is deduplicated, lexically sorted, cleared
    /// when filtering is not allowed, and checked against the registry.
    fn parse_and_merge_column_behavior(
        &self,
        table: &Table,
        column: &Column,
        data_type: &DataType,
        raw: Option<&str>,
    ) -> Result<ColumnBehavior, DiscoverError> {
        let default = self
            .config
            .column_defaults
            .get(data_type)
            .or(self.config.column_unknown_default.as_ref())
            .ok_or_else(|| DiscoverError::NoColumnDefaults {
                table: table.clone(),
                column: column.clone(),
                data_type: data_type.clone(),
            })?;

        let mut behavior = match raw {
            None | Some("") => default.clone(),
            Some(raw) => {
                let comment_error = |source| DiscoverError::Comment {
                    table: table.clone(),
                    column: Some(column.clone()),
                    source,
                };
                // first pass observes which keys are present at all
                let present: serde_json::Map<String, JsonValue> =
                    serde_json::from_str(raw).map_err(comment_error)?;
                let mut behavior: ColumnBehavior =
                    serde_json::from_str(raw).map_err(comment_error)?;

                if !present.contains_key("allowSorting") {
                    behavior.allow_sorting = default.allow_sorting;
                }
                if !present.contains_key("allowFiltering") {
                    behavior.allow_filtering = default.allow_filtering;
                }
                if !present.contains_key("omitDefaultFilterOperations") {
                    behavior.omit_default_filter_operations = default.omit_default_filter_operations;
                }
                if !present.contains_key("filterOperations") {
                    behavior.filter_operations = default.filter_operations.clone();
                }

                if !behavior.omit_default_filter_operations {
                    behavior
                        .filter_operations
                        .extend(default.filter_operations.iter().cloned());
                }
                behavior
            }
        };

        behavior.filter_operations = unique_sorted(behavior.filter_operations);
        if !behavior.allow_filtering {
            behavior.filter_operations.clear();
        }

        for operator in &behavior.filter_operations {
            if !self.config.filter_operations.is_registered(data_type, operator) {
                return Err(DiscoverError::UnregisteredOperator {
                    table: table.clone(),
                    column: column.clone(),
                    data_type: data_type.clone(),
                    operator: operator.clone(),
                });
            }
        }

        Ok(behavior)
    }
}

fn parse_table_behavior(table: &Table, raw: Option<&str>) -> Result<TableBehavior, DiscoverError> {
    match raw {
        None | Some("") => Ok(TableBehavior::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|source| DiscoverError::Comment {
            table: table.clone(),
            column: None,
            source,
        }),
    }
}

fn unique_sorted(operations: Vec<FilterOperator>) -> Vec<FilterOperator> {
    let set: BTreeSet<FilterOperator> = operations.into_iter().collect();
    set.into_iter().collect()
}

// ---------- result ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResult {
    pub base_table: Table,
    pub tables_metadata: TablesMetadata,
    /// Every reachable selector (written without table segments) mapped to
    /// the column it resolves to.
    pub columns_metadata: BTreeMap<ColumnSelector, ColumnMetadata>,
}

// ---------- errors ----------

#[derive(Debug)]
pub enum DiscoverError {
    InvalidBaseTable(Table),
    TableNotFound { schema: String, table: Table },
    Comment { table: Table, column: Option<Column>, source: serde_json::Error },
    NoColumnDefaults { table: Table, column: Column, data_type: DataType },
    UnregisteredOperator { table: Table, column: Column, data_type: DataType, operator: FilterOperator },
    UnknownFkColumn { table: Table, column: Column },
    Integrity(MetadataError),
    Db { context: &'static str, source: tokio_postgres::Error },
    Cancelled,
}

impl fmt::Display for DiscoverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoverError::InvalidBaseTable(t) => write!(f, "invalid base table '{t}'"),
            DiscoverError::TableNotFound { schema, table } => {
                write!(f, "table {schema}.{table} not found")
            }
            DiscoverError::Comment { table, column, source } => match column {
                Some(column) => write!(
                    f,
                    "failed to parse comment of column '{column}' in table '{table}': {source}"
                ),
                None => write!(f, "failed to parse comment of table '{table}': {source}"),
            },
            DiscoverError::NoColumnDefaults { table, column, data_type } => write!(
                f,
                "no column defaults for data type '{data_type}' (column '{column}' in table '{table}')"
            ),
            DiscoverError::UnregisteredOperator { table, column, data_type, operator } => write!(
                f,
                "filter operation '{operator}' on column '{column}' in table '{table}' is not registered for data type '{data_type}'"
            ),
            DiscoverError::UnknownFkColumn { table, column } => write!(
                f,
                "foreign key references column '{column}' not found in table '{table}'"
            ),
            DiscoverError::Integrity(e) => write!(f, "invalid table metadata: {e}"),
            DiscoverError::Db { context, source } => write!(f, "{context}: {source}"),
            DiscoverError::Cancelled => write!(f, "discovery cancelled"),
        }
    }
}

impl std::error::Error for DiscoverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiscoverError::Comment { source, .. } => Some(source),
            DiscoverError::Integrity(e) => Some(e),
            DiscoverError::Db { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOperations;

    fn test_api() -> Api {
        let config = Config {
            filter_operations: FilterOperations::defaults(),
            column_defaults: [
                (
                    DataType::from("integer"),
                    ColumnBehavior {
                        allow_sorting: true,
                        allow_filtering: true,
                        filter_operations: vec!["equals".into(), "notEquals".into()],
                        ..Default::default()
                    },
                ),
                (
                    DataType::from("text"),
                    ColumnBehavior {
                        allow_sorting: false,
                        allow_filtering: true,
                        filter_operations: vec!["equals".into(), "contains".into()],
                        ..Default::default()
                    },
                ),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        Api::new(config).expect("test config should validate")
    }

    fn merge(api: &Api, data_type: &str, raw: Option<&str>) -> Result<ColumnBehavior, DiscoverError> {
        api.parse_and_merge_column_behavior(
            &Table::from("table1"),
            &Column::from("col1"),
            &DataType::from(data_type),
            raw,
        )
    }

    #[test]
    fn test_new_fills_defaults() {
        let api = test_api();
        assert_eq!(api.config().schema, "public");
        assert_eq!(api.config().default_limit, DEFAULT_LIMIT);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = Api::new(Config::default()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyFilterOperations), "got {err}");
    }

    #[test]
    fn test_merge_absent_comment_takes_default() {
        let api = test_api();
        let b = merge(&api, "integer", None).unwrap();
        assert!(b.allow_sorting);
        assert!(b.allow_filtering);
        assert_eq!(b.filter_operations, vec!["equals".into(), "notEquals".into()]);

        // empty comment behaves like an absent one
        let b2 = merge(&api, "integer", Some("")).unwrap();
        assert_eq!(b, b2);
    }

    #[test]
    fn test_merge_present_keys_override() {
        let api = test_api();
        let b = merge(
            &api,
            "integer",
            Some(r#"{"allowSorting": false, "allowFiltering": false}"#),
        )
        .unwrap();
        assert!(!b.allow_sorting);
        assert!(!b.allow_filtering);
        // filtering disabled clears the operations
        assert!(b.filter_operations.is_empty());
    }

    #[test]
    fn test_merge_absent_keys_copy_default() {
        let api = test_api();
        let b = merge(&api, "integer", Some(r#"{"properties": {"k": "v"}}"#)).unwrap();
        assert!(b.allow_sorting, "allowSorting absent, default applies");
        assert!(b.allow_filtering);
        assert_eq!(b.properties.get("k").map(String::as_str), Some("v"));
        assert_eq!(b.filter_operations, vec!["equals".into(), "notEquals".into()]);
    }

    #[test]
    fn test_merge_concatenates_defaults_sorted() {
        let api = test_api();
        let b = merge(
            &api,
            "integer",
            Some(r#"{"filterOperations": ["greater", "equals"]}"#),
        )
        .unwrap();
        // own ops plus defaults, deduplicated and lexically sorted
        assert_eq!(
            b.filter_operations,
            vec!["equals".into(), "greater".into(), "notEquals".into()]
        );
    }

    #[test]
    fn test_merge_omit_default_operations() {
        let api = test_api();
        let b = merge(
            &api,
            "integer",
            Some(r#"{"omitDefaultFilterOperations": true, "filterOperations": ["greater"]}"#),
        )
        .unwrap();
        assert_eq!(b.filter_operations, vec!["greater".into()]);
    }

    #[test]
    fn test_merge_no_defaults_for_data_type() {
        let api = test_api();
        let err = merge(&api, "boolean", None).unwrap_err();
        assert!(matches!(err, DiscoverError::NoColumnDefaults { .. }), "got {err}");
        assert!(err.to_string().contains("no column defaults for data type 'boolean'"));
    }

    #[test]
    fn test_merge_unknown_default_fallback() {
        let mut config = Config {
            filter_operations: FilterOperations::defaults(),
            column_unknown_default: Some(ColumnBehavior {
                allow_sorting: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        config.column_defaults.insert(
            DataType::from("integer"),
            ColumnBehavior::default(),
        );
        let api = Api::new(config).unwrap();

        let b = merge(&api, "boolean", None).unwrap();
        assert!(b.allow_sorting);
        assert!(!b.allow_filtering);
    }

    #[test]
    fn test_merge_malformed_comment() {
        let api = test_api();
        let err = merge(&api, "integer", Some("not json")).unwrap_err();
        assert!(matches!(err, DiscoverError::Comment { .. }), "got {err}");
    }

    #[test]
    fn test_merge_rejects_unregistered_operator() {
        let api = test_api();
        let err = merge(
            &api,
            "integer",
            Some(r#"{"filterOperations": ["contains"]}"#),
        )
        .unwrap_err();
        assert!(matches!(err, DiscoverError::UnregisteredOperator { .. }), "got {err}");
    }

    #[test]
    fn test_parse_table_behavior() {
        let table = Table::from("table1");
        assert_eq!(
            parse_table_behavior(&table, None).unwrap(),
            TableBehavior::default()
        );
        assert_eq!(
            parse_table_behavior(&table, Some("")).unwrap(),
            TableBehavior::default()
        );

        let b = parse_table_behavior(&table, Some(r#"{"properties": {"kk": "vv"}}"#)).unwrap();
        assert_eq!(b.properties.get("kk").map(String::as_str), Some("vv"));

        // unknown keys such as a description are tolerated
        let b = parse_table_behavior(&table, Some(r#"{"description": "orders"}"#)).unwrap();
        assert_eq!(b, TableBehavior::default());

        let err = parse_table_behavior(&table, Some("{broken")).unwrap_err();
        assert!(matches!(err, DiscoverError::Comment { column: None, .. }));
    }

    #[test]
    fn test_unique_sorted() {
        let ops: Vec<FilterOperator> =
            vec!["b".into(), "a".into(), "b".into(), "c".into(), "a".into()];
        let expected: Vec<FilterOperator> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(unique_sorted(ops), expected);
    }
}
