//! In-memory table/column catalog built by discovery.
//!
//! [`TablesMetadata`] is the root aggregate: a mapping of table name to
//! [`TableMetadata`]. Derived views (the flattened selector map, join
//! lists) are computed from it on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::filter::FilterOperator;
use crate::selector::{Column, ColumnSelector, ColumnSelectorFull, Table};

/// Lower-case PostgreSQL type string as produced by
/// `pg_catalog.format_type`, e.g. `integer`, `text`, `text[]`,
/// `timestamp without time zone`, or an enum type name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataType(String);

impl DataType {
    pub fn new(s: impl Into<String>) -> Self {
        DataType(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        DataType(s.to_string())
    }
}

// ---------- behavior ----------

/// Table-level metadata recovered from the table's JSON comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableBehavior {
    pub properties: BTreeMap<String, String>,
}

/// Column-level metadata recovered from the column's JSON comment, merged
/// against the per-data-type defaults from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColumnBehavior {
    pub properties: BTreeMap<String, String>,
    pub allow_sorting: bool,
    pub allow_filtering: bool,
    /// When set, the data type's default filter operations are not added to
    /// the column's own.
    pub omit_default_filter_operations: bool,
    /// Allowed filter operations, deduplicated and lexically sorted. Empty
    /// whenever `allow_filtering` is false.
    pub filter_operations: Vec<FilterOperator>,
}

// ---------- columns ----------

/// Foreign-key target of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRelation {
    pub table: Table,
    pub column: Column,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: Column,
    /// Owning table.
    pub table: Table,
    pub data_type: DataType,
    pub is_nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<ColumnRelation>,
    pub behavior: ColumnBehavior,
}

impl ColumnMetadata {
    pub fn validate(&self) -> Result<(), MetadataError> {
        if !self.name.is_valid() {
            return Err(MetadataError::InvalidColumnName(self.name.clone()));
        }
        if self.data_type.is_empty() {
            return Err(MetadataError::MissingDataType {
                table: self.table.clone(),
                column: self.name.clone(),
            });
        }
        Ok(())
    }
}

// ---------- tables ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub name: Table,
    /// Columns keyed by their name.
    pub columns: BTreeMap<Column, ColumnMetadata>,
    pub behavior: TableBehavior,
}

impl TableMetadata {
    pub fn validate(&self) -> Result<(), MetadataError> {
        if !self.name.is_valid() {
            return Err(MetadataError::InvalidTableName(self.name.clone()));
        }
        if self.columns.is_empty() {
            return Err(MetadataError::MissingColumns(self.name.clone()));
        }
        for (key, column) in &self.columns {
            column.validate()?;
            if *key != column.name {
                return Err(MetadataError::ColumnKeyMismatch {
                    table: self.name.clone(),
                    key: key.clone(),
                    name: column.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// The discovered catalog: every table reachable from the base table via
/// foreign keys, keyed by table name. Immutable once discovery returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TablesMetadata(pub BTreeMap<Table, TableMetadata>);

impl TablesMetadata {
    pub fn get(&self, table: &Table) -> Option<&TableMetadata> {
        self.0.get(table)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks the catalog invariants: keys match table names, tables have
    /// columns, every relation resolves to an existing table and column of
    /// an equal data type.
    pub fn validate(&self) -> Result<(), MetadataError> {
        for (key, table) in &self.0 {
            table.validate()?;
            if *key != table.name {
                return Err(MetadataError::TableKeyMismatch {
                    key: key.clone(),
                    name: table.name.clone(),
                });
            }

            for column in table.columns.values() {
                let Some(relation) = &column.relation else {
                    continue;
                };
                let Some(foreign_table) = self.0.get(&relation.table) else {
                    return Err(MetadataError::UnknownForeignTable {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        foreign_table: relation.table.clone(),
                    });
                };
                let Some(foreign_column) = foreign_table.columns.get(&relation.column) else {
                    return Err(MetadataError::UnknownForeignColumn {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        foreign_table: relation.table.clone(),
                        foreign_column: relation.column.clone(),
                    });
                };
                if column.data_type != foreign_column.data_type {
                    return Err(MetadataError::RelationTypeMismatch {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        data_type: column.data_type.clone(),
                        foreign_table: relation.table.clone(),
                        foreign_data_type: foreign_column.data_type.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Produces the mapping from every reachable [`ColumnSelector`] (written
    /// without table segments) to its metadata, by depth-first descent
    /// through relations rooted at `base_table`.
    ///
    /// Descent is pruned when a relation targets a table already on the
    /// current path, so cyclic schemas terminate. The cycle-closing column
    /// itself is still emitted.
    pub fn flatten_columns(
        &self,
        base_table: &Table,
    ) -> Result<BTreeMap<ColumnSelector, ColumnMetadata>, MetadataError> {
        let mut result = BTreeMap::new();
        let mut path = vec![base_table.clone()];
        self.flatten_into(&mut result, &mut Vec::new(), &mut path, base_table)?;
        Ok(result)
    }

    fn flatten_into(
        &self,
        result: &mut BTreeMap<ColumnSelector, ColumnMetadata>,
        parents: &mut Vec<Column>,
        path: &mut Vec<Table>,
        table: &Table,
    ) -> Result<(), MetadataError> {
        let table_meta = self.0.get(table).ok_or_else(|| MetadataError::UnknownTable {
            table: table.clone(),
            context: format!("flattening via {:?}", parents),
        })?;

        for (column, column_meta) in &table_meta.columns {
            parents.push(column.clone());
            result.insert(ColumnSelector::from_columns(parents), column_meta.clone());

            if let Some(relation) = &column_meta.relation {
                if !path.contains(&relation.table) {
                    path.push(relation.table.clone());
                    self.flatten_into(result, parents, path, &relation.table)?;
                    path.pop();
                }
            }
            parents.pop();
        }
        Ok(())
    }

    pub fn convert_column_selectors(
        &self,
        base_table: &Table,
        selectors: &[ColumnSelector],
    ) -> Result<Vec<ColumnSelectorFull>, MetadataError> {
        selectors
            .iter()
            .map(|cs| self.convert_column_selector(base_table, cs))
            .collect()
    }

    /// Lifts a user selector `c1.c2.…cn` to its full form
    /// `baseTable.c1.t2.c2.…tn.cn` by walking relations: every column but
    /// the last must own a relation, whose target supplies the next table.
    pub fn convert_column_selector(
        &self,
        base_table: &Table,
        selector: &ColumnSelector,
    ) -> Result<ColumnSelectorFull, MetadataError> {
        let columns = selector.columns();
        if columns.is_empty() || !selector.is_valid() {
            return Err(MetadataError::InvalidSelector(selector.clone()));
        }

        let mut tables = vec![base_table.clone()];
        for (i, column) in columns.iter().enumerate() {
            let table = &tables[i];
            let table_meta = self.0.get(table).ok_or_else(|| MetadataError::UnknownTable {
                table: table.clone(),
                context: format!("resolving column selector '{}'", selector),
            })?;
            let column_meta =
                table_meta
                    .columns
                    .get(column)
                    .ok_or_else(|| MetadataError::UnknownColumn {
                        table: table.clone(),
                        column: column.clone(),
                    })?;

            // not at the end, so there must be a relation to follow
            if i < columns.len() - 1 {
                let relation =
                    column_meta
                        .relation
                        .as_ref()
                        .ok_or_else(|| MetadataError::MissingRelation {
                            table: table.clone(),
                            column: column.clone(),
                        })?;
                tables.push(relation.table.clone());
            }
        }

        Ok(ColumnSelectorFull::rebuild(&tables, &columns))
    }

    /// Data type of the column a full selector points at.
    pub fn data_type_of(&self, selector: &ColumnSelectorFull) -> Result<DataType, MetadataError> {
        let (tables, columns) = selector.breakdown();
        let (table, column) = match (tables.last(), columns.last()) {
            (Some(t), Some(c)) => (t, c),
            _ => {
                return Err(MetadataError::InvalidSelector(ColumnSelector::new(
                    selector.as_str(),
                )))
            }
        };
        let table_meta = self.0.get(table).ok_or_else(|| MetadataError::UnknownTable {
            table: table.clone(),
            context: format!("resolving data type of '{}'", selector),
        })?;
        let column_meta = table_meta
            .columns
            .get(column)
            .ok_or_else(|| MetadataError::UnknownColumn {
                table: table.clone(),
                column: column.clone(),
            })?;
        Ok(column_meta.data_type.clone())
    }
}

// ---------- errors ----------

#[derive(Debug)]
pub enum MetadataError {
    InvalidTableName(Table),
    InvalidColumnName(Column),
    MissingDataType { table: Table, column: Column },
    MissingColumns(Table),
    TableKeyMismatch { key: Table, name: Table },
    ColumnKeyMismatch { table: Table, key: Column, name: Column },
    UnknownForeignTable { table: Table, column: Column, foreign_table: Table },
    UnknownForeignColumn { table: Table, column: Column, foreign_table: Table, foreign_column: Column },
    RelationTypeMismatch { table: Table, column: Column, data_type: DataType, foreign_table: Table, foreign_data_type: DataType },
    UnknownTable { table: Table, context: String },
    UnknownColumn { table: Table, column: Column },
    MissingRelation { table: Table, column: Column },
    InvalidSelector(ColumnSelector),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::InvalidTableName(t) => write!(f, "invalid table name '{t}'"),
            MetadataError::InvalidColumnName(c) => write!(f, "invalid column name '{c}'"),
            MetadataError::MissingDataType { table, column } => {
                write!(f, "missing data type for column '{column}' in table '{table}'")
            }
            MetadataError::MissingColumns(t) => write!(f, "table '{t}' has no columns"),
            MetadataError::TableKeyMismatch { key, name } => {
                write!(f, "table name '{name}' does not match key '{key}'")
            }
            MetadataError::ColumnKeyMismatch { table, key, name } => write!(
                f,
                "column name '{name}' does not match key '{key}' in table '{table}'"
            ),
            MetadataError::UnknownForeignTable { table, column, foreign_table } => write!(
                f,
                "invalid foreign table '{foreign_table}' for column '{column}' in table '{table}'"
            ),
            MetadataError::UnknownForeignColumn {
                table,
                column,
                foreign_table,
                foreign_column,
            } => write!(
                f,
                "invalid foreign column '{foreign_table}.{foreign_column}' for column '{column}' in table '{table}'"
            ),
            MetadataError::RelationTypeMismatch {
                table,
                column,
                data_type,
                foreign_table,
                foreign_data_type,
            } => write!(
                f,
                "relation of column '{column}' in table '{table}' targets '{foreign_table}' but data type '{data_type}' does not match '{foreign_data_type}'"
            ),
            MetadataError::UnknownTable { table, context } => {
                write!(f, "table '{table}' not found ({context})")
            }
            MetadataError::UnknownColumn { table, column } => {
                write!(f, "table '{table}' does not have column '{column}'")
            }
            MetadataError::MissingRelation { table, column } => write!(
                f,
                "column '{column}' in table '{table}' should have a relation, but does not"
            ),
            MetadataError::InvalidSelector(s) => write!(f, "invalid column selector '{s}'"),
        }
    }
}

impl std::error::Error for MetadataError {}
