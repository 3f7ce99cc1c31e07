//! Identifier and selector value types.
//!
//! A [`ColumnSelector`] is what callers write: a dotted chain of column
//! names interpreted as foreign-key hops from a base table
//! (`other_b.other_c.name`). A [`ColumnSelectorFull`] is the resolved form
//! with the intermediate table names interleaved
//! (`tableA.other_b.tableB.other_c.tableC.name`); its dotted prefix doubles
//! as a globally unique SQL alias.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Accepts PostgreSQL-style identifiers: lower-case initial, then letters,
/// digits or underscores. Names up to PostgreSQL's 63-byte limit must pass.
fn is_valid_identifier(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 2 || bytes.len() > 64 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

// ---------- table ----------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Table(String);

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        is_valid_identifier(&self.0)
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Table {
    fn from(s: &str) -> Self {
        Table(s.to_string())
    }
}

// ---------- column ----------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Column(String);

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Column(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        is_valid_identifier(&self.0)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Column {
    fn from(s: &str) -> Self {
        Column(s.to_string())
    }
}

// ---------- column selector (user form, columns only) ----------

/// Dotted chain of column names, without table segments. A single segment
/// selects a column of the base table; every further segment follows the
/// foreign-key relation of the previous column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSelector(String);

impl ColumnSelector {
    pub fn new(s: impl Into<String>) -> Self {
        ColumnSelector(s.into())
    }

    /// Build from a column chain; inverse of [`ColumnSelector::columns`].
    pub fn from_columns(columns: &[Column]) -> Self {
        let parts: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
        ColumnSelector(parts.join("."))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn columns(&self) -> Vec<Column> {
        self.0.split('.').map(Column::from).collect()
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.columns().iter().all(|c| c.is_valid())
    }
}

impl fmt::Display for ColumnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColumnSelector {
    fn from(s: &str) -> Self {
        ColumnSelector(s.to_string())
    }
}

// ---------- column selector (full form, tables interleaved) ----------

/// Selector with table names interleaved:
/// `<base table>.<column>.<foreign table>.<foreign column>…`, always an even
/// number of segments. The prefix before the last column is used verbatim as
/// the SQL alias of the table it reaches, which keeps aliases unique even
/// when the same foreign table is reached via different paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSelectorFull(String);

impl ColumnSelectorFull {
    pub fn new(s: impl Into<String>) -> Self {
        ColumnSelectorFull(s.into())
    }

    /// Interleave tables and columns back into the dotted form. The two
    /// slices must pair up one to one.
    pub fn rebuild(tables: &[Table], columns: &[Column]) -> Self {
        assert!(
            tables.len() == columns.len(),
            "selector rebuild requires as many tables ({:?}) as columns ({:?})",
            tables,
            columns
        );
        let mut parts = Vec::with_capacity(tables.len() * 2);
        for (t, c) in tables.iter().zip(columns) {
            parts.push(t.as_str());
            parts.push(c.as_str());
        }
        ColumnSelectorFull(parts.join("."))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        if self.0.is_empty() {
            return false;
        }
        // even number of segments, so an odd number of separators
        if self.0.matches('.').count() % 2 != 1 {
            return false;
        }
        let (tables, columns) = self.breakdown();
        tables.iter().all(|t| t.is_valid()) && columns.iter().all(|c| c.is_valid())
    }

    /// Split into paired `(tables, columns)` of equal length.
    /// Assumes the selector is valid.
    pub fn breakdown(&self) -> (Vec<Table>, Vec<Column>) {
        let parts: Vec<&str> = self.0.split('.').collect();
        let mut tables = Vec::with_capacity(parts.len() / 2);
        let mut columns = Vec::with_capacity(parts.len() / 2);
        for pair in parts.chunks(2) {
            tables.push(Table::from(pair[0]));
            if pair.len() > 1 {
                columns.push(Column::from(pair[1]));
            }
        }
        (tables, columns)
    }

    /// `(prefix before the last dot, last segment)`.
    pub fn split_at_last_column(&self) -> (&str, &str) {
        match self.0.rfind('.') {
            Some(idx) => (&self.0[..idx], &self.0[idx + 1..]),
            None => ("", self.0.as_str()),
        }
    }

    /// Substitute the trailing column, preserving the prefix. Used to point
    /// a join condition at the foreign key's target column.
    pub fn replace_last_column(&self, c: &Column) -> ColumnSelectorFull {
        let (prefix, _) = self.split_at_last_column();
        ColumnSelectorFull(format!("{}.{}", prefix, c))
    }

    pub fn base_table(&self) -> Table {
        Table::from(self.0.split('.').next().unwrap_or_default())
    }

    pub fn last_table(&self) -> Table {
        let (tables, _) = self.breakdown();
        tables.last().cloned().unwrap_or_else(|| Table::new(""))
    }

    /// `"prefix"."column"` with both sides double-quoted.
    pub fn quoted(&self) -> String {
        let (prefix, column) = self.split_at_last_column();
        format!("\"{}\".\"{}\"", prefix, column)
    }
}

impl fmt::Display for ColumnSelectorFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColumnSelectorFull {
    fn from(s: &str) -> Self {
        ColumnSelectorFull(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(Table::from("ab").is_valid());
        assert!(Table::from("tableA").is_valid());
        assert!(Column::from("other_b2").is_valid());

        assert!(!Table::from("").is_valid());
        assert!(!Table::from("a").is_valid(), "single char is too short");
        assert!(!Table::from("Abc").is_valid(), "must start lower-case");
        assert!(!Table::from("1abc").is_valid());
        assert!(!Column::from("a-b").is_valid());
        assert!(!Column::from("a.b").is_valid());
    }

    #[test]
    fn test_identifier_length_bounds() {
        // PostgreSQL truncates identifiers at 63 bytes; those must pass.
        let name63 = format!("a{}", "x".repeat(62));
        assert_eq!(name63.len(), 63);
        assert!(Table::new(name63.clone()).is_valid());
        assert!(Column::new(name63).is_valid());

        let name65 = format!("a{}", "x".repeat(64));
        assert!(!Table::new(name65).is_valid());
    }

    #[test]
    fn test_selector_columns() {
        let cs = ColumnSelector::from("other_b.other_c.name");
        assert_eq!(
            cs.columns(),
            vec![
                Column::from("other_b"),
                Column::from("other_c"),
                Column::from("name")
            ]
        );
        assert!(cs.is_valid());
        assert_eq!(ColumnSelector::from_columns(&cs.columns()), cs);
    }

    #[test]
    fn test_selector_invalid() {
        assert!(!ColumnSelector::from("").is_valid());
        assert!(!ColumnSelector::from("a..b").is_valid());
        assert!(!ColumnSelector::from("ok.Bad").is_valid());
    }

    #[test]
    fn test_full_selector_breakdown_and_rebuild() {
        let cs = ColumnSelectorFull::from("aa.xx.bb.yy.cc.zz");
        let (tables, columns) = cs.breakdown();
        assert_eq!(tables, vec![Table::from("aa"), Table::from("bb"), Table::from("cc")]);
        assert_eq!(
            columns,
            vec![Column::from("xx"), Column::from("yy"), Column::from("zz")]
        );

        // round-trip law
        assert_eq!(ColumnSelectorFull::rebuild(&tables, &columns), cs);

        // partial rebuild keeps the prefix
        assert_eq!(
            ColumnSelectorFull::rebuild(&tables[..2], &columns[..2]),
            ColumnSelectorFull::from("aa.xx.bb.yy")
        );
    }

    #[test]
    fn test_full_selector_split_and_replace() {
        let cs = ColumnSelectorFull::from("aa.xx.bb.yy");
        let (prefix, col) = cs.split_at_last_column();
        assert_eq!(prefix, "aa.xx.bb");
        assert_eq!(col, "yy");

        assert_eq!(
            cs.replace_last_column(&Column::from("id")),
            ColumnSelectorFull::from("aa.xx.bb.id")
        );
        assert_eq!(cs.base_table(), Table::from("aa"));
        assert_eq!(cs.last_table(), Table::from("bb"));
    }

    #[test]
    fn test_full_selector_quoted() {
        let cs = ColumnSelectorFull::from("tableA.other_b.tableB.name");
        assert_eq!(cs.quoted(), "\"tableA.other_b.tableB\".\"name\"");

        let single = ColumnSelectorFull::from("tableA.id");
        assert_eq!(single.quoted(), "\"tableA\".\"id\"");
    }

    #[test]
    fn test_full_selector_validity() {
        assert!(ColumnSelectorFull::from("aa.xx").is_valid());
        assert!(ColumnSelectorFull::from("aa.xx.bb.yy").is_valid());

        assert!(!ColumnSelectorFull::from("").is_valid());
        assert!(!ColumnSelectorFull::from("aa").is_valid(), "odd segment count");
        assert!(!ColumnSelectorFull::from("aa.xx.bb").is_valid(), "odd segment count");
        assert!(!ColumnSelectorFull::from("aa.Xx").is_valid());
    }

    #[test]
    #[should_panic(expected = "selector rebuild")]
    fn test_rebuild_length_mismatch_panics() {
        ColumnSelectorFull::rebuild(&[Table::from("aa")], &[]);
    }
}
