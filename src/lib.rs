//! pgreach — data discovery and read-query API over PostgreSQL.
//!
//! Given a base table, [`Api::discover`] walks the transitive closure of
//! foreign-key relations in a single schema, enriching every column with
//! behavior metadata parsed from per-column JSON comments. The resulting
//! catalog feeds [`Api::query`], which turns a selector-based read query
//! (dotted selectors traverse foreign keys, e.g. `other_b.other_c.name`)
//! into a paired page/count SQL statement pipelined over one connection.

pub mod config;
pub mod discover;
pub mod expr;
pub mod filter;
pub mod metadata;
pub mod query;
pub mod selector;
pub mod sql;

pub use config::{Config, ConfigError};
pub use discover::{Api, DiscoverError, DiscoverResult};
pub use expr::{Filter, WhereExpression};
pub use filter::{FilterError, FilterOperations, FilterOperator};
pub use metadata::{
    ColumnBehavior, ColumnMetadata, ColumnRelation, DataType, MetadataError, TableBehavior,
    TableMetadata, TablesMetadata,
};
pub use query::{OrderByExpression, Query, QueryDebug, QueryError, QueryResult};
pub use selector::{Column, ColumnSelector, ColumnSelectorFull, Table};
