//! Library configuration and its validation.

use std::collections::BTreeMap;
use std::fmt;

use crate::filter::{FilterOperations, FilterOperator};
use crate::metadata::{ColumnBehavior, DataType};

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_LIMIT: u64 = 200;
pub const MAX_LIMIT: u64 = 1000;

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Catalog scope for discovery. Empty takes [`DEFAULT_SCHEMA`].
    pub schema: String,

    /// Page size applied when a query does not set a limit. Zero takes
    /// [`DEFAULT_LIMIT`]; values above [`MAX_LIMIT`] are rejected.
    pub default_limit: u64,

    /// Operator registry consulted by the where-expression compiler.
    pub filter_operations: FilterOperations,

    /// Default column behavior per data type, merged under column comments.
    pub column_defaults: BTreeMap<DataType, ColumnBehavior>,

    /// Fallback behavior for data types without a `column_defaults` entry.
    /// When unset, discovering such a type fails.
    pub column_unknown_default: Option<ColumnBehavior>,
}

impl Config {
    /// Validates a fully defaulted config (see [`crate::Api::new`]).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema.is_empty() {
            return Err(ConfigError::EmptySchema);
        }
        if self.default_limit == 0 || self.default_limit > MAX_LIMIT {
            return Err(ConfigError::InvalidDefaultLimit(self.default_limit));
        }
        if self.filter_operations.is_empty() {
            return Err(ConfigError::EmptyFilterOperations);
        }

        for (data_type, behavior) in &self.column_defaults {
            Self::validate_behavior(Some(data_type), behavior, &self.filter_operations)?;
        }
        if let Some(behavior) = &self.column_unknown_default {
            // the data type is unknown here, so registration cannot be checked
            Self::validate_behavior(None, behavior, &self.filter_operations)?;
        }
        Ok(())
    }

    fn validate_behavior(
        data_type: Option<&DataType>,
        behavior: &ColumnBehavior,
        registry: &FilterOperations,
    ) -> Result<(), ConfigError> {
        let scope = data_type
            .map(|dt| dt.to_string())
            .unwrap_or_else(|| "columnUnknownDefault".to_string());

        for operator in &behavior.filter_operations {
            if operator.is_empty() {
                return Err(ConfigError::EmptyOperator { scope });
            }
            if let Some(dt) = data_type {
                if !registry.is_registered(dt, operator) {
                    return Err(ConfigError::UnregisteredOperator {
                        data_type: dt.clone(),
                        operator: operator.clone(),
                    });
                }
            }
        }

        if behavior.allow_filtering && behavior.filter_operations.is_empty() {
            return Err(ConfigError::NoEffectiveOperators { scope });
        }
        Ok(())
    }
}

// ---------- errors ----------

#[derive(Debug)]
pub enum ConfigError {
    EmptySchema,
    InvalidDefaultLimit(u64),
    EmptyFilterOperations,
    EmptyOperator { scope: String },
    UnregisteredOperator { data_type: DataType, operator: FilterOperator },
    NoEffectiveOperators { scope: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptySchema => write!(f, "invalid config: schema cannot be empty"),
            ConfigError::InvalidDefaultLimit(limit) => write!(
                f,
                "invalid config: defaultLimit {limit} outside 1..={MAX_LIMIT}"
            ),
            ConfigError::EmptyFilterOperations => {
                write!(f, "invalid config: filterOperations cannot be empty")
            }
            ConfigError::EmptyOperator { scope } => write!(
                f,
                "invalid config: {scope}: filterOperations cannot contain empty names"
            ),
            ConfigError::UnregisteredOperator { data_type, operator } => write!(
                f,
                "invalid config: operator '{operator}' is not registered for data type '{data_type}'"
            ),
            ConfigError::NoEffectiveOperators { scope } => write!(
                f,
                "invalid config: {scope}: filterOperations cannot be empty when allowFiltering is set"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            schema: "public".to_string(),
            default_limit: 200,
            filter_operations: FilterOperations::defaults(),
            column_defaults: [(
                DataType::from("text"),
                ColumnBehavior {
                    allow_filtering: true,
                    filter_operations: vec!["equals".into(), "contains".into()],
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            column_unknown_default: None,
        }
    }

    #[test]
    fn test_valid() {
        valid_config().validate().expect("config should validate");
    }

    #[test]
    fn test_empty_schema() {
        let mut c = valid_config();
        c.schema.clear();
        assert!(matches!(c.validate(), Err(ConfigError::EmptySchema)));
    }

    #[test]
    fn test_default_limit_bounds() {
        let mut c = valid_config();
        c.default_limit = 0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidDefaultLimit(0))));

        c.default_limit = MAX_LIMIT + 1;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidDefaultLimit(_))));

        c.default_limit = MAX_LIMIT;
        c.validate().unwrap();
    }

    #[test]
    fn test_empty_registry() {
        let mut c = valid_config();
        c.filter_operations = FilterOperations::new();
        assert!(matches!(c.validate(), Err(ConfigError::EmptyFilterOperations)));
    }

    #[test]
    fn test_unregistered_default_operator() {
        let mut c = valid_config();
        c.column_defaults.insert(
            DataType::from("integer"),
            ColumnBehavior {
                allow_filtering: true,
                filter_operations: vec!["contains".into()], // not a number operator
                ..Default::default()
            },
        );
        assert!(matches!(
            c.validate(),
            Err(ConfigError::UnregisteredOperator { .. })
        ));
    }

    #[test]
    fn test_filtering_without_operators() {
        let mut c = valid_config();
        c.column_defaults.insert(
            DataType::from("integer"),
            ColumnBehavior {
                allow_filtering: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NoEffectiveOperators { .. })
        ));
    }

    #[test]
    fn test_unknown_default_checked() {
        let mut c = valid_config();
        c.column_unknown_default = Some(ColumnBehavior {
            allow_filtering: true,
            ..Default::default()
        });
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NoEffectiveOperators { scope }) if scope == "columnUnknownDefault"
        ));

        c.column_unknown_default = Some(ColumnBehavior::default());
        c.validate().unwrap();
    }
}
