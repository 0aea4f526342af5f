// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Database options and keyword-argument parsing.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// Keyword arguments from a storage URI query string or a factory
/// configuration.
pub type Kwargs = BTreeMap<String, String>;

/// Options applied to a [`Database`](crate::Database) when it is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Name used in logs and pool statistics.
    pub database_name: String,
    /// Number of connections the pool expects to lease at once. Leasing
    /// more is allowed but logged as a warning.
    pub pool_size: usize,
    /// Idle connections older than this are discarded instead of reused.
    pub pool_timeout_secs: Option<u64>,
    /// How long the activity monitor keeps records.
    pub history_length_secs: u64,
    /// Objects each pooled connection keeps cached between leases.
    pub cache_size: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            database_name: "unnamed".to_string(),
            pool_size: 7,
            pool_timeout_secs: None,
            history_length_secs: 3600,
            cache_size: 400,
        }
    }
}

impl DatabaseOptions {
    /// Build options from keyword arguments.
    ///
    /// Accepted keys: `database_name`, `pool_size` (alias
    /// `connection_pool_size`), `pool_timeout` (alias
    /// `connection_pool_timeout`, seconds), `history_length` (seconds),
    /// `cache_size`.
    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Self, DbError> {
        let mut options = Self::default();
        for (key, value) in kwargs {
            match key.as_str() {
                "database_name" => options.database_name = value.clone(),
                "pool_size" | "connection_pool_size" => {
                    options.pool_size = parse_kwarg(key, value)?;
                }
                "pool_timeout" | "connection_pool_timeout" => {
                    options.pool_timeout_secs = Some(parse_kwarg(key, value)?);
                }
                "history_length" => options.history_length_secs = parse_kwarg(key, value)?,
                "cache_size" => options.cache_size = parse_kwarg(key, value)?,
                other => {
                    return Err(DbError::config(format!(
                        "unknown database option '{other}'"
                    )))
                }
            }
        }
        if options.pool_size == 0 {
            return Err(DbError::config("pool_size must be at least 1"));
        }
        Ok(options)
    }

    pub fn pool_timeout(&self) -> Option<Duration> {
        self.pool_timeout_secs.map(Duration::from_secs)
    }

    pub fn history_length(&self) -> Duration {
        Duration::from_secs(self.history_length_secs)
    }
}

fn parse_kwarg<T: FromStr>(key: &str, value: &str) -> Result<T, DbError> {
    value
        .parse()
        .map_err(|_| DbError::config(format!("invalid value '{value}' for option '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(pairs: &[(&str, &str)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let opts = DatabaseOptions::from_kwargs(&Kwargs::new()).unwrap();
        assert_eq!(opts, DatabaseOptions::default());
        assert_eq!(opts.database_name, "unnamed");
        assert_eq!(opts.pool_size, 7);
        assert_eq!(opts.pool_timeout(), None);
        assert_eq!(opts.history_length(), Duration::from_secs(3600));
    }

    #[test]
    fn test_aliases_and_values() {
        let opts = DatabaseOptions::from_kwargs(&kwargs(&[
            ("database_name", "main"),
            ("connection_pool_size", "3"),
            ("connection_pool_timeout", "30"),
            ("history_length", "60"),
            ("cache_size", "16"),
        ]))
        .unwrap();
        assert_eq!(opts.database_name, "main");
        assert_eq!(opts.pool_size, 3);
        assert_eq!(opts.pool_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(opts.history_length_secs, 60);
        assert_eq!(opts.cache_size, 16);
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        let err = DatabaseOptions::from_kwargs(&kwargs(&[("read_only", "true")])).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("read_only"));

        let err = DatabaseOptions::from_kwargs(&kwargs(&[("pool_size", "many")])).unwrap_err();
        assert!(err.to_string().contains("many"));

        assert!(DatabaseOptions::from_kwargs(&kwargs(&[("pool_size", "0")])).is_err());
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let opts: DatabaseOptions = serde_json::from_str(r#"{"pool_size": 2}"#).unwrap();
        assert_eq!(opts.pool_size, 2);
        assert_eq!(opts.database_name, "unnamed");
    }
}
