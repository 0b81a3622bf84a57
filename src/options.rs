//! # Unit-of-Work Options
//!
//! [`UnitOfWorkOptions`] describes a single unit: whether it is transactional,
//! which isolation level the adapters should use, and an optional timeout.
//!
//! [`UnitOfWorkDefaultOptions`] is the process-wide configuration. Any option a
//! caller leaves unset is filled from it when a unit is initialized
//! ([`UnitOfWorkDefaultOptions::normalize`]), and interception layers ask it
//! whether a call should be transactional at all
//! ([`UnitOfWorkDefaultOptions::calculate_is_transactional`]).
//!
//! ## Environment
//!
//! ```bash
//! UOW_TRANSACTION_BEHAVIOR=auto      # enabled | disabled | auto
//! UOW_ISOLATION_LEVEL=read_committed
//! UOW_TIMEOUT_MS=30000
//! ```

use crate::error::{Result, UnitOfWorkError};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Transaction isolation level requested from the database adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Unspecified,
    Chaos,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl FromStr for IsolationLevel {
    type Err = UnitOfWorkError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "unspecified" => Ok(Self::Unspecified),
            "chaos" => Ok(Self::Chaos),
            "read_uncommitted" => Ok(Self::ReadUncommitted),
            "read_committed" => Ok(Self::ReadCommitted),
            "repeatable_read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(UnitOfWorkError::InvalidConfiguration {
                key: "isolation_level",
                value: value.to_string(),
            }),
        }
    }
}

/// Options attached to one unit of work. Fixed once the unit is initialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWorkOptions {
    pub is_transactional: bool,
    pub isolation_level: Option<IsolationLevel>,
    pub timeout_millis: Option<u64>,
}

impl UnitOfWorkOptions {
    pub fn new(is_transactional: bool) -> Self {
        Self {
            is_transactional,
            ..Self::default()
        }
    }

    /// Shorthand for `UnitOfWorkOptions::new(true)`.
    pub fn transactional() -> Self {
        Self::new(true)
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_timeout_millis(mut self, timeout_millis: u64) -> Self {
        self.timeout_millis = Some(timeout_millis);
        self
    }
}

/// Default transactional behavior for calls that do not say explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionBehavior {
    Enabled,
    Disabled,
    /// Let the caller decide (for example: transactional for writes, not for reads).
    #[default]
    Auto,
}

impl FromStr for TransactionBehavior {
    type Err = UnitOfWorkError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "auto" => Ok(Self::Auto),
            _ => Err(UnitOfWorkError::InvalidConfiguration {
                key: "transaction_behavior",
                value: value.to_string(),
            }),
        }
    }
}

/// Process-wide defaults applied to every unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkDefaultOptions {
    pub transaction_behavior: TransactionBehavior,
    pub isolation_level: Option<IsolationLevel>,
    pub timeout_millis: Option<u64>,
}

impl UnitOfWorkDefaultOptions {
    pub const TRANSACTION_BEHAVIOR_VAR: &'static str = "UOW_TRANSACTION_BEHAVIOR";
    pub const ISOLATION_LEVEL_VAR: &'static str = "UOW_ISOLATION_LEVEL";
    pub const TIMEOUT_VAR: &'static str = "UOW_TIMEOUT_MS";

    /// Loads defaults from the environment. Unset variables keep their default value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads defaults through an arbitrary key lookup (environment, config map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut defaults = Self::default();
        if let Some(behavior) = parse_var(&lookup, Self::TRANSACTION_BEHAVIOR_VAR)? {
            defaults.transaction_behavior = behavior;
        }
        defaults.isolation_level = parse_var(&lookup, Self::ISOLATION_LEVEL_VAR)?;
        defaults.timeout_millis = parse_var(&lookup, Self::TIMEOUT_VAR)?;
        Ok(defaults)
    }

    /// Fills every option the caller left unset. Explicit values always win.
    pub fn normalize(&self, mut options: UnitOfWorkOptions) -> UnitOfWorkOptions {
        if options.isolation_level.is_none() {
            options.isolation_level = self.isolation_level;
        }
        if options.timeout_millis.is_none() {
            options.timeout_millis = self.timeout_millis;
        }
        options
    }

    /// Resolves the configured behavior; `auto_value` is used when the behavior is `Auto`.
    pub fn calculate_is_transactional(&self, auto_value: bool) -> bool {
        match self.transaction_behavior {
            TransactionBehavior::Enabled => true,
            TransactionBehavior::Disabled => false,
            TransactionBehavior::Auto => auto_value,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| UnitOfWorkError::InvalidConfiguration {
                key,
                value: format!("{raw} ({e})"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn normalize_keeps_explicit_values() {
        let defaults = UnitOfWorkDefaultOptions {
            transaction_behavior: TransactionBehavior::Enabled,
            isolation_level: Some(IsolationLevel::ReadCommitted),
            timeout_millis: Some(1_000),
        };

        let explicit = UnitOfWorkOptions::transactional()
            .with_isolation_level(IsolationLevel::Serializable)
            .with_timeout_millis(50);
        assert_eq!(defaults.normalize(explicit.clone()), explicit);

        let filled = defaults.normalize(UnitOfWorkOptions::new(false));
        assert!(!filled.is_transactional);
        assert_eq!(filled.isolation_level, Some(IsolationLevel::ReadCommitted));
        assert_eq!(filled.timeout_millis, Some(1_000));
    }

    #[test]
    fn transaction_behavior_resolution() {
        let mut defaults = UnitOfWorkDefaultOptions::default();
        assert!(defaults.calculate_is_transactional(true));
        assert!(!defaults.calculate_is_transactional(false));

        defaults.transaction_behavior = TransactionBehavior::Enabled;
        assert!(defaults.calculate_is_transactional(false));

        defaults.transaction_behavior = TransactionBehavior::Disabled;
        assert!(!defaults.calculate_is_transactional(true));
    }

    #[test]
    fn loads_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("UOW_TRANSACTION_BEHAVIOR", "Disabled"),
            ("UOW_ISOLATION_LEVEL", "repeatable-read"),
            ("UOW_TIMEOUT_MS", "2500"),
        ]
        .into_iter()
        .collect();

        let defaults =
            UnitOfWorkDefaultOptions::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(defaults.transaction_behavior, TransactionBehavior::Disabled);
        assert_eq!(defaults.isolation_level, Some(IsolationLevel::RepeatableRead));
        assert_eq!(defaults.timeout_millis, Some(2_500));
    }

    #[test]
    fn rejects_invalid_values() {
        let result = UnitOfWorkDefaultOptions::from_lookup(|k| {
            (k == "UOW_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(
            result,
            Err(UnitOfWorkError::InvalidConfiguration { key: "UOW_TIMEOUT_MS", .. })
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let defaults: UnitOfWorkDefaultOptions =
            serde_json::from_str(r#"{ "isolation_level": "snapshot" }"#).unwrap();
        assert_eq!(defaults.transaction_behavior, TransactionBehavior::Auto);
        assert_eq!(defaults.isolation_level, Some(IsolationLevel::Snapshot));
        assert_eq!(defaults.timeout_millis, None);
    }
}
