//! # Interception Metadata
//!
//! Interception layers decide which operations are wrapped in a unit of work.
//! They do not discover this at runtime: they hand the core a plain
//! [`UnitOfWorkMetadataTable`] built at registration time, keyed by operation
//! name.

use crate::options::{IsolationLevel, UnitOfWorkDefaultOptions, UnitOfWorkOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declarative unit-of-work settings for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkMetadata {
    pub is_transactional: Option<bool>,
    pub isolation_level: Option<IsolationLevel>,
    pub timeout_millis: Option<u64>,
    pub is_disabled: bool,
}

impl UnitOfWorkMetadata {
    pub fn transactional(is_transactional: bool) -> Self {
        Self {
            is_transactional: Some(is_transactional),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            is_disabled: true,
            ..Self::default()
        }
    }

    /// Copies every value this metadata sets onto `options`.
    pub fn apply_to(&self, options: &mut UnitOfWorkOptions) {
        if let Some(is_transactional) = self.is_transactional {
            options.is_transactional = is_transactional;
        }
        if let Some(level) = self.isolation_level {
            options.isolation_level = Some(level);
        }
        if let Some(timeout) = self.timeout_millis {
            options.timeout_millis = Some(timeout);
        }
    }
}

/// Operation name → metadata, supplied by the interception collaborator.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWorkMetadataTable {
    entries: HashMap<String, UnitOfWorkMetadata>,
}

impl UnitOfWorkMetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: impl Into<String>, metadata: UnitOfWorkMetadata) -> &mut Self {
        self.entries.insert(operation.into(), metadata);
        self
    }

    pub fn get(&self, operation: &str) -> Option<&UnitOfWorkMetadata> {
        self.entries.get(operation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the options an interceptor should pass to `begin` for `operation`.
    ///
    /// Returns `None` when the operation is not registered or is disabled. When the
    /// metadata leaves `is_transactional` unset, the process defaults decide, with
    /// `auto_transactional` as the answer for [`TransactionBehavior::Auto`].
    ///
    /// [`TransactionBehavior::Auto`]: crate::options::TransactionBehavior::Auto
    pub fn options_for(
        &self,
        operation: &str,
        defaults: &UnitOfWorkDefaultOptions,
        auto_transactional: bool,
    ) -> Option<UnitOfWorkOptions> {
        let metadata = self.entries.get(operation)?;
        if metadata.is_disabled {
            return None;
        }

        let mut options = UnitOfWorkOptions::default();
        metadata.apply_to(&mut options);
        if metadata.is_transactional.is_none() {
            options.is_transactional = defaults.calculate_is_transactional(auto_transactional);
        }
        Some(options)
    }
}
