//! # Resource Capabilities & Containers
//!
//! ORM adapters plug into a unit of work through two capability traits:
//!
//! - [`DatabaseApi`]: a change tracker or session that can save pending changes
//!   and, optionally, roll them back.
//! - [`TransactionApi`]: a physical transaction that is committed at the end of
//!   the unit, optionally rolled back, and always disposed.
//!
//! Which optional operations an adapter supports is declared up front through
//! [`ApiCapabilities`], so the save and rollback loops never inspect types at runtime.
//!
//! Each unit keeps one [`ResourceContainer`] per kind, keyed by an opaque string
//! (by convention a provider or connection identifier). Registration order is
//! preserved: transactions commit in the order they were opened.

use crate::error::BoxError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Optional operations a resource supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiCapabilities {
    pub save_changes: bool,
    pub rollback: bool,
}

impl ApiCapabilities {
    pub const NONE: Self = Self {
        save_changes: false,
        rollback: false,
    };

    pub const ALL: Self = Self {
        save_changes: true,
        rollback: true,
    };

    pub const fn saving() -> Self {
        Self {
            save_changes: true,
            rollback: false,
        }
    }

    pub const fn with_rollback(mut self) -> Self {
        self.rollback = true;
        self
    }
}

/// A database session registered on a unit of work.
#[async_trait]
pub trait DatabaseApi: Send + Sync {
    fn capabilities(&self) -> ApiCapabilities;

    /// Flushes pending changes. Only called when `capabilities().save_changes` is set.
    async fn save_changes(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        Ok(())
    }

    /// Discards pending changes. Only called when `capabilities().rollback` is set.
    async fn rollback(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A physical transaction registered on a unit of work.
#[async_trait]
pub trait TransactionApi: Send + Sync {
    /// Only the `rollback` flag is meaningful for transactions.
    fn capabilities(&self) -> ApiCapabilities {
        ApiCapabilities::NONE
    }

    async fn commit(&self, cancel: &CancellationToken) -> Result<(), BoxError>;

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        Ok(())
    }

    /// Releases the underlying connection. Called exactly once, when the unit is disposed.
    fn dispose(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Registry of resources of one kind, keyed by string, in registration order.
pub struct ResourceContainer<T: ?Sized> {
    entries: Vec<(String, Arc<T>)>,
}

impl<T: ?Sized> Default for ResourceContainer<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: ?Sized> ResourceContainer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, api)| api.clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Adds `api` under `key`. Hands the value back if the key is already taken.
    pub fn try_insert(&mut self, key: impl Into<String>, api: Arc<T>) -> Result<(), Arc<T>> {
        let key = key.into();
        if self.contains_key(&key) {
            return Err(api);
        }
        self.entries.push((key, api));
        Ok(())
    }

    /// Returns the existing entry for `key`, or stores and returns the factory's value.
    /// The factory is not invoked when the key already exists.
    pub fn get_or_insert_with<F>(&mut self, key: &str, factory: F) -> Arc<T>
    where
        F: FnOnce() -> Arc<T>,
    {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        let api = factory();
        self.entries.push((key.to_string(), api.clone()));
        api
    }

    /// Snapshot of all entries in registration order.
    pub fn entries(&self) -> Vec<(String, Arc<T>)> {
        self.entries.clone()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry, in registration order.
    pub fn drain(&mut self) -> Vec<(String, Arc<T>)> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDb;

    #[async_trait]
    impl DatabaseApi for NoopDb {
        fn capabilities(&self) -> ApiCapabilities {
            ApiCapabilities::saving()
        }
    }

    #[test]
    fn get_or_insert_invokes_factory_once() {
        let mut container: ResourceContainer<dyn DatabaseApi> = ResourceContainer::new();
        let mut calls = 0;

        let first = container.get_or_insert_with("sql", || {
            calls += 1;
            Arc::new(NoopDb)
        });
        let second = container.get_or_insert_with("sql", || {
            calls += 1;
            Arc::new(NoopDb)
        });

        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn try_insert_rejects_duplicates() {
        let mut container: ResourceContainer<dyn DatabaseApi> = ResourceContainer::new();
        assert!(container.try_insert("sql", Arc::new(NoopDb)).is_ok());
        assert!(container.try_insert("sql", Arc::new(NoopDb)).is_err());
        assert!(container.try_insert("mongo", Arc::new(NoopDb)).is_ok());

        let keys: Vec<_> = container.keys().collect();
        assert_eq!(keys, ["sql", "mongo"]);
        assert_eq!(container.drain().len(), 2);
        assert!(container.is_empty());
    }

    #[test]
    fn capability_presets() {
        assert_eq!(ApiCapabilities::saving().with_rollback(), ApiCapabilities::ALL);
        assert!(!ApiCapabilities::NONE.save_changes);
    }
}
