//! # In-Memory Store
//!
//! A tiny document store used to show how an ORM adapter plugs into a unit of
//! work.
//!
//! - [`InMemoryDatabase`] holds committed rows, shared by every unit.
//! - [`InMemorySession`] is the unit-scoped [`DatabaseApi`]: writes are staged
//!   in the session and moved out by `save_changes`.
//! - [`InMemoryTransaction`] is the matching [`TransactionApi`]: for
//!   transactional units, saved writes wait here until `commit`. Non-transactional
//!   units apply writes as soon as they are saved.
//!
//! [`session_for`] registers both on the current unit the first time a unit
//! touches the store, so nested code always shares one session.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use unit_of_work::{
    ApiCapabilities, BoxError, DatabaseApi, TransactionApi, UnitOfWork, UnitOfWorkError,
};

/// Key under which the store registers itself on a unit of work.
pub const SESSION_KEY: &str = "in-memory";

#[derive(Debug, Clone, PartialEq)]
enum Write {
    Put { table: String, key: String, value: Value },
    Delete { table: String, key: String },
}

impl Write {
    fn target(&self) -> (&str, &str) {
        match self {
            Self::Put { table, key, .. } | Self::Delete { table, key } => {
                (table.as_str(), key.as_str())
            }
        }
    }
}

/// Looks up the latest staged write for `table`/`key`, newest first.
fn staged(writes: &[Write], table: &str, key: &str) -> Option<Option<Value>> {
    writes
        .iter()
        .rev()
        .find(|w| w.target() == (table, key))
        .map(|w| match w {
            Write::Put { value, .. } => Some(value.clone()),
            Write::Delete { .. } => None,
        })
}

type Tables = HashMap<String, BTreeMap<String, Value>>;

/// Committed state, shared by every unit of work.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.tables().get(table)?.get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        self.get(table, key).map(serde_json::from_value).transpose()
    }

    /// Writes `value` directly, bypassing any unit of work. Used for seeding.
    pub fn insert<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.apply(vec![Write::Put {
            table: table.to_string(),
            key: key.to_string(),
            value,
        }]);
        Ok(())
    }

    pub fn count(&self, table: &str) -> usize {
        self.tables().get(table).map_or(0, BTreeMap::len)
    }

    fn apply(&self, writes: Vec<Write>) {
        let mut tables = self.tables();
        for write in writes {
            match write {
                Write::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                Write::Delete { table, key } => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
    }
}

/// Transaction that holds saved writes until commit.
#[derive(Debug)]
pub struct InMemoryTransaction {
    database: InMemoryDatabase,
    is_transactional: bool,
    saved: Mutex<Vec<Write>>,
}

impl InMemoryTransaction {
    fn new(database: InMemoryDatabase, is_transactional: bool) -> Self {
        Self {
            database,
            is_transactional,
            saved: Mutex::new(Vec::new()),
        }
    }

    fn saved(&self) -> std::sync::MutexGuard<'_, Vec<Write>> {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept(&self, writes: Vec<Write>) {
        if self.is_transactional {
            self.saved().extend(writes);
        } else {
            self.database.apply(writes);
        }
    }
}

#[async_trait]
impl TransactionApi for InMemoryTransaction {
    fn capabilities(&self) -> ApiCapabilities {
        ApiCapabilities::NONE.with_rollback()
    }

    async fn commit(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        let writes = std::mem::take(&mut *self.saved());
        debug!(count = writes.len(), "Committing in-memory transaction");
        self.database.apply(writes);
        Ok(())
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        let discarded = std::mem::take(&mut *self.saved()).len();
        debug!(discarded, "Rolled back in-memory transaction");
        Ok(())
    }
}

/// Unit-scoped change tracker.
#[derive(Debug)]
pub struct InMemorySession {
    transaction: Arc<InMemoryTransaction>,
    pending: Mutex<Vec<Write>>,
}

impl InMemorySession {
    fn new(transaction: Arc<InMemoryTransaction>) -> Self {
        Self {
            transaction,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Vec<Write>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads through pending writes, saved writes and committed state, in that order.
    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        if let Some(value) = staged(&self.pending(), table, key) {
            return value;
        }
        if let Some(value) = staged(&self.transaction.saved(), table, key) {
            return value;
        }
        self.transaction.database.get(table, key)
    }

    pub fn get_as<T: DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        self.get(table, key).map(serde_json::from_value).transpose()
    }

    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.pending().push(Write::Put {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    pub fn delete(&self, table: &str, key: &str) {
        self.pending().push(Write::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

#[async_trait]
impl DatabaseApi for InMemorySession {
    fn capabilities(&self) -> ApiCapabilities {
        ApiCapabilities::ALL
    }

    async fn save_changes(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        let writes = std::mem::take(&mut *self.pending());
        if !writes.is_empty() {
            debug!(count = writes.len(), "Saving in-memory session");
            self.transaction.accept(writes);
        }
        Ok(())
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.pending().clear();
        Ok(())
    }
}

/// Returns the store session of `uow`, registering it on first use.
pub fn session_for(
    uow: &UnitOfWork,
    database: &InMemoryDatabase,
) -> Result<Arc<InMemorySession>, UnitOfWorkError> {
    if let Some(session) = uow.get_item::<InMemorySession>(SESSION_KEY) {
        return Ok(session);
    }

    let is_transactional = uow.options().is_some_and(|o| o.is_transactional);
    let transaction = Arc::new(InMemoryTransaction::new(database.clone(), is_transactional));
    let session = uow.get_or_add_item(SESSION_KEY, || InMemorySession::new(transaction.clone()));
    uow.add_transaction_api(SESSION_KEY, transaction)?;
    uow.add_database_api(SESSION_KEY, session.clone())?;
    debug!(uow_id = %uow.id(), is_transactional, "Opened in-memory session");
    Ok(session)
}
