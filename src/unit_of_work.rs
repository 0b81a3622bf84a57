//! # Unit of Work
//!
//! [`UnitOfWork`] is the physical unit: it owns the resource containers, the
//! pending event buffers and the completion lifecycle for one logical root
//! operation.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──initialize──▶ Initialized ──complete──▶ Completing ──▶ Completed
//!       │                            ▲
//!       └──reserve──▶ Reserved ──────┘ (claimed via initialize)
//!
//! any state ──dispose──▶ Disposed
//! ```
//!
//! ## Completion
//!
//! [`UnitOfWork::complete`] runs, strictly in this order:
//!
//! 1. save changes on every database api that supports it;
//! 2. while any event is buffered: publish local events (sorted by event
//!    order), publish distributed events (sorted), save changes again;
//! 3. commit every transaction api in registration order;
//! 4. mark the unit completed and run `on_completed` handlers in order.
//!
//! The first failure aborts the sequence, is recorded on the unit and returned.
//! Disposing a unit that did not complete cleanly notifies `on_failed` handlers
//! with that error before `on_disposed` handlers run.
//!
//! Cancellation is checked between steps and passed to every collaborator. A
//! cancelled unit is *not* rolled back automatically; that decision stays with
//! the caller.

use crate::error::{require_non_blank, BoxError, Result, SharedError, UnitOfWorkError};
use crate::event_record::{self, EventRecord};
use crate::manager::ScopeLifetime;
use crate::options::{UnitOfWorkDefaultOptions, UnitOfWorkOptions};
use crate::publisher::UnitOfWorkEventPublisher;
use crate::resources::{DatabaseApi, ResourceContainer, TransactionApi};
use crate::tree::{NodeStatus, UnitOfWorkTree};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-unique identity of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitOfWorkId(pub u64);

impl UnitOfWorkId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uow_{}", self.0)
    }
}

/// Passed to `on_failed` handlers when a unit is disposed without completing cleanly.
#[derive(Debug, Clone)]
pub struct UnitOfWorkFailedEvent {
    pub unit_id: UnitOfWorkId,
    /// The error recorded during completion, if completion was attempted.
    pub error: Option<UnitOfWorkError>,
    /// Whether the caller rolled the unit back explicitly.
    pub is_rolled_back: bool,
}

type CompletedHandler = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;
type FailedHandler = Box<dyn Fn(&UnitOfWorkFailedEvent) + Send + Sync>;
type DisposedHandler = Box<dyn Fn(UnitOfWorkId) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    completed: Vec<CompletedHandler>,
    failed: Vec<FailedHandler>,
    disposed: Vec<DisposedHandler>,
}

#[derive(Default)]
struct UnitOfWorkState {
    options: Option<UnitOfWorkOptions>,
    is_reserved: bool,
    reservation_name: Option<String>,
    is_completing: bool,
    is_completed: bool,
    is_rolled_back: bool,
    is_disposed: bool,
    error: Option<UnitOfWorkError>,
    items: HashMap<String, Arc<dyn Any + Send + Sync>>,
    local_events: Vec<EventRecord>,
    distributed_events: Vec<EventRecord>,
    database_apis: ResourceContainer<dyn DatabaseApi>,
    transaction_apis: ResourceContainer<dyn TransactionApi>,
}

struct UnitOfWorkInner {
    id: UnitOfWorkId,
    outer: Option<UnitOfWorkId>,
    tree: Arc<UnitOfWorkTree>,
    publisher: Arc<dyn UnitOfWorkEventPublisher>,
    defaults: UnitOfWorkDefaultOptions,
    state: Mutex<UnitOfWorkState>,
    handlers: Mutex<Handlers>,
    lifetime: Mutex<Option<ScopeLifetime>>,
}

impl Drop for UnitOfWorkInner {
    fn drop(&mut self) {
        self.tree.unregister(self.id);
    }
}

#[derive(Clone)]
pub(crate) struct WeakUnitOfWork(Weak<UnitOfWorkInner>);

impl WeakUnitOfWork {
    pub(crate) fn upgrade(&self) -> Option<UnitOfWork> {
        self.0.upgrade().map(|inner| UnitOfWork { inner })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(UnitOfWorkError::Cancelled);
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum EventKind {
    Local,
    Distributed,
}

/// The physical unit of work. Cheap to clone; clones share the same unit.
#[derive(Clone)]
pub struct UnitOfWork {
    inner: Arc<UnitOfWorkInner>,
}

impl Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("UnitOfWork")
            .field("id", &self.inner.id)
            .field("outer", &self.inner.outer)
            .field("reservation_name", &status.reservation_name)
            .field("is_completed", &status.is_completed)
            .field("is_disposed", &status.is_disposed)
            .finish()
    }
}

impl UnitOfWork {
    /// Creates a detached unit with no outer unit and its own tree.
    pub fn new(
        publisher: Arc<dyn UnitOfWorkEventPublisher>,
        defaults: UnitOfWorkDefaultOptions,
    ) -> Self {
        Self::attached(Arc::new(UnitOfWorkTree::new()), None, publisher, defaults)
    }

    pub(crate) fn attached(
        tree: Arc<UnitOfWorkTree>,
        outer: Option<UnitOfWorkId>,
        publisher: Arc<dyn UnitOfWorkEventPublisher>,
        defaults: UnitOfWorkDefaultOptions,
    ) -> Self {
        let unit = Self {
            inner: Arc::new(UnitOfWorkInner {
                id: UnitOfWorkId::next(),
                outer,
                tree: tree.clone(),
                publisher,
                defaults,
                state: Mutex::new(UnitOfWorkState::default()),
                handlers: Mutex::new(Handlers::default()),
                lifetime: Mutex::new(None),
            }),
        };
        tree.register(&unit);
        debug!(uow_id = %unit.id(), outer = ?outer.map(|id| id.to_string()), "Created unit of work");
        unit
    }

    pub(crate) fn downgrade(&self) -> WeakUnitOfWork {
        WeakUnitOfWork(Arc::downgrade(&self.inner))
    }

    pub(crate) fn tree(&self) -> &Arc<UnitOfWorkTree> {
        &self.inner.tree
    }

    pub(crate) fn set_lifetime(&self, lifetime: ScopeLifetime) {
        *lock(&self.inner.lifetime) = Some(lifetime);
    }

    fn state(&self) -> MutexGuard<'_, UnitOfWorkState> {
        lock(&self.inner.state)
    }

    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        lock(&self.inner.handlers)
    }

    // --- Identity & status ---

    pub fn id(&self) -> UnitOfWorkId {
        self.inner.id
    }

    pub fn outer_id(&self) -> Option<UnitOfWorkId> {
        self.inner.outer
    }

    /// The logically enclosing unit, if it is still alive.
    pub fn outer(&self) -> Option<UnitOfWork> {
        self.inner.outer.and_then(|id| self.inner.tree.get(id))
    }

    pub fn options(&self) -> Option<UnitOfWorkOptions> {
        self.state().options.clone()
    }

    pub fn is_reserved(&self) -> bool {
        self.state().is_reserved
    }

    pub fn reservation_name(&self) -> Option<String> {
        self.state().reservation_name.clone()
    }

    pub fn is_reserved_for(&self, name: &str) -> bool {
        let state = self.state();
        state.is_reserved && state.reservation_name.as_deref() == Some(name)
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_completed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state().is_rolled_back
    }

    pub fn is_disposed(&self) -> bool {
        self.state().is_disposed
    }

    /// The error recorded by a failed completion.
    pub fn error(&self) -> Option<UnitOfWorkError> {
        self.state().error.clone()
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state();
        NodeStatus {
            outer: self.inner.outer,
            is_reserved: state.is_reserved,
            reservation_name: state.reservation_name.clone(),
            is_disposed: state.is_disposed,
            is_completed: state.is_completed,
        }
    }

    // --- Initialization ---

    /// Fixes the options of this unit. Legal exactly once; claims a reservation.
    pub fn initialize(&self, options: UnitOfWorkOptions) -> Result<()> {
        let mut state = self.state();
        if state.options.is_some() {
            return Err(UnitOfWorkError::AlreadyInitialized(self.id()));
        }
        let options = self.inner.defaults.normalize(options);
        debug!(uow_id = %self.id(), ?options, claimed = state.is_reserved, "Initialized unit of work");
        state.options = Some(options);
        state.is_reserved = false;
        Ok(())
    }

    /// Parks this uninitialized unit under `name` until it is claimed.
    pub fn reserve(&self, name: &str) -> Result<()> {
        require_non_blank(name, "reservation name")?;
        let mut state = self.state();
        if state.options.is_some() {
            return Err(UnitOfWorkError::AlreadyInitialized(self.id()));
        }
        if state.is_reserved {
            return Err(UnitOfWorkError::AlreadyReserved(self.id()));
        }
        state.is_reserved = true;
        state.reservation_name = Some(name.to_string());
        debug!(uow_id = %self.id(), reservation = name, "Reserved unit of work");
        Ok(())
    }

    // --- Items ---

    /// Stores a value in the unit's item bag, replacing any previous value.
    pub fn set_item<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.state().items.insert(key.into(), Arc::new(value));
    }

    /// Returns the item stored under `key` if it has type `T`.
    pub fn get_item<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let item = self.state().items.get(key).cloned()?;
        item.downcast::<T>().ok()
    }

    /// Returns the `T` stored under `key`, storing the factory's value when the key
    /// is missing or holds a value of another type.
    pub fn get_or_add_item<T, F>(&self, key: &str, factory: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get_item::<T>(key) {
            return existing;
        }
        let value = Arc::new(factory());
        self.state().items.insert(key.to_string(), value.clone());
        value
    }

    pub fn remove_item(&self, key: &str) -> bool {
        self.state().items.remove(key).is_some()
    }

    // --- Events ---

    pub fn add_local_event(&self, record: EventRecord) {
        self.push_event(EventKind::Local, record, None);
    }

    pub fn add_distributed_event(&self, record: EventRecord) {
        self.push_event(EventKind::Distributed, record, None);
    }

    /// Replaces the first buffered local event matching `selector`, or appends.
    pub fn add_or_replace_local_event<F>(&self, record: EventRecord, selector: F)
    where
        F: Fn(&EventRecord) -> bool,
    {
        self.push_event(EventKind::Local, record, Some(&selector));
    }

    /// Replaces the first buffered distributed event matching `selector`, or appends.
    pub fn add_or_replace_distributed_event<F>(&self, record: EventRecord, selector: F)
    where
        F: Fn(&EventRecord) -> bool,
    {
        self.push_event(EventKind::Distributed, record, Some(&selector));
    }

    fn push_event(
        &self,
        kind: EventKind,
        record: EventRecord,
        selector: Option<&dyn Fn(&EventRecord) -> bool>,
    ) {
        let mut state = self.state();
        if state.is_completed || state.is_disposed {
            warn!(
                uow_id = %self.id(),
                event_type = record.event_type(),
                "Event added to a finished unit of work will not be published"
            );
        }
        debug!(
            uow_id = %self.id(),
            event_type = record.event_type(),
            event_order = record.event_order(),
            "Queued event"
        );
        let buffer = match kind {
            EventKind::Local => &mut state.local_events,
            EventKind::Distributed => &mut state.distributed_events,
        };
        event_record::add_or_replace(buffer, record, selector);
    }

    /// Buffered local events in registration order.
    pub fn local_events(&self) -> Vec<EventRecord> {
        self.state().local_events.clone()
    }

    /// Buffered distributed events in registration order.
    pub fn distributed_events(&self) -> Vec<EventRecord> {
        self.state().distributed_events.clone()
    }

    pub fn has_pending_events(&self) -> bool {
        let state = self.state();
        !state.local_events.is_empty() || !state.distributed_events.is_empty()
    }

    // --- Resources ---

    pub fn find_database_api(&self, key: &str) -> Option<Arc<dyn DatabaseApi>> {
        self.state().database_apis.get(key)
    }

    /// Registers `api` under `key`; fails if the key is taken or the unit is disposed.
    pub fn add_database_api(&self, key: &str, api: Arc<dyn DatabaseApi>) -> Result<()> {
        require_non_blank(key, "database api key")?;
        let mut state = self.state();
        if state.is_disposed {
            return Err(UnitOfWorkError::Disposed(self.id()));
        }
        state
            .database_apis
            .try_insert(key, api)
            .map_err(|_| UnitOfWorkError::DuplicateDatabaseApi(key.to_string()))?;
        drop(state);
        debug!(uow_id = %self.id(), key, "Added database api");
        Ok(())
    }

    /// Returns the database api for `key`, creating it with `factory` on first access.
    ///
    /// The factory runs without the unit locked, so it may itself use this unit.
    pub fn get_or_add_database_api<F>(&self, key: &str, factory: F) -> Result<Arc<dyn DatabaseApi>>
    where
        F: FnOnce() -> Arc<dyn DatabaseApi>,
    {
        require_non_blank(key, "database api key")?;
        if let Some(existing) = self.find_database_api(key) {
            return Ok(existing);
        }
        let created = factory();
        let api = {
            let mut state = self.state();
            if state.is_disposed {
                return Err(UnitOfWorkError::Disposed(self.id()));
            }
            state.database_apis.get_or_insert_with(key, move || created)
        };
        debug!(uow_id = %self.id(), key, "Added database api");
        Ok(api)
    }

    /// Registered database apis in registration order.
    pub fn database_apis(&self) -> Vec<(String, Arc<dyn DatabaseApi>)> {
        self.state().database_apis.entries()
    }

    pub fn find_transaction_api(&self, key: &str) -> Option<Arc<dyn TransactionApi>> {
        self.state().transaction_apis.get(key)
    }

    /// Registers `api` under `key`; fails if the key is taken or the unit is disposed.
    pub fn add_transaction_api(&self, key: &str, api: Arc<dyn TransactionApi>) -> Result<()> {
        require_non_blank(key, "transaction api key")?;
        let mut state = self.state();
        if state.is_disposed {
            return Err(UnitOfWorkError::Disposed(self.id()));
        }
        state
            .transaction_apis
            .try_insert(key, api)
            .map_err(|_| UnitOfWorkError::DuplicateTransactionApi(key.to_string()))?;
        drop(state);
        debug!(uow_id = %self.id(), key, "Added transaction api");
        Ok(())
    }

    /// Returns the transaction api for `key`, creating it with `factory` on first access.
    pub fn get_or_add_transaction_api<F>(
        &self,
        key: &str,
        factory: F,
    ) -> Result<Arc<dyn TransactionApi>>
    where
        F: FnOnce() -> Arc<dyn TransactionApi>,
    {
        require_non_blank(key, "transaction api key")?;
        if let Some(existing) = self.find_transaction_api(key) {
            return Ok(existing);
        }
        let created = factory();
        let api = {
            let mut state = self.state();
            if state.is_disposed {
                drop(state);
                // Never registered, so nothing else will release it.
                if let Err(error) = created.dispose() {
                    warn!(uow_id = %self.id(), key, error = %error, "Failed to dispose transaction api");
                }
                return Err(UnitOfWorkError::Disposed(self.id()));
            }
            state.transaction_apis.get_or_insert_with(key, move || created)
        };
        debug!(uow_id = %self.id(), key, "Added transaction api");
        Ok(api)
    }

    /// Registered transaction apis in registration order.
    pub fn transaction_apis(&self) -> Vec<(String, Arc<dyn TransactionApi>)> {
        self.state().transaction_apis.entries()
    }

    // --- Handlers ---

    /// Runs `handler` after a successful commit. Handlers run in registration order;
    /// the first error fails the completion and skips the remaining handlers.
    pub fn on_completed<F, Fut>(&self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.handlers()
            .completed
            .push(Box::new(move || handler().boxed()));
    }

    pub fn on_failed<F>(&self, handler: F)
    where
        F: Fn(&UnitOfWorkFailedEvent) + Send + Sync + 'static,
    {
        self.handlers().failed.push(Box::new(handler));
    }

    pub fn on_disposed<F>(&self, handler: F)
    where
        F: Fn(UnitOfWorkId) + Send + Sync + 'static,
    {
        self.handlers().disposed.push(Box::new(handler));
    }

    // --- Lifecycle ---

    /// Saves pending changes on every database api that supports it.
    /// Does nothing once the unit has been rolled back.
    pub async fn save_changes(&self, cancel: &CancellationToken) -> Result<()> {
        let apis = {
            let state = self.state();
            if state.is_rolled_back {
                return Ok(());
            }
            state.database_apis.entries()
        };

        for (key, api) in apis {
            if !api.capabilities().save_changes {
                continue;
            }
            ensure_not_cancelled(cancel)?;
            api.save_changes(cancel)
                .await
                .map_err(|e| UnitOfWorkError::SaveChanges {
                    key: key.clone(),
                    source: SharedError::from(e),
                })?;
        }
        Ok(())
    }

    /// Saves, flushes events to a fixed point, commits and runs completion handlers.
    ///
    /// Completing a completed or rolled back unit does nothing. Completing a unit
    /// that is already completing (or failed while completing) is a usage fault.
    #[tracing::instrument(skip_all, fields(uow_id = %self.id()))]
    pub async fn complete(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state();
            if state.is_rolled_back {
                debug!("Skipping completion of a rolled back unit of work");
                return Ok(());
            }
            if state.is_completed {
                debug!("Unit of work is already completed");
                return Ok(());
            }
            if state.is_completing {
                return Err(UnitOfWorkError::AlreadyCompleting(self.id()));
            }
            if state.is_disposed {
                return Err(UnitOfWorkError::Disposed(self.id()));
            }
            state.is_completing = true;
        }

        if let Err(error) = self.run_completion(cancel).await {
            warn!(error = %error, "Unit of work completion failed");
            self.state().error = Some(error.clone());
            return Err(error);
        }

        info!("Completed unit of work");
        Ok(())
    }

    async fn run_completion(&self, cancel: &CancellationToken) -> Result<()> {
        self.save_changes(cancel).await?;

        let mut round = 0u32;
        while self.has_pending_events() {
            round += 1;
            ensure_not_cancelled(cancel)?;

            let local = event_record::drain_ordered(&mut self.state().local_events);
            if !local.is_empty() {
                debug!(round, count = local.len(), "Publishing local events");
                self.inner
                    .publisher
                    .publish_local_events(local, cancel)
                    .await
                    .map_err(|e| UnitOfWorkError::Publish(SharedError::from(e)))?;
            }

            let distributed = event_record::drain_ordered(&mut self.state().distributed_events);
            if !distributed.is_empty() {
                debug!(round, count = distributed.len(), "Publishing distributed events");
                self.inner
                    .publisher
                    .publish_distributed_events(distributed, cancel)
                    .await
                    .map_err(|e| UnitOfWorkError::Publish(SharedError::from(e)))?;
            }

            self.save_changes(cancel).await?;
        }

        ensure_not_cancelled(cancel)?;
        self.commit_transactions(cancel).await?;

        self.state().is_completed = true;

        let handlers = std::mem::take(&mut self.handlers().completed);
        for handler in handlers {
            handler()
                .await
                .map_err(|e| UnitOfWorkError::CompletedHandler(SharedError::from(e)))?;
        }
        Ok(())
    }

    async fn commit_transactions(&self, cancel: &CancellationToken) -> Result<()> {
        let transactions = self.state().transaction_apis.entries();
        for (key, api) in transactions {
            api.commit(cancel)
                .await
                .map_err(|e| UnitOfWorkError::Commit {
                    key: key.clone(),
                    source: SharedError::from(e),
                })?;
            debug!(key, "Committed transaction");
        }
        Ok(())
    }

    /// Rolls back every resource that supports it. Idempotent and best-effort:
    /// individual failures are logged and the remaining resources are still tried.
    #[tracing::instrument(skip_all, fields(uow_id = %self.id()))]
    pub async fn rollback(&self, cancel: &CancellationToken) {
        let (databases, transactions) = {
            let mut state = self.state();
            if state.is_rolled_back {
                return;
            }
            state.is_rolled_back = true;
            state.local_events.clear();
            state.distributed_events.clear();
            (
                state.database_apis.entries(),
                state.transaction_apis.entries(),
            )
        };
        info!(
            databases = databases.len(),
            transactions = transactions.len(),
            "Rolling back unit of work"
        );

        for (key, api) in databases {
            if !api.capabilities().rollback {
                continue;
            }
            if let Err(e) = api.rollback(cancel).await {
                warn!(key, error = %e, "Database api rollback failed");
            }
        }
        for (key, api) in transactions {
            if !api.capabilities().rollback {
                continue;
            }
            if let Err(e) = api.rollback(cancel).await {
                warn!(key, error = %e, "Transaction api rollback failed");
            }
        }
    }

    /// Releases every resource and notifies handlers. Idempotent; never fails.
    pub fn dispose(&self) {
        let (databases, transactions, failure) = {
            let mut state = self.state();
            if state.is_disposed {
                return;
            }
            state.is_disposed = true;
            state.local_events.clear();
            state.distributed_events.clear();
            let failure = (!state.is_completed || state.error.is_some()).then(|| {
                UnitOfWorkFailedEvent {
                    unit_id: self.id(),
                    error: state.error.clone(),
                    is_rolled_back: state.is_rolled_back,
                }
            });
            (
                state.database_apis.drain(),
                state.transaction_apis.drain(),
                failure,
            )
        };

        for (key, api) in &transactions {
            if let Err(e) = api.dispose() {
                warn!(uow_id = %self.id(), key = key.as_str(), error = %e, "Transaction api dispose failed");
            }
        }
        drop(transactions);
        drop(databases);

        let handlers = std::mem::take(&mut *self.handlers());
        if let Some(event) = &failure {
            warn!(
                uow_id = %self.id(),
                rolled_back = event.is_rolled_back,
                error = ?event.error.as_ref().map(ToString::to_string),
                "Unit of work failed"
            );
            for handler in &handlers.failed {
                handler(event);
            }
        }
        for handler in &handlers.disposed {
            handler(self.id());
        }

        let lifetime = lock(&self.inner.lifetime).take();
        if let Some(lifetime) = lifetime {
            lifetime.release();
        }
        info!(uow_id = %self.id(), failed = failure.is_some(), "Disposed unit of work");
    }
}

/// The full unit-of-work surface, shared by physical units, child units and
/// the handles returned by the manager.
///
/// Implementors supply the physical unit plus their own `complete`/`dispose`;
/// every other operation is forwarded to the physical unit.
#[async_trait]
pub trait ActiveUnitOfWork: Send + Sync {
    /// The physical unit that owns buffers and resources.
    fn physical(&self) -> &UnitOfWork;

    /// `true` when this value is allowed to commit and dispose the physical unit.
    fn is_root(&self) -> bool;

    async fn complete(&self, cancel: &CancellationToken) -> Result<()>;

    fn dispose(&self);

    fn id(&self) -> UnitOfWorkId {
        self.physical().id()
    }

    fn outer(&self) -> Option<UnitOfWork> {
        self.physical().outer()
    }

    fn options(&self) -> Option<UnitOfWorkOptions> {
        self.physical().options()
    }

    fn is_reserved(&self) -> bool {
        self.physical().is_reserved()
    }

    fn reservation_name(&self) -> Option<String> {
        self.physical().reservation_name()
    }

    fn is_reserved_for(&self, name: &str) -> bool {
        self.physical().is_reserved_for(name)
    }

    fn is_completed(&self) -> bool {
        self.physical().is_completed()
    }

    fn is_disposed(&self) -> bool {
        self.physical().is_disposed()
    }

    fn initialize(&self, options: UnitOfWorkOptions) -> Result<()> {
        self.physical().initialize(options)
    }

    fn reserve(&self, name: &str) -> Result<()> {
        self.physical().reserve(name)
    }

    fn set_item<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T)
    where
        Self: Sized,
    {
        self.physical().set_item(key, value)
    }

    fn get_item<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>>
    where
        Self: Sized,
    {
        self.physical().get_item(key)
    }

    fn add_local_event(&self, record: EventRecord) {
        self.physical().add_local_event(record)
    }

    fn add_distributed_event(&self, record: EventRecord) {
        self.physical().add_distributed_event(record)
    }

    fn add_or_replace_local_event<F>(&self, record: EventRecord, selector: F)
    where
        Self: Sized,
        F: Fn(&EventRecord) -> bool,
    {
        self.physical().add_or_replace_local_event(record, selector)
    }

    fn add_or_replace_distributed_event<F>(&self, record: EventRecord, selector: F)
    where
        Self: Sized,
        F: Fn(&EventRecord) -> bool,
    {
        self.physical().add_or_replace_distributed_event(record, selector)
    }

    fn find_database_api(&self, key: &str) -> Option<Arc<dyn DatabaseApi>> {
        self.physical().find_database_api(key)
    }

    fn add_database_api(&self, key: &str, api: Arc<dyn DatabaseApi>) -> Result<()> {
        self.physical().add_database_api(key, api)
    }

    fn get_or_add_database_api<F>(&self, key: &str, factory: F) -> Result<Arc<dyn DatabaseApi>>
    where
        Self: Sized,
        F: FnOnce() -> Arc<dyn DatabaseApi>,
    {
        self.physical().get_or_add_database_api(key, factory)
    }

    fn find_transaction_api(&self, key: &str) -> Option<Arc<dyn TransactionApi>> {
        self.physical().find_transaction_api(key)
    }

    fn add_transaction_api(&self, key: &str, api: Arc<dyn TransactionApi>) -> Result<()> {
        self.physical().add_transaction_api(key, api)
    }

    fn get_or_add_transaction_api<F>(
        &self,
        key: &str,
        factory: F,
    ) -> Result<Arc<dyn TransactionApi>>
    where
        Self: Sized,
        F: FnOnce() -> Arc<dyn TransactionApi>,
    {
        self.physical().get_or_add_transaction_api(key, factory)
    }

    fn on_failed<F>(&self, handler: F)
    where
        Self: Sized,
        F: Fn(&UnitOfWorkFailedEvent) + Send + Sync + 'static,
    {
        self.physical().on_failed(handler)
    }

    fn on_disposed<F>(&self, handler: F)
    where
        Self: Sized,
        F: Fn(UnitOfWorkId) + Send + Sync + 'static,
    {
        self.physical().on_disposed(handler)
    }

    fn on_completed<F, Fut>(&self, handler: F)
    where
        Self: Sized,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.physical().on_completed(handler)
    }

    async fn save_changes(&self, cancel: &CancellationToken) -> Result<()> {
        self.physical().save_changes(cancel).await
    }

    async fn rollback(&self, cancel: &CancellationToken) {
        self.physical().rollback(cancel).await
    }
}

#[async_trait]
impl ActiveUnitOfWork for UnitOfWork {
    fn physical(&self) -> &UnitOfWork {
        self
    }

    fn is_root(&self) -> bool {
        true
    }

    async fn complete(&self, cancel: &CancellationToken) -> Result<()> {
        UnitOfWork::complete(self, cancel).await
    }

    fn dispose(&self) {
        UnitOfWork::dispose(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CallLog, MockDatabaseApi, MockTransactionApi, RecordingEventPublisher};
    use serde_json::json;
    use std::sync::OnceLock;

    fn unit_with(publisher: Arc<dyn UnitOfWorkEventPublisher>) -> UnitOfWork {
        let unit = UnitOfWork::new(publisher, UnitOfWorkDefaultOptions::default());
        unit.initialize(UnitOfWorkOptions::transactional()).unwrap();
        unit
    }

    #[test]
    fn initialize_is_allowed_once() {
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(CallLog::new())));
        let result = unit.initialize(UnitOfWorkOptions::default());
        assert!(matches!(result, Err(UnitOfWorkError::AlreadyInitialized(id)) if id == unit.id()));
        assert!(unit.options().unwrap().is_transactional);
    }

    #[test]
    fn reservation_is_claimed_by_initialize() {
        let unit = UnitOfWork::new(
            Arc::new(RecordingEventPublisher::new(CallLog::new())),
            UnitOfWorkDefaultOptions::default(),
        );
        unit.reserve("checkout").unwrap();
        assert!(unit.is_reserved_for("checkout"));
        assert!(matches!(unit.reserve("checkout"), Err(UnitOfWorkError::AlreadyReserved(_))));
        assert!(matches!(unit.reserve(" "), Err(UnitOfWorkError::InvalidArgument(_))));

        unit.initialize(UnitOfWorkOptions::transactional()).unwrap();
        assert!(!unit.is_reserved());
        assert_eq!(unit.reservation_name().as_deref(), Some("checkout"));
    }

    #[tokio::test]
    async fn publishes_events_in_registration_order() {
        let log = CallLog::new();
        let publisher = Arc::new(RecordingEventPublisher::new(log.clone()));
        let unit = unit_with(publisher.clone());

        for payload in ["A", "B", "C"] {
            unit.add_local_event(EventRecord::new("Letter", json!(payload)));
        }
        unit.complete(&CancellationToken::new()).await.unwrap();

        let published: Vec<_> = publisher
            .local_events()
            .iter()
            .map(|r| r.event_data().clone())
            .collect();
        assert_eq!(published, [json!("A"), json!("B"), json!("C")]);
        assert!(unit.is_completed());
    }

    #[tokio::test]
    async fn flushes_until_no_new_events_appear() {
        let log = CallLog::new();
        let slot: Arc<OnceLock<UnitOfWork>> = Arc::new(OnceLock::new());
        let hook_slot = slot.clone();
        let publisher = Arc::new(RecordingEventPublisher::new(log.clone()).with_local_hook(
            move |events| {
                let unit = hook_slot.get().expect("unit registered");
                for event in events {
                    if event.event_type() == "OrderPlaced" {
                        unit.add_distributed_event(EventRecord::new("order.placed", json!(1)));
                        unit.add_local_event(EventRecord::new("InvoiceRequested", json!(1)));
                    }
                }
            },
        ));
        let unit = unit_with(publisher.clone());
        slot.set(unit.clone()).unwrap();

        let db = Arc::new(MockDatabaseApi::new("sql", log.clone()));
        unit.add_database_api("sql", db.clone()).unwrap();
        unit.add_local_event(EventRecord::new("OrderPlaced", json!(1)));

        unit.complete(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            log.entries(),
            [
                "sql.save",
                "publish.local:OrderPlaced",
                "publish.distributed:order.placed",
                "sql.save",
                "publish.local:InvoiceRequested",
                "sql.save",
            ]
        );
        assert!(!unit.has_pending_events());
        assert_eq!(db.save_count(), 3);
    }

    #[tokio::test]
    async fn commits_after_flush_in_registration_order() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        unit.add_transaction_api("sql", Arc::new(MockTransactionApi::new("sql", log.clone())))
            .unwrap();
        unit.add_transaction_api("mongo", Arc::new(MockTransactionApi::new("mongo", log.clone())))
            .unwrap();
        unit.add_distributed_event(EventRecord::new("order.placed", json!(1)));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handler_log = log.clone();
        unit.on_completed(move || async move {
            handler_log.record("completed");
            let _ = tx.send(());
            Ok::<(), BoxError>(())
        });

        unit.complete(&CancellationToken::new()).await.unwrap();
        rx.await.unwrap();

        assert_eq!(
            log.entries(),
            [
                "publish.distributed:order.placed",
                "sql.commit",
                "mongo.commit",
                "completed",
            ]
        );
    }

    #[tokio::test]
    async fn second_complete_is_a_no_op() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        unit.add_transaction_api("sql", Arc::new(MockTransactionApi::new("sql", log.clone())))
            .unwrap();

        let cancel = CancellationToken::new();
        unit.complete(&cancel).await.unwrap();
        unit.complete(&cancel).await.unwrap();
        assert_eq!(log.entries(), ["sql.commit"]);
    }

    struct ReentrantPublisher {
        unit: OnceLock<UnitOfWork>,
        observed: Mutex<Option<Result<()>>>,
    }

    #[async_trait]
    impl UnitOfWorkEventPublisher for ReentrantPublisher {
        async fn publish_local_events(
            &self,
            _events: Vec<EventRecord>,
            cancel: &CancellationToken,
        ) -> Result<(), BoxError> {
            if let Some(unit) = self.unit.get() {
                let result = unit.complete(cancel).await;
                *self.observed.lock().unwrap() = Some(result);
            }
            Ok(())
        }

        async fn publish_distributed_events(
            &self,
            _events: Vec<EventRecord>,
            _cancel: &CancellationToken,
        ) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn complete_while_completing_is_rejected() {
        let publisher = Arc::new(ReentrantPublisher {
            unit: OnceLock::new(),
            observed: Mutex::new(None),
        });
        let unit = unit_with(publisher.clone());
        let _ = publisher.unit.set(unit.clone());
        unit.add_local_event(EventRecord::new("Ping", json!(null)));

        unit.complete(&CancellationToken::new()).await.unwrap();

        let observed = publisher.observed.lock().unwrap().take();
        assert!(matches!(observed, Some(Err(UnitOfWorkError::AlreadyCompleting(_)))));
    }

    #[tokio::test]
    async fn commit_failure_is_recorded_and_reported_on_dispose() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        unit.add_transaction_api(
            "sql",
            Arc::new(MockTransactionApi::new("sql", log.clone()).failing_commit("deadlock")),
        )
        .unwrap();

        let failures: Arc<Mutex<Vec<UnitOfWorkFailedEvent>>> = Arc::default();
        let sink = failures.clone();
        unit.on_failed(move |event| sink.lock().unwrap().push(event.clone()));

        let error = unit.complete(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(&error, UnitOfWorkError::Commit { key, .. } if key == "sql"));
        assert!(!unit.is_completed());
        assert!(matches!(
            unit.complete(&CancellationToken::new()).await,
            Err(UnitOfWorkError::AlreadyCompleting(_))
        ));

        unit.dispose();
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].error.as_ref().map(ToString::to_string),
            Some(error.to_string())
        );
        assert!(!failures[0].is_rolled_back);
    }

    #[tokio::test]
    async fn completed_handler_error_aborts_remaining_handlers() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));

        let first = log.clone();
        unit.on_completed(move || async move {
            first.record("first");
            Err::<(), BoxError>(BoxError::from("mail server down"))
        });
        let second = log.clone();
        unit.on_completed(move || async move {
            second.record("second");
            Ok::<(), BoxError>(())
        });

        let result = unit.complete(&CancellationToken::new()).await;
        assert!(matches!(result, Err(UnitOfWorkError::CompletedHandler(_))));
        assert!(unit.is_completed());
        assert!(unit.error().is_some());
        assert_eq!(log.entries(), ["first"]);
    }

    #[tokio::test]
    async fn rollback_attempts_every_resource() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        let sql = Arc::new(MockTransactionApi::new("sql", log.clone()).failing_rollback("gone"));
        let mongo = Arc::new(MockTransactionApi::new("mongo", log.clone()));
        let db = Arc::new(MockDatabaseApi::new("cache", log.clone()).failing_rollback("gone"));
        unit.add_database_api("cache", db.clone()).unwrap();
        unit.add_transaction_api("sql", sql.clone()).unwrap();
        unit.add_transaction_api("mongo", mongo.clone()).unwrap();

        let cancel = CancellationToken::new();
        unit.rollback(&cancel).await;
        unit.rollback(&cancel).await;

        assert_eq!(log.entries(), ["cache.rollback", "sql.rollback", "mongo.rollback"]);
        assert_eq!(mongo.rollback_count(), 1);

        unit.save_changes(&cancel).await.unwrap();
        unit.complete(&cancel).await.unwrap();
        assert_eq!(db.save_count(), 0);
        assert!(!unit.is_completed());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_disposes_transactions() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        let failing = Arc::new(MockTransactionApi::new("sql", log.clone()).failing_dispose("busy"));
        let healthy = Arc::new(MockTransactionApi::new("mongo", log.clone()));
        unit.add_transaction_api("sql", failing.clone()).unwrap();
        unit.add_transaction_api("mongo", healthy.clone()).unwrap();

        let failed = Arc::new(AtomicU64::new(0));
        let disposed = Arc::new(AtomicU64::new(0));
        let (f, d) = (failed.clone(), disposed.clone());
        unit.on_failed(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        unit.on_disposed(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        unit.dispose();
        unit.dispose();

        assert!(unit.is_disposed());
        assert_eq!(healthy.dispose_count(), 1);
        assert_eq!(failing.dispose_count(), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(unit.transaction_apis().is_empty());
    }

    #[tokio::test]
    async fn clean_completion_does_not_report_failure() {
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(CallLog::new())));
        let failed = Arc::new(AtomicU64::new(0));
        let f = failed.clone();
        unit.on_failed(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        unit.complete(&CancellationToken::new()).await.unwrap();
        unit.dispose();
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_completion_without_rollback() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        unit.add_transaction_api("sql", Arc::new(MockTransactionApi::new("sql", log.clone())))
            .unwrap();
        unit.add_local_event(EventRecord::new("Ping", json!(null)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(unit.complete(&cancel).await, Err(UnitOfWorkError::Cancelled)));
        assert!(!unit.is_rolled_back());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn get_or_add_returns_the_first_instance() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        let first = unit
            .get_or_add_database_api("sql", || Arc::new(MockDatabaseApi::new("sql", log.clone())))
            .unwrap();
        let second = unit
            .get_or_add_database_api("sql", || panic!("factory must not run twice"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let duplicate = unit.add_database_api("sql", Arc::new(MockDatabaseApi::new("sql", log)));
        assert!(matches!(duplicate, Err(UnitOfWorkError::DuplicateDatabaseApi(key)) if key == "sql"));
    }

    #[test]
    fn disposed_unit_rejects_new_resources() {
        let log = CallLog::new();
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(log.clone())));
        unit.dispose();

        let late = Arc::new(MockTransactionApi::new("late", log.clone()));
        let added = unit.add_transaction_api("late", late.clone());
        assert!(matches!(added, Err(UnitOfWorkError::Disposed(id)) if id == unit.id()));
        assert!(matches!(
            unit.add_database_api("db", Arc::new(MockDatabaseApi::new("db", log.clone()))),
            Err(UnitOfWorkError::Disposed(_))
        ));
        assert!(matches!(
            unit.get_or_add_database_api("db", || Arc::new(MockDatabaseApi::new("db", log.clone()))),
            Err(UnitOfWorkError::Disposed(_))
        ));

        let created = Arc::new(MockTransactionApi::new("created", log.clone()));
        let factory_api = created.clone();
        assert!(matches!(
            unit.get_or_add_transaction_api("created", move || factory_api),
            Err(UnitOfWorkError::Disposed(_))
        ));

        unit.dispose();
        assert!(unit.transaction_apis().is_empty());
        assert!(unit.database_apis().is_empty());
        assert_eq!(late.dispose_count(), 0);
        // The factory's instance was never registered, so the unit released it.
        assert_eq!(created.dispose_count(), 1);
    }

    #[test]
    fn item_bag_is_typed() {
        let unit = unit_with(Arc::new(RecordingEventPublisher::new(CallLog::new())));
        unit.set_item("tenant", "acme".to_string());
        assert_eq!(unit.get_item::<String>("tenant").as_deref().map(String::as_str), Some("acme"));
        assert!(unit.get_item::<u32>("tenant").is_none());

        let counter = unit.get_or_add_item("counter", || 41u32);
        assert_eq!(*counter, 41);
        assert_eq!(*unit.get_or_add_item("counter", || 0u32), 41);
        assert!(unit.remove_item("counter"));
        assert!(!unit.remove_item("counter"));
    }
}
