//! # Test Doubles
//!
//! In-memory implementations of every collaborator seam, for testing code that
//! runs inside units of work without a database or a message bus.
//!
//! All doubles write to a shared [`CallLog`], so a test can assert the exact
//! interleaving of saves, publications, commits and rollbacks across several
//! resources.
//!
//! | Double | Seam | Log entries |
//! |--------|------|-------------|
//! | [`MockDatabaseApi`] | [`DatabaseApi`] | `{name}.save`, `{name}.rollback` |
//! | [`MockTransactionApi`] | [`TransactionApi`] | `{name}.commit`, `{name}.rollback` |
//! | [`RecordingEventPublisher`] | [`UnitOfWorkEventPublisher`] | `publish.local:{types}`, `publish.distributed:{types}` |
//!
//! Disposal is counted ([`MockTransactionApi::dispose_count`]) but not logged.
//!
//! ## Failure Injection
//!
//! Every double can be told to fail a specific operation:
//!
//! ```rust
//! use std::sync::Arc;
//! use unit_of_work::mock::{CallLog, MockTransactionApi};
//!
//! let log = CallLog::new();
//! let tx = Arc::new(MockTransactionApi::new("sql", log.clone()).failing_commit("deadlock"));
//! ```
//!
//! The failure is still logged, so ordering assertions keep working on error paths.
//!
//! ## Reacting to Publication
//!
//! [`RecordingEventPublisher::with_local_hook`] runs a closure on every local
//! batch. Handlers that raise follow-up events are modelled this way:
//!
//! ```rust,ignore
//! let publisher = RecordingEventPublisher::new(log.clone()).with_local_hook(|events| {
//!     if let Some(uow) = AmbientUnitOfWork::get_current_by_checking() {
//!         uow.add_distributed_event(EventRecord::new("order.placed", json!({})));
//!     }
//! });
//! ```

use crate::error::BoxError;
use crate::event_record::EventRecord;
use crate::publisher::UnitOfWorkEventPublisher;
use crate::resources::{ApiCapabilities, DatabaseApi, TransactionApi};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Error returned by injected failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct MockError(pub String);

fn injected(message: &Option<String>) -> Result<(), BoxError> {
    match message {
        Some(message) => Err(Box::new(MockError(message.clone()))),
        None => Ok(()),
    }
}

/// Ordered, shared record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// In-memory [`DatabaseApi`] that counts saves and rollbacks.
#[derive(Debug)]
pub struct MockDatabaseApi {
    name: String,
    log: CallLog,
    capabilities: ApiCapabilities,
    save_error: Option<String>,
    rollback_error: Option<String>,
    saves: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl MockDatabaseApi {
    /// A database api that supports saving and rolling back.
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            capabilities: ApiCapabilities::ALL,
            save_error: None,
            rollback_error: None,
            saves: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ApiCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn failing_save(mut self, message: impl Into<String>) -> Self {
        self.save_error = Some(message.into());
        self
    }

    pub fn failing_rollback(mut self, message: impl Into<String>) -> Self {
        self.rollback_error = Some(message.into());
        self
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseApi for MockDatabaseApi {
    fn capabilities(&self) -> ApiCapabilities {
        self.capabilities
    }

    async fn save_changes(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.log.record(format!("{}.save", self.name));
        self.saves.fetch_add(1, Ordering::SeqCst);
        injected(&self.save_error)
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.log.record(format!("{}.rollback", self.name));
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        injected(&self.rollback_error)
    }
}

/// In-memory [`TransactionApi`] that counts commits, rollbacks and disposals.
#[derive(Debug)]
pub struct MockTransactionApi {
    name: String,
    log: CallLog,
    capabilities: ApiCapabilities,
    commit_error: Option<String>,
    rollback_error: Option<String>,
    dispose_error: Option<String>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    disposals: AtomicUsize,
}

impl MockTransactionApi {
    /// A transaction that supports rollback.
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            capabilities: ApiCapabilities::NONE.with_rollback(),
            commit_error: None,
            rollback_error: None,
            dispose_error: None,
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
        }
    }

    pub fn without_rollback(mut self) -> Self {
        self.capabilities = ApiCapabilities::NONE;
        self
    }

    pub fn failing_commit(mut self, message: impl Into<String>) -> Self {
        self.commit_error = Some(message.into());
        self
    }

    pub fn failing_rollback(mut self, message: impl Into<String>) -> Self {
        self.rollback_error = Some(message.into());
        self
    }

    pub fn failing_dispose(mut self, message: impl Into<String>) -> Self {
        self.dispose_error = Some(message.into());
        self
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionApi for MockTransactionApi {
    fn capabilities(&self) -> ApiCapabilities {
        self.capabilities
    }

    async fn commit(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.log.record(format!("{}.commit", self.name));
        self.commits.fetch_add(1, Ordering::SeqCst);
        injected(&self.commit_error)
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.log.record(format!("{}.rollback", self.name));
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        injected(&self.rollback_error)
    }

    fn dispose(&self) -> Result<(), BoxError> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        injected(&self.dispose_error)
    }
}

type PublishHook = Box<dyn Fn(&[EventRecord]) + Send + Sync>;

/// Publisher that keeps every batch it receives.
#[derive(Default)]
pub struct RecordingEventPublisher {
    log: CallLog,
    local: Mutex<Vec<EventRecord>>,
    distributed: Mutex<Vec<EventRecord>>,
    local_hook: Option<PublishHook>,
    distributed_hook: Option<PublishHook>,
    local_error: Option<String>,
    distributed_error: Option<String>,
}

impl RecordingEventPublisher {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Runs `hook` after each local batch is recorded.
    pub fn with_local_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[EventRecord]) + Send + Sync + 'static,
    {
        self.local_hook = Some(Box::new(hook));
        self
    }

    /// Runs `hook` after each distributed batch is recorded.
    pub fn with_distributed_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[EventRecord]) + Send + Sync + 'static,
    {
        self.distributed_hook = Some(Box::new(hook));
        self
    }

    pub fn failing_local(mut self, message: impl Into<String>) -> Self {
        self.local_error = Some(message.into());
        self
    }

    pub fn failing_distributed(mut self, message: impl Into<String>) -> Self {
        self.distributed_error = Some(message.into());
        self
    }

    /// Every local event published so far, in publication order.
    pub fn local_events(&self) -> Vec<EventRecord> {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every distributed event published so far, in publication order.
    pub fn distributed_events(&self) -> Vec<EventRecord> {
        self.distributed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(
        &self,
        channel: &str,
        sink: &Mutex<Vec<EventRecord>>,
        events: Vec<EventRecord>,
        hook: Option<&PublishHook>,
        error: &Option<String>,
    ) -> Result<(), BoxError> {
        let types: Vec<&str> = events.iter().map(EventRecord::event_type).collect();
        self.log
            .record(format!("publish.{channel}:{}", types.join(",")));
        injected(error)?;

        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(events.iter().cloned());
        if let Some(hook) = hook {
            hook(events.as_slice());
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWorkEventPublisher for RecordingEventPublisher {
    async fn publish_local_events(
        &self,
        events: Vec<EventRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.record(
            "local",
            &self.local,
            events,
            self.local_hook.as_ref(),
            &self.local_error,
        )
    }

    async fn publish_distributed_events(
        &self,
        events: Vec<EventRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.record(
            "distributed",
            &self.distributed,
            events,
            self.distributed_hook.as_ref(),
            &self.distributed_error,
        )
    }
}
