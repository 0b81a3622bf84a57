//! # Event Dispatch
//!
//! [`LogEventPublisher`] delivers local events to in-process handlers and
//! records distributed events in an outbox, logging both.
//!
//! Local handlers run while the unit of work is completing, so they can write
//! through the unit's session and raise further events; the unit flushes again
//! until nothing new is raised.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;
use unit_of_work::{BoxError, EventRecord, UnitOfWorkEventPublisher};

type LocalHandler = Arc<dyn Fn(&EventRecord) -> Result<(), BoxError> + Send + Sync>;

#[derive(Default)]
pub struct LogEventPublisher {
    handlers: RwLock<HashMap<String, Vec<LocalHandler>>>,
    outbox: Mutex<Vec<EventRecord>>,
}

impl LogEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for local events of `event_type`.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&EventRecord) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Distributed events published so far.
    pub fn outbox(&self) -> Vec<EventRecord> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn handlers_for(&self, event_type: &str) -> Vec<LocalHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl UnitOfWorkEventPublisher for LogEventPublisher {
    async fn publish_local_events(
        &self,
        events: Vec<EventRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        for event in &events {
            let handlers = self.handlers_for(event.event_type());
            info!(
                event_type = event.event_type(),
                event_order = event.event_order(),
                handlers = handlers.len(),
                "Dispatching local event"
            );
            for handler in handlers {
                handler(event)?;
            }
        }
        Ok(())
    }

    async fn publish_distributed_events(
        &self,
        events: Vec<EventRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        for event in &events {
            info!(
                event_type = event.event_type(),
                event_order = event.event_order(),
                use_outbox = event.use_outbox(),
                "Publishing distributed event"
            );
        }
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(events);
        Ok(())
    }
}
