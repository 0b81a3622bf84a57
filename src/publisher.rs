//! # Event Publisher Seam
//!
//! When a unit of work completes, its buffered events are handed to a
//! [`UnitOfWorkEventPublisher`] in `event_order` order, local events first.
//! Publishers must not reorder a batch. They may register new events or modify
//! entities while publishing; the unit keeps flushing until no new events appear.

use crate::error::BoxError;
use crate::event_record::EventRecord;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delivers ordered batches of events at commit time.
#[async_trait]
pub trait UnitOfWorkEventPublisher: Send + Sync {
    async fn publish_local_events(
        &self,
        events: Vec<EventRecord>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>;

    async fn publish_distributed_events(
        &self,
        events: Vec<EventRecord>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>;
}

/// Publisher that discards every event. Used when no transport is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventPublisher;

#[async_trait]
impl UnitOfWorkEventPublisher for NullEventPublisher {
    async fn publish_local_events(
        &self,
        events: Vec<EventRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        debug!(count = events.len(), "Discarding local events");
        Ok(())
    }

    async fn publish_distributed_events(
        &self,
        events: Vec<EventRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        debug!(count = events.len(), "Discarding distributed events");
        Ok(())
    }
}
