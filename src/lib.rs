//! # Unit of Work
//!
//! > **Ambient, nestable units of work for async Rust.**
//!
//! A unit of work groups the database sessions, transactions and domain events
//! of one logical operation. Application code opens one with
//! [`UnitOfWorkManager::begin`]; nested code that begins again *joins* the
//! same physical unit instead of opening a second transaction. When the
//! outermost caller completes, the unit saves changes, publishes buffered
//! events in order until no new ones appear, and commits every transaction.
//!
//! ## Core Concepts
//!
//! - [`UnitOfWork`]: the physical unit: options, resources, event buffers, lifecycle.
//! - [`ChildUnitOfWork`]: what a nested `begin` returns; `complete`/`dispose` are no-ops.
//! - [`ActiveUnitOfWork`]: the shared surface of both, plus [`UnitOfWorkHandle`].
//! - [`AmbientUnitOfWork`]: the task-local "current unit" slot.
//! - [`DatabaseApi`] / [`TransactionApi`]: adapter seams for ORMs and drivers.
//! - [`UnitOfWorkEventPublisher`]: delivers local and distributed events at commit time.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use unit_of_work::{
//!     ActiveUnitOfWork, AmbientUnitOfWork, EventRecord, NullEventPublisher,
//!     UnitOfWorkDefaultOptions, UnitOfWorkManager, UnitOfWorkOptions,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), unit_of_work::UnitOfWorkError> {
//! let manager = UnitOfWorkManager::with_publisher(
//!     Arc::new(NullEventPublisher),
//!     UnitOfWorkDefaultOptions::default(),
//! );
//!
//! AmbientUnitOfWork::scope(async {
//!     let uow = manager.begin(UnitOfWorkOptions::transactional(), false).await?;
//!     {
//!         // Nested begin joins the same physical unit.
//!         let nested = manager.begin(UnitOfWorkOptions::default(), false).await?;
//!         assert_eq!(nested.id(), uow.id());
//!         nested.add_local_event(EventRecord::new("OrderPlaced", serde_json::json!({ "id": 1 })));
//!     }
//!     uow.complete(&CancellationToken::new()).await
//! })
//! .await
//! # }
//! ```
//!
//! ## Testing
//!
//! The [`mock`] module provides recording doubles for every seam.

pub mod ambient;
pub mod child;
pub mod error;
pub mod event_record;
pub mod logging;
pub mod manager;
pub mod metadata;
pub mod mock;
pub mod options;
pub mod publisher;
pub mod resources;
pub mod tree;
pub mod unit_of_work;

pub use ambient::AmbientUnitOfWork;
pub use child::ChildUnitOfWork;
pub use error::{BoxError, Result, SharedError, UnitOfWorkError};
pub use event_record::{next_event_order, EventRecord};
pub use logging::setup_tracing;
pub use manager::{
    ResolutionScope, ScopeFactory, SharedPublisherScopeFactory, UnitOfWorkHandle,
    UnitOfWorkManager,
};
pub use metadata::{UnitOfWorkMetadata, UnitOfWorkMetadataTable};
pub use options::{
    IsolationLevel, TransactionBehavior, UnitOfWorkDefaultOptions, UnitOfWorkOptions,
};
pub use publisher::{NullEventPublisher, UnitOfWorkEventPublisher};
pub use resources::{ApiCapabilities, DatabaseApi, ResourceContainer, TransactionApi};
pub use tree::{walk_outward, NodeStatus, UnitOfWorkTree};
pub use unit_of_work::{ActiveUnitOfWork, UnitOfWork, UnitOfWorkFailedEvent, UnitOfWorkId};
