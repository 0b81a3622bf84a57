//! # Unit-of-Work Manager
//!
//! The manager is the entry point application code uses to start units of work.
//!
//! ## Begin
//!
//! `begin(options, requires_new)` either joins the current unit (returning a
//! [`UnitOfWorkHandle::Child`]) or creates a new physical unit, makes it the
//! ambient unit and returns a [`UnitOfWorkHandle::Root`]. Dropping a root handle
//! disposes the unit, which restores the previous ambient unit.
//!
//! ## Reservations
//!
//! An outer layer (an HTTP pipeline, a message consumer) may *reserve* a unit
//! under a name before knowing its options. Inner code later claims it with
//! [`UnitOfWorkManager::begin_reserved`], which initializes the nearest matching
//! reservation in the ambient chain.
//!
//! ## Scopes
//!
//! Every new physical unit gets a [`ResolutionScope`] from the configured
//! [`ScopeFactory`]. The scope supplies the event publisher and is disposed when
//! the unit is disposed.

use crate::ambient::{AmbientSlot, AmbientUnitOfWork};
use crate::child::ChildUnitOfWork;
use crate::error::{require_non_blank, BoxError, Result, SharedError, UnitOfWorkError};
use crate::options::{UnitOfWorkDefaultOptions, UnitOfWorkOptions};
use crate::publisher::UnitOfWorkEventPublisher;
use crate::tree::UnitOfWorkTree;
use crate::unit_of_work::{ActiveUnitOfWork, UnitOfWork};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-unit service scope. Disposed together with the unit that owns it.
pub trait ResolutionScope: Send + Sync {
    fn event_publisher(&self) -> Result<Arc<dyn UnitOfWorkEventPublisher>, BoxError>;

    fn dispose(&self) {}
}

/// Creates a [`ResolutionScope`] for each new physical unit.
#[async_trait]
pub trait ScopeFactory: Send + Sync {
    async fn create_scope(&self) -> Result<Box<dyn ResolutionScope>, BoxError>;
}

/// Scope factory that hands every unit the same publisher.
#[derive(Clone)]
pub struct SharedPublisherScopeFactory {
    publisher: Arc<dyn UnitOfWorkEventPublisher>,
}

impl SharedPublisherScopeFactory {
    pub fn new(publisher: Arc<dyn UnitOfWorkEventPublisher>) -> Self {
        Self { publisher }
    }
}

struct SharedPublisherScope {
    publisher: Arc<dyn UnitOfWorkEventPublisher>,
}

impl ResolutionScope for SharedPublisherScope {
    fn event_publisher(&self) -> Result<Arc<dyn UnitOfWorkEventPublisher>, BoxError> {
        Ok(self.publisher.clone())
    }
}

#[async_trait]
impl ScopeFactory for SharedPublisherScopeFactory {
    async fn create_scope(&self) -> Result<Box<dyn ResolutionScope>, BoxError> {
        Ok(Box::new(SharedPublisherScope {
            publisher: self.publisher.clone(),
        }))
    }
}

/// What a root unit releases when it is disposed: the ambient value it
/// displaced and its resolution scope.
pub(crate) struct ScopeLifetime {
    slot: Arc<AmbientSlot>,
    previous: Option<UnitOfWork>,
    scope: Box<dyn ResolutionScope>,
}

impl ScopeLifetime {
    pub(crate) fn release(self) {
        let replaced = self.slot.replace(self.previous);
        drop(replaced);
        self.scope.dispose();
    }
}

struct ManagerInner {
    scope_factory: Arc<dyn ScopeFactory>,
    defaults: UnitOfWorkDefaultOptions,
    tree: Arc<UnitOfWorkTree>,
}

/// Begins, joins, reserves and claims units of work on the ambient flow.
#[derive(Clone)]
pub struct UnitOfWorkManager {
    inner: Arc<ManagerInner>,
}

impl UnitOfWorkManager {
    pub fn new(scope_factory: Arc<dyn ScopeFactory>, defaults: UnitOfWorkDefaultOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                scope_factory,
                defaults,
                tree: Arc::new(UnitOfWorkTree::new()),
            }),
        }
    }

    /// Manager whose units all publish through `publisher`.
    pub fn with_publisher(
        publisher: Arc<dyn UnitOfWorkEventPublisher>,
        defaults: UnitOfWorkDefaultOptions,
    ) -> Self {
        Self::new(Arc::new(SharedPublisherScopeFactory::new(publisher)), defaults)
    }

    pub fn defaults(&self) -> &UnitOfWorkDefaultOptions {
        &self.inner.defaults
    }

    /// Arena of the units this manager created that are still alive.
    pub fn tree(&self) -> &Arc<UnitOfWorkTree> {
        &self.inner.tree
    }

    /// The unit new work would join right now, if any.
    pub fn current(&self) -> Option<UnitOfWork> {
        AmbientUnitOfWork::get_current_by_checking()
    }

    /// Joins the current unit, or starts a new one when there is none or
    /// `requires_new` is set.
    #[tracing::instrument(skip(self, options))]
    pub async fn begin(
        &self,
        options: UnitOfWorkOptions,
        requires_new: bool,
    ) -> Result<UnitOfWorkHandle> {
        let slot = AmbientUnitOfWork::slot()?;
        let gate = slot.gate();
        let _guard = gate.lock().await;

        if !requires_new {
            if let Some(current) = slot.current_by_checking() {
                debug!(uow_id = %current.id(), "Joining current unit of work");
                return Ok(UnitOfWorkHandle::Child(ChildUnitOfWork::new(current)));
            }
        }

        let handle = UnitOfWorkHandle::Root(self.create_unit(&slot).await?);
        handle.initialize(options)?;
        Ok(handle)
    }

    /// Starts a reserved, uninitialized unit under `reservation_name`. Joins the
    /// ambient unit instead when it is already reserved under that name.
    #[tracing::instrument(skip(self))]
    pub async fn reserve(
        &self,
        reservation_name: &str,
        requires_new: bool,
    ) -> Result<UnitOfWorkHandle> {
        require_non_blank(reservation_name, "reservation name")?;
        let slot = AmbientUnitOfWork::slot()?;
        let gate = slot.gate();
        let _guard = gate.lock().await;

        if !requires_new {
            if let Some(ambient) = slot.get() {
                if ambient.is_reserved_for(reservation_name) {
                    debug!(uow_id = %ambient.id(), "Joining reserved unit of work");
                    return Ok(UnitOfWorkHandle::Child(ChildUnitOfWork::new(ambient)));
                }
            }
        }

        let handle = UnitOfWorkHandle::Root(self.create_unit(&slot).await?);
        handle.reserve(reservation_name)?;
        Ok(handle)
    }

    /// Claims the nearest reservation named `reservation_name`.
    pub async fn begin_reserved(
        &self,
        reservation_name: &str,
        options: UnitOfWorkOptions,
    ) -> Result<()> {
        if !self.try_begin_reserved(reservation_name, options).await? {
            return Err(UnitOfWorkError::ReservationNotFound(
                reservation_name.to_string(),
            ));
        }
        Ok(())
    }

    /// Claims the nearest reservation named `reservation_name`. Returns `false`
    /// and changes nothing when no such reservation is live.
    #[tracing::instrument(skip(self, options))]
    pub async fn try_begin_reserved(
        &self,
        reservation_name: &str,
        options: UnitOfWorkOptions,
    ) -> Result<bool> {
        require_non_blank(reservation_name, "reservation name")?;
        // No ambient flow means no reservation to claim.
        let Ok(slot) = AmbientUnitOfWork::slot() else {
            debug!("No ambient scope");
            return Ok(false);
        };
        let gate = slot.gate();
        let _guard = gate.lock().await;

        let Some(start) = slot.get() else {
            return Ok(false);
        };
        let Some(reserved) = start.tree().find_reservation(&start, reservation_name) else {
            debug!("No matching reservation");
            return Ok(false);
        };

        reserved.initialize(options)?;
        info!(uow_id = %reserved.id(), "Claimed reserved unit of work");
        Ok(true)
    }

    /// Runs `body` inside a unit of work: completes it when the body succeeds,
    /// rolls it back when the body fails and this call owns the unit.
    pub async fn run<T, E, F, Fut>(
        &self,
        options: UnitOfWorkOptions,
        requires_new: bool,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<UnitOfWorkError>,
    {
        let handle = self.begin(options, requires_new).await?;
        match body(handle.physical().clone()).await {
            Ok(value) => {
                handle.complete(cancel).await?;
                Ok(value)
            }
            Err(error) => {
                if handle.is_root() {
                    handle.physical().rollback(cancel).await;
                }
                Err(error)
            }
        }
    }

    async fn create_unit(&self, slot: &Arc<AmbientSlot>) -> Result<UnitOfWork> {
        let scope = self
            .inner
            .scope_factory
            .create_scope()
            .await
            .map_err(|e| UnitOfWorkError::Scope(SharedError::from(e)))?;

        let publisher = match scope.event_publisher() {
            Ok(publisher) => publisher,
            Err(e) => {
                warn!(error = %e, "Could not resolve event publisher");
                scope.dispose();
                return Err(UnitOfWorkError::Scope(SharedError::from(e)));
            }
        };

        let previous = slot.get();
        let unit = UnitOfWork::attached(
            self.inner.tree.clone(),
            previous.as_ref().map(UnitOfWork::id),
            publisher,
            self.inner.defaults.clone(),
        );
        unit.set_lifetime(ScopeLifetime {
            slot: slot.clone(),
            previous,
            scope,
        });
        let displaced = slot.replace(Some(unit.clone()));
        drop(displaced);

        info!(uow_id = %unit.id(), "Began unit of work");
        Ok(unit)
    }
}

/// A unit of work returned by the manager.
///
/// A `Root` handle owns the physical unit and disposes it when dropped. A
/// `Child` handle only borrows the current unit.
#[derive(Debug)]
pub enum UnitOfWorkHandle {
    Root(UnitOfWork),
    Child(ChildUnitOfWork),
}

impl UnitOfWorkHandle {
    pub fn is_child(&self) -> bool {
        matches!(self, Self::Child(_))
    }
}

#[async_trait]
impl ActiveUnitOfWork for UnitOfWorkHandle {
    fn physical(&self) -> &UnitOfWork {
        match self {
            Self::Root(unit) => unit,
            Self::Child(child) => child.parent(),
        }
    }

    fn is_root(&self) -> bool {
        matches!(self, Self::Root(_))
    }

    async fn complete(&self, cancel: &CancellationToken) -> Result<()> {
        match self {
            Self::Root(unit) => unit.complete(cancel).await,
            Self::Child(child) => child.complete(cancel).await,
        }
    }

    fn dispose(&self) {
        match self {
            Self::Root(unit) => unit.dispose(),
            Self::Child(child) => child.dispose(),
        }
    }
}

impl Drop for UnitOfWorkHandle {
    fn drop(&mut self) {
        if let Self::Root(unit) = self {
            unit.dispose();
        }
    }
}
