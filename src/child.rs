//! # Child Units
//!
//! A [`ChildUnitOfWork`] is what a nested `begin` returns when it joins the
//! current unit instead of starting a new one. It forwards every operation to
//! its parent, except that `complete` and `dispose` do nothing: only the code
//! that started the physical unit decides when it commits and ends.

use crate::error::Result;
use crate::unit_of_work::{ActiveUnitOfWork, UnitOfWork};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A non-owning view of a physical unit of work.
#[derive(Debug, Clone)]
pub struct ChildUnitOfWork {
    parent: UnitOfWork,
}

impl ChildUnitOfWork {
    pub fn new(parent: UnitOfWork) -> Self {
        Self { parent }
    }

    pub fn parent(&self) -> &UnitOfWork {
        &self.parent
    }
}

#[async_trait]
impl ActiveUnitOfWork for ChildUnitOfWork {
    fn physical(&self) -> &UnitOfWork {
        &self.parent
    }

    fn is_root(&self) -> bool {
        false
    }

    async fn complete(&self, _cancel: &CancellationToken) -> Result<()> {
        debug!(uow_id = %self.parent.id(), "Child unit of work completion deferred to its parent");
        Ok(())
    }

    fn dispose(&self) {}
}
