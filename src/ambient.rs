//! # Ambient Unit of Work
//!
//! The "current" unit of work travels with the logical flow of control: a Tokio
//! task-local slot, entered with [`AmbientUnitOfWork::scope`].
//!
//! ## Semantics
//!
//! - A scope starts with whatever unit the enclosing scope holds at the moment
//!   the scope is created. Spawned work wrapped in its own scope therefore sees
//!   the parent's unit, but changes it makes never leak back to the parent.
//! - Two independent top-level scopes never observe each other's units.
//! - Each slot owns a gate that serializes `begin`/`reserve` for that flow.
//!
//! ## Concurrent Branches
//!
//! A slot belongs to one flow. Futures polled concurrently inside the same
//! scope (`tokio::join!`, `select!`, `FuturesUnordered`) share that slot, so a
//! unit one branch begins with `requires_new` becomes the ambient unit of its
//! siblings too. Fork each branch with its own scope:
//!
//! ```ignore
//! let (a, b) = tokio::join!(
//!     AmbientUnitOfWork::scope(import_orders(&manager)),
//!     AmbientUnitOfWork::scope(import_invoices(&manager)),
//! );
//! ```
//!
//! Each branch starts from the unit current at the fork and restores nothing
//! into the parent when it ends.
//!
//! ```ignore
//! AmbientUnitOfWork::scope(async {
//!     let uow = manager.begin(UnitOfWorkOptions::transactional(), false).await?;
//!     // ...
//! })
//! .await
//! ```

use crate::error::{Result, UnitOfWorkError};
use crate::unit_of_work::UnitOfWork;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

tokio::task_local! {
    static AMBIENT_SLOT: Arc<AmbientSlot>;
}

pub(crate) struct AmbientSlot {
    current: Mutex<Option<UnitOfWork>>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl AmbientSlot {
    fn new(initial: Option<UnitOfWork>) -> Self {
        Self {
            current: Mutex::new(initial),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The raw ambient unit, whatever its state.
    pub(crate) fn get(&self) -> Option<UnitOfWork> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stores `unit` and hands back the previous value.
    pub(crate) fn replace(&self, unit: Option<UnitOfWork>) -> Option<UnitOfWork> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, unit)
    }

    /// Nearest unit, from the ambient one outward, that new work may join.
    pub(crate) fn current_by_checking(&self) -> Option<UnitOfWork> {
        let start = self.get()?;
        start.tree().find_current(&start)
    }

    pub(crate) fn gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.gate.clone()
    }
}

/// Accessors for the ambient unit of work of the running task.
pub struct AmbientUnitOfWork;

impl AmbientUnitOfWork {
    /// Runs `future` in a fresh ambient slot seeded with the caller's current unit.
    pub fn scope<F>(future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let slot = Arc::new(AmbientSlot::new(Self::get()));
        AMBIENT_SLOT.scope(slot, future)
    }

    /// Synchronous counterpart of [`AmbientUnitOfWork::scope`].
    pub fn sync_scope<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let slot = Arc::new(AmbientSlot::new(Self::get()));
        AMBIENT_SLOT.sync_scope(slot, f)
    }

    pub fn is_in_scope() -> bool {
        AMBIENT_SLOT.try_with(|_| ()).is_ok()
    }

    /// The raw ambient unit, including reserved, completed or disposed ones.
    pub fn get() -> Option<UnitOfWork> {
        AMBIENT_SLOT.try_with(|slot| slot.get()).ok().flatten()
    }

    /// Replaces the ambient unit of the current scope.
    pub fn set(unit: Option<UnitOfWork>) -> Result<()> {
        let previous = Self::slot()?.replace(unit);
        drop(previous);
        Ok(())
    }

    /// Walks outward from the ambient unit and returns the first unit that is
    /// not reserved, disposed or completed.
    pub fn get_current_by_checking() -> Option<UnitOfWork> {
        AMBIENT_SLOT
            .try_with(|slot| slot.current_by_checking())
            .ok()
            .flatten()
    }

    pub(crate) fn slot() -> Result<Arc<AmbientSlot>> {
        AMBIENT_SLOT
            .try_with(Arc::clone)
            .map_err(|_| UnitOfWorkError::NoAmbientScope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{UnitOfWorkDefaultOptions, UnitOfWorkOptions};
    use crate::publisher::NullEventPublisher;
    use crate::tree::UnitOfWorkTree;

    fn detached() -> UnitOfWork {
        UnitOfWork::new(Arc::new(NullEventPublisher), UnitOfWorkDefaultOptions::default())
    }

    #[tokio::test]
    async fn set_outside_scope_is_rejected() {
        assert!(!AmbientUnitOfWork::is_in_scope());
        assert!(AmbientUnitOfWork::get().is_none());
        assert!(matches!(
            AmbientUnitOfWork::set(Some(detached())),
            Err(UnitOfWorkError::NoAmbientScope)
        ));
    }

    #[tokio::test]
    async fn nested_scope_inherits_but_does_not_leak() {
        AmbientUnitOfWork::scope(async {
            let outer = detached();
            AmbientUnitOfWork::set(Some(outer.clone())).unwrap();

            AmbientUnitOfWork::scope(async {
                assert_eq!(AmbientUnitOfWork::get().map(|u| u.id()), Some(outer.id()));
                AmbientUnitOfWork::set(Some(detached())).unwrap();
                assert_ne!(AmbientUnitOfWork::get().map(|u| u.id()), Some(outer.id()));
            })
            .await;

            assert_eq!(AmbientUnitOfWork::get().map(|u| u.id()), Some(outer.id()));
        })
        .await;
    }

    #[tokio::test]
    async fn spawned_scopes_are_isolated() {
        let first = tokio::spawn(AmbientUnitOfWork::scope(async {
            let unit = detached();
            AmbientUnitOfWork::set(Some(unit.clone())).unwrap();
            tokio::task::yield_now().await;
            AmbientUnitOfWork::get().map(|u| u.id()) == Some(unit.id())
        }));
        let second = tokio::spawn(AmbientUnitOfWork::scope(async {
            tokio::task::yield_now().await;
            AmbientUnitOfWork::get().is_none()
        }));

        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
    }

    #[tokio::test]
    async fn checking_walk_skips_reserved_units() {
        let tree = Arc::new(UnitOfWorkTree::new());
        let publisher = Arc::new(NullEventPublisher);
        let root = UnitOfWork::attached(tree.clone(), None, publisher.clone(), Default::default());
        root.initialize(UnitOfWorkOptions::default()).unwrap();
        let reserved = UnitOfWork::attached(tree, Some(root.id()), publisher, Default::default());
        reserved.reserve("request").unwrap();

        AmbientUnitOfWork::scope(async {
            AmbientUnitOfWork::set(Some(reserved.clone())).unwrap();
            assert_eq!(AmbientUnitOfWork::get().map(|u| u.id()), Some(reserved.id()));
            assert_eq!(
                AmbientUnitOfWork::get_current_by_checking().map(|u| u.id()),
                Some(root.id())
            );
        })
        .await;
    }

    #[test]
    fn sync_scope_provides_a_slot() {
        AmbientUnitOfWork::sync_scope(|| {
            assert!(AmbientUnitOfWork::is_in_scope());
            AmbientUnitOfWork::set(None).unwrap();
        });
    }
}
