//! # Unit-of-Work Tree
//!
//! Units refer to their enclosing ("outer") unit by [`UnitOfWorkId`], never by an
//! owning pointer. The [`UnitOfWorkTree`] is the arena that resolves those ids: it
//! holds a weak entry per live unit, and a unit removes itself when its last
//! handle is dropped.
//!
//! Searching outward is a pure function over node snapshots ([`walk_outward`]),
//! so the "skip reserved, disposed and completed units" rule can be tested
//! without building real units.

use crate::unit_of_work::{UnitOfWork, UnitOfWorkId, WeakUnitOfWork};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Snapshot of the parts of a unit the outward walks look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub outer: Option<UnitOfWorkId>,
    pub is_reserved: bool,
    pub reservation_name: Option<String>,
    pub is_disposed: bool,
    pub is_completed: bool,
}

impl NodeStatus {
    /// A unit new work may join: not a reservation placeholder and not finished.
    pub fn is_available(&self) -> bool {
        !self.is_reserved && !self.is_disposed && !self.is_completed
    }

    /// A live reservation parked under `name`.
    pub fn is_claimable_for(&self, name: &str) -> bool {
        self.is_reserved && !self.is_disposed && self.reservation_name.as_deref() == Some(name)
    }
}

/// Follows `outer` links from `start` and returns the first node accepted by `accept`.
///
/// The walk stops at the first id `lookup` cannot resolve.
pub fn walk_outward<L, P>(start: Option<UnitOfWorkId>, lookup: L, mut accept: P) -> Option<UnitOfWorkId>
where
    L: Fn(UnitOfWorkId) -> Option<NodeStatus>,
    P: FnMut(&NodeStatus) -> bool,
{
    let mut cursor = start;
    while let Some(id) = cursor {
        let status = lookup(id)?;
        if accept(&status) {
            return Some(id);
        }
        cursor = status.outer;
    }
    None
}

/// Arena of live units, indexed by id.
#[derive(Default)]
pub struct UnitOfWorkTree {
    nodes: Mutex<HashMap<UnitOfWorkId, WeakUnitOfWork>>,
}

impl UnitOfWorkTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<UnitOfWorkId, WeakUnitOfWork>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, unit: &UnitOfWork) {
        self.nodes().insert(unit.id(), unit.downgrade());
    }

    pub(crate) fn unregister(&self, id: UnitOfWorkId) {
        self.nodes().remove(&id);
    }

    pub fn get(&self, id: UnitOfWorkId) -> Option<UnitOfWork> {
        let weak = self.nodes().get(&id).cloned()?;
        weak.upgrade()
    }

    /// Number of live units in the arena.
    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }

    /// Nearest unit, starting at `start`, that new work may join.
    pub fn find_current(&self, start: &UnitOfWork) -> Option<UnitOfWork> {
        self.find_from(start, NodeStatus::is_available)
    }

    /// Nearest live reservation named `name`, starting at `start`.
    pub fn find_reservation(&self, start: &UnitOfWork, name: &str) -> Option<UnitOfWork> {
        self.find_from(start, |status| status.is_claimable_for(name))
    }

    fn find_from<P>(&self, start: &UnitOfWork, accept: P) -> Option<UnitOfWork>
    where
        P: FnMut(&NodeStatus) -> bool,
    {
        let start_id = start.id();
        let found = walk_outward(
            Some(start_id),
            |id| {
                if id == start_id {
                    Some(start.status())
                } else {
                    self.get(id).map(|unit| unit.status())
                }
            },
            accept,
        )?;

        if found == start_id {
            Some(start.clone())
        } else {
            self.get(found)
        }
    }
}
