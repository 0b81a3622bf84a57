//! # Unit-of-Work Errors
//!
//! This module defines the single error type used throughout the crate.
//!
//! Errors fall into four groups:
//!
//! - **Usage faults**: re-initializing a unit, completing twice, registering a
//!   duplicate resource key, blank reservation names. These are programmer
//!   errors and are never retried.
//! - **Reservation misses**: [`UnitOfWorkError::ReservationNotFound`].
//! - **Completion failures**: anything a collaborator reports while saving,
//!   publishing or committing. The first one is recorded on the unit and
//!   handed to `on_failed` handlers when the unit is disposed.
//! - **Environment**: no ambient slot, bad configuration, scope creation.
//!
//! Collaborator errors arrive as [`BoxError`] and are stored as [`SharedError`]
//! so the recorded completion error can be cloned into failure notifications.

use crate::unit_of_work::UnitOfWorkId;
use std::error::Error as StdError;
use std::sync::Arc;

/// Error type returned by collaborators (database, transaction and publisher adapters).
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A collaborator error that can be cloned between the caller and failure handlers.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T, E = UnitOfWorkError> = std::result::Result<T, E>;

/// Errors produced by the unit-of-work core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("Unit of work {0} is already initialized")]
    AlreadyInitialized(UnitOfWorkId),
    #[error("Unit of work {0} is already reserved")]
    AlreadyReserved(UnitOfWorkId),
    #[error("Completion has already been requested for unit of work {0}")]
    AlreadyCompleting(UnitOfWorkId),
    #[error("Unit of work {0} is disposed")]
    Disposed(UnitOfWorkId),
    #[error("Database api already registered for key: {0}")]
    DuplicateDatabaseApi(String),
    #[error("Transaction api already registered for key: {0}")]
    DuplicateTransactionApi(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Could not find a reserved unit of work named: {0}")]
    ReservationNotFound(String),
    #[error("No ambient unit-of-work scope is active on this task")]
    NoAmbientScope,
    #[error("Invalid value for {key}: {value}")]
    InvalidConfiguration { key: &'static str, value: String },
    #[error("Could not create a resolution scope: {0}")]
    Scope(SharedError),
    #[error("Database api `{key}` failed to save changes: {source}")]
    SaveChanges { key: String, source: SharedError },
    #[error("Transaction api `{key}` failed to commit: {source}")]
    Commit { key: String, source: SharedError },
    #[error("Event publisher failed: {0}")]
    Publish(SharedError),
    #[error("Completed handler failed: {0}")]
    CompletedHandler(SharedError),
    #[error("Operation cancelled")]
    Cancelled,
}

impl UnitOfWorkError {
    /// Returns `true` for programmer errors that should never be retried.
    pub fn is_usage_fault(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitialized(_)
                | Self::AlreadyReserved(_)
                | Self::AlreadyCompleting(_)
                | Self::Disposed(_)
                | Self::DuplicateDatabaseApi(_)
                | Self::DuplicateTransactionApi(_)
                | Self::InvalidArgument(_)
        )
    }
}

/// Rejects empty or whitespace-only names and keys.
pub(crate) fn require_non_blank(value: &str, what: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(UnitOfWorkError::InvalidArgument(what));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_errors_are_shared_not_copied() {
        let source: SharedError = Arc::from(BoxError::from("disk full"));
        let error = UnitOfWorkError::Commit {
            key: "sql".to_string(),
            source: source.clone(),
        };
        let cloned = error.clone();

        assert_eq!(
            cloned.to_string(),
            "Transaction api `sql` failed to commit: disk full"
        );
        assert!(std::error::Error::source(&error).is_some());
        assert_eq!(Arc::strong_count(&source), 3);
    }

    #[test]
    fn usage_faults_are_classified() {
        assert!(UnitOfWorkError::InvalidArgument("name").is_usage_fault());
        assert!(UnitOfWorkError::DuplicateDatabaseApi("sql".into()).is_usage_fault());
        assert!(!UnitOfWorkError::ReservationNotFound("checkout".into()).is_usage_fault());
        assert!(!UnitOfWorkError::Cancelled.is_usage_fault());
    }

    #[test]
    fn blank_values_are_rejected() {
        assert!(require_non_blank("checkout", "name").is_ok());
        assert!(matches!(
            require_non_blank("   ", "name"),
            Err(UnitOfWorkError::InvalidArgument("name"))
        ));
    }
}
