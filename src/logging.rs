//! # Observability
//!
//! The core logs through the `tracing` macros and never installs a subscriber
//! itself. Binaries call [`setup_tracing`] once at startup.
//!
//! ## What Gets Traced
//!
//! - **Lifecycle**: begin, join, reserve, claim, complete and dispose, each with
//!   a `uow_id` field (`uow_7`).
//! - **Flush rounds**: batch sizes per round at `debug`.
//! - **Failures**: completion errors, rollback and dispose failures at `warn`,
//!   with the resource `key` that failed.
//!
//! `complete` and `rollback` open a span carrying `uow_id`, so collaborator logs
//! emitted while flushing are attributed to their unit.
//!
//! ```bash
//! RUST_LOG=info cargo run -p uow-sample
//! RUST_LOG=unit_of_work=debug cargo run -p uow-sample
//! ```
//!
//! ```text
//! INFO begin{requires_new=false}: Began unit of work uow_id=uow_1
//! DEBUG complete{uow_id=uow_1}: Publishing local events round=1 count=2
//! INFO complete{uow_id=uow_1}: Completed unit of work
//! INFO Disposed unit of work uow_id=uow_1 failed=false
//! ```

use tracing_subscriber::EnvFilter;

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
