//! # Checkout Sample
//!
//! A small checkout flow built on the `unit_of_work` crate, used by the demo
//! binary and the integration tests.
//!
//! - [`store`]: an in-memory document store exposed as database and transaction apis.
//! - [`publisher`]: local event dispatch and a distributed-event outbox.
//! - [`orders`]: inventory and order services that each begin a unit of work.
//! - [`lifecycle`]: wiring of the above into a [`lifecycle::CheckoutSystem`].

pub mod lifecycle;
pub mod orders;
pub mod publisher;
pub mod store;
