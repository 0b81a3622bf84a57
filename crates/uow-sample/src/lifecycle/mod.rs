//! # System Wiring
//!
//! [`CheckoutSystem`] builds the store, the event publisher, the unit-of-work
//! manager and the services, and subscribes the local event handlers.
//!
//! The handlers run during completion of the unit that raised the event:
//!
//! - `OrderPlaced` writes an audit row through the same session and raises the
//!   distributed `checkout.order_placed` event (outbox enabled).
//! - `StockChanged` raises `inventory.low_stock` when stock drops below
//!   [`LOW_STOCK_THRESHOLD`].
//!
//! Both writes happen before the transaction commits, so they are atomic with
//! the order itself.

mod checkout_system;

pub use checkout_system::*;
