//! # Checkout Services
//!
//! Two services that each begin a unit of work:
//!
//! - [`InventoryService::reserve_stock`] can run on its own, or inside a caller's
//!   unit. When called from [`OrderService::place_order`] its `begin` joins the
//!   order's unit, so its stock change commits or rolls back with the order.
//! - [`OrderService::place_order`] wraps the whole checkout in
//!   [`UnitOfWorkManager::run`].

use crate::store::{session_for, InMemoryDatabase};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use unit_of_work::{
    ActiveUnitOfWork, EventRecord, UnitOfWorkError, UnitOfWorkManager, UnitOfWorkOptions,
};

pub const PRODUCTS: &str = "products";
pub const ORDERS: &str = "orders";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub name: String,
    pub price_cents: u64,
    pub stock: u32,
}

impl Product {
    pub fn new(sku: &str, name: &str, price_cents: u64, stock: u32) -> Self {
        Self {
            sku: sku.to_string(),
            name: name.to_string(),
            price_cents,
            stock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub sku: String,
    pub quantity: u32,
    pub total_cents: u64,
}

/// Local event raised when an order row is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub total_cents: u64,
}

/// Local event carrying the latest stock level of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockChanged {
    pub sku: String,
    pub stock: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("Product not found: {0}")]
    UnknownProduct(String),
    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u32,
    },
    #[error("Quantity must be greater than zero")]
    InvalidQuantity,
    #[error("Order total overflows for {sku}: {quantity} x {price_cents}")]
    TotalOverflow {
        sku: String,
        quantity: u32,
        price_cents: u64,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
}

#[derive(Clone)]
pub struct InventoryService {
    manager: UnitOfWorkManager,
    database: InMemoryDatabase,
}

impl InventoryService {
    pub fn new(manager: UnitOfWorkManager, database: InMemoryDatabase) -> Self {
        Self { manager, database }
    }

    /// Decrements the stock of `sku` by `quantity`.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn reserve_stock(
        &self,
        sku: &str,
        quantity: u32,
        cancel: &CancellationToken,
    ) -> Result<Product, CheckoutError> {
        let uow = self
            .manager
            .begin(UnitOfWorkOptions::transactional(), false)
            .await?;
        let session = session_for(uow.physical(), &self.database)?;

        let mut product: Product = session
            .get_as(PRODUCTS, sku)?
            .ok_or_else(|| CheckoutError::UnknownProduct(sku.to_string()))?;
        if product.stock < quantity {
            return Err(CheckoutError::InsufficientStock {
                sku: sku.to_string(),
                requested: quantity,
                available: product.stock,
            });
        }

        product.stock -= quantity;
        session.put(PRODUCTS, sku, &product)?;

        // One StockChanged per product per unit: the latest level wins.
        let changed = EventRecord::from_payload(
            "StockChanged",
            &StockChanged {
                sku: sku.to_string(),
                stock: product.stock,
            },
        )?;
        uow.add_or_replace_local_event(changed, |e| {
            e.event_type() == "StockChanged" && e.event_data()["sku"] == sku
        });

        debug!(joined = !uow.is_root(), stock = product.stock, "Stock reserved");
        uow.complete(cancel).await?;
        Ok(product)
    }
}

pub struct OrderService {
    manager: UnitOfWorkManager,
    database: InMemoryDatabase,
    inventory: InventoryService,
    next_id: AtomicU64,
}

impl OrderService {
    pub fn new(
        manager: UnitOfWorkManager,
        database: InMemoryDatabase,
        inventory: InventoryService,
    ) -> Self {
        Self {
            manager,
            database,
            inventory,
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserves stock and writes the order in one unit of work.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn place_order(
        &self,
        sku: &str,
        quantity: u32,
        cancel: &CancellationToken,
    ) -> Result<Order, CheckoutError> {
        if quantity == 0 {
            return Err(CheckoutError::InvalidQuantity);
        }

        let order = self
            .manager
            .run(UnitOfWorkOptions::transactional(), false, cancel, |uow| async move {
                let product = self.inventory.reserve_stock(sku, quantity, cancel).await?;
                let total_cents = product
                    .price_cents
                    .checked_mul(u64::from(quantity))
                    .ok_or_else(|| CheckoutError::TotalOverflow {
                        sku: sku.to_string(),
                        quantity,
                        price_cents: product.price_cents,
                    })?;

                let order = Order {
                    id: format!("order_{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
                    sku: sku.to_string(),
                    quantity,
                    total_cents,
                };
                session_for(&uow, &self.database)?.put(ORDERS, &order.id, &order)?;

                uow.add_local_event(EventRecord::from_payload(
                    "OrderPlaced",
                    &OrderPlaced {
                        order_id: order.id.clone(),
                        sku: order.sku.clone(),
                        quantity,
                        total_cents: order.total_cents,
                    },
                )?);
                Ok::<_, CheckoutError>(order)
            })
            .await?;

        info!(order_id = %order.id, total_cents = order.total_cents, "Order placed");
        Ok(order)
    }
}
