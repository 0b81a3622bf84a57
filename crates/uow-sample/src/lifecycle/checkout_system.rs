use crate::orders::{InventoryService, OrderPlaced, OrderService, Product, StockChanged, PRODUCTS};
use crate::publisher::LogEventPublisher;
use crate::store::{session_for, InMemoryDatabase};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use unit_of_work::{
    AmbientUnitOfWork, BoxError, EventRecord, UnitOfWork, UnitOfWorkDefaultOptions,
    UnitOfWorkError, UnitOfWorkManager,
};

pub const AUDIT: &str = "order_audit";
pub const LOW_STOCK_THRESHOLD: u32 = 5;

/// Store, publisher, manager and services, wired together.
pub struct CheckoutSystem {
    pub manager: UnitOfWorkManager,
    pub database: InMemoryDatabase,
    pub publisher: Arc<LogEventPublisher>,
    pub inventory: InventoryService,
    pub orders: OrderService,
}

impl CheckoutSystem {
    pub fn new(defaults: UnitOfWorkDefaultOptions) -> Self {
        let database = InMemoryDatabase::new();
        let publisher = Arc::new(LogEventPublisher::new());
        subscribe_handlers(&publisher, &database);

        let manager = UnitOfWorkManager::with_publisher(publisher.clone(), defaults);
        let inventory = InventoryService::new(manager.clone(), database.clone());
        let orders = OrderService::new(manager.clone(), database.clone(), inventory.clone());

        info!(defaults = ?manager.defaults(), "Checkout system ready");
        Self {
            manager,
            database,
            publisher,
            inventory,
            orders,
        }
    }

    /// Writes a product straight to the store.
    pub fn seed_product(&self, product: &Product) -> Result<(), serde_json::Error> {
        self.database.insert(PRODUCTS, &product.sku, product)
    }

    pub fn stock_of(&self, sku: &str) -> Option<u32> {
        self.database
            .get_as::<Product>(PRODUCTS, sku)
            .ok()
            .flatten()
            .map(|p| p.stock)
    }

    pub fn shutdown(self) {
        info!(
            products = self.database.count(PRODUCTS),
            audit_rows = self.database.count(AUDIT),
            outbox = self.publisher.outbox().len(),
            "Checkout system shut down"
        );
    }
}

fn current_unit() -> Result<UnitOfWork, BoxError> {
    AmbientUnitOfWork::get_current_by_checking()
        .ok_or_else(|| BoxError::from(UnitOfWorkError::NoAmbientScope))
}

fn subscribe_handlers(publisher: &LogEventPublisher, database: &InMemoryDatabase) {
    let audit_db = database.clone();
    publisher.subscribe("OrderPlaced", move |event| {
        let placed: OrderPlaced = event.decode()?;
        let uow = current_unit()?;

        session_for(&uow, &audit_db)?.put(
            AUDIT,
            &placed.order_id,
            &json!({ "sku": placed.sku, "quantity": placed.quantity }),
        )?;
        uow.add_distributed_event(
            EventRecord::from_payload("checkout.order_placed", &placed)?.with_outbox(true),
        );
        Ok(())
    });

    publisher.subscribe("StockChanged", |event| {
        let changed: StockChanged = event.decode()?;
        if changed.stock < LOW_STOCK_THRESHOLD {
            current_unit()?.add_distributed_event(EventRecord::from_payload(
                "inventory.low_stock",
                &changed,
            )?);
        }
        Ok(())
    });
}
