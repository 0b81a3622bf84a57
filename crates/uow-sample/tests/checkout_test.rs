use tokio_util::sync::CancellationToken;
use unit_of_work::{ActiveUnitOfWork, AmbientUnitOfWork, UnitOfWorkDefaultOptions, UnitOfWorkOptions};
use uow_sample::lifecycle::{CheckoutSystem, AUDIT};
use uow_sample::orders::{CheckoutError, Order, Product, StockChanged, ORDERS};

fn system_with_stock(stock: u32) -> CheckoutSystem {
    let system = CheckoutSystem::new(UnitOfWorkDefaultOptions::default());
    system
        .seed_product(&Product::new("widget", "Super Widget", 2550, stock))
        .expect("Failed to seed product");
    system
}

/// Stock, order, audit row and integration events commit together.
#[tokio::test]
async fn test_place_order_commits_everything_at_once() {
    let system = system_with_stock(10);
    let cancel = CancellationToken::new();

    let order = AmbientUnitOfWork::scope(system.orders.place_order("widget", 6, &cancel))
        .await
        .expect("Failed to place order");
    assert_eq!(order.total_cents, 6 * 2550);

    assert_eq!(system.stock_of("widget"), Some(4));
    let stored: Order = system
        .database
        .get_as(ORDERS, &order.id)
        .expect("Failed to decode order")
        .expect("Order not committed");
    assert_eq!(stored, order);

    // Written by the OrderPlaced handler during the flush
    assert!(system.database.get(AUDIT, &order.id).is_some());

    let outbox: Vec<_> = system
        .publisher
        .outbox()
        .iter()
        .map(|e| e.event_type().to_string())
        .collect();
    assert_eq!(outbox, ["inventory.low_stock", "checkout.order_placed"]);
    assert!(system.publisher.outbox()[1].use_outbox());
}

/// A rejected order leaves stock, orders and the outbox untouched.
#[tokio::test]
async fn test_rejected_order_rolls_back_the_stock_change() {
    let system = system_with_stock(3);
    let cancel = CancellationToken::new();

    let result = AmbientUnitOfWork::scope(system.orders.place_order("widget", 5, &cancel)).await;
    assert!(matches!(
        result,
        Err(CheckoutError::InsufficientStock {
            requested: 5,
            available: 3,
            ..
        })
    ));

    assert_eq!(system.stock_of("widget"), Some(3));
    assert_eq!(system.database.count(ORDERS), 0);
    assert!(system.publisher.outbox().is_empty());
}

#[tokio::test]
async fn test_unknown_product_and_zero_quantity_are_rejected() {
    let system = system_with_stock(3);
    let cancel = CancellationToken::new();

    AmbientUnitOfWork::scope(async {
        let unknown = system.orders.place_order("gadget", 1, &cancel).await;
        assert!(matches!(unknown, Err(CheckoutError::UnknownProduct(sku)) if sku == "gadget"));

        let zero = system.orders.place_order("widget", 0, &cancel).await;
        assert!(matches!(zero, Err(CheckoutError::InvalidQuantity)));
    })
    .await;

    assert!(system.manager.tree().is_empty());
}

/// Called on its own, the inventory service owns and commits its unit.
#[tokio::test]
async fn test_inventory_service_commits_standalone() {
    let system = system_with_stock(10);
    let cancel = CancellationToken::new();

    let product = AmbientUnitOfWork::scope(system.inventory.reserve_stock("widget", 2, &cancel))
        .await
        .expect("Failed to reserve stock");
    assert_eq!(product.stock, 8);
    assert_eq!(system.stock_of("widget"), Some(8));
    assert!(system.publisher.outbox().is_empty());
}

/// Repeated stock changes in one unit publish only the latest level.
#[tokio::test]
async fn test_stock_changes_collapse_within_one_unit() {
    let system = system_with_stock(4);
    let cancel = CancellationToken::new();

    AmbientUnitOfWork::scope(async {
        let uow = system
            .manager
            .begin(UnitOfWorkOptions::transactional(), false)
            .await
            .expect("Failed to begin unit");
        system
            .inventory
            .reserve_stock("widget", 1, &cancel)
            .await
            .expect("First reservation failed");
        system
            .inventory
            .reserve_stock("widget", 1, &cancel)
            .await
            .expect("Second reservation failed");

        // Nothing is visible until the outer unit completes
        assert_eq!(system.stock_of("widget"), Some(4));
        uow.complete(&cancel).await.expect("Completion failed");
    })
    .await;

    assert_eq!(system.stock_of("widget"), Some(2));
    let outbox = system.publisher.outbox();
    assert_eq!(outbox.len(), 1);
    let changed: StockChanged = outbox[0].decode().expect("Failed to decode event");
    assert_eq!(changed.stock, 2);
}

/// An order whose total does not fit in a u64 is rejected and rolled back.
#[tokio::test]
async fn test_overflowing_total_is_rejected() {
    let system = CheckoutSystem::new(UnitOfWorkDefaultOptions::default());
    system
        .seed_product(&Product::new("yacht", "Gold Yacht", u64::MAX, 10))
        .expect("Failed to seed product");
    let cancel = CancellationToken::new();

    let result = AmbientUnitOfWork::scope(system.orders.place_order("yacht", 2, &cancel)).await;
    assert!(matches!(
        result,
        Err(CheckoutError::TotalOverflow { quantity: 2, price_cents: u64::MAX, .. })
    ));

    assert_eq!(system.stock_of("yacht"), Some(10));
    assert_eq!(system.database.count(ORDERS), 0);
    assert!(system.publisher.outbox().is_empty());
}
