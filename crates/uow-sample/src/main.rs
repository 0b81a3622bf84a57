//! Demo: places one order that succeeds and one that is rejected, then prints
//! what was committed and published.
//!
//! ```bash
//! RUST_LOG=info cargo run -p uow-sample
//! UOW_ISOLATION_LEVEL=serializable RUST_LOG=debug cargo run -p uow-sample
//! ```

use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use unit_of_work::{setup_tracing, AmbientUnitOfWork, UnitOfWorkDefaultOptions};
use uow_sample::lifecycle::CheckoutSystem;
use uow_sample::orders::{CheckoutError, Product};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    setup_tracing();

    let defaults = UnitOfWorkDefaultOptions::from_env()?;
    let system = CheckoutSystem::new(defaults);
    system.seed_product(&Product::new("widget", "Super Widget", 2550, 10))?;

    let cancel = CancellationToken::new();
    AmbientUnitOfWork::scope(async {
        let span = tracing::info_span!("checkout");
        let order = system
            .orders
            .place_order("widget", 6, &cancel)
            .instrument(span)
            .await?;
        info!(order_id = %order.id, total_cents = order.total_cents, "First order committed");

        let span = tracing::info_span!("oversold_checkout");
        match system
            .orders
            .place_order("widget", 50, &cancel)
            .instrument(span)
            .await
        {
            Ok(order) => info!(order_id = %order.id, "Unexpectedly committed"),
            Err(e) => warn!(error = %e, "Second order rejected"),
        }
        Ok::<_, CheckoutError>(())
    })
    .await?;

    info!(stock = ?system.stock_of("widget"), "Remaining stock");
    for event in system.publisher.outbox() {
        info!(event_type = event.event_type(), data = %event.event_data(), "Outbox");
    }

    system.shutdown();
    Ok(())
}
