//! Places a market order through the two-step confirmation flow.
//!
//! Environment variables:
//! - `TRADE_SYNC_SYMBOL` (defaults to BTCUSDT)
//! - `TRADE_SYNC_QUANTITY` (defaults to 0.001)
//! - optional `TRADE_SYNC_BASE_URL` / `TRADE_SYNC_VARIANT`

use std::{env, sync::Arc};

use trade_sync::{OrderRequest, OrderSide, PlaceOutcome, SyncConfig, TradingSession};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let symbol = env::var("TRADE_SYNC_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string());
    let quantity: f64 = env::var("TRADE_SYNC_QUANTITY")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0.001);

    let config = SyncConfig::from_env()?;
    let api = Arc::new(config.rest_client()?);
    let session = TradingSession::new(api, config.session_options())?;
    session.start().await;

    let request = OrderRequest::market(symbol.as_str(), OrderSide::Buy, quantity);
    match session.place_order(request).await? {
        PlaceOutcome::NeedsConfirmation(pending) => {
            println!(
                "Preview: {} (token expires at {})",
                pending.summary, pending.expires_at
            );
            match session.confirm_order().await? {
                PlaceOutcome::Executed(response) => {
                    println!("Confirmed: order {:?} trade {:?}", response.order, response.trade)
                }
                PlaceOutcome::NeedsConfirmation(_) => println!("Backend asked for another preview"),
            }
        }
        PlaceOutcome::Executed(response) => println!(
            "Executed without preview: order {:?} trade {:?}",
            response.order, response.trade
        ),
    }

    let state = session.snapshot();
    println!(
        "{} open trade(s), {} pending order(s)",
        state.open_trades.len(),
        state.pending_orders.len()
    );
    session.stop().await;
    Ok(())
}
