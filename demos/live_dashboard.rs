//! Streams the synchronized dashboard state to stdout.
//!
//! Environment variables:
//! - optional `TRADE_SYNC_CONFIG` (path to a TOML file with a `[sync]` table)
//! - optional `TRADE_SYNC_BASE_URL`, `TRADE_SYNC_VARIANT` and the other
//!   `TRADE_SYNC_*` overrides

use std::{env, sync::Arc, time::Duration};

use trade_sync::{SyncConfig, TradingSession};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = match env::var("TRADE_SYNC_CONFIG") {
        Ok(path) => SyncConfig::from_file(path)?,
        Err(_) => SyncConfig::from_env()?,
    };
    let api = Arc::new(config.rest_client()?);
    let session = TradingSession::new(api, config.session_options())?;
    session.start().await;

    let mut updates = session.subscribe();
    let deadline = tokio::time::sleep(Duration::from_secs(120));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                println!(
                    "[{:?}/{:?}] equity {:.2} | unrealized {:.2} | open {} | orders {} | signals {}",
                    state.connection.state,
                    state.connection.quality,
                    state.display.equity,
                    state.display.unrealized_pnl,
                    state.open_trades.len(),
                    state.pending_orders.len(),
                    state.signals.len(),
                );
                if let Some(error) = &state.last_error {
                    println!("  last error: {error}");
                }
            }
        }
    }

    session.stop().await;
    Ok(())
}
