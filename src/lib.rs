extern crate reqwest;
extern crate serde;
extern crate serde_json;
extern crate url;

pub mod config;
pub mod errors;
pub mod events;
pub mod orders;
pub mod reconciler;
pub mod refresh;
pub mod session;
pub mod signals;
pub mod trading_client;
pub mod types;
pub mod ws_client;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::SyncConfig;
pub use errors::{WsClientError, WsResult};
pub use events::{parse_frame, EventRouter, SocketEvent};
pub use orders::{OrderFlow, PlaceOutcome};
pub use reconciler::{DriftCorrection, Reconciler, RefreshPlan, RefreshTarget};
pub use refresh::Refresher;
pub use session::{SessionOptions, TradingSession};
pub use signals::SignalDeduplicator;
pub use trading_client::{
    Error as TradingError, RestClient, RestClientBuilder, Result as TradingResult, RetryPolicy,
    TradingApi, TradingVariant,
};
pub use types::{
    AiSignal, ConnectionQuality, ConnectionState, ConnectionStatus, DashboardState, Direction,
    OrderId, OrderRequest, OrderSide, OrderType, PendingOrderConfirmation, PortfolioSnapshot,
    Symbol, Trade, TradeId,
};
pub use ws_client::{reconnect_delay, ConnectionManager, ExponentialBackoff, WsConfig};
