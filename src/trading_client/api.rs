use async_trait::async_trait;

use super::errors::Result;
use crate::types::{
    AiSignal, MarketSymbol, OrderId, OrderRequest, PendingOrder, PlaceOrderResponse,
    PortfolioSnapshot, ServiceStatus, Settings, StopLossTakeProfit, Symbol, Trade, TradeId,
};

/// Operations the synchronization core needs from the trading backend.
///
/// [`RestClient`](super::RestClient) is the production implementation; tests
/// substitute scripted fakes.
#[async_trait]
pub trait TradingApi: Send + Sync {
    async fn status(&self) -> Result<ServiceStatus>;
    async fn portfolio(&self) -> Result<PortfolioSnapshot>;
    async fn open_trades(&self) -> Result<Vec<Trade>>;
    async fn closed_trades(&self) -> Result<Vec<Trade>>;
    async fn pending_orders(&self) -> Result<Vec<PendingOrder>>;
    async fn settings(&self) -> Result<Settings>;
    async fn update_settings(&self, settings: &Settings) -> Result<Settings>;
    async fn symbols(&self) -> Result<Vec<MarketSymbol>>;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn reset(&self) -> Result<()>;

    async fn close_trade(&self, id: &TradeId) -> Result<()>;
    async fn update_sltp(&self, symbol: &Symbol, levels: &StopLossTakeProfit) -> Result<()>;
    async fn analyze(&self, symbol: &Symbol) -> Result<AiSignal>;

    async fn place_order(&self, request: &OrderRequest) -> Result<PlaceOrderResponse>;
    async fn cancel_order(&self, id: &OrderId) -> Result<()>;
    async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> Result<()>;
}
