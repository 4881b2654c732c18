use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::reconciler::RefreshTarget;

/// Instrument identifier such as `BTCUSDT`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned trade identifier. Numeric ids are accepted and stored as text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TradeId(pub String);

impl TradeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for TradeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_id(deserializer).map(Self)
    }
}

impl From<&str> for TradeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned identifier of a resting order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for OrderId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_id(deserializer).map(Self)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ids arrive as strings or bare numbers depending on the backend.
fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unsupported id value {other}"
        ))),
    }
}

/// Lifecycle of the socket as seen by the dashboard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Coarse link quality derived from heartbeat round-trip latency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionQuality {
    #[default]
    Good,
    Slow,
    Poor,
}

impl ConnectionQuality {
    pub fn classify(latency: Duration, warn: Duration, error: Duration) -> Self {
        if latency < warn {
            ConnectionQuality::Good
        } else if latency < error {
            ConnectionQuality::Slow
        } else {
            ConnectionQuality::Poor
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub latency: Option<Duration>,
    pub average_latency: Option<Duration>,
    pub quality: ConnectionQuality,
    pub reconnect_attempts: u32,
    pub next_reconnect_in: Option<Duration>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Aggregate account metrics as reported by `GET portfolio`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub margin_free: f64,
    pub total_pnl: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub win_rate: f64,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
}

/// Partial portfolio patch carried by `performance_update` events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioUpdate {
    pub balance: Option<f64>,
    pub equity: Option<f64>,
    pub margin_used: Option<f64>,
    pub margin_free: Option<f64>,
    pub total_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub win_rate: Option<f64>,
    pub total_trades: Option<u64>,
    pub winning_trades: Option<u64>,
    pub losing_trades: Option<u64>,
}

impl PortfolioUpdate {
    pub fn apply_to(&self, portfolio: &mut PortfolioSnapshot) {
        fn set<T: Copy>(field: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *field = value;
            }
        }

        set(&mut portfolio.balance, self.balance);
        set(&mut portfolio.equity, self.equity);
        set(&mut portfolio.margin_used, self.margin_used);
        set(&mut portfolio.margin_free, self.margin_free);
        set(&mut portfolio.total_pnl, self.total_pnl);
        set(&mut portfolio.realized_pnl, self.realized_pnl);
        set(&mut portfolio.unrealized_pnl, self.unrealized_pnl);
        set(&mut portfolio.win_rate, self.win_rate);
        set(&mut portfolio.total_trades, self.total_trades);
        set(&mut portfolio.winning_trades, self.winning_trades);
        set(&mut portfolio.losing_trades, self.losing_trades);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "LONG", alias = "Long", alias = "buy", alias = "BUY")]
    Long,
    #[serde(alias = "SHORT", alias = "Short", alias = "sell", alias = "SELL")]
    Short,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    #[default]
    #[serde(alias = "OPEN", alias = "Open")]
    Open,
    #[serde(alias = "CLOSED", alias = "Closed")]
    Closed,
    #[serde(alias = "CANCELLED", alias = "Cancelled", alias = "canceled", alias = "CANCELED")]
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub symbol: Symbol,
    #[serde(alias = "side")]
    pub direction: Direction,
    #[serde(default)]
    pub status: TradeStatus,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    pub quantity: f64,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default, alias = "entry_time")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "exit_time")]
    pub closed_at: Option<DateTime<Utc>>,
}

fn default_leverage() -> f64 {
    1.0
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Mark-to-market P&L of this trade at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.direction.sign()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    #[serde(alias = "BUY", alias = "Buy")]
    Buy,
    #[serde(alias = "SELL", alias = "Sell")]
    Sell,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[serde(alias = "MARKET")]
    Market,
    #[serde(alias = "LIMIT")]
    Limit,
    #[serde(alias = "STOP_LIMIT", alias = "stop-limit")]
    StopLimit,
}

/// Order submission payload for `POST orders`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_token: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<Symbol>, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            leverage: None,
            stop_loss: None,
            take_profit: None,
            confirmation_token: None,
        }
    }

    pub fn limit(symbol: impl Into<Symbol>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = Some(leverage);
        self
    }

    pub fn with_stop_loss(mut self, price: f64) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: f64) -> Self {
        self.take_profit = Some(price);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }
}

/// Response body of `POST orders`: either a confirmation challenge or an accepted order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceOrderResponse {
    pub requires_confirmation: bool,
    pub confirmation_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub order: Option<PendingOrder>,
    pub trade: Option<Trade>,
}

impl PlaceOrderResponse {
    pub fn challenge(&self) -> Option<(&str, DateTime<Utc>)> {
        match (&self.confirmation_token, self.expires_at) {
            (Some(token), Some(expires_at)) => Some((token.as_str(), expires_at)),
            _ => None,
        }
    }
}

/// The single outstanding order preview waiting for user confirmation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingOrderConfirmation {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub summary: String,
    pub request: OrderRequest,
}

impl PendingOrderConfirmation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Resting order as listed by `GET orders`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    #[serde(alias = "BUY", alias = "Buy", alias = "long", alias = "LONG")]
    Buy,
    #[serde(alias = "SELL", alias = "Sell", alias = "short", alias = "SHORT")]
    Sell,
    #[serde(alias = "HOLD", alias = "Hold", alias = "neutral", alias = "NEUTRAL")]
    Hold,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiSignal {
    pub id: String,
    pub symbol: Symbol,
    #[serde(alias = "direction", alias = "action")]
    pub signal: SignalDirection,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_analysis: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<Value>,
}

/// Single real-time price update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: Symbol,
    #[serde(alias = "current_price", alias = "last_price")]
    pub price: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default, alias = "running")]
    pub is_running: bool,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

pub type Settings = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketSymbol {
    pub symbol: Symbol,
    #[serde(default)]
    pub base_asset: Option<String>,
    #[serde(default)]
    pub quote_asset: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Stop-loss / take-profit update for `PUT positions/{symbol}/sltp`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopLossTakeProfit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
}

/// Locally derived metrics shown between authoritative refreshes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DisplayMetrics {
    pub unrealized_pnl: f64,
    pub equity: f64,
}

/// Everything the dashboard renders, owned by the reconciler.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DashboardState {
    pub connection: ConnectionStatus,
    pub service: Option<ServiceStatus>,
    pub portfolio: PortfolioSnapshot,
    pub display: DisplayMetrics,
    pub open_trades: Vec<Trade>,
    pub closed_trades: Vec<Trade>,
    pub pending_orders: Vec<PendingOrder>,
    pub signals: Vec<AiSignal>,
    pub pending_confirmation: Option<PendingOrderConfirmation>,
    pub settings: Settings,
    pub symbols: Vec<MarketSymbol>,
    pub last_prices: HashMap<Symbol, f64>,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) refresh_marks: HashMap<RefreshTarget, u64>,
}

impl DashboardState {
    pub fn open_trade(&self, id: &TradeId) -> Option<&Trade> {
        self.open_trades.iter().find(|trade| &trade.id == id)
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }
}

/// Shared REST response envelope.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}
