use serde::Deserialize;
use serde_json::Value;

use crate::{
    errors::{WsClientError, WsResult},
    reconciler::{Reconciler, RefreshPlan, RefreshTarget},
    signals::SignalDeduplicator,
    types::{AiSignal, PortfolioUpdate, PriceTick},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderEventKind {
    Placed,
    Filled,
    PartiallyFilled,
    Cancelled,
}

impl OrderEventKind {
    fn touches_positions(self) -> bool {
        matches!(self, OrderEventKind::Filled | OrderEventKind::PartiallyFilled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopLimitEventKind {
    Created,
    Triggered,
    Filled,
    Cancelled,
}

impl StopLimitEventKind {
    fn touches_positions(self) -> bool {
        matches!(self, StopLimitEventKind::Triggered | StopLimitEventKind::Filled)
    }
}

/// Every frame the backend socket is known to send.
#[derive(Clone, Debug, PartialEq)]
pub enum SocketEvent {
    MarketData(PriceTick),
    PerformanceUpdate(PortfolioUpdate),
    TradeExecuted(Value),
    TradeClosed(Value),
    AiSignal(Vec<AiSignal>),
    Order(OrderEventKind, Value),
    StopLimit(StopLimitEventKind, Value),
    Connected,
    Ping,
    Pong,
    ServerError(String),
    /// Event type this client does not know about yet.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

impl RawFrame {
    /// `data` when present, otherwise the remaining top-level fields.
    fn payload(self) -> Value {
        match self.data {
            Some(data) if !data.is_null() => data,
            _ => Value::Object(self.rest),
        }
    }
}

/// Parses one text frame. Frames without a discriminator decode to
/// [`SocketEvent::Unknown`]; invalid JSON or a payload that does not fit its
/// declared type is an error.
pub fn parse_frame(text: &str) -> WsResult<SocketEvent> {
    let frame: RawFrame = serde_json::from_str(text)?;
    let Some(kind) = frame.event_type.clone().or_else(|| frame.kind.clone()) else {
        return Ok(SocketEvent::Unknown(String::new()));
    };

    let event = match kind.as_str() {
        "market_data" | "price_update" | "tick" => {
            SocketEvent::MarketData(serde_json::from_value(frame.payload())?)
        }
        "performance_update" | "portfolio_update" => {
            let payload = match frame.payload() {
                Value::Object(mut map) if map.contains_key("portfolio") => {
                    map.remove("portfolio").unwrap_or(Value::Null)
                }
                other => other,
            };
            SocketEvent::PerformanceUpdate(serde_json::from_value(payload)?)
        }
        "trade_executed" => SocketEvent::TradeExecuted(frame.payload()),
        "trade_closed" => SocketEvent::TradeClosed(frame.payload()),
        "ai_signal" | "ai_signal_received" => SocketEvent::AiSignal(parse_signals(frame.payload())?),
        "order_placed" => SocketEvent::Order(OrderEventKind::Placed, frame.payload()),
        "order_filled" => SocketEvent::Order(OrderEventKind::Filled, frame.payload()),
        "order_partially_filled" => {
            SocketEvent::Order(OrderEventKind::PartiallyFilled, frame.payload())
        }
        "order_cancelled" => SocketEvent::Order(OrderEventKind::Cancelled, frame.payload()),
        "stop_limit_created" => SocketEvent::StopLimit(StopLimitEventKind::Created, frame.payload()),
        "stop_limit_triggered" => {
            SocketEvent::StopLimit(StopLimitEventKind::Triggered, frame.payload())
        }
        "stop_limit_filled" => SocketEvent::StopLimit(StopLimitEventKind::Filled, frame.payload()),
        "stop_limit_cancelled" => {
            SocketEvent::StopLimit(StopLimitEventKind::Cancelled, frame.payload())
        }
        "connected" | "connection_established" => SocketEvent::Connected,
        "ping" => SocketEvent::Ping,
        "pong" => SocketEvent::Pong,
        "error" => SocketEvent::ServerError(error_message(frame)),
        _ => SocketEvent::Unknown(kind),
    };

    Ok(event)
}

fn parse_signals(payload: Value) -> WsResult<Vec<AiSignal>> {
    match payload {
        Value::Array(_) => Ok(serde_json::from_value(payload)?),
        Value::Object(mut map) => match map.remove("signals") {
            Some(signals @ Value::Array(_)) => Ok(serde_json::from_value(signals)?),
            Some(_) => Err(WsClientError::InvalidMessage(
                "signals must be an array".to_string(),
            )),
            None => Ok(vec![serde_json::from_value(Value::Object(map))?]),
        },
        other => Err(WsClientError::InvalidMessage(format!(
            "unexpected ai signal payload: {other}"
        ))),
    }
}

fn error_message(frame: RawFrame) -> String {
    fn text(value: &Value) -> Option<String> {
        match value {
            Value::String(text) => Some(text.clone()),
            Value::Object(map) => map.get("message").or_else(|| map.get("error")).and_then(text),
            _ => None,
        }
    }

    frame
        .message
        .as_ref()
        .and_then(text)
        .or_else(|| frame.data.as_ref().and_then(text))
        .or_else(|| frame.rest.get("error").and_then(text))
        .unwrap_or_else(|| "Unknown server error".to_string())
}

/// Applies socket events to the reconciler and reports which categories need
/// an authoritative REST refresh.
#[derive(Clone)]
pub struct EventRouter {
    reconciler: Reconciler,
    dedup: SignalDeduplicator,
}

impl EventRouter {
    pub fn new(reconciler: Reconciler, dedup: SignalDeduplicator) -> Self {
        Self { reconciler, dedup }
    }

    /// Never fails: a frame that cannot be parsed only sets the error slot.
    pub fn route(&self, text: &str) -> RefreshPlan {
        match parse_frame(text) {
            Ok(event) => self.dispatch(event),
            Err(err) => {
                tracing::warn!(error = %err, "ws_frame_parse_failed");
                self.reconciler
                    .record_error(format!("Failed to parse message: {err}"));
                RefreshPlan::none()
            }
        }
    }

    pub fn dispatch(&self, event: SocketEvent) -> RefreshPlan {
        match event {
            SocketEvent::MarketData(tick) => {
                if self.reconciler.apply_tick(&tick) {
                    tracing::debug!(symbol = %tick.symbol, "drift_refresh_requested");
                    RefreshPlan::from_targets([RefreshTarget::Portfolio, RefreshTarget::OpenTrades])
                } else {
                    RefreshPlan::none()
                }
            }
            SocketEvent::PerformanceUpdate(update) => {
                self.reconciler.merge_portfolio(&update);
                RefreshPlan::none()
            }
            SocketEvent::TradeExecuted(payload) | SocketEvent::TradeClosed(payload) => {
                tracing::debug!(%payload, "trade_lifecycle_event");
                self.reconciler.touch_activity();
                RefreshPlan::trades()
            }
            SocketEvent::AiSignal(signals) => {
                self.reconciler.merge_signals(&self.dedup, &signals);
                RefreshPlan::none()
            }
            SocketEvent::Order(kind, _) => {
                self.reconciler.touch_activity();
                let mut plan = RefreshPlan::from_targets([RefreshTarget::Orders]);
                if kind.touches_positions() {
                    plan.merge(RefreshPlan::trades());
                }
                plan
            }
            SocketEvent::StopLimit(kind, _) => {
                self.reconciler.touch_activity();
                let mut plan = RefreshPlan::from_targets([RefreshTarget::Orders]);
                if kind.touches_positions() {
                    plan.merge(RefreshPlan::trades());
                }
                plan
            }
            SocketEvent::ServerError(message) => {
                tracing::warn!(%message, "ws_server_error");
                self.reconciler.record_error(message);
                RefreshPlan::none()
            }
            SocketEvent::Unknown(kind) => {
                tracing::debug!(kind = %kind, "ws_unknown_event");
                self.reconciler.touch_activity();
                RefreshPlan::none()
            }
            SocketEvent::Connected | SocketEvent::Ping | SocketEvent::Pong => {
                self.reconciler.touch_activity();
                RefreshPlan::none()
            }
        }
    }
}
