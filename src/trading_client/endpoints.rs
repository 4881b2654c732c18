use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{OrderId, Symbol, TradeId};

/// Backend flavour the dashboard talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingVariant {
    #[default]
    Paper,
    Live,
}

impl fmt::Display for TradingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingVariant::Paper => f.write_str("paper"),
            TradingVariant::Live => f.write_str("live"),
        }
    }
}

/// REST prefix and socket path for one backend variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSet {
    pub variant: TradingVariant,
    pub rest_prefix: String,
    pub ws_path: String,
}

impl EndpointSet {
    pub fn paper() -> Self {
        Self {
            variant: TradingVariant::Paper,
            rest_prefix: "/api/paper-trading".to_string(),
            ws_path: "/ws/paper-trading".to_string(),
        }
    }

    pub fn live() -> Self {
        Self {
            variant: TradingVariant::Live,
            rest_prefix: "/api/real-trading".to_string(),
            ws_path: "/ws/real-trading".to_string(),
        }
    }

    pub fn for_variant(variant: TradingVariant) -> Self {
        match variant {
            TradingVariant::Paper => Self::paper(),
            TradingVariant::Live => Self::live(),
        }
    }

    /// Absolute URL for `endpoint` under `base_url`. Ids and symbols are
    /// appended as single percent-encoded path segments.
    pub fn url(&self, base_url: &Url, endpoint: &Endpoint) -> Url {
        let mut url = base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(self.rest_prefix.split('/').filter(|part| !part.is_empty()))
                .extend(endpoint.segments());
        }
        url
    }
}

impl Default for EndpointSet {
    fn default() -> Self {
        Self::paper()
    }
}

/// Every REST route the dashboard uses, relative to the variant prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Status,
    Portfolio,
    OpenTrades,
    ClosedTrades,
    Orders,
    Settings,
    Start,
    Stop,
    Reset,
    CloseTrade(TradeId),
    CancelOrder(OrderId),
    CancelAllOrders,
    PositionSlTp(Symbol),
    Analyze,
    Symbols,
}

impl Endpoint {
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Endpoint::Status => vec!["status"],
            Endpoint::Portfolio => vec!["portfolio"],
            Endpoint::OpenTrades => vec!["trades", "open"],
            Endpoint::ClosedTrades => vec!["trades", "closed"],
            Endpoint::Orders => vec!["orders"],
            Endpoint::Settings => vec!["settings"],
            Endpoint::Start => vec!["start"],
            Endpoint::Stop => vec!["stop"],
            Endpoint::Reset => vec!["reset"],
            Endpoint::CloseTrade(id) => vec!["trades", id.as_str(), "close"],
            Endpoint::CancelOrder(id) => vec!["orders", id.as_str()],
            Endpoint::CancelAllOrders => vec!["orders", "all"],
            Endpoint::PositionSlTp(symbol) => vec!["positions", symbol.as_str(), "sltp"],
            Endpoint::Analyze => vec!["ai", "analyze"],
            Endpoint::Symbols => vec!["market", "symbols"],
        }
    }
}
