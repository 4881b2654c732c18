use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use url::Url;

use super::{
    api::TradingApi,
    endpoints::{Endpoint, EndpointSet},
    errors::{Error, Result, ServerErr},
};
use crate::types::{
    AiSignal, ApiResponse, MarketSymbol, OrderId, OrderRequest, PendingOrder, PlaceOrderResponse,
    PortfolioSnapshot, ServiceStatus, Settings, StopLossTakeProfit, Symbol, Trade, TradeId,
};

/// Typed reqwest client for the trading backend, parameterized by an [`EndpointSet`].
#[derive(Clone, Debug)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    endpoints: EndpointSet,
}

impl RestClient {
    pub fn builder() -> RestClientBuilder {
        RestClientBuilder::default()
    }

    pub fn new(base_url: impl Into<String>, endpoints: EndpointSet) -> Result<Self> {
        Self::builder()
            .base_url(base_url)
            .endpoints(endpoints)
            .build()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    async fn call<T, B>(
        &self,
        method: Method,
        endpoint: Endpoint,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoints.url(&self.base_url, &endpoint);
        tracing::trace!(%method, %url, "rest_request");

        let mut request = self.http.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        decode_envelope(status, &text)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: Endpoint) -> Result<T> {
        self.call::<T, Value>(Method::GET, endpoint, &[], None).await
    }

    async fn post_unit(&self, endpoint: Endpoint) -> Result<()> {
        self.call::<Value, Value>(Method::POST, endpoint, &[], None)
            .await
            .map(|_| ())
    }
}

/// Maps an HTTP status and body onto the backend's `{success, data, error}` envelope.
pub(crate) fn decode_envelope<T: DeserializeOwned>(status: StatusCode, text: &str) -> Result<T> {
    if !status.is_success() {
        return Err(map_status_error(status, text));
    }

    let envelope: ApiResponse<Value> = serde_json::from_str(text)?;
    if !envelope.success {
        let message = envelope
            .error
            .unwrap_or_else(|| "request failed".to_string());
        return Err(Error::Rejected(message));
    }

    match envelope.data {
        Some(data) => Ok(serde_json::from_value(data)?),
        None => serde_json::from_value(Value::Null).map_err(|_| Error::MissingData("data")),
    }
}

fn map_status_error(status: StatusCode, text: &str) -> Error {
    let status_code = status.as_u16();
    let parsed = serde_json::from_str::<ServerErr>(text).ok();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Error::RateLimited {
            retry_after: parsed.and_then(|server| server.retry_after),
        };
    }

    match parsed.and_then(|server| server.error) {
        Some(message) => Error::Server {
            status: status_code,
            message,
        },
        None => Error::Http {
            status: status_code,
            body: text.to_string(),
        },
    }
}

#[async_trait]
impl TradingApi for RestClient {
    async fn status(&self) -> Result<ServiceStatus> {
        self.get(Endpoint::Status).await
    }

    async fn portfolio(&self) -> Result<PortfolioSnapshot> {
        self.get(Endpoint::Portfolio).await
    }

    async fn open_trades(&self) -> Result<Vec<Trade>> {
        self.get(Endpoint::OpenTrades).await
    }

    async fn closed_trades(&self) -> Result<Vec<Trade>> {
        self.get(Endpoint::ClosedTrades).await
    }

    async fn pending_orders(&self) -> Result<Vec<PendingOrder>> {
        self.get(Endpoint::Orders).await
    }

    async fn settings(&self) -> Result<Settings> {
        self.get(Endpoint::Settings).await
    }

    async fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        self.call(Method::PUT, Endpoint::Settings, &[], Some(settings))
            .await
    }

    async fn symbols(&self) -> Result<Vec<MarketSymbol>> {
        self.get(Endpoint::Symbols).await
    }

    async fn start(&self) -> Result<()> {
        self.post_unit(Endpoint::Start).await
    }

    async fn stop(&self) -> Result<()> {
        self.post_unit(Endpoint::Stop).await
    }

    async fn reset(&self) -> Result<()> {
        self.post_unit(Endpoint::Reset).await
    }

    async fn close_trade(&self, id: &TradeId) -> Result<()> {
        self.post_unit(Endpoint::CloseTrade(id.clone())).await
    }

    async fn update_sltp(&self, symbol: &Symbol, levels: &StopLossTakeProfit) -> Result<()> {
        self.call::<Value, _>(
            Method::PUT,
            Endpoint::PositionSlTp(symbol.clone()),
            &[],
            Some(levels),
        )
        .await
        .map(|_| ())
    }

    async fn analyze(&self, symbol: &Symbol) -> Result<AiSignal> {
        let body = json!({ "symbol": symbol });
        self.call(Method::POST, Endpoint::Analyze, &[], Some(&body))
            .await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlaceOrderResponse> {
        self.call(Method::POST, Endpoint::Orders, &[], Some(request))
            .await
    }

    async fn cancel_order(&self, id: &OrderId) -> Result<()> {
        self.call::<Value, Value>(Method::DELETE, Endpoint::CancelOrder(id.clone()), &[], None)
            .await
            .map(|_| ())
    }

    async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> Result<()> {
        let query: Vec<(&str, &str)> = symbol
            .map(|symbol| vec![("symbol", symbol.as_str())])
            .unwrap_or_default();
        self.call::<Value, Value>(Method::DELETE, Endpoint::CancelAllOrders, &query, None)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Default)]
pub struct RestClientBuilder {
    base_url: Option<String>,
    endpoints: Option<EndpointSet>,
    http: Option<reqwest::Client>,
}

impl RestClientBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointSet) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<RestClient> {
        let base_url = self.base_url.ok_or(Error::InvalidConfig {
            field: "base_url",
            why: "must be provided",
        })?;

        let base_url = Url::parse(&base_url).map_err(|_| Error::InvalidConfig {
            field: "base_url",
            why: "must be an absolute url",
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig {
                field: "base_url",
                why: "scheme must be http or https",
            });
        }

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder().build()?,
        };

        Ok(RestClient {
            http,
            base_url,
            endpoints: self.endpoints.unwrap_or_default(),
        })
    }
}
