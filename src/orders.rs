//! Two-step order placement.
//!
//! An order submitted without a token comes back as a preview carrying a
//! short-lived confirmation token. The preview is parked on the dashboard as
//! the single pending confirmation until the user confirms it, it expires or
//! it is cleared. Placing a new preview overwrites the old one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    reconciler::{Reconciler, RefreshPlan, RefreshTarget},
    refresh::Refresher,
    trading_client::{Error, Result, TradingApi},
    types::{OrderRequest, OrderType, PendingOrderConfirmation, PlaceOrderResponse},
};

#[derive(Clone, Debug, PartialEq)]
pub enum PlaceOutcome {
    /// The backend wants the order confirmed before executing it.
    NeedsConfirmation(PendingOrderConfirmation),
    Executed(PlaceOrderResponse),
}

#[derive(Clone)]
pub struct OrderFlow {
    api: Arc<dyn TradingApi>,
    reconciler: Reconciler,
    refresher: Refresher,
    submit: Arc<Mutex<()>>,
}

impl OrderFlow {
    pub fn new(api: Arc<dyn TradingApi>, reconciler: Reconciler, refresher: Refresher) -> Self {
        Self {
            api,
            reconciler,
            refresher,
            submit: Arc::new(Mutex::new(())),
        }
    }

    pub fn pending_confirmation(&self) -> Option<PendingOrderConfirmation> {
        self.reconciler.pending_confirmation()
    }

    pub async fn place_order(&self, request: OrderRequest) -> Result<PlaceOutcome> {
        let _guard = self.submit.lock().await;
        self.submit_order(request).await
    }

    pub async fn confirm_order(&self) -> Result<PlaceOutcome> {
        self.confirm_order_at(Utc::now()).await
    }

    /// Confirms the pending preview as of `now`.
    pub async fn confirm_order_at(&self, now: DateTime<Utc>) -> Result<PlaceOutcome> {
        let _guard = self.submit.lock().await;

        let Some(pending) = self.reconciler.pending_confirmation() else {
            let err = Error::NoPendingConfirmation;
            self.reconciler.record_error(err.to_string());
            return Err(err);
        };

        if pending.is_expired_at(now) {
            tracing::info!(expires_at = %pending.expires_at, "order_confirmation_expired");
            self.reconciler.clear_pending_confirmation();
            let err = Error::ConfirmationExpired;
            self.reconciler.record_error(err.to_string());
            return Err(err);
        }

        let request = pending.request.with_token(pending.token);
        self.submit_order(request).await
    }

    pub fn clear_pending_confirmation(&self) {
        self.reconciler.clear_pending_confirmation();
    }

    async fn submit_order(&self, request: OrderRequest) -> Result<PlaceOutcome> {
        let confirming = request.confirmation_token.is_some();
        tracing::info!(
            symbol = %request.symbol,
            side = ?request.side,
            order_type = ?request.order_type,
            quantity = request.quantity,
            confirming,
            "order_submit"
        );

        let response = match self.api.place_order(&request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, confirming, "order_submit_failed");
                self.reconciler.record_error(err.user_message());
                return Err(err);
            }
        };

        if !confirming {
            if let Some((token, expires_at)) = response.challenge() {
                let pending = PendingOrderConfirmation {
                    token: token.to_string(),
                    expires_at,
                    summary: response
                        .summary
                        .clone()
                        .unwrap_or_else(|| describe(&request)),
                    request,
                };
                tracing::info!(expires_at = %pending.expires_at, "order_confirmation_required");
                self.reconciler.set_pending_confirmation(pending.clone());
                return Ok(PlaceOutcome::NeedsConfirmation(pending));
            }
            if response.requires_confirmation {
                let err = Error::MissingData("confirmation_token");
                self.reconciler.record_error(err.to_string());
                return Err(err);
            }
        } else {
            self.reconciler.clear_pending_confirmation();
        }

        tracing::info!(confirming, "order_executed");
        self.refresher
            .run(&RefreshPlan::trades().with(RefreshTarget::Orders))
            .await;
        Ok(PlaceOutcome::Executed(response))
    }
}

fn describe(request: &OrderRequest) -> String {
    let kind = match request.order_type {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::StopLimit => "stop-limit",
    };
    let mut summary = format!(
        "{:?} {} {} ({kind})",
        request.side, request.quantity, request.symbol
    );
    if let Some(price) = request.price {
        summary.push_str(&format!(" @ {price}"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reconciler::DriftCorrection, test_support::FakeApi, trading_client::RetryPolicy,
        types::OrderSide,
    };

    fn setup() -> (Arc<FakeApi>, Reconciler, OrderFlow) {
        let api = FakeApi::new();
        let reconciler = Reconciler::new(DriftCorrection::Probabilistic { probability: 0.0 });
        let refresher = Refresher::new(api.clone(), reconciler.clone(), RetryPolicy::once());
        let flow = OrderFlow::new(api.clone(), reconciler.clone(), refresher);
        (api, reconciler, flow)
    }

    fn btc_buy() -> OrderRequest {
        OrderRequest::market("BTCUSDT", OrderSide::Buy, 0.1)
    }

    #[tokio::test]
    async fn test_place_then_confirm_then_confirm_again() {
        let (api, reconciler, flow) = setup();

        let outcome = flow.place_order(btc_buy()).await.unwrap();
        let PlaceOutcome::NeedsConfirmation(pending) = outcome else {
            panic!("expected a confirmation challenge");
        };
        assert_eq!(pending.token, "tok-1");
        assert_eq!(reconciler.pending_confirmation(), Some(pending));

        let confirmed = flow.confirm_order().await.unwrap();
        assert!(matches!(confirmed, PlaceOutcome::Executed(_)));
        assert_eq!(reconciler.pending_confirmation(), None);
        assert_eq!(
            api.last_order().unwrap().confirmation_token.as_deref(),
            Some("tok-1")
        );
        assert_eq!(api.calls("pending_orders"), 1);
        assert_eq!(api.calls("open_trades"), 1);
        assert_eq!(api.calls("portfolio"), 1);
        assert_eq!(reconciler.snapshot().pending_orders.len(), 1);

        let again = flow.confirm_order().await.unwrap_err();
        assert!(matches!(again, Error::NoPendingConfirmation));
        assert!(again.to_string().contains("no pending order"));
        assert_eq!(api.calls("place_order"), 2);
    }

    #[tokio::test]
    async fn test_confirm_without_pending_makes_no_call() {
        let (api, _, flow) = setup();

        let err = flow.confirm_order().await.unwrap_err();

        assert!(matches!(err, Error::NoPendingConfirmation));
        assert_eq!(api.calls("place_order"), 0);
    }

    #[tokio::test]
    async fn test_expired_confirmation_is_cleared() {
        let (api, reconciler, flow) = setup();
        flow.place_order(btc_buy()).await.unwrap();
        let expires_at = reconciler.pending_confirmation().unwrap().expires_at;

        let err = flow
            .confirm_order_at(expires_at + chrono::Duration::seconds(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConfirmationExpired));
        assert!(err.to_string().contains("expired"));
        assert_eq!(reconciler.pending_confirmation(), None);
        assert_eq!(api.calls("place_order"), 1);
    }

    #[tokio::test]
    async fn test_confirmation_at_expiry_instant_still_valid() {
        let (_, reconciler, flow) = setup();
        flow.place_order(btc_buy()).await.unwrap();
        let expires_at = reconciler.pending_confirmation().unwrap().expires_at;

        let outcome = flow.confirm_order_at(expires_at).await.unwrap();
        assert!(matches!(outcome, PlaceOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_new_preview_overwrites_previous() {
        let (_, reconciler, flow) = setup();
        flow.place_order(btc_buy()).await.unwrap();
        flow.place_order(OrderRequest::limit("ETHUSDT", OrderSide::Sell, 1.0, 3_100.0))
            .await
            .unwrap();

        let pending = reconciler.pending_confirmation().unwrap();
        assert_eq!(pending.token, "tok-2");
        assert_eq!(pending.request.symbol.as_str(), "ETHUSDT");
    }

    #[tokio::test]
    async fn test_rejected_confirmation_keeps_pending() {
        let (api, reconciler, flow) = setup();
        flow.place_order(btc_buy()).await.unwrap();
        api.with_state(|state| state.reject_with = Some("Insufficient margin".to_string()));

        let err = flow.confirm_order().await.unwrap_err();

        assert_eq!(err.user_message(), "Insufficient margin");
        assert_eq!(
            reconciler.snapshot().last_error.as_deref(),
            Some("Insufficient margin")
        );
        assert!(reconciler.pending_confirmation().is_some());
    }

    #[tokio::test]
    async fn test_immediate_execution_counts_as_success() {
        let (api, reconciler, flow) = setup();
        api.with_state(|state| state.execute_immediately = true);

        let outcome = flow.place_order(btc_buy()).await.unwrap();

        assert!(matches!(outcome, PlaceOutcome::Executed(_)));
        assert_eq!(reconciler.pending_confirmation(), None);
        assert_eq!(reconciler.snapshot().pending_orders.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (_, reconciler, flow) = setup();
        flow.place_order(btc_buy()).await.unwrap();

        flow.clear_pending_confirmation();
        flow.clear_pending_confirmation();

        assert_eq!(reconciler.pending_confirmation(), None);
    }
}
