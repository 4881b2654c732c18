use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::{
    reconciler::{Reconciler, RefreshPlan, RefreshTarget},
    trading_client::{fetch_with_retry, Result, RetryPolicy, TradingApi},
};

/// Executes refresh plans against the backend and hands the results to the
/// reconciler under a fresh ticket.
#[derive(Clone)]
pub struct Refresher {
    api: Arc<dyn TradingApi>,
    reconciler: Reconciler,
    retry: RetryPolicy,
}

impl Refresher {
    pub fn new(api: Arc<dyn TradingApi>, reconciler: Reconciler, retry: RetryPolicy) -> Self {
        Self {
            api,
            reconciler,
            retry,
        }
    }

    /// Refreshes one category. Status polling is best effort and tried once;
    /// everything else goes through the retry policy.
    pub async fn refresh(&self, target: RefreshTarget) -> Result<()> {
        let ticket = self.reconciler.begin_refresh(target);
        let label = target.label();
        let api = &self.api;
        let retry = &self.retry;

        let result = match target {
            RefreshTarget::Portfolio => fetch_with_retry(label, retry, move |_| api.portfolio())
                .await
                .map(|portfolio| {
                    self.reconciler.apply_portfolio(ticket, portfolio);
                }),
            RefreshTarget::OpenTrades => fetch_with_retry(label, retry, move |_| api.open_trades())
                .await
                .map(|trades| {
                    self.reconciler.apply_open_trades(ticket, trades);
                }),
            RefreshTarget::ClosedTrades => {
                fetch_with_retry(label, retry, move |_| api.closed_trades())
                    .await
                    .map(|trades| {
                        self.reconciler.apply_closed_trades(ticket, trades);
                    })
            }
            RefreshTarget::Orders => fetch_with_retry(label, retry, move |_| api.pending_orders())
                .await
                .map(|orders| {
                    self.reconciler.apply_orders(ticket, orders);
                }),
            RefreshTarget::Status => {
                fetch_with_retry(label, &RetryPolicy::once(), move |_| api.status())
                    .await
                    .map(|status| {
                        self.reconciler.apply_status(ticket, status);
                    })
            }
            RefreshTarget::Settings => fetch_with_retry(label, retry, move |_| api.settings())
                .await
                .map(|settings| {
                    self.reconciler.apply_settings(ticket, settings);
                }),
            RefreshTarget::Symbols => fetch_with_retry(label, retry, move |_| api.symbols())
                .await
                .map(|symbols| {
                    self.reconciler.apply_symbols(ticket, symbols);
                }),
        };

        if let Err(err) = &result {
            tracing::warn!(refresh = label, error = %err, "refresh_failed");
            if target != RefreshTarget::Status {
                self.reconciler
                    .record_error(format!("Failed to load {label}: {}", err.user_message()));
            }
        }
        result
    }

    /// Refreshes every target in `plan` concurrently. Failures are recorded,
    /// not returned.
    pub async fn run(&self, plan: &RefreshPlan) {
        if plan.is_empty() {
            return;
        }
        join_all(plan.iter().map(|target| self.refresh(target))).await;
    }

    pub fn spawn(&self, plan: RefreshPlan) -> Option<JoinHandle<()>> {
        if plan.is_empty() {
            return None;
        }
        let refresher = self.clone();
        Some(tokio::spawn(async move { refresher.run(&plan).await }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reconciler::DriftCorrection,
        test_support::{open_trade, FakeApi},
        types::{Direction, PortfolioSnapshot},
    };
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
        }
    }

    fn setup() -> (Arc<FakeApi>, Reconciler, Refresher) {
        let api = FakeApi::new();
        let reconciler = Reconciler::new(DriftCorrection::Probabilistic { probability: 0.0 });
        let refresher = Refresher::new(api.clone(), reconciler.clone(), fast_retry());
        (api, reconciler, refresher)
    }

    #[tokio::test]
    async fn test_closed_trades_recover_on_third_attempt() {
        let (api, reconciler, refresher) = setup();
        let mut closed = open_trade("c1", "BTCUSDT", Direction::Long, 50_000.0, 0.1);
        closed.status = crate::types::TradeStatus::Closed;
        api.with_state(|state| state.closed_trades = vec![closed.clone()]);
        api.fail_times("closed_trades", 2);

        refresher.refresh(RefreshTarget::ClosedTrades).await.unwrap();

        assert_eq!(api.calls("closed_trades"), 3);
        assert_eq!(reconciler.snapshot().closed_trades, vec![closed]);
        assert_eq!(reconciler.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn test_exhausted_refresh_only_sets_error() {
        let (api, reconciler, refresher) = setup();
        api.with_state(|state| {
            state.portfolio = PortfolioSnapshot {
                balance: 1.0,
                ..Default::default()
            }
        });
        api.fail_times("portfolio", 5);

        assert!(refresher.refresh(RefreshTarget::Portfolio).await.is_err());

        let state = reconciler.snapshot();
        assert_eq!(api.calls("portfolio"), 3);
        assert_eq!(state.portfolio, PortfolioSnapshot::default());
        assert!(state.last_error.unwrap().contains("portfolio"));
    }

    #[tokio::test]
    async fn test_status_is_single_attempt_and_silent() {
        let (api, reconciler, refresher) = setup();
        api.fail_times("status", 1);

        assert!(refresher.refresh(RefreshTarget::Status).await.is_err());

        assert_eq!(api.calls("status"), 1);
        assert_eq!(reconciler.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn test_full_plan_loads_everything() {
        let (api, reconciler, refresher) = setup();
        api.with_state(|state| {
            state.open_trades = vec![open_trade("t1", "ETHUSDT", Direction::Short, 3_000.0, 1.0)];
            state.status.is_running = true;
        });

        refresher.run(&RefreshPlan::full()).await;

        let state = reconciler.snapshot();
        assert_eq!(state.open_trades.len(), 1);
        assert!(state.service.unwrap().is_running);
        for method in [
            "portfolio",
            "open_trades",
            "closed_trades",
            "pending_orders",
            "status",
            "settings",
            "symbols",
        ] {
            assert_eq!(api.calls(method), 1, "{method}");
        }
    }
}
