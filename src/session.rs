use std::{
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

use crate::{
    errors::WsResult,
    events::EventRouter,
    orders::{OrderFlow, PlaceOutcome},
    reconciler::{DriftCorrection, Reconciler, RefreshPlan, RefreshTarget},
    refresh::Refresher,
    signals::SignalDeduplicator,
    trading_client::{Result, RetryPolicy, TradingApi},
    types::{
        AiSignal, ConnectionStatus, DashboardState, OrderId, OrderRequest, Settings,
        StopLossTakeProfit, Symbol, TradeId,
    },
    ws_client::{ConnectionManager, FrameReceiver, WsConfig},
};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Everything a session needs besides the backend client.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub ws: WsConfig,
    pub retry: RetryPolicy,
    pub drift: DriftCorrection,
    pub signals: SignalDeduplicator,
    /// Best-effort service status polling; `None` disables it.
    pub status_poll_interval: Option<Duration>,
}

/// One dashboard's view of the trading backend.
///
/// `start` opens the socket, starts the routing and mirroring tasks and loads
/// every category once. `stop` tears all of it down and freezes the state.
/// A stopped session cannot be restarted.
pub struct TradingSession {
    api: Arc<dyn TradingApi>,
    reconciler: Reconciler,
    connection: ConnectionManager,
    router: EventRouter,
    refresher: Refresher,
    orders: OrderFlow,
    signals: SignalDeduplicator,
    status_poll_interval: Option<Duration>,
    frames: Mutex<Option<FrameReceiver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    phase: AtomicU8,
}

impl TradingSession {
    pub fn new(api: Arc<dyn TradingApi>, options: SessionOptions) -> WsResult<Self> {
        let (connection, frames) = ConnectionManager::new(options.ws)?;
        let reconciler = Reconciler::new(options.drift);
        let router = EventRouter::new(reconciler.clone(), options.signals);
        let refresher = Refresher::new(api.clone(), reconciler.clone(), options.retry);
        let orders = OrderFlow::new(api.clone(), reconciler.clone(), refresher.clone());

        Ok(Self {
            api,
            reconciler,
            connection,
            router,
            refresher,
            orders,
            signals: options.signals,
            status_poll_interval: options.status_poll_interval,
            frames: Mutex::new(Some(frames)),
            tasks: Mutex::new(Vec::new()),
            phase: AtomicU8::new(IDLE),
        })
    }

    pub fn is_running(&self) -> bool {
        self.phase.load(Ordering::Acquire) == RUNNING
    }

    pub async fn start(&self) {
        if self
            .phase
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("session_start_skipped");
            return;
        }
        tracing::info!(url = %self.connection.url(), "session_start");

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(frames) = self.frames.lock().await.take() {
                tasks.push(tokio::spawn(route_frames(
                    self.router.clone(),
                    self.refresher.clone(),
                    frames,
                )));
            }
            tasks.push(tokio::spawn(mirror_connection(
                self.connection.subscribe(),
                self.reconciler.clone(),
            )));
            if let Some(interval) = self.status_poll_interval {
                tasks.push(tokio::spawn(poll_status(self.refresher.clone(), interval)));
            }
        }

        self.connection.connect().await;
        self.refresher.run(&RefreshPlan::full()).await;
    }

    pub async fn stop(&self) {
        if self
            .phase
            .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("session_stop_skipped");
            return;
        }

        self.connection.disconnect().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.reconciler.set_connection(self.connection.status());
        self.reconciler.shutdown();
        tracing::info!("session_stopped");
    }

    pub fn snapshot(&self) -> DashboardState {
        self.reconciler.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.reconciler.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> WsResult<bool> {
        self.connection.send_message(payload).await
    }

    pub async fn refresh(&self, plan: RefreshPlan) {
        self.refresher.run(&plan).await;
    }

    pub async fn place_order(&self, request: OrderRequest) -> Result<PlaceOutcome> {
        self.orders.place_order(request).await
    }

    pub async fn confirm_order(&self) -> Result<PlaceOutcome> {
        self.orders.confirm_order().await
    }

    pub fn clear_pending_confirmation(&self) {
        self.orders.clear_pending_confirmation();
    }

    pub async fn close_trade(&self, id: &TradeId) -> Result<()> {
        self.mutate("close_trade", self.api.close_trade(id), RefreshPlan::trades())
            .await
    }

    pub async fn cancel_order(&self, id: &OrderId) -> Result<()> {
        self.mutate(
            "cancel_order",
            self.api.cancel_order(id),
            RefreshPlan::from_targets([RefreshTarget::Orders]),
        )
        .await
    }

    pub async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> Result<()> {
        self.mutate(
            "cancel_all_orders",
            self.api.cancel_all_orders(symbol),
            RefreshPlan::from_targets([RefreshTarget::Orders]),
        )
        .await
    }

    pub async fn update_sltp(&self, symbol: &Symbol, levels: &StopLossTakeProfit) -> Result<()> {
        self.mutate(
            "update_sltp",
            self.api.update_sltp(symbol, levels),
            RefreshPlan::from_targets([RefreshTarget::OpenTrades, RefreshTarget::Orders]),
        )
        .await
    }

    pub async fn start_trading(&self) -> Result<()> {
        self.mutate(
            "start_trading",
            self.api.start(),
            RefreshPlan::from_targets([RefreshTarget::Status]),
        )
        .await
    }

    pub async fn stop_trading(&self) -> Result<()> {
        self.mutate(
            "stop_trading",
            self.api.stop(),
            RefreshPlan::from_targets([RefreshTarget::Status]),
        )
        .await
    }

    pub async fn reset_account(&self) -> Result<()> {
        self.mutate("reset_account", self.api.reset(), RefreshPlan::full())
            .await
    }

    /// Requests a fresh analysis and files the result with the other signals.
    pub async fn analyze(&self, symbol: &Symbol) -> Result<AiSignal> {
        let signal = self
            .mutate("analyze", self.api.analyze(symbol), RefreshPlan::none())
            .await?;
        self.reconciler
            .merge_signals(&self.signals, std::slice::from_ref(&signal));
        Ok(signal)
    }

    pub async fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        let ticket = self.reconciler.begin_refresh(RefreshTarget::Settings);
        let updated = self
            .mutate(
                "update_settings",
                self.api.update_settings(settings),
                RefreshPlan::none(),
            )
            .await?;
        self.reconciler.apply_settings(ticket, updated.clone());
        Ok(updated)
    }

    async fn mutate<T>(
        &self,
        action: &'static str,
        call: impl Future<Output = Result<T>>,
        plan: RefreshPlan,
    ) -> Result<T> {
        match call.await {
            Ok(value) => {
                tracing::info!(action, "action_succeeded");
                self.refresher.run(&plan).await;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(action, error = %err, "action_failed");
                self.reconciler.record_error(err.user_message());
                Err(err)
            }
        }
    }
}

async fn route_frames(router: EventRouter, refresher: Refresher, mut frames: FrameReceiver) {
    while let Some(text) = frames.recv().await {
        let plan = router.route(&text);
        refresher.spawn(plan);
    }
    tracing::debug!("frame_router_finished");
}

async fn mirror_connection(mut status: watch::Receiver<ConnectionStatus>, reconciler: Reconciler) {
    loop {
        let current = status.borrow_and_update().clone();
        reconciler.set_connection(current);
        if status.changed().await.is_err() {
            break;
        }
    }
}

async fn poll_status(refresher: Refresher, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately and the initial full refresh covers it
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let _ = refresher.refresh(RefreshTarget::Status).await;
    }
}
