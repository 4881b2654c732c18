//! Scripted doubles shared by the unit tests.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

use crate::{
    trading_client::{Error, Result, TradingApi},
    types::{
        AiSignal, Direction, MarketSymbol, OrderId, OrderRequest, PendingOrder, PlaceOrderResponse,
        PortfolioSnapshot, ServiceStatus, Settings, SignalDirection, StopLossTakeProfit, Symbol,
        Trade, TradeId, TradeStatus,
    },
};

/// Polls `condition` every 10ms for up to three seconds.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PingMode {
    Answer,
    Ignore,
}

#[derive(Clone, Debug)]
enum ServerCommand {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// In-process websocket server bound to an ephemeral local port.
pub(crate) struct MockSocketServer {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    commands: broadcast::Sender<ServerCommand>,
    received: Mutex<mpsc::UnboundedReceiver<String>>,
    task: JoinHandle<()>,
}

impl MockSocketServer {
    pub(crate) async fn start(mode: PingMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let (commands, _) = broadcast::channel(64);
        let (received_tx, received) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let accepts = accepts.clone();
            let commands = commands.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let command_rx = commands.subscribe();
                    let Ok(socket) = accept_async(stream).await else {
                        continue;
                    };
                    accepts.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_connection(
                        socket,
                        command_rx,
                        received_tx.clone(),
                        mode,
                    ));
                }
            }
        });

        Self {
            addr,
            accepts,
            commands,
            received: Mutex::new(received),
            task,
        }
    }

    pub(crate) fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Sends a text frame to every connected client.
    pub(crate) fn push(&self, text: &str) {
        let _ = self.commands.send(ServerCommand::Text(text.to_string()));
    }

    pub(crate) fn push_binary(&self, bytes: Vec<u8>) {
        let _ = self.commands.send(ServerCommand::Binary(bytes));
    }

    pub(crate) fn close_all(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }

    /// Next non-heartbeat text frame a client sent.
    pub(crate) async fn next_received(&self) -> Option<String> {
        let mut received = self.received.lock().await;
        timeout(Duration::from_secs(3), received.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for MockSocketServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn frame_type(text: &str) -> Option<String> {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("type").and_then(Value::as_str).map(str::to_owned))
}

async fn serve_connection(
    mut socket: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut commands: broadcast::Receiver<ServerCommand>,
    received: mpsc::UnboundedSender<String>,
    mode: PingMode,
) {
    loop {
        tokio::select! {
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if frame_type(&text).as_deref() == Some("ping") {
                        if mode == PingMode::Answer {
                            let pong = r#"{"type":"pong"}"#.to_string();
                            if socket.send(Message::Text(pong)).await.is_err() {
                                break;
                            }
                        }
                        continue;
                    }
                    let _ = received.send(text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(ServerCommand::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerCommand::Binary(bytes)) => {
                    if socket.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerCommand::Close) => {
                    let _ = socket.close(None).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

pub(crate) fn open_trade(id: &str, symbol: &str, direction: Direction, entry: f64, qty: f64) -> Trade {
    Trade {
        id: TradeId::from(id),
        symbol: Symbol::from(symbol),
        direction,
        status: TradeStatus::Open,
        entry_price: entry,
        exit_price: None,
        quantity: qty,
        leverage: 1.0,
        pnl: 0.0,
        opened_at: None,
        closed_at: None,
    }
}

/// Canned backend data plus knobs the tests turn.
pub(crate) struct FakeState {
    pub(crate) portfolio: PortfolioSnapshot,
    pub(crate) open_trades: Vec<Trade>,
    pub(crate) closed_trades: Vec<Trade>,
    pub(crate) orders: Vec<PendingOrder>,
    pub(crate) status: ServiceStatus,
    pub(crate) settings: Settings,
    pub(crate) symbols: Vec<MarketSymbol>,
    /// Lifetime of issued confirmation tokens; negative issues expired ones.
    pub(crate) confirmation_ttl: chrono::Duration,
    /// Execute untokened orders directly instead of issuing a challenge.
    pub(crate) execute_immediately: bool,
    /// Reject tokened submissions with this message.
    pub(crate) reject_with: Option<String>,
    pub(crate) last_order: Option<OrderRequest>,
    issued_tokens: u32,
    failures: HashMap<&'static str, u32>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            portfolio: PortfolioSnapshot::default(),
            open_trades: Vec::new(),
            closed_trades: Vec::new(),
            orders: Vec::new(),
            status: ServiceStatus::default(),
            settings: Settings::new(),
            symbols: Vec::new(),
            confirmation_ttl: chrono::Duration::seconds(60),
            execute_immediately: false,
            reject_with: None,
            last_order: None,
            issued_tokens: 0,
            failures: HashMap::new(),
        }
    }
}

/// [`TradingApi`] double: serves [`FakeState`] and counts calls per method.
#[derive(Default)]
pub(crate) struct FakeApi {
    state: StdMutex<FakeState>,
    calls: StdMutex<HashMap<&'static str, u32>>,
}

impl FakeApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_state(&self, edit: impl FnOnce(&mut FakeState)) {
        edit(&mut self.state.lock().unwrap());
    }

    /// Makes the next `times` calls to `method` fail with a transport error.
    pub(crate) fn fail_times(&self, method: &'static str, times: u32) {
        self.state.lock().unwrap().failures.insert(method, times);
    }

    pub(crate) fn calls(&self, method: &str) -> u32 {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub(crate) fn last_order(&self) -> Option<OrderRequest> {
        self.state.lock().unwrap().last_order.clone()
    }

    fn enter(&self, method: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
        let mut state = self.state.lock().unwrap();
        match state.failures.get_mut(method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::Transport(format!("{method} unavailable")))
            }
            _ => Ok(()),
        }
    }

    fn read<T>(&self, method: &'static str, pick: impl FnOnce(&FakeState) -> T) -> Result<T> {
        self.enter(method)?;
        Ok(pick(&self.state.lock().unwrap()))
    }
}

#[async_trait]
impl TradingApi for FakeApi {
    async fn status(&self) -> Result<ServiceStatus> {
        self.read("status", |state| state.status.clone())
    }

    async fn portfolio(&self) -> Result<PortfolioSnapshot> {
        self.read("portfolio", |state| state.portfolio.clone())
    }

    async fn open_trades(&self) -> Result<Vec<Trade>> {
        self.read("open_trades", |state| state.open_trades.clone())
    }

    async fn closed_trades(&self) -> Result<Vec<Trade>> {
        self.read("closed_trades", |state| state.closed_trades.clone())
    }

    async fn pending_orders(&self) -> Result<Vec<PendingOrder>> {
        self.read("pending_orders", |state| state.orders.clone())
    }

    async fn settings(&self) -> Result<Settings> {
        self.read("settings", |state| state.settings.clone())
    }

    async fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        self.enter("update_settings")?;
        let mut state = self.state.lock().unwrap();
        state.settings.extend(settings.clone());
        Ok(state.settings.clone())
    }

    async fn symbols(&self) -> Result<Vec<MarketSymbol>> {
        self.read("symbols", |state| state.symbols.clone())
    }

    async fn start(&self) -> Result<()> {
        self.enter("start")?;
        self.state.lock().unwrap().status.is_running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.enter("stop")?;
        self.state.lock().unwrap().status.is_running = false;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.enter("reset")?;
        let mut state = self.state.lock().unwrap();
        state.open_trades.clear();
        state.closed_trades.clear();
        state.orders.clear();
        Ok(())
    }

    async fn close_trade(&self, id: &TradeId) -> Result<()> {
        self.enter("close_trade")?;
        let mut state = self.state.lock().unwrap();
        let Some(index) = state.open_trades.iter().position(|trade| &trade.id == id) else {
            return Err(Error::Rejected(format!("Trade {id} not found")));
        };
        let mut trade = state.open_trades.remove(index);
        trade.status = TradeStatus::Closed;
        state.closed_trades.push(trade);
        Ok(())
    }

    async fn update_sltp(&self, _symbol: &Symbol, _levels: &StopLossTakeProfit) -> Result<()> {
        self.enter("update_sltp")
    }

    async fn analyze(&self, symbol: &Symbol) -> Result<AiSignal> {
        self.enter("analyze")?;
        Ok(AiSignal {
            id: format!("analysis-{symbol}"),
            symbol: symbol.clone(),
            signal: SignalDirection::Hold,
            confidence: 0.5,
            reasoning: "range bound".to_string(),
            timestamp: Utc::now(),
            market_analysis: None,
            risk_assessment: None,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlaceOrderResponse> {
        self.enter("place_order")?;
        let mut state = self.state.lock().unwrap();
        state.last_order = Some(request.clone());

        if request.confirmation_token.is_none() && !state.execute_immediately {
            state.issued_tokens += 1;
            return Ok(PlaceOrderResponse {
                requires_confirmation: true,
                confirmation_token: Some(format!("tok-{}", state.issued_tokens)),
                expires_at: Some(Utc::now() + state.confirmation_ttl),
                summary: Some(format!(
                    "{:?} {} {}",
                    request.side, request.quantity, request.symbol
                )),
                order: None,
                trade: None,
            });
        }

        if let Some(message) = state.reject_with.clone() {
            return Err(Error::Rejected(message));
        }

        let order = PendingOrder {
            id: OrderId::new(format!("o-{}", state.orders.len() + 1)),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            status: Some("open".to_string()),
            created_at: Some(Utc::now()),
        };
        state.orders.push(order.clone());
        Ok(PlaceOrderResponse {
            order: Some(order),
            ..Default::default()
        })
    }

    async fn cancel_order(&self, id: &OrderId) -> Result<()> {
        self.enter("cancel_order")?;
        self.state
            .lock()
            .unwrap()
            .orders
            .retain(|order| &order.id != id);
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> Result<()> {
        self.enter("cancel_all_orders")?;
        let mut state = self.state.lock().unwrap();
        match symbol {
            Some(symbol) => state.orders.retain(|order| &order.symbol != symbol),
            None => state.orders.clear(),
        }
        Ok(())
    }
}
