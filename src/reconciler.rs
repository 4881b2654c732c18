//! Canonical dashboard state and every way it is allowed to change.
//!
//! All writes go through a single `watch` sender so readers always observe a
//! complete snapshot. Three kinds of update exist:
//!
//! * optimistic tick patches, which only touch open-trade `pnl`, the latest
//!   price map and the display metrics;
//! * field merges from streamed performance updates;
//! * authoritative REST replacements, guarded by per-target refresh tickets so
//!   a slow response can never overwrite a newer one.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    signals::SignalDeduplicator,
    types::{
        AiSignal, ConnectionStatus, DashboardState, MarketSymbol, PendingOrder,
        PendingOrderConfirmation, PortfolioSnapshot, PortfolioUpdate, PriceTick, ServiceStatus,
        Settings, Trade,
    },
};

/// How optimistic P&L is periodically corrected against the backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DriftCorrection {
    /// Each tick triggers a full refresh with probability `p`.
    Probabilistic { probability: f64 },
    /// A full refresh is forced after every `n` ticks.
    EveryNTicks { ticks: u32 },
}

impl Default for DriftCorrection {
    fn default() -> Self {
        DriftCorrection::Probabilistic { probability: 0.05 }
    }
}

/// A category of state that can be replaced from REST.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefreshTarget {
    Portfolio,
    OpenTrades,
    ClosedTrades,
    Orders,
    Status,
    Settings,
    Symbols,
}

impl RefreshTarget {
    pub const ALL: [RefreshTarget; 7] = [
        RefreshTarget::Portfolio,
        RefreshTarget::OpenTrades,
        RefreshTarget::ClosedTrades,
        RefreshTarget::Orders,
        RefreshTarget::Status,
        RefreshTarget::Settings,
        RefreshTarget::Symbols,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RefreshTarget::Portfolio => "portfolio",
            RefreshTarget::OpenTrades => "trades/open",
            RefreshTarget::ClosedTrades => "trades/closed",
            RefreshTarget::Orders => "orders",
            RefreshTarget::Status => "status",
            RefreshTarget::Settings => "settings",
            RefreshTarget::Symbols => "market/symbols",
        }
    }
}

/// Set of categories a single event or user action wants refreshed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshPlan(BTreeSet<RefreshTarget>);

impl RefreshPlan {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self(RefreshTarget::ALL.into_iter().collect())
    }

    /// Open trades, closed trades and portfolio.
    pub fn trades() -> Self {
        Self::from_targets([
            RefreshTarget::OpenTrades,
            RefreshTarget::ClosedTrades,
            RefreshTarget::Portfolio,
        ])
    }

    pub fn from_targets(targets: impl IntoIterator<Item = RefreshTarget>) -> Self {
        Self(targets.into_iter().collect())
    }

    pub fn with(mut self, target: RefreshTarget) -> Self {
        self.0.insert(target);
        self
    }

    pub fn merge(&mut self, other: RefreshPlan) {
        self.0.extend(other.0);
    }

    pub fn contains(&self, target: RefreshTarget) -> bool {
        self.0.contains(&target)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RefreshTarget> + '_ {
        self.0.iter().copied()
    }
}

/// Proof that a refresh was started; responses carrying an older ticket
/// than the last one applied for the same target are discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshTicket {
    pub target: RefreshTarget,
    seq: u64,
}

struct Inner {
    state: watch::Sender<DashboardState>,
    alive: AtomicBool,
    drift: DriftCorrection,
    ticks_since_refresh: AtomicU32,
    next_ticket: AtomicU64,
}

/// Cheap-to-clone handle over the single dashboard state container.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(drift: DriftCorrection) -> Self {
        let (state, _) = watch::channel(DashboardState::default());
        Self {
            inner: Arc::new(Inner {
                state,
                alive: AtomicBool::new(true),
                drift,
                ticks_since_refresh: AtomicU32::new(0),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    pub fn snapshot(&self) -> DashboardState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.inner.state.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Marks the reconciler dead; every later update is ignored.
    pub fn shutdown(&self) {
        if self.inner.alive.swap(false, Ordering::AcqRel) {
            tracing::debug!("reconciler_shutdown");
        }
    }

    fn update(&self, apply: impl FnOnce(&mut DashboardState)) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.inner.state.send_modify(apply);
        true
    }

    /// Optimistically re-prices open trades on the tick's symbol.
    ///
    /// Returns `true` when the drift guard asks for a full refresh.
    pub fn apply_tick(&self, tick: &PriceTick) -> bool {
        let applied = self.update(|state| {
            state.last_prices.insert(tick.symbol.clone(), tick.price);
            for trade in state
                .open_trades
                .iter_mut()
                .filter(|trade| trade.is_open() && trade.symbol == tick.symbol)
            {
                trade.pnl = trade.pnl_at(tick.price);
            }
            recompute_display(state);
            state.last_activity = Some(Utc::now());
        });

        applied && self.drift_check()
    }

    fn drift_check(&self) -> bool {
        match self.inner.drift {
            DriftCorrection::Probabilistic { probability } => {
                let probability = probability.clamp(0.0, 1.0);
                rand::thread_rng().gen_bool(probability)
            }
            DriftCorrection::EveryNTicks { ticks } => {
                let ticks = ticks.max(1);
                let seen = self.inner.ticks_since_refresh.fetch_add(1, Ordering::AcqRel) + 1;
                if seen >= ticks {
                    self.inner.ticks_since_refresh.store(0, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Patches only the fields present in a streamed performance update.
    pub fn merge_portfolio(&self, update: &PortfolioUpdate) {
        self.update(|state| {
            update.apply_to(&mut state.portfolio);
            if let Some(unrealized) = update.unrealized_pnl {
                state.display.unrealized_pnl = unrealized;
            }
            match update.equity {
                Some(equity) => state.display.equity = equity,
                None => {
                    if update.balance.is_some() {
                        state.display.equity =
                            state.portfolio.balance + state.display.unrealized_pnl;
                    }
                }
            }
            state.last_activity = Some(Utc::now());
        });
    }

    pub fn begin_refresh(&self, target: RefreshTarget) -> RefreshTicket {
        let seq = self.inner.next_ticket.fetch_add(1, Ordering::AcqRel);
        RefreshTicket { target, seq }
    }

    fn apply_ticketed(
        &self,
        ticket: RefreshTicket,
        apply: impl FnOnce(&mut DashboardState),
    ) -> bool {
        if !self.is_alive() {
            return false;
        }

        let mut applied = false;
        self.inner.state.send_if_modified(|state| {
            let mark = state.refresh_marks.entry(ticket.target).or_default();
            if ticket.seq <= *mark {
                return false;
            }
            *mark = ticket.seq;
            apply(state);
            applied = true;
            true
        });

        if !applied {
            tracing::debug!(
                refresh = ticket.target.label(),
                seq = ticket.seq,
                "stale_refresh_discarded"
            );
        }
        applied
    }

    /// Replaces the portfolio snapshot. Display metrics are rederived from the
    /// current open trades and the new balance, so they never disagree with
    /// tick-patched trade P&L when the trades leg of a refresh failed.
    pub fn apply_portfolio(&self, ticket: RefreshTicket, portfolio: PortfolioSnapshot) -> bool {
        self.apply_ticketed(ticket, |state| {
            state.portfolio = portfolio;
            recompute_display(state);
        })
    }

    pub fn apply_open_trades(&self, ticket: RefreshTicket, trades: Vec<Trade>) -> bool {
        let applied = self.apply_ticketed(ticket, |state| {
            state.open_trades = trades;
            recompute_display(state);
        });
        if applied {
            self.inner.ticks_since_refresh.store(0, Ordering::Release);
        }
        applied
    }

    pub fn apply_closed_trades(&self, ticket: RefreshTicket, trades: Vec<Trade>) -> bool {
        self.apply_ticketed(ticket, |state| state.closed_trades = trades)
    }

    pub fn apply_orders(&self, ticket: RefreshTicket, orders: Vec<PendingOrder>) -> bool {
        self.apply_ticketed(ticket, |state| state.pending_orders = orders)
    }

    pub fn apply_status(&self, ticket: RefreshTicket, status: ServiceStatus) -> bool {
        self.apply_ticketed(ticket, |state| state.service = Some(status))
    }

    pub fn apply_settings(&self, ticket: RefreshTicket, settings: Settings) -> bool {
        self.apply_ticketed(ticket, |state| state.settings = settings)
    }

    pub fn apply_symbols(&self, ticket: RefreshTicket, symbols: Vec<MarketSymbol>) -> bool {
        self.apply_ticketed(ticket, |state| state.symbols = symbols)
    }

    /// Runs incoming signals through `dedup` together with the current set.
    pub fn merge_signals(&self, dedup: &SignalDeduplicator, incoming: &[AiSignal]) {
        self.update(|state| {
            state.signals = dedup.reduce(&state.signals, incoming);
            state.last_activity = Some(Utc::now());
        });
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| state.last_error = Some(message));
    }

    pub fn touch_activity(&self) {
        self.update(|state| state.last_activity = Some(Utc::now()));
    }

    pub fn set_connection(&self, connection: ConnectionStatus) {
        self.update(|state| state.connection = connection);
    }

    pub fn pending_confirmation(&self) -> Option<PendingOrderConfirmation> {
        self.inner.state.borrow().pending_confirmation.clone()
    }

    pub fn set_pending_confirmation(&self, pending: PendingOrderConfirmation) {
        self.update(|state| state.pending_confirmation = Some(pending));
    }

    pub fn clear_pending_confirmation(&self) {
        self.update(|state| state.pending_confirmation = None);
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DriftCorrection::default())
    }
}

fn recompute_display(state: &mut DashboardState) {
    let unrealized: f64 = state
        .open_trades
        .iter()
        .filter(|trade| trade.is_open())
        .map(|trade| trade.pnl)
        .sum();
    state.display.unrealized_pnl = unrealized;
    state.display.equity = state.portfolio.balance + unrealized;
}
