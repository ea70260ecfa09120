//! Per-instrument grid engine
//!
//! One engine owns one ledger. Ticks, order events and stop requests arrive
//! through a single inbox and are handled one at a time; order events never
//! suspend while they mutate the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{decide, CloseKind, EventOutcome, GridDecision, GridThresholds, Ledger};
use crate::config::EngineSettings;
use crate::domain::{
    CloseType, EngineEvent, EngineStatus, InstrumentId, OrderCandidate, OrderEvent, OrderRequest,
};
use crate::error::{GridError, OrderError, Result};
use crate::exchange::{ExecutionAdapter, MarketDataProvider, OrderEventSink};
use crate::signal::{Signal, SignalEvaluator, SignalParams, SignalState};

// ============================================================================
// Reporting types
// ============================================================================

/// Point-in-time view of an engine, published after every event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub instrument: InstrumentId,
    pub status: EngineStatus,
    pub close_type: Option<CloseType>,
    pub open_nums: usize,
    pub open_filled_amount: Decimal,
    pub opened_amount: Decimal,
    pub closed_amount: Decimal,
    pub position_average_price: Decimal,
    pub realized_profit: Decimal,
    pub session_pnl: Decimal,
    pub cumulative_fee: Decimal,
    pub retries: u32,
    pub last_signal: Option<Signal>,
    pub last_signal_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_action_at: DateTime<Utc>,
    /// Holds inventory or has orders in flight
    pub is_trading: bool,
}

/// Final account of a terminated engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineReport {
    pub snapshot: EngineSnapshot,
    pub closed_at: DateTime<Utc>,
    pub unmatched_events: u64,
    pub duplicate_events: u64,
}

/// Sent to the controller once an engine reaches `Terminated`
#[derive(Debug, Clone)]
pub struct ShutdownNotice {
    pub instrument: InstrumentId,
    pub close_type: Option<CloseType>,
    pub report: EngineReport,
}

/// Bounded, non-blocking delivery of shutdown notices
#[derive(Debug, Clone)]
pub struct ShutdownNotifier {
    tx: mpsc::Sender<ShutdownNotice>,
    timeout: Duration,
}

impl ShutdownNotifier {
    pub fn new(tx: mpsc::Sender<ShutdownNotice>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    /// Waits at most `timeout` for queue space; the notice is dropped on overflow
    pub async fn notify(&self, notice: ShutdownNotice) -> bool {
        let instrument = notice.instrument.clone();
        match self.tx.send_timeout(notice, self.timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(%instrument, "Shutdown queue full, dropping notice");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(%instrument, "Shutdown queue closed, dropping notice");
                false
            }
        }
    }
}

/// Result of one control pass
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A collaborator call failed; the pass is retried on the next tick
    Skipped,
    /// Signal timestamp already acted on
    Stale,
    Acted(GridDecision),
    /// Shutting down, close order still outstanding
    Waiting,
    /// Shutting down, liquidation submitted
    Liquidating,
    Terminated,
}

// ============================================================================
// Engine
// ============================================================================

/// Everything an engine is built from
#[derive(Clone)]
pub struct EngineContext {
    pub instrument: InstrumentId,
    pub thresholds: GridThresholds,
    pub settings: EngineSettings,
    pub signal: Arc<dyn SignalEvaluator>,
    pub signal_params: SignalParams,
}

pub struct GridEngine {
    instrument: InstrumentId,
    thresholds: GridThresholds,
    settings: EngineSettings,
    signal: Arc<dyn SignalEvaluator>,
    signal_params: SignalParams,
    exchange: Arc<dyn ExecutionAdapter>,
    market_data: Arc<dyn MarketDataProvider>,
    ledger: Ledger,
    signal_state: SignalState,
    status: EngineStatus,
    close_type: Option<CloseType>,
    retries: u32,
    created_at: DateTime<Utc>,
    last_action_at: DateTime<Utc>,
    unmatched_events: u64,
    duplicate_events: u64,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    notifier: Option<ShutdownNotifier>,
}

impl GridEngine {
    pub fn new(
        context: EngineContext,
        exchange: Arc<dyn ExecutionAdapter>,
        market_data: Arc<dyn MarketDataProvider>,
    ) -> Self {
        let now = Utc::now();
        let ledger = Ledger::new(context.thresholds.side, context.settings.amount_epsilon);
        let (snapshot_tx, _) = watch::channel(Self::empty_snapshot(&context.instrument, now));
        let engine = Self {
            instrument: context.instrument,
            thresholds: context.thresholds,
            settings: context.settings,
            signal: context.signal,
            signal_params: context.signal_params,
            exchange,
            market_data,
            ledger,
            signal_state: SignalState::default(),
            status: EngineStatus::NotStarted,
            close_type: None,
            retries: 0,
            created_at: now,
            last_action_at: now,
            unmatched_events: 0,
            duplicate_events: 0,
            snapshot_tx,
            notifier: None,
        };
        engine.snapshot_tx.send_replace(engine.snapshot());
        engine
    }

    pub fn with_notifier(mut self, notifier: ShutdownNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn empty_snapshot(instrument: &InstrumentId, now: DateTime<Utc>) -> EngineSnapshot {
        EngineSnapshot {
            instrument: instrument.clone(),
            status: EngineStatus::NotStarted,
            close_type: None,
            open_nums: 0,
            open_filled_amount: Decimal::ZERO,
            opened_amount: Decimal::ZERO,
            closed_amount: Decimal::ZERO,
            position_average_price: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
            session_pnl: Decimal::ZERO,
            cumulative_fee: Decimal::ZERO,
            retries: 0,
            last_signal: None,
            last_signal_at: None,
            created_at: now,
            last_action_at: now,
            is_trading: false,
        }
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn close_type(&self) -> Option<CloseType> {
        self.close_type
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            instrument: self.instrument.clone(),
            status: self.status,
            close_type: self.close_type,
            open_nums: self.ledger.open_nums(),
            open_filled_amount: self.ledger.open_filled_amount(),
            opened_amount: self.ledger.opened_amount(),
            closed_amount: self.ledger.closed_amount(),
            position_average_price: self.ledger.position_average_price(),
            realized_profit: self.ledger.realized_profit(),
            session_pnl: self.ledger.session_pnl(),
            cumulative_fee: self.ledger.cumulative_fee(),
            retries: self.retries,
            last_signal: self.signal_state.last_signal,
            last_signal_at: self.signal_state.last_timestamp,
            created_at: self.created_at,
            last_action_at: self.last_action_at,
            is_trading: !self.ledger.is_flat(),
        }
    }

    pub fn report(&self) -> EngineReport {
        EngineReport {
            snapshot: self.snapshot(),
            closed_at: Utc::now(),
            unmatched_events: self.unmatched_events,
            duplicate_events: self.duplicate_events,
        }
    }

    /// Single serialized entry point
    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Tick => {
                let outcome = self.tick().await;
                debug!(instrument = %self.instrument, ?outcome, "Control pass done");
            }
            EngineEvent::Order(event) => {
                self.on_order_event(&event);
            }
            EngineEvent::EarlyStop => self.early_stop().await,
            EngineEvent::Refresh => {
                self.refresh().await;
            }
        }
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Consume the inbox until the engine terminates or every sender is gone
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<EngineEvent>) -> EngineReport {
        info!(instrument = %self.instrument, side = %self.thresholds.side, "Grid engine starting");

        while let Some(event) = inbox.recv().await {
            self.handle_event(event).await;
            if self.status.is_terminal() {
                break;
            }
        }

        if !self.status.is_terminal() {
            warn!(
                instrument = %self.instrument,
                status = %self.status,
                "Engine inbox closed before termination"
            );
        }
        self.report()
    }

    // ------------------------------------------------------------------
    // Control pass
    // ------------------------------------------------------------------

    pub async fn tick(&mut self) -> TickOutcome {
        match self.status {
            EngineStatus::NotStarted => {
                if let Some(outcome) = self.preflight().await {
                    return outcome;
                }
                self.running_pass().await
            }
            EngineStatus::Running => self.running_pass().await,
            EngineStatus::ShuttingDown => self.shutdown_pass().await,
            EngineStatus::Terminated => TickOutcome::Terminated,
        }
    }

    /// Budget check before anything is opened. `None` means the engine is now running.
    async fn preflight(&mut self) -> Option<TickOutcome> {
        let price = match self.market_data.last_price(&self.instrument).await {
            Ok(price) => price,
            Err(e) => {
                warn!(instrument = %self.instrument, "Pre-flight price unavailable: {}", e);
                return Some(TickOutcome::Skipped);
            }
        };
        let candidate = OrderCandidate {
            instrument: self.instrument.clone(),
            side: self.thresholds.side.order_side(),
            order_type: self.thresholds.open_order_type,
            amount: self.thresholds.flat_amount(price),
            price,
            leverage: self.thresholds.leverage,
        };
        let tradeable = match self.exchange.adjust_order_candidate(&candidate).await {
            Ok(amount) => amount,
            Err(e) => {
                warn!(instrument = %self.instrument, "Pre-flight budget check failed: {}", e);
                return Some(TickOutcome::Skipped);
            }
        };

        if tradeable <= Decimal::ZERO {
            let err = GridError::InsufficientBalance {
                instrument: self.instrument.to_string(),
            };
            error!(instrument = %self.instrument, "{}", err);
            self.close_type = Some(CloseType::InsufficientBalance);
            self.terminate().await;
            return Some(TickOutcome::Terminated);
        }

        self.transition(EngineStatus::Running);
        info!(instrument = %self.instrument, %price, "Pre-flight passed, engine running");
        None
    }

    async fn running_pass(&mut self) -> TickOutcome {
        let candles = match self
            .market_data
            .get_recent_candles(
                &self.instrument,
                &self.thresholds.signal_interval,
                self.thresholds.max_records,
            )
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!(instrument = %self.instrument, "Candles unavailable: {}", e);
                return TickOutcome::Skipped;
            }
        };

        let result = match self.signal.evaluate(&candles, &self.signal_params) {
            Ok(result) => result,
            Err(e) => {
                warn!(instrument = %self.instrument, signal = self.signal.name(), "Signal evaluation failed: {}", e);
                return TickOutcome::Skipped;
            }
        };
        if self
            .signal_state
            .last_timestamp
            .is_some_and(|seen| result.timestamp <= seen)
        {
            return TickOutcome::Stale;
        }

        let last_price = match self.market_data.last_price(&self.instrument).await {
            Ok(price) => price,
            Err(e) => {
                warn!(instrument = %self.instrument, "Last price unavailable: {}", e);
                return TickOutcome::Skipped;
            }
        };
        self.signal_state.observe(&result);

        let decision = decide(&self.ledger, result.signal, last_price, &self.thresholds);
        info!(
            instrument = %self.instrument,
            signal = %result.signal,
            signal_at = %result.timestamp,
            %last_price,
            rungs = self.ledger.open_nums(),
            avg_price = %self.ledger.position_average_price(),
            ?decision,
            "Signal updated"
        );
        self.execute(&decision, last_price).await;
        TickOutcome::Acted(decision)
    }

    async fn execute(&mut self, decision: &GridDecision, last_price: Decimal) {
        match decision {
            GridDecision::Open { amount } | GridDecision::Increment { amount, .. } => {
                self.submit_open(*amount, last_price).await;
            }
            GridDecision::CloseAll { .. } => {
                self.liquidate(last_price).await;
            }
            GridDecision::Decrement { amount, rung_ids } => {
                self.submit_close(CloseKind::Partial, rung_ids.clone(), *amount, last_price)
                    .await;
            }
            GridDecision::Hold(_) => {}
        }
    }

    async fn shutdown_pass(&mut self) -> TickOutcome {
        if self.ledger.is_drained() {
            self.cancel_open_orders().await;
            self.terminate().await;
            return TickOutcome::Terminated;
        }
        if self.ledger.close_in_flight() {
            debug!(instrument = %self.instrument, "Waiting for close order");
            return TickOutcome::Waiting;
        }

        self.cancel_open_orders().await;
        let price = match self.market_data.last_price(&self.instrument).await {
            Ok(price) => price,
            Err(e) => {
                warn!(instrument = %self.instrument, "Liquidation price unavailable: {}", e);
                return TickOutcome::Skipped;
            }
        };
        if self.liquidate(price).await {
            self.retries += 1;
            self.check_retry_ceiling();
        }
        TickOutcome::Liquidating
    }

    // ------------------------------------------------------------------
    // Stop requests
    // ------------------------------------------------------------------

    /// Cancel open orders, liquidate, then drain
    pub async fn early_stop(&mut self) {
        match self.status {
            EngineStatus::NotStarted => {
                info!(instrument = %self.instrument, "Early stop before start");
                self.close_type = Some(CloseType::EarlyStop);
                self.terminate().await;
            }
            EngineStatus::Running => {
                info!(instrument = %self.instrument, "Early stop requested");
                self.begin_shutdown(CloseType::EarlyStop);
                self.cancel_open_orders().await;
                if !self.ledger.is_drained() && !self.ledger.close_in_flight() {
                    match self.market_data.last_price(&self.instrument).await {
                        Ok(price) => {
                            self.liquidate(price).await;
                        }
                        Err(e) => warn!(
                            instrument = %self.instrument,
                            "Liquidation deferred, price unavailable: {}", e
                        ),
                    }
                }
            }
            EngineStatus::ShuttingDown | EngineStatus::Terminated => {
                debug!(instrument = %self.instrument, status = %self.status, "Early stop ignored");
            }
        }
    }

    /// Retire the engine if it is idle. Returns whether it terminated.
    pub async fn refresh(&mut self) -> bool {
        let idle = matches!(self.status, EngineStatus::NotStarted | EngineStatus::Running);
        if !idle || !self.ledger.is_flat() {
            debug!(instrument = %self.instrument, "Refresh ignored, engine is trading");
            return false;
        }
        info!(instrument = %self.instrument, "Refreshing idle engine");
        if self.status == EngineStatus::Running {
            self.begin_shutdown(CloseType::Liquidated);
        } else {
            self.close_type = Some(CloseType::Liquidated);
        }
        self.terminate().await;
        true
    }

    // ------------------------------------------------------------------
    // Order events
    // ------------------------------------------------------------------

    /// Reconcile one execution event. Never suspends.
    pub fn on_order_event(&mut self, event: &OrderEvent) -> EventOutcome {
        let outcome = self.ledger.apply(event);
        match outcome {
            EventOutcome::Acknowledged => {
                debug!(instrument = %self.instrument, order_id = event.order_id(), "Order acknowledged");
            }
            EventOutcome::OpenFilled => {
                self.last_action_at = Utc::now();
                debug!(
                    instrument = %self.instrument,
                    order_id = event.order_id(),
                    avg_price = %self.ledger.position_average_price(),
                    filled = %self.ledger.open_filled_amount(),
                    "Opening fill"
                );
            }
            EventOutcome::OpenFailed { had_fills } => {
                debug!(instrument = %self.instrument, order_id = event.order_id(), had_fills, "Opening order retired");
            }
            EventOutcome::CloseFilled { kind, confirmed } => {
                self.last_action_at = Utc::now();
                if confirmed {
                    self.retries = 0;
                    info!(
                        instrument = %self.instrument,
                        order_id = event.order_id(),
                        ?kind,
                        realized = %self.ledger.realized_profit(),
                        session_pnl = %self.ledger.session_pnl(),
                        rungs = self.ledger.open_nums(),
                        "Close confirmed"
                    );
                }
            }
            EventOutcome::CloseFailed { kind } => {
                self.retries += 1;
                warn!(
                    instrument = %self.instrument,
                    order_id = event.order_id(),
                    ?kind,
                    retries = self.retries,
                    "Close order failed"
                );
                self.check_retry_ceiling();
            }
            EventOutcome::Duplicate => {
                self.duplicate_events += 1;
                debug!(instrument = %self.instrument, order_id = event.order_id(), "Duplicate order event ignored");
            }
            EventOutcome::Unmatched => {
                self.unmatched_events += 1;
                warn!(instrument = %self.instrument, order_id = event.order_id(), "Order event matches no tracked order");
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    async fn submit_open(&mut self, amount: Decimal, price: Decimal) -> bool {
        if !self.status.can_grow_position() {
            debug!(instrument = %self.instrument, status = %self.status, "Not growing position");
            return false;
        }
        if amount <= Decimal::ZERO {
            return false;
        }
        let request = OrderRequest::open(
            self.instrument.clone(),
            self.thresholds.side,
            self.thresholds.open_order_type,
            amount,
            price,
        );
        match self.exchange.place_order(&request).await {
            Ok(Some(order_id)) => {
                info!(instrument = %self.instrument, order_id = %order_id, %amount, %price, "Opening order placed");
                self.ledger.add_open(order_id, price, amount);
                self.last_action_at = Utc::now();
                true
            }
            Ok(None) => {
                self.record_submission_failure("opening order refused");
                false
            }
            Err(e) => {
                self.record_submission_failure(&e.to_string());
                false
            }
        }
    }

    /// Submit a full liquidation of every filled rung
    async fn liquidate(&mut self, price: Decimal) -> bool {
        let (rung_ids, amount) = self.ledger.full_close_targets();
        if amount <= self.settings.amount_epsilon {
            return false;
        }
        self.submit_close(CloseKind::Full, rung_ids, amount, price).await
    }

    async fn submit_close(
        &mut self,
        kind: CloseKind,
        rung_ids: Vec<String>,
        amount: Decimal,
        price: Decimal,
    ) -> bool {
        let request = OrderRequest::close(self.instrument.clone(), self.thresholds.side, amount, price);
        match self.exchange.place_order(&request).await {
            Ok(Some(order_id)) => {
                info!(instrument = %self.instrument, order_id = %order_id, ?kind, %amount, %price, "Close order placed");
                self.ledger.begin_close(order_id, kind, rung_ids, amount);
                self.last_action_at = Utc::now();
                true
            }
            Ok(None) => {
                self.record_submission_failure("close order refused");
                false
            }
            Err(e) => {
                self.record_submission_failure(&e.to_string());
                false
            }
        }
    }

    async fn cancel_open_orders(&mut self) {
        for order_id in self.ledger.active_open_orders() {
            match self.exchange.cancel_order(&self.instrument, &order_id).await {
                Ok(true) => {
                    self.ledger.mark_cancelled(&order_id);
                    debug!(instrument = %self.instrument, order_id = %order_id, "Opening order cancelled");
                }
                Ok(false) => {
                    debug!(instrument = %self.instrument, order_id = %order_id, "Opening order already done");
                }
                Err(e) => {
                    warn!(instrument = %self.instrument, order_id = %order_id, "Cancel failed: {}", e);
                }
            }
        }
    }

    fn record_submission_failure(&mut self, reason: &str) {
        self.retries += 1;
        warn!(
            instrument = %self.instrument,
            retries = self.retries,
            max_retries = self.settings.max_retries,
            "Order submission failed: {}", reason
        );
        self.check_retry_ceiling();
    }

    fn check_retry_ceiling(&mut self) {
        if self.retries <= self.settings.max_retries {
            return;
        }
        let exhausted = OrderError::MaxRetriesExceeded {
            attempts: self.retries,
        };
        match self.status {
            EngineStatus::Running => {
                error!(
                    instrument = %self.instrument,
                    error = %exhausted,
                    "Retry budget exhausted, shutting down"
                );
                self.begin_shutdown(CloseType::Failed);
            }
            EngineStatus::ShuttingDown => {
                error!(
                    instrument = %self.instrument,
                    error = %exhausted,
                    left = %self.ledger.open_filled_amount(),
                    "Still draining past retry budget"
                );
            }
            EngineStatus::NotStarted | EngineStatus::Terminated => {}
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn transition(&mut self, target: EngineStatus) -> bool {
        if !self.status.can_transition_to(target) {
            let err = GridError::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            };
            error!(instrument = %self.instrument, "{}", err);
            return false;
        }
        debug!(instrument = %self.instrument, from = %self.status, to = %target, "Engine transition");
        self.status = target;
        true
    }

    /// Leave `Running`; the close type is assigned here exactly once
    fn begin_shutdown(&mut self, close_type: CloseType) {
        if self.transition(EngineStatus::ShuttingDown) && self.close_type.is_none() {
            self.close_type = Some(close_type);
        }
    }

    async fn terminate(&mut self) {
        if !self.transition(EngineStatus::Terminated) {
            return;
        }
        info!(
            instrument = %self.instrument,
            close_type = ?self.close_type,
            session_pnl = %self.ledger.session_pnl(),
            fees = %self.ledger.cumulative_fee(),
            "Engine terminated"
        );
        let report = self.report();
        self.snapshot_tx.send_replace(report.snapshot.clone());
        if let Some(notifier) = &self.notifier {
            notifier
                .notify(ShutdownNotice {
                    instrument: self.instrument.clone(),
                    close_type: self.close_type,
                    report,
                })
                .await;
        }
    }
}

// ============================================================================
// Task wiring
// ============================================================================

/// Controller-side handle of a spawned engine
pub struct EngineHandle {
    instrument: InstrumentId,
    events: mpsc::UnboundedSender<EngineEvent>,
    snapshot: watch::Receiver<EngineSnapshot>,
    task: JoinHandle<EngineReport>,
}

impl EngineHandle {
    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    pub fn send(&self, event: EngineEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| GridError::ChannelClosed(format!("engine inbox for {}", self.instrument)))
    }

    pub fn early_stop(&self) -> Result<()> {
        self.send(EngineEvent::EarlyStop)
    }

    pub fn refresh(&self) -> Result<()> {
        self.send(EngineEvent::Refresh)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<EngineReport> {
        self.task
            .await
            .map_err(|e| GridError::Internal(format!("engine task for {} failed: {}", self.instrument, e)))
    }
}

/// Start the engine task, its ticker and its execution listener
pub fn spawn_engine(engine: GridEngine) -> EngineHandle {
    let instrument = engine.instrument.clone();
    let (tx, rx) = mpsc::unbounded_channel();
    let snapshot = engine.subscribe();
    let exchange = engine.exchange.clone();
    exchange.register_listener(&instrument, OrderEventSink::new(tx.clone()));

    let period = Duration::from_secs(engine.settings.executor_interval_secs.max(1));
    let ticker_tx = tx.clone();
    let ticker = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if ticker_tx.send(EngineEvent::Tick).is_err() {
                break;
            }
        }
    });

    let listener_id = instrument.clone();
    let task = tokio::spawn(async move {
        let report = engine.run(rx).await;
        ticker.abort();
        exchange.unregister_listener(&listener_id);
        report
    });

    EngineHandle {
        instrument,
        events: tx,
        snapshot,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{PaperConfig, PaperExchange, ReplayFeed};
    use crate::domain::{Candle, OrderType, PositionAction, TradeSide};
    use crate::signal::ConstantSignal;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: GridEngine,
        inbox: mpsc::UnboundedReceiver<EngineEvent>,
        paper: Arc<PaperExchange>,
        feed: Arc<ReplayFeed>,
        minute: i64,
    }

    fn instrument() -> InstrumentId {
        InstrumentId::new("binance_perpetual", "DOGE-USDT")
    }

    fn context(max_retries: u32) -> EngineContext {
        EngineContext {
            instrument: instrument(),
            thresholds: GridThresholds {
                side: TradeSide::Long,
                grid_max: 3,
                grid_open: dec!(0.02),
                grid_close: dec!(0.01),
                mart_open: dec!(0.25),
                amount_quote: dec!(50),
                leverage: 10,
                signal_interval: "1m".into(),
                max_records: 10,
                open_order_type: OrderType::Market,
            },
            settings: EngineSettings {
                executor_interval_secs: 1,
                max_retries,
                amount_epsilon: dec!(0.000000001),
            },
            signal: Arc::new(ConstantSignal),
            signal_params: SignalParams::default(),
        }
    }

    fn paper_config(balance: Decimal) -> PaperConfig {
        PaperConfig {
            quote_balance: balance,
            fee_rate: Decimal::ZERO,
            min_notional: dec!(5),
            auto_fill: true,
        }
    }

    async fn harness(paper: PaperExchange, max_retries: u32) -> Harness {
        let paper = Arc::new(paper);
        let feed = Arc::new(ReplayFeed::new());
        let (tx, inbox) = mpsc::unbounded_channel();
        paper.register_listener(&instrument(), OrderEventSink::new(tx));
        let engine = GridEngine::new(context(max_retries), paper.clone(), feed.clone());
        let mut h = Harness {
            engine,
            inbox,
            paper,
            feed,
            minute: 0,
        };
        h.bar(dec!(100)).await;
        h.bar(dec!(100)).await;
        h
    }

    impl Harness {
        /// Append a closed bar so the constant signal carries a new timestamp
        async fn bar(&mut self, price: Decimal) {
            let ts = Utc
                .with_ymd_and_hms(2024, 5, 1, 0, 0, 0)
                .single()
                .expect("valid timestamp")
                + chrono::Duration::minutes(self.minute);
            self.minute += 1;
            self.feed.push_candle(&instrument(), Candle::flat(ts, price)).await;
            self.feed.set_price(&instrument(), price).await;
        }

        async fn drain(&mut self) {
            while let Ok(event) = self.inbox.try_recv() {
                self.engine.handle_event(event).await;
            }
        }

        async fn tick(&mut self) -> TickOutcome {
            let outcome = self.engine.tick().await;
            self.drain().await;
            outcome
        }

        fn set_signal(&mut self, value: f64) {
            self.engine.signal_params = SignalParams::default().with("value", value);
        }
    }

    #[tokio::test]
    async fn test_insufficient_balance_terminates_before_opening() {
        let (tx, mut notices) = mpsc::channel(4);
        let mut h = harness(PaperExchange::new(paper_config(dec!(1))), 3).await;
        h.engine = GridEngine::new(context(3), h.paper.clone(), h.feed.clone())
            .with_notifier(ShutdownNotifier::new(tx, Duration::from_millis(50)));

        assert_eq!(h.tick().await, TickOutcome::Terminated);
        assert_eq!(h.engine.status(), EngineStatus::Terminated);
        assert_eq!(h.engine.close_type(), Some(CloseType::InsufficientBalance));
        assert!(h.paper.submitted().is_empty());

        let notice = notices.try_recv().expect("notice sent");
        assert_eq!(notice.instrument, instrument());
        assert_eq!(notice.close_type, Some(CloseType::InsufficientBalance));
    }

    #[tokio::test]
    async fn test_full_notice_queue_drops_after_bounded_wait() {
        let (tx, mut notices) = mpsc::channel(1);
        let notifier = ShutdownNotifier::new(tx, Duration::from_millis(30));
        let mut h = harness(PaperExchange::new(paper_config(dec!(1))), 3).await;
        let notice = ShutdownNotice {
            instrument: instrument(),
            close_type: None,
            report: h.engine.report(),
        };

        assert!(notifier.notify(notice.clone()).await);
        let started = std::time::Instant::now();
        assert!(!notifier.notify(notice).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Termination completes even though its notice cannot be queued
        h.engine = GridEngine::new(context(3), h.paper.clone(), h.feed.clone())
            .with_notifier(notifier);
        assert_eq!(h.tick().await, TickOutcome::Terminated);
        assert_eq!(h.engine.close_type(), Some(CloseType::InsufficientBalance));

        assert!(notices.try_recv().is_ok());
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_bar_never_decides_twice() {
        let mut h = harness(PaperExchange::new(paper_config(dec!(1000))), 3).await;

        assert!(matches!(h.tick().await, TickOutcome::Acted(GridDecision::Open { .. })));
        assert_eq!(h.tick().await, TickOutcome::Stale);
        assert_eq!(h.tick().await, TickOutcome::Stale);
        assert_eq!(h.paper.submitted().len(), 1);
        assert_eq!(h.engine.ledger().open_filled_amount(), dec!(0.5));
    }

    #[tokio::test]
    async fn test_replayed_fill_does_not_double_count() {
        let mut h = harness(PaperExchange::manual(paper_config(dec!(1000))), 3).await;
        h.tick().await;
        let order_id = h.paper.open_orders()[0].client_order_id.clone();

        let fill = OrderEvent::Filled {
            order_id,
            fill_id: "trade-1".into(),
            amount: dec!(0.5),
            price: dec!(100),
            fee: dec!(0.01),
        };
        assert_eq!(h.engine.on_order_event(&fill), EventOutcome::OpenFilled);
        assert_eq!(h.engine.on_order_event(&fill), EventOutcome::Duplicate);

        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.open_filled_amount, dec!(0.5));
        assert_eq!(snapshot.cumulative_fee, dec!(0.01));
        assert_eq!(h.engine.report().duplicate_events, 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_forces_failed_shutdown() {
        let max_retries = 2;
        let mut h = harness(PaperExchange::new(paper_config(dec!(1000))), max_retries).await;
        h.tick().await;
        assert_eq!(h.engine.ledger().open_nums(), 1);

        h.paper.fail_next(PositionAction::Close, max_retries + 1);
        h.set_signal(-1.0);
        for attempt in 1..=max_retries + 1 {
            h.bar(dec!(102)).await;
            assert!(matches!(h.tick().await, TickOutcome::Acted(GridDecision::CloseAll { .. })));
            assert_eq!(h.engine.retries(), attempt);
            if attempt <= max_retries {
                assert_eq!(h.engine.status(), EngineStatus::Running);
            }
        }

        assert_eq!(h.engine.status(), EngineStatus::ShuttingDown);
        assert_eq!(h.engine.close_type(), Some(CloseType::Failed));

        // Drain completes once a liquidation goes through
        assert_eq!(h.tick().await, TickOutcome::Liquidating);
        assert!(h.engine.ledger().is_drained());
        assert_eq!(h.tick().await, TickOutcome::Terminated);
        assert_eq!(h.engine.close_type(), Some(CloseType::Failed));
    }

    #[tokio::test]
    async fn test_shutdown_never_grows_position() {
        let mut h = harness(PaperExchange::manual(paper_config(dec!(1000))), 5).await;
        h.tick().await;
        let first = h.paper.open_orders()[0].client_order_id.clone();
        h.paper.fill(&first, dec!(0.5), dec!(100));
        h.drain().await;

        h.engine.early_stop().await;
        h.drain().await;
        assert_eq!(h.engine.status(), EngineStatus::ShuttingDown);
        assert_eq!(h.engine.close_type(), Some(CloseType::EarlyStop));

        // Favoring signals and adverse prices while draining submit nothing new
        h.bar(dec!(90)).await;
        assert_eq!(h.tick().await, TickOutcome::Waiting);
        let opens = h
            .paper
            .submitted()
            .iter()
            .filter(|r| r.action == PositionAction::Open)
            .count();
        assert_eq!(opens, 1);

        let close = h
            .paper
            .open_orders()
            .into_iter()
            .find(|r| r.action == PositionAction::Close)
            .expect("liquidation order");
        assert_eq!(close.amount, dec!(0.5));
        h.paper.fill(&close.client_order_id, dec!(0.2), dec!(90));
        h.drain().await;
        assert_eq!(h.tick().await, TickOutcome::Waiting);
        assert_ne!(h.engine.status(), EngineStatus::Terminated);

        h.paper.fill(&close.client_order_id, dec!(0.3), dec!(90));
        h.drain().await;
        assert_eq!(h.tick().await, TickOutcome::Terminated);
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.opened_amount, snapshot.closed_amount);
    }

    #[tokio::test]
    async fn test_early_stop_cancels_unfilled_opens() {
        let mut h = harness(PaperExchange::manual(paper_config(dec!(1000))), 5).await;
        h.tick().await;
        assert!(h.engine.ledger().has_pending_open());

        h.engine.early_stop().await;
        h.drain().await;

        assert!(h.paper.open_orders().is_empty());
        assert!(h.engine.ledger().is_flat());
        assert!(!h
            .paper
            .submitted()
            .iter()
            .any(|r| r.action == PositionAction::Close));
        assert_eq!(h.tick().await, TickOutcome::Terminated);
        assert_eq!(h.engine.close_type(), Some(CloseType::EarlyStop));
    }

    #[tokio::test]
    async fn test_early_stop_before_start_terminates() {
        let mut h = harness(PaperExchange::new(paper_config(dec!(1000))), 5).await;
        h.engine.early_stop().await;
        assert_eq!(h.engine.status(), EngineStatus::Terminated);
        assert_eq!(h.engine.close_type(), Some(CloseType::EarlyStop));
    }

    #[tokio::test]
    async fn test_refresh_only_retires_idle_engines() {
        let mut h = harness(PaperExchange::new(paper_config(dec!(1000))), 5).await;
        h.tick().await;
        assert!(!h.engine.refresh().await);
        assert_eq!(h.engine.status(), EngineStatus::Running);

        let mut idle = harness(PaperExchange::new(paper_config(dec!(1000))), 5).await;
        idle.set_signal(0.0);
        idle.tick().await;
        assert_eq!(idle.engine.status(), EngineStatus::Running);
        assert!(idle.engine.refresh().await);
        assert_eq!(idle.engine.status(), EngineStatus::Terminated);
        assert_eq!(idle.engine.close_type(), Some(CloseType::Liquidated));
    }

    #[tokio::test]
    async fn test_unknown_order_events_change_nothing() {
        let mut h = harness(PaperExchange::new(paper_config(dec!(1000))), 5).await;
        h.tick().await;
        let before = h.engine.snapshot();

        let outcome = h.engine.on_order_event(&OrderEvent::Failed {
            order_id: "someone-else".into(),
            reason: "n/a".into(),
        });

        assert_eq!(outcome, EventOutcome::Unmatched);
        assert_eq!(h.engine.retries(), 0);
        assert_eq!(h.engine.snapshot().open_filled_amount, before.open_filled_amount);
        assert_eq!(h.engine.report().unmatched_events, 1);
    }

    #[tokio::test]
    async fn test_spawned_engine_runs_until_stopped() {
        let paper = Arc::new(PaperExchange::new(paper_config(dec!(1000))));
        let feed = Arc::new(ReplayFeed::new());
        let start = Utc::now();
        feed.set_candles(
            &instrument(),
            vec![
                Candle::flat(start, dec!(100)),
                Candle::flat(start + chrono::Duration::minutes(1), dec!(100)),
            ],
        )
        .await;
        let (tx, mut notices) = mpsc::channel(4);
        let engine = GridEngine::new(context(3), paper.clone(), feed.clone())
            .with_notifier(ShutdownNotifier::new(tx, Duration::from_millis(100)));

        let handle = spawn_engine(engine);
        let mut snapshots = handle.snapshot.clone();
        snapshots
            .wait_for(|s| s.open_filled_amount > Decimal::ZERO)
            .await
            .expect("engine opened a position");

        handle.early_stop().expect("inbox open");
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("notice in time")
            .expect("notice");
        assert_eq!(notice.close_type, Some(CloseType::EarlyStop));
        assert!(notice.report.snapshot.open_filled_amount.is_zero());

        let report = handle.join().await.expect("joined");
        assert_eq!(report.snapshot.status, EngineStatus::Terminated);
    }
}
