use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use trailgrid::adapters::{PaperConfig, PaperExchange, ReplayFeed};
use trailgrid::config::EngineSettings;
use trailgrid::domain::{
    Candle, EngineEvent, EngineStatus, InstrumentId, OrderType, PositionAction, TradeSide,
};
use trailgrid::error::{GridError, Result};
use trailgrid::exchange::{ExecutionAdapter, OrderEventSink};
use trailgrid::grid::{
    CloseReason, EngineContext, GridDecision, GridEngine, GridThresholds, Sizing, TickOutcome,
};
use trailgrid::signal::{Signal, SignalEvaluator, SignalParams, SignalResult};

/// Returns whatever signal the test set last, stamped with the last closed bar
struct ScriptedSignal {
    next: Arc<Mutex<Signal>>,
}

impl SignalEvaluator for ScriptedSignal {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn min_window(&self, _params: &SignalParams) -> usize {
        2
    }

    fn evaluate(&self, window: &[Candle], _params: &SignalParams) -> Result<SignalResult> {
        if window.len() < 2 {
            return Err(GridError::InvalidMarketData("window too short".into()));
        }
        let signal = *self.next.lock().expect("signal lock");
        Ok(SignalResult {
            signal,
            timestamp: window[window.len() - 2].timestamp,
        })
    }
}

struct Scenario {
    engine: GridEngine,
    inbox: mpsc::UnboundedReceiver<EngineEvent>,
    paper: Arc<PaperExchange>,
    feed: Arc<ReplayFeed>,
    signal: Arc<Mutex<Signal>>,
    bars: i64,
}

fn instrument() -> InstrumentId {
    InstrumentId::new("binance_perpetual", "DOGE-USDT")
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .expect("valid start")
}

fn thresholds(side: TradeSide, grid_max: u32) -> GridThresholds {
    GridThresholds {
        side,
        grid_max,
        grid_open: dec!(0.02),
        grid_close: dec!(0.01),
        mart_open: dec!(0.25),
        amount_quote: dec!(50),
        leverage: 10,
        signal_interval: "1m".into(),
        max_records: 20,
        open_order_type: OrderType::Market,
    }
}

impl Scenario {
    async fn new(paper: PaperExchange, thresholds: GridThresholds, max_retries: u32) -> Self {
        let paper = Arc::new(paper);
        let feed = Arc::new(ReplayFeed::new());
        let signal = Arc::new(Mutex::new(Signal::Neutral));
        let (tx, inbox) = mpsc::unbounded_channel();
        paper.register_listener(&instrument(), OrderEventSink::new(tx));

        let context = EngineContext {
            instrument: instrument(),
            thresholds,
            settings: EngineSettings {
                executor_interval_secs: 60,
                max_retries,
                amount_epsilon: dec!(0.000000001),
            },
            signal: Arc::new(ScriptedSignal {
                next: signal.clone(),
            }),
            signal_params: SignalParams::default(),
        };
        let engine = GridEngine::new(context, paper.clone(), feed.clone());
        let mut scenario = Self {
            engine,
            inbox,
            paper,
            feed,
            signal,
            bars: 0,
        };
        scenario.bar(dec!(100)).await;
        scenario
    }

    /// Close a bar at `price` and make it the last traded price
    async fn bar(&mut self, price: Decimal) {
        let ts = start() + Duration::minutes(self.bars);
        self.bars += 1;
        self.feed.push_candle(&instrument(), Candle::flat(ts, price)).await;
        self.feed.set_price(&instrument(), price).await;
    }

    /// Deliver queued order events in order
    async fn drain(&mut self) {
        while let Ok(event) = self.inbox.try_recv() {
            self.engine.handle_event(event).await;
        }
    }

    async fn step(&mut self, signal: Signal, price: Decimal) -> TickOutcome {
        *self.signal.lock().expect("signal lock") = signal;
        self.bar(price).await;
        let outcome = self.engine.tick().await;
        self.drain().await;
        outcome
    }

    fn opens_submitted(&self) -> usize {
        self.paper
            .submitted()
            .iter()
            .filter(|r| r.action == PositionAction::Open)
            .count()
    }
}

fn paper(auto_fill: bool) -> PaperExchange {
    let config = PaperConfig {
        quote_balance: dec!(1000),
        fee_rate: Decimal::ZERO,
        min_notional: dec!(5),
        auto_fill,
    };
    if auto_fill {
        PaperExchange::new(config)
    } else {
        PaperExchange::manual(config)
    }
}

fn close_to(actual: Decimal, expected: Decimal) -> bool {
    (actual - expected).abs() < dec!(0.000001)
}

/// Open at t0, flat increment at t1 (-3%), full close at t2 once the whole
/// position clears the profit bar.
#[tokio::test]
async fn open_increment_then_full_close() {
    let mut s = Scenario::new(paper(true), thresholds(TradeSide::Long, 3), 10).await;

    let t0 = s.step(Signal::Long, dec!(100)).await;
    assert_eq!(t0, TickOutcome::Acted(GridDecision::Open { amount: dec!(0.5) }));
    assert_eq!(s.engine.status(), EngineStatus::Running);

    let t1 = s.step(Signal::Long, dec!(97)).await;
    let TickOutcome::Acted(GridDecision::Increment { amount, sizing }) = t1 else {
        panic!("expected increment, got {t1:?}");
    };
    assert_eq!(sizing, Sizing::Flat);
    assert_eq!(amount, dec!(50) / dec!(97));

    let snapshot = s.engine.snapshot();
    assert_eq!(snapshot.open_nums, 2);
    // 100 quote spent over 0.5 + 50/97 base
    assert!(close_to(
        snapshot.position_average_price,
        dec!(100) / (dec!(0.5) + dec!(50) / dec!(97))
    ));

    let t2 = s.step(Signal::Short, dec!(101.5)).await;
    assert_eq!(
        t2,
        TickOutcome::Acted(GridDecision::CloseAll {
            reason: CloseReason::AggregateProfit
        })
    );

    let snapshot = s.engine.snapshot();
    assert_eq!(snapshot.open_nums, 0);
    assert!(snapshot.position_average_price.is_zero());
    assert!(snapshot.realized_profit.is_zero());
    let held = dec!(0.5) + dec!(50) / dec!(97);
    assert!(close_to(snapshot.session_pnl, held * dec!(101.5) - dec!(100)));
    assert_eq!(snapshot.opened_amount, snapshot.closed_amount);
    // A strategy close keeps the engine trading
    assert_eq!(s.engine.status(), EngineStatus::Running);
    assert_eq!(s.engine.close_type(), None);
}

#[tokio::test]
async fn partial_close_retires_only_qualifying_rungs() {
    let mut s = Scenario::new(paper(true), thresholds(TradeSide::Long, 3), 10).await;
    s.step(Signal::Long, dec!(100)).await;
    s.step(Signal::Long, dec!(97)).await;
    let before = s.engine.snapshot().open_filled_amount;
    let lower_rung = s.engine.ledger().rungs()[1].order_id.clone();

    // 1.5% over the 97 rung, still under water on the average
    let outcome = s.step(Signal::Short, dec!(98.455)).await;
    let TickOutcome::Acted(GridDecision::Decrement { amount, rung_ids }) = outcome else {
        panic!("expected decrement, got {outcome:?}");
    };
    assert_eq!(rung_ids, vec![lower_rung.clone()]);
    assert_eq!(amount, dec!(50) / dec!(97));

    let ledger = s.engine.ledger();
    assert_eq!(ledger.open_nums(), 1);
    assert!(ledger.rungs().iter().all(|r| r.order_id != lower_rung));
    assert_eq!(before - amount, ledger.open_filled_amount());
    assert_eq!(ledger.position_average_price(), dec!(100));
    // Booked against the retired rung's own entry
    assert!(close_to(ledger.realized_profit(), amount * (dec!(98.455) - dec!(97))));
}

#[tokio::test]
async fn martingale_sizing_after_deep_drawdown() {
    let mut m = Scenario::new(paper(false), thresholds(TradeSide::Long, 5), 10).await;
    m.step(Signal::Long, dec!(100)).await;

    // Overfill the first rung so the position holds 2 @ 100
    let order = m.paper.open_orders()[0].client_order_id.clone();
    assert!(m.paper.fill(&order, dec!(2), dec!(100)));
    m.drain().await;
    assert_eq!(m.engine.snapshot().open_filled_amount, dec!(2));

    let outcome = m.step(Signal::Long, dec!(70)).await;
    let TickOutcome::Acted(GridDecision::Increment { amount, sizing }) = outcome else {
        panic!("expected increment, got {outcome:?}");
    };
    assert_eq!(sizing, Sizing::Martingale);
    assert!((amount - dec!(1.690308509)).abs() < dec!(0.000001));
}

#[tokio::test]
async fn short_engine_mirrors_long_rules() {
    let mut s = Scenario::new(paper(true), thresholds(TradeSide::Short, 3), 10).await;

    assert!(matches!(
        s.step(Signal::Long, dec!(100)).await,
        TickOutcome::Acted(GridDecision::Hold(_))
    ));
    assert!(matches!(
        s.step(Signal::Short, dec!(100)).await,
        TickOutcome::Acted(GridDecision::Open { .. })
    ));
    // Adverse for a short is up
    assert!(matches!(
        s.step(Signal::Short, dec!(103)).await,
        TickOutcome::Acted(GridDecision::Increment { .. })
    ));
    assert!(matches!(
        s.step(Signal::Long, dec!(98)).await,
        TickOutcome::Acted(GridDecision::CloseAll { .. })
    ));

    let snapshot = s.engine.snapshot();
    assert_eq!(snapshot.open_nums, 0);
    assert!(snapshot.session_pnl > Decimal::ZERO);
}

#[tokio::test]
async fn repeated_signal_timestamp_places_no_orders() {
    let mut s = Scenario::new(paper(true), thresholds(TradeSide::Long, 3), 10).await;
    s.step(Signal::Long, dec!(100)).await;
    assert_eq!(s.opens_submitted(), 1);

    // Same closed bar, even with an adverse price
    s.feed.set_price(&instrument(), dec!(80)).await;
    assert_eq!(s.engine.tick().await, TickOutcome::Stale);
    assert_eq!(s.engine.tick().await, TickOutcome::Stale);
    assert_eq!(s.opens_submitted(), 1);
}

#[tokio::test]
async fn close_failures_past_ceiling_force_failed_termination() {
    let max_retries = 3;
    let mut s = Scenario::new(paper(true), thresholds(TradeSide::Long, 3), max_retries).await;
    s.step(Signal::Long, dec!(100)).await;

    s.paper.fail_next(PositionAction::Close, max_retries + 1);
    for _ in 0..=max_retries {
        s.step(Signal::Short, dec!(103)).await;
    }
    assert_eq!(s.engine.retries(), max_retries + 1);
    assert_eq!(s.engine.status(), EngineStatus::ShuttingDown);

    assert_eq!(s.step(Signal::Long, dec!(103)).await, TickOutcome::Liquidating);
    assert_eq!(s.step(Signal::Long, dec!(90)).await, TickOutcome::Terminated);
    assert_eq!(s.opens_submitted(), 1);

    let snapshot = s.engine.snapshot();
    assert_eq!(snapshot.status, EngineStatus::Terminated);
    assert_eq!(snapshot.close_type, Some(trailgrid::domain::CloseType::Failed));
    assert_eq!(snapshot.opened_amount, snapshot.closed_amount);
}

#[tokio::test]
async fn early_stop_cancels_open_remainder_and_liquidates_fills() {
    let mut s = Scenario::new(paper(false), thresholds(TradeSide::Long, 3), 10).await;
    s.step(Signal::Long, dec!(100)).await;
    let open = s.paper.open_orders()[0].client_order_id.clone();
    assert!(s.paper.fill(&open, dec!(0.2), dec!(100)));
    s.drain().await;

    s.engine.early_stop().await;
    s.drain().await;
    assert_eq!(s.engine.status(), EngineStatus::ShuttingDown);

    // The partially filled open was cancelled; its inventory is what gets liquidated
    let close = s
        .paper
        .open_orders()
        .into_iter()
        .find(|r| r.action == PositionAction::Close)
        .expect("liquidation submitted");
    assert_eq!(close.amount, dec!(0.2));
    assert!(s.paper.fill(&close.client_order_id, dec!(0.2), dec!(99)));
    s.drain().await;

    assert_eq!(s.step(Signal::Long, dec!(99)).await, TickOutcome::Terminated);
    assert_eq!(s.opens_submitted(), 1);
}
