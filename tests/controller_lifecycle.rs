use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use trailgrid::adapters::{PaperConfig, PaperExchange, ReplayFeed};
use trailgrid::config::{AppConfig, SignalConfig};
use trailgrid::controller::GridController;
use trailgrid::domain::{Candle, CloseType, EngineStatus, InstrumentId};
use trailgrid::signal::SignalRegistry;

const CONNECTOR: &str = "binance_perpetual";

fn id(pair: &str) -> InstrumentId {
    InstrumentId::new(CONNECTOR, pair)
}

/// Plain grid (always long) ticking every second
fn config(pairs: &[&str]) -> AppConfig {
    let mut config = AppConfig::default_config(CONNECTOR, pairs);
    config.engine.executor_interval_secs = 1;
    config.controller.control_interval_ms = 20;
    for params in config.params.values_mut() {
        params.max_records = 10;
        params.signal = SignalConfig {
            name: "constant".to_string(),
            params: BTreeMap::new(),
        };
    }
    config
}

async fn seeded_feed(pairs: &[&str]) -> Arc<ReplayFeed> {
    let feed = Arc::new(ReplayFeed::new());
    let start = Utc::now() - chrono::Duration::minutes(5);
    for pair in pairs {
        let candles = (0..3)
            .map(|i| Candle::flat(start + chrono::Duration::minutes(i), dec!(100)))
            .collect();
        feed.set_candles(&id(pair), candles).await;
    }
    feed
}

fn paper() -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(PaperConfig {
        quote_balance: dec!(1000),
        fee_rate: Decimal::ZERO,
        min_notional: dec!(5),
        auto_fill: true,
    }))
}

async fn settle(controller: &mut GridController, done: impl Fn(&GridController) -> bool) {
    for _ in 0..500 {
        if done(controller) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.control_pass(Utc::now()).await;
    }
    panic!("controller did not settle");
}

#[tokio::test]
async fn descoped_engine_liquidates_before_release() {
    let pairs = ["DOGE-USDT", "WIF-USDT"];
    let feed = seeded_feed(&pairs).await;
    let mut controller =
        GridController::new(config(&pairs), paper(), feed.clone(), SignalRegistry::default());

    controller.control_pass(Utc::now()).await;
    settle(&mut controller, |c| c.snapshots().iter().all(|s| s.is_trading)).await;

    controller.update_config(&config(&["DOGE-USDT"])).await;
    // WIF still has inventory, so its feed stays up while it drains
    assert!(feed.active_feeds().await.contains(&id("WIF-USDT")));

    settle(&mut controller, |c| c.live_instruments() == vec![id("DOGE-USDT")]).await;
    assert_eq!(feed.active_feeds().await, vec![id("DOGE-USDT")]);

    let report = controller.closed_reports().last().expect("report");
    assert_eq!(report.snapshot.instrument, id("WIF-USDT"));
    assert_eq!(report.snapshot.close_type, Some(CloseType::EarlyStop));
    assert_eq!(report.snapshot.opened_amount, report.snapshot.closed_amount);
    assert!(report.snapshot.open_filled_amount.is_zero());
}

#[tokio::test]
async fn refresh_leaves_trading_engines_alone() {
    let pairs = ["DOGE-USDT"];
    let feed = seeded_feed(&pairs).await;
    let mut cfg = config(&pairs);
    cfg.controller.refresh_interval_secs = 1;
    let mut controller = GridController::new(cfg, paper(), feed, SignalRegistry::default());

    controller.control_pass(Utc::now()).await;
    settle(&mut controller, |c| c.snapshots().iter().all(|s| s.is_trading)).await;

    let much_later = Utc::now() + chrono::Duration::hours(1);
    assert!(controller.refresh_actions(much_later).is_empty());
    controller.control_pass(much_later).await;
    assert_eq!(controller.live_instruments(), vec![id("DOGE-USDT")]);
    assert_eq!(controller.closed_reports().count(), 0);
}

#[tokio::test]
async fn insufficient_balance_engine_is_retired() {
    let pairs = ["DOGE-USDT"];
    let feed = seeded_feed(&pairs).await;
    let broke = Arc::new(PaperExchange::new(PaperConfig {
        quote_balance: dec!(1),
        fee_rate: Decimal::ZERO,
        min_notional: dec!(5),
        auto_fill: true,
    }));
    let mut controller =
        GridController::new(config(&pairs), broke.clone(), feed, SignalRegistry::default());

    controller.control_pass(Utc::now()).await;
    settle(&mut controller, |c| c.closed_reports().count() >= 1).await;

    let report = controller.closed_reports().next().expect("report");
    assert_eq!(report.snapshot.close_type, Some(CloseType::InsufficientBalance));
    assert!(broke.submitted().is_empty());
}

#[tokio::test]
async fn engines_whose_notices_were_dropped_are_still_retired() {
    let pairs = ["DOGE-USDT", "WIF-USDT", "PEPE-USDT"];
    let feed = seeded_feed(&pairs).await;
    let broke = Arc::new(PaperExchange::new(PaperConfig {
        quote_balance: dec!(1),
        fee_rate: Decimal::ZERO,
        min_notional: dec!(5),
        auto_fill: true,
    }));
    let mut cfg = config(&pairs);
    cfg.controller.shutdown_queue_capacity = 1;
    cfg.controller.shutdown_notify_timeout_ms = 10;
    let mut controller = GridController::new(cfg, broke, feed.clone(), SignalRegistry::default());

    controller.control_pass(Utc::now()).await;
    for _ in 0..100 {
        if controller
            .snapshots()
            .iter()
            .all(|s| s.status == EngineStatus::Terminated)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Past every notify timeout: only one notice fits the queue
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Drop the pairs so retired engines are not recreated
    controller.update_config(&config(&[])).await;
    assert_eq!(feed.active_feeds().await.len(), 3);

    controller.control_pass(Utc::now()).await;

    assert!(controller.live_instruments().is_empty());
    assert!(controller.active_feeds().is_empty());
    assert!(feed.active_feeds().await.is_empty());
    let mut closed: Vec<InstrumentId> = controller
        .closed_reports()
        .map(|r| r.snapshot.instrument.clone())
        .collect();
    closed.sort();
    let mut expected: Vec<InstrumentId> = pairs.iter().map(|p| id(p)).collect();
    expected.sort();
    assert_eq!(closed, expected);
    assert!(controller
        .closed_reports()
        .all(|r| r.snapshot.close_type == Some(CloseType::InsufficientBalance)));
}

#[tokio::test]
async fn run_loop_drains_on_shutdown() {
    let pairs = ["DOGE-USDT", "WIF-USDT"];
    let feed = seeded_feed(&pairs).await;
    let cfg = config(&pairs);
    let (_config_tx, config_rx) = watch::channel(cfg.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut controller = GridController::new(cfg, paper(), feed.clone(), SignalRegistry::default());
    let task = tokio::spawn(async move {
        controller.run(config_rx, shutdown_rx).await;
        controller
    });

    // Let engines open
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(true).expect("controller listening");

    let controller = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("shutdown in time")
        .expect("controller task");

    assert!(controller.live_instruments().is_empty());
    assert!(feed.active_feeds().await.is_empty());
    assert_eq!(controller.closed_reports().count(), 2);
    assert!(controller.closed_reports().all(|r| {
        r.snapshot.close_type == Some(CloseType::EarlyStop) && r.snapshot.open_filled_amount.is_zero()
    }));
}
