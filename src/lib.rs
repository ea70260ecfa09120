pub mod adapters;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod grid;
pub mod logging;
pub mod signal;

pub use adapters::{BinanceKlineFeed, PaperConfig, PaperExchange, ReplayFeed};
pub use config::AppConfig;
pub use controller::{ControllerAction, GridController, StopReason};
pub use domain::{
    Candle, CloseType, EngineEvent, EngineStatus, InstrumentId, OrderEvent, OrderRequest,
    TradeSide,
};
pub use error::{GridError, OrderError, Result};
pub use exchange::{ExecutionAdapter, MarketDataProvider, OrderEventSink};
pub use grid::{
    decide, spawn_engine, EngineContext, EngineHandle, EngineReport, EngineSnapshot,
    GridDecision, GridEngine, GridThresholds, Ledger, TickOutcome,
};
pub use signal::{Signal, SignalEvaluator, SignalParams, SignalRegistry, SignalResult};
