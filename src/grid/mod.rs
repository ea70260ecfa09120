//! Grid position engine
//!
//! - `thresholds`: per-pair grid parameters
//! - `ledger`: rung bookkeeping and PnL accounting
//! - `decision`: pure open/increment/close selection
//! - `engine`: lifecycle, order reconciliation and the engine task

mod decision;
mod engine;
mod ledger;
mod thresholds;

pub use decision::{decide, CloseReason, GridDecision, HoldReason, Sizing};
pub use engine::{
    spawn_engine, EngineContext, EngineHandle, EngineReport, EngineSnapshot, GridEngine,
    ShutdownNotice, ShutdownNotifier, TickOutcome,
};
pub use ledger::{CloseKind, CloseOrder, EventOutcome, Ledger, Rung};
pub use thresholds::GridThresholds;
