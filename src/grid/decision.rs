use rust_decimal::{Decimal, MathematicalOps};
use serde::Serialize;

use super::{GridThresholds, Ledger};
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sizing {
    /// `amount_quote / last_price`
    Flat,
    /// `sqrt(avg_price * filled_amount / last_price)`
    Martingale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Only one rung held
    SingleRung,
    /// The whole position cleared `grid_close`, realized profit included
    AggregateProfit,
    /// Several rungs held but none cleared `grid_close` on its own
    NoRungQualifies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HoldReason {
    /// Signal neither opens nor closes
    NoSignal,
    InvalidPrice,
    CloseInFlight,
    AwaitingFill,
    GridFull,
    SpacingNotReached,
    TargetNotReached,
}

/// What one control pass should do
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GridDecision {
    Open { amount: Decimal },
    Increment { amount: Decimal, sizing: Sizing },
    CloseAll { reason: CloseReason },
    Decrement { amount: Decimal, rung_ids: Vec<String> },
    Hold(HoldReason),
}

/// Evaluate the grid rules against the ledger. Pure: no side effects.
///
/// Rules are checked in order: open, increment, single-rung close, decrement.
/// The aggregate-profit check of the decrement branch runs before per-rung
/// selection and, when it passes, liquidates the whole position.
pub fn decide(
    ledger: &Ledger,
    signal: Signal,
    last_price: Decimal,
    thresholds: &GridThresholds,
) -> GridDecision {
    let side = thresholds.side;

    if last_price <= Decimal::ZERO {
        return GridDecision::Hold(HoldReason::InvalidPrice);
    }
    if ledger.close_in_flight() {
        return GridDecision::Hold(HoldReason::CloseInFlight);
    }

    if ledger.open_nums() == 0 {
        return if signal.favors(side) {
            GridDecision::Open {
                amount: thresholds.flat_amount(last_price),
            }
        } else {
            GridDecision::Hold(HoldReason::NoSignal)
        };
    }

    if ledger.has_pending_open() {
        return GridDecision::Hold(HoldReason::AwaitingFill);
    }
    let Some(frontier) = ledger.frontier_price() else {
        return GridDecision::Hold(HoldReason::AwaitingFill);
    };
    let frontier_move = side.directional_return(last_price, frontier);

    if signal.favors(side) {
        if ledger.open_nums() >= thresholds.grid_max as usize {
            return GridDecision::Hold(HoldReason::GridFull);
        }
        if frontier_move >= -thresholds.grid_open {
            return GridDecision::Hold(HoldReason::SpacingNotReached);
        }
        return increment(ledger, last_price, thresholds);
    }

    if !signal.opposes(side) {
        return GridDecision::Hold(HoldReason::NoSignal);
    }
    if frontier_move <= thresholds.grid_close {
        return GridDecision::Hold(HoldReason::TargetNotReached);
    }

    if ledger.open_nums() == 1 {
        return GridDecision::CloseAll {
            reason: CloseReason::SingleRung,
        };
    }

    let avg = ledger.position_average_price();
    let nominal = ledger.nominal_value();
    if avg > Decimal::ZERO && nominal > Decimal::ZERO {
        let roe = side.directional_return(last_price, avg);
        if (nominal * roe + ledger.realized_profit()) / nominal > thresholds.grid_close {
            return GridDecision::CloseAll {
                reason: CloseReason::AggregateProfit,
            };
        }
    }

    let (rung_ids, amount) = ledger.partial_close_candidates(last_price, thresholds.grid_close);
    if rung_ids.is_empty() || amount <= Decimal::ZERO {
        return GridDecision::CloseAll {
            reason: CloseReason::NoRungQualifies,
        };
    }
    GridDecision::Decrement { amount, rung_ids }
}

fn increment(ledger: &Ledger, last_price: Decimal, thresholds: &GridThresholds) -> GridDecision {
    let avg = ledger.position_average_price();
    let roe = thresholds.side.directional_return(last_price, avg);

    if roe < -thresholds.mart_open {
        let exposure = avg * ledger.open_filled_amount() / last_price;
        if let Some(amount) = exposure.sqrt() {
            return GridDecision::Increment {
                amount,
                sizing: Sizing::Martingale,
            };
        }
    }
    GridDecision::Increment {
        amount: thresholds.flat_amount(last_price),
        sizing: Sizing::Flat,
    }
}
