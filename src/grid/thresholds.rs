use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::PairParams;
use crate::domain::{OrderType, TradeSide};
use crate::error::{GridError, Result};

/// Grid rules for one engine instance, fixed at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridThresholds {
    pub side: TradeSide,
    /// Maximum number of rungs
    pub grid_max: u32,
    /// Adverse move from the frontier rung required before adding a rung
    pub grid_open: Decimal,
    /// Favorable move required before closing
    pub grid_close: Decimal,
    /// Adverse return on the average price that switches to martingale sizing
    pub mart_open: Decimal,
    /// Quote notional of a flat-sized rung
    pub amount_quote: Decimal,
    pub leverage: u32,
    pub signal_interval: String,
    pub max_records: usize,
    pub open_order_type: OrderType,
}

impl GridThresholds {
    pub fn from_params(params: &PairParams) -> Self {
        Self {
            side: params.side,
            grid_max: params.grid_max,
            grid_open: params.grid_open,
            grid_close: params.grid_close,
            mart_open: params.mart_open,
            amount_quote: params.amount_quote,
            leverage: params.leverage.max(1),
            signal_interval: params.interval.clone(),
            max_records: params.max_records,
            open_order_type: params.open_order_type,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fraction = |name: &str, v: Decimal| {
            if v > Decimal::ZERO && v < Decimal::ONE {
                Ok(())
            } else {
                Err(GridError::Validation(format!(
                    "{name} must be between 0 and 1, got {v}"
                )))
            }
        };
        fraction("grid_open", self.grid_open)?;
        fraction("grid_close", self.grid_close)?;
        fraction("mart_open", self.mart_open)?;

        if self.grid_max == 0 {
            return Err(GridError::Validation("grid_max must be at least 1".into()));
        }
        if self.amount_quote <= Decimal::ZERO {
            return Err(GridError::Validation("amount_quote must be positive".into()));
        }
        Ok(())
    }

    /// Flat rung size at `price`
    pub fn flat_amount(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.amount_quote / price
    }
}
