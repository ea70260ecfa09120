use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::InstrumentId;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction the grid accumulates inventory in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    /// Side of the orders that open or grow the position
    pub fn order_side(&self) -> OrderSide {
        match self {
            TradeSide::Long => OrderSide::Buy,
            TradeSide::Short => OrderSide::Sell,
        }
    }

    /// Side of the orders that reduce the position
    pub fn close_side(&self) -> OrderSide {
        match self {
            TradeSide::Long => OrderSide::Sell,
            TradeSide::Short => OrderSide::Buy,
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Long => Decimal::ONE,
            TradeSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Signal value that favors this side
    pub fn favoring_signal(&self) -> i8 {
        match self {
            TradeSide::Long => 1,
            TradeSide::Short => -1,
        }
    }

    /// Return of `price` against `reference`, positive when the move favors this side.
    ///
    /// Zero when `reference` is zero.
    pub fn directional_return(&self, price: Decimal, reference: Decimal) -> Decimal {
        if reference.is_zero() {
            return Decimal::ZERO;
        }
        self.sign() * (price - reference) / reference
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Long => write!(f, "long"),
            TradeSide::Short => write!(f, "short"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Market
    }
}

/// Whether an order grows or reduces the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionAction {
    Open,
    Close,
}

/// Order request (what we want the execution layer to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Decimal,
    pub action: PositionAction,
}

impl OrderRequest {
    pub fn open(
        instrument: InstrumentId,
        side: TradeSide,
        order_type: OrderType,
        amount: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            instrument,
            side: side.order_side(),
            order_type,
            amount,
            price,
            action: PositionAction::Open,
        }
    }

    /// Closing orders always go out as market orders
    pub fn close(instrument: InstrumentId, side: TradeSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            instrument,
            side: side.close_side(),
            order_type: OrderType::Market,
            amount,
            price,
            action: PositionAction::Close,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.amount * self.price
    }
}

/// Hypothetical order sized for the pre-flight balance check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCandidate {
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Decimal,
    pub leverage: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_directional_return_mirrors_for_short() {
        assert_eq!(
            TradeSide::Long.directional_return(dec!(97), dec!(100)),
            dec!(-0.03)
        );
        assert_eq!(
            TradeSide::Short.directional_return(dec!(97), dec!(100)),
            dec!(0.03)
        );
        assert_eq!(TradeSide::Long.directional_return(dec!(1), dec!(0)), dec!(0));
    }

    #[test]
    fn test_close_request_reverses_side() {
        let id = InstrumentId::new("binance_perpetual", "ETH-USDT");
        let req = OrderRequest::close(id, TradeSide::Short, dec!(2), dec!(10));
        assert_eq!(req.side, OrderSide::Buy);
        assert_eq!(req.order_type, OrderType::Market);
        assert_eq!(req.action, PositionAction::Close);
        assert_eq!(req.notional(), dec!(20));
    }
}
