use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tradable instrument on a specific connector (e.g. `binance_perpetual:DOGE-USDT`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentId {
    pub connector: String,
    pub pair: String,
}

impl InstrumentId {
    pub fn new(connector: impl Into<String>, pair: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            pair: pair.into().to_uppercase(),
        }
    }

    /// Whether the connector trades perpetual contracts
    pub fn is_perpetual(&self) -> bool {
        self.connector.contains("perpetual")
    }

    /// Exchange symbol without separator (`DOGE-USDT` -> `DOGEUSDT`)
    pub fn symbol(&self) -> String {
        self.pair.replace(['-', '/', '_'], "")
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connector, self.pair)
    }
}

/// A single OHLCV candle, stamped with its open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Flat candle where every price equals `price`
    pub fn flat(timestamp: DateTime<Utc>, price: Decimal) -> Self {
        Self::new(timestamp, price, price, price, price, Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_display_and_symbol() {
        let id = InstrumentId::new("binance_perpetual", "doge-usdt");
        assert_eq!(id.to_string(), "binance_perpetual:DOGE-USDT");
        assert_eq!(id.symbol(), "DOGEUSDT");
        assert!(id.is_perpetual());
        assert!(!InstrumentId::new("binance", "ETH-USDT").is_perpetual());
    }
}
