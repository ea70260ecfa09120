use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{Candle, EngineEvent, InstrumentId, OrderCandidate, OrderEvent, OrderRequest};
use crate::error::{GridError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Paper,
}

impl Default for ExchangeKind {
    fn default() -> Self {
        Self::Paper
    }
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paper" | "dry_run" | "dry-run" => Ok(Self::Paper),
            _ => Err("invalid exchange; expected paper"),
        }
    }
}

pub fn parse_exchange_kind(raw: &str) -> Result<ExchangeKind> {
    ExchangeKind::from_str(raw).map_err(|e| GridError::Validation(e.to_string()))
}

/// Where the execution layer delivers order events for one engine.
///
/// Wraps the engine inbox so fills, failures and ticks share one ordered queue.
#[derive(Debug, Clone)]
pub struct OrderEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl OrderEventSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event; a closed inbox means the engine is gone and the event is dropped
    pub fn deliver(&self, event: OrderEvent) -> bool {
        match self.tx.send(EngineEvent::Order(event)) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping order event for closed engine inbox: {:?}", e.0);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Order placement and cancellation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Submit an order. `Ok(None)` means the venue refused to accept it.
    async fn place_order(&self, request: &OrderRequest) -> Result<Option<String>>;

    async fn cancel_order(&self, instrument: &InstrumentId, order_id: &str) -> Result<bool>;

    /// Tradeable amount after balance/margin adjustment, zero when unaffordable
    async fn adjust_order_candidate(&self, candidate: &OrderCandidate) -> Result<Decimal>;

    /// Route order events for `instrument` into `sink`
    fn register_listener(&self, instrument: &InstrumentId, sink: OrderEventSink);

    fn unregister_listener(&self, instrument: &InstrumentId);
}

/// Candle retrieval and feed subscriptions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Most recent `window` candles, oldest first
    async fn get_recent_candles(
        &self,
        instrument: &InstrumentId,
        interval: &str,
        window: usize,
    ) -> Result<Vec<Candle>>;

    async fn last_price(&self, instrument: &InstrumentId) -> Result<Decimal>;

    async fn start_feed(&self, instrument: &InstrumentId, interval: &str, window: usize)
        -> Result<()>;

    async fn stop_feed(&self, instrument: &InstrumentId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exchange_kind_accepts_aliases() {
        assert_eq!(
            parse_exchange_kind("paper").expect("paper should parse"),
            ExchangeKind::Paper
        );
        assert_eq!(
            parse_exchange_kind("dry-run").expect("dry-run alias should parse"),
            ExchangeKind::Paper
        );
    }

    #[test]
    fn parse_exchange_kind_rejects_unknown_value() {
        assert!(parse_exchange_kind("foo").is_err());
    }

    #[test]
    fn sink_reports_closed_inbox() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = OrderEventSink::new(tx);
        assert!(sink.deliver(OrderEvent::Created {
            order_id: "a".to_string()
        }));
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.deliver(OrderEvent::Created {
            order_id: "b".to_string()
        }));
    }
}
