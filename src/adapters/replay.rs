//! In-memory candle source
//!
//! Serves candles and last prices that the caller pushes in, in order.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{Candle, InstrumentId};
use crate::error::{GridError, Result};
use crate::exchange::MarketDataProvider;

#[derive(Default)]
pub struct ReplayFeed {
    candles: RwLock<HashMap<InstrumentId, Vec<Candle>>>,
    prices: RwLock<HashMap<InstrumentId, Decimal>>,
    feeds: RwLock<BTreeSet<InstrumentId>>,
}

impl ReplayFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_candles(&self, instrument: &InstrumentId, candles: Vec<Candle>) {
        self.candles.write().await.insert(instrument.clone(), candles);
    }

    pub async fn push_candle(&self, instrument: &InstrumentId, candle: Candle) {
        self.candles
            .write()
            .await
            .entry(instrument.clone())
            .or_default()
            .push(candle);
    }

    /// Override the last price; defaults to the newest candle close
    pub async fn set_price(&self, instrument: &InstrumentId, price: Decimal) {
        self.prices.write().await.insert(instrument.clone(), price);
    }

    pub async fn active_feeds(&self) -> Vec<InstrumentId> {
        self.feeds.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl MarketDataProvider for ReplayFeed {
    async fn get_recent_candles(
        &self,
        instrument: &InstrumentId,
        _interval: &str,
        window: usize,
    ) -> Result<Vec<Candle>> {
        let candles = self.candles.read().await;
        let series = candles
            .get(instrument)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GridError::MarketDataUnavailable(format!("no candles for {instrument}")))?;
        let start = series.len().saturating_sub(window);
        Ok(series[start..].to_vec())
    }

    async fn last_price(&self, instrument: &InstrumentId) -> Result<Decimal> {
        if let Some(price) = self.prices.read().await.get(instrument) {
            return Ok(*price);
        }
        self.candles
            .read()
            .await
            .get(instrument)
            .and_then(|c| c.last())
            .map(|c| c.close)
            .ok_or_else(|| GridError::MarketDataUnavailable(format!("no price for {instrument}")))
    }

    async fn start_feed(&self, instrument: &InstrumentId, interval: &str, window: usize) -> Result<()> {
        debug!(%instrument, interval, window, "Replay feed started");
        self.feeds.write().await.insert(instrument.clone());
        Ok(())
    }

    async fn stop_feed(&self, instrument: &InstrumentId) -> Result<()> {
        debug!(%instrument, "Replay feed stopped");
        self.feeds.write().await.remove(instrument);
        Ok(())
    }
}
