//! Binance USDⓈ-M futures K-line REST client
//!
//! Serves candle windows and last trade prices for perpetual pairs.

use async_trait::async_trait;
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::{Candle, InstrumentId};
use crate::error::{GridError, Result};
use crate::exchange::MarketDataProvider;

/// Binance caps a single klines request at this many rows
const MAX_KLINES_PER_REQUEST: usize = 1500;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FeedSpec {
    interval: String,
    window: usize,
}

pub struct BinanceKlineFeed {
    client: reqwest::Client,
    base_url: String,
    feeds: RwLock<HashMap<InstrumentId, FeedSpec>>,
}

impl BinanceKlineFeed {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            feeds: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch the most recent `limit` klines, oldest first
    pub async fn fetch_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            interval,
            limit.clamp(1, MAX_KLINES_PER_REQUEST)
        );

        debug!("Fetching K-lines: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GridError::MarketDataUnavailable(format!(
                "K-line API error for {}: {}",
                symbol,
                response.status()
            )));
        }

        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;
        let mut candles: Vec<Candle> = rows.iter().filter_map(|row| parse_kline_row(row)).collect();
        candles.sort_by_key(|c| c.timestamp);

        debug!("Fetched {} K-lines for {}", candles.len(), symbol);
        Ok(candles)
    }

    pub async fn fetch_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GridError::MarketDataUnavailable(format!(
                "ticker API error for {}: {}",
                symbol,
                response.status()
            )));
        }
        let ticker: TickerPrice = response.json().await?;
        ticker
            .price
            .parse()
            .map_err(|e| GridError::InvalidMarketData(format!("price '{}': {}", ticker.price, e)))
    }

    pub async fn active_feeds(&self) -> Vec<InstrumentId> {
        let mut ids: Vec<_> = self.feeds.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Parse one kline row: `[open_time, open, high, low, close, volume, close_time, ...]`
fn parse_kline_row(row: &[serde_json::Value]) -> Option<Candle> {
    if row.len() < 6 {
        return None;
    }
    let timestamp = DateTime::from_timestamp_millis(row[0].as_i64()?)?;
    Some(Candle {
        timestamp,
        open: row[1].as_str()?.parse().ok()?,
        high: row[2].as_str()?.parse().ok()?,
        low: row[3].as_str()?.parse().ok()?,
        close: row[4].as_str()?.parse().ok()?,
        volume: row[5].as_str()?.parse().ok()?,
    })
}

#[async_trait]
impl MarketDataProvider for BinanceKlineFeed {
    async fn get_recent_candles(
        &self,
        instrument: &InstrumentId,
        interval: &str,
        window: usize,
    ) -> Result<Vec<Candle>> {
        let candles = self.fetch_klines(&instrument.symbol(), interval, window).await?;
        if candles.is_empty() {
            return Err(GridError::MarketDataUnavailable(format!(
                "no candles returned for {instrument}"
            )));
        }
        Ok(candles)
    }

    async fn last_price(&self, instrument: &InstrumentId) -> Result<Decimal> {
        self.fetch_price(&instrument.symbol()).await
    }

    async fn start_feed(&self, instrument: &InstrumentId, interval: &str, window: usize) -> Result<()> {
        let spec = FeedSpec {
            interval: interval.to_string(),
            window,
        };
        let mut feeds = self.feeds.write().await;
        if feeds.get(instrument) != Some(&spec) {
            info!(%instrument, interval, window, "Starting candle feed");
            feeds.insert(instrument.clone(), spec);
        }
        Ok(())
    }

    async fn stop_feed(&self, instrument: &InstrumentId) -> Result<()> {
        if self.feeds.write().await.remove(instrument).is_some() {
            info!(%instrument, "Stopped candle feed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_kline_row() {
        let row = json!([
            1_700_000_000_000_i64,
            "0.0801",
            "0.0810",
            "0.0795",
            "0.0805",
            "123456",
            1_700_000_059_999_i64,
            "9876.5",
            321,
            "60000",
            "4800",
            "0"
        ]);
        let row = row.as_array().expect("array");

        let candle = parse_kline_row(row).expect("parses");
        assert_eq!(candle.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(candle.high, dec!(0.0810));
        assert_eq!(candle.close, dec!(0.0805));
        assert_eq!(candle.volume, dec!(123456));
    }

    #[test]
    fn test_parse_rejects_malformed_rows() {
        let short = json!([1_700_000_000_000_i64, "1"]);
        assert!(parse_kline_row(short.as_array().expect("array")).is_none());

        let numeric_price = json!([1_700_000_000_000_i64, 1, 1, 1, 1, 1]);
        assert!(parse_kline_row(numeric_price.as_array().expect("array")).is_none());
    }

    #[tokio::test]
    async fn test_feed_bookkeeping() {
        let feed = BinanceKlineFeed::new("https://fapi.binance.com/").expect("client");
        assert_eq!(feed.base_url, "https://fapi.binance.com");

        let id = InstrumentId::new("binance_perpetual", "DOGE-USDT");
        feed.start_feed(&id, "1m", 37).await.expect("start");
        feed.start_feed(&id, "1m", 37).await.expect("restart");
        assert_eq!(feed.active_feeds().await, vec![id.clone()]);

        feed.stop_feed(&id).await.expect("stop");
        assert!(feed.active_feeds().await.is_empty());
    }
}
