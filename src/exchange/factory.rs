use std::sync::Arc;

use crate::adapters::{BinanceKlineFeed, PaperConfig, PaperExchange};
use crate::config::ExchangeConfig;
use crate::error::Result;

use super::{ExchangeKind, ExecutionAdapter, MarketDataProvider};

/// Create the runtime execution adapter from `ExchangeConfig`.
pub fn build_execution_adapter(config: &ExchangeConfig) -> Arc<dyn ExecutionAdapter> {
    match config.kind {
        ExchangeKind::Paper => Arc::new(PaperExchange::new(PaperConfig::from(config))),
    }
}

/// Create the candle/price source. Always the public REST endpoint.
pub fn build_market_data_provider(config: &ExchangeConfig) -> Result<Arc<dyn MarketDataProvider>> {
    Ok(Arc::new(BinanceKlineFeed::new(&config.rest_url)?))
}
