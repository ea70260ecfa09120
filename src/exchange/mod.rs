mod factory;
mod traits;

pub use factory::{build_execution_adapter, build_market_data_provider};
pub use traits::{
    parse_exchange_kind, ExchangeKind, ExecutionAdapter, MarketDataProvider, OrderEventSink,
};

#[cfg(test)]
pub use traits::{MockExecutionAdapter, MockMarketDataProvider};
