pub mod binance_klines;
pub mod paper;
pub mod replay;

pub use binance_klines::BinanceKlineFeed;
pub use paper::{PaperConfig, PaperExchange};
pub use replay::ReplayFeed;
