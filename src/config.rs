use config::{Config, ConfigError, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::domain::{InstrumentId, OrderType, TradeSide};
use crate::exchange::ExchangeKind;
use crate::signal::{SignalParams, SignalRegistry};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    pub controller: ControllerSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Per-pair grid and signal parameters, keyed by pair (e.g. "DOGE-USDT")
    #[serde(default)]
    pub params: BTreeMap<String, PairParams>,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerSettings {
    /// Pairs to run an engine for, per connector
    #[serde(default)]
    pub markets: BTreeMap<String, BTreeSet<String>>,
    /// Controller control pass interval in milliseconds
    #[serde(default = "default_control_interval_ms")]
    pub control_interval_ms: u64,
    /// Idle engines older than this are stopped and recreated (0 = disabled)
    #[serde(default)]
    pub refresh_interval_secs: u64,
    /// How often the binary reloads configuration files
    #[serde(default = "default_config_update_interval")]
    pub config_update_interval_secs: u64,
    /// Capacity of the engine -> controller shutdown notification queue
    #[serde(default = "default_shutdown_queue_capacity")]
    pub shutdown_queue_capacity: usize,
    /// Bounded wait when the shutdown queue is full before dropping the notice
    #[serde(default = "default_shutdown_notify_timeout_ms")]
    pub shutdown_notify_timeout_ms: u64,
    /// Reports of closed engines kept for inspection
    #[serde(default = "default_closed_engines_buffer")]
    pub closed_engines_buffer: usize,
    /// Maximum wait for engines to drain on process shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_control_interval_ms() -> u64 {
    1000
}

fn default_config_update_interval() -> u64 {
    60
}

fn default_shutdown_queue_capacity() -> usize {
    64
}

fn default_shutdown_notify_timeout_ms() -> u64 {
    500
}

fn default_closed_engines_buffer() -> usize {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineSettings {
    /// Minimum seconds between two control passes of one engine
    #[serde(default = "default_executor_interval")]
    pub executor_interval_secs: u64,
    /// Close failures tolerated before forcing shutdown
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Tolerance for amount comparisons (drain and close confirmation)
    #[serde(default = "default_amount_epsilon")]
    pub amount_epsilon: Decimal,
}

fn default_executor_interval() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    10
}

fn default_amount_epsilon() -> Decimal {
    Decimal::new(1, 9)
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            executor_interval_secs: default_executor_interval(),
            max_retries: default_max_retries(),
            amount_epsilon: default_amount_epsilon(),
        }
    }
}

/// Grid parameters for one pair
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PairParams {
    pub side: TradeSide,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Base quote notional per rung
    pub amount_quote: Decimal,
    /// Candle interval, e.g. "1m"
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Candle window length fed to the signal function
    pub max_records: usize,
    pub grid_max: u32,
    pub grid_open: Decimal,
    pub grid_close: Decimal,
    pub mart_open: Decimal,
    #[serde(default)]
    pub open_order_type: OrderType,
    pub signal: SignalConfig,
}

fn default_leverage() -> u32 {
    10
}

fn default_interval() -> String {
    "1m".to_string()
}

/// Signal function selection: a registered name plus numeric parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignalConfig {
    pub name: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, f64>,
}

impl SignalConfig {
    pub fn signal_params(&self) -> SignalParams {
        SignalParams::from_map(self.params.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub kind: ExchangeKind,
    /// REST endpoint used for candles and last prices
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Paper account quote balance
    #[serde(default = "default_quote_balance")]
    pub quote_balance: Decimal,
    /// Paper taker fee rate (0.0004 = 4 bps)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Smallest order notional the venue accepts
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_quote_balance() -> Decimal {
    Decimal::from(1000)
}

fn default_fee_rate() -> Decimal {
    Decimal::new(4, 4)
}

fn default_min_notional() -> Decimal {
    Decimal::from(5)
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::default(),
            rest_url: default_rest_url(),
            quote_balance: default_quote_balance(),
            fee_rate: default_fee_rate(),
            min_notional: default_min_notional(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// Outcome of applying a reloaded configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub applied: Vec<&'static str>,
    /// Changed fields that require a restart and were left untouched
    pub ignored: Vec<&'static str>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.ignored.is_empty()
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Self::with_defaults(Config::builder())?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("GRID_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (GRID_ENGINE__MAX_RETRIES, etc.)
            .add_source(
                Environment::with_prefix("GRID")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config.normalized())
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = Self::with_defaults(Config::builder())?
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config.normalized())
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("engine.executor_interval_secs", 60)?
            .set_default("engine.max_retries", 10)
    }

    /// Upper-case pair identifiers so lookups do not depend on source casing
    fn normalized(mut self) -> Self {
        self.params = self
            .params
            .into_iter()
            .map(|(pair, params)| (pair.to_uppercase(), params))
            .collect();
        for pairs in self.controller.markets.values_mut() {
            *pairs = pairs.iter().map(|p| p.to_uppercase()).collect();
        }
        self
    }

    /// All configured instruments, ordered
    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.controller
            .markets
            .iter()
            .flat_map(|(connector, pairs)| {
                pairs.iter().map(move |pair| InstrumentId::new(connector, pair))
            })
            .collect()
    }

    pub fn pair_params(&self, pair: &str) -> Option<&PairParams> {
        self.params.get(&pair.to_uppercase())
    }

    /// Copy the hot-reloadable fields from `new`, report the rest
    pub fn apply_update(&mut self, new: &AppConfig) -> ConfigUpdate {
        let mut update = ConfigUpdate::default();

        if self.controller.markets != new.controller.markets {
            self.controller.markets = new.controller.markets.clone();
            update.applied.push("controller.markets");
        }
        if self.params != new.params {
            self.params = new.params.clone();
            update.applied.push("params");
        }
        if self.controller.refresh_interval_secs != new.controller.refresh_interval_secs {
            self.controller.refresh_interval_secs = new.controller.refresh_interval_secs;
            update.applied.push("controller.refresh_interval_secs");
        }

        let mut fixed_controller = new.controller.clone();
        fixed_controller.markets = self.controller.markets.clone();
        fixed_controller.refresh_interval_secs = self.controller.refresh_interval_secs;
        if fixed_controller != self.controller {
            update.ignored.push("controller");
        }
        if self.engine != new.engine {
            update.ignored.push("engine");
        }
        if self.exchange != new.exchange {
            update.ignored.push("exchange");
        }
        if self.logging != new.logging {
            update.ignored.push("logging");
        }

        update
    }

    /// Create a default configuration for tests and CLI usage
    pub fn default_config(connector: &str, pairs: &[&str]) -> Self {
        use rust_decimal_macros::dec;

        let mut markets = BTreeMap::new();
        markets.insert(
            connector.to_string(),
            pairs.iter().map(|p| p.to_uppercase()).collect(),
        );

        let params = pairs
            .iter()
            .map(|pair| {
                (
                    pair.to_uppercase(),
                    PairParams {
                        side: TradeSide::Long,
                        leverage: 10,
                        amount_quote: dec!(50),
                        interval: "1m".to_string(),
                        max_records: 37,
                        grid_max: 100,
                        grid_open: dec!(0.02),
                        grid_close: dec!(0.01),
                        mart_open: dec!(0.25),
                        open_order_type: OrderType::Market,
                        signal: SignalConfig {
                            name: "smi".to_string(),
                            params: BTreeMap::from([("k".to_string(), 17.0), ("d".to_string(), 4.0)]),
                        },
                    },
                )
            })
            .collect();

        Self {
            controller: ControllerSettings {
                markets,
                control_interval_ms: default_control_interval_ms(),
                refresh_interval_secs: 0,
                config_update_interval_secs: default_config_update_interval(),
                shutdown_queue_capacity: default_shutdown_queue_capacity(),
                shutdown_notify_timeout_ms: default_shutdown_notify_timeout_ms(),
                closed_engines_buffer: default_closed_engines_buffer(),
                shutdown_grace_secs: default_shutdown_grace_secs(),
            },
            engine: EngineSettings::default(),
            params,
            exchange: ExchangeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self, registry: &SignalRegistry) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.controller.shutdown_queue_capacity == 0 {
            errors.push("controller.shutdown_queue_capacity must be positive".to_string());
        }
        if self.engine.executor_interval_secs == 0 {
            errors.push("engine.executor_interval_secs must be positive".to_string());
        }

        for instrument in self.instruments() {
            if self.pair_params(&instrument.pair).is_none() {
                errors.push(format!("{} has no params entry", instrument));
            }
        }

        for (pair, params) in &self.params {
            let frac = |name: &str, value: Decimal, errors: &mut Vec<String>| {
                if value <= Decimal::ZERO || value >= Decimal::ONE {
                    errors.push(format!("{pair}: {name} must be between 0 and 1"));
                }
            };
            frac("grid_open", params.grid_open, &mut errors);
            frac("grid_close", params.grid_close, &mut errors);
            frac("mart_open", params.mart_open, &mut errors);

            if params.amount_quote <= Decimal::ZERO {
                errors.push(format!("{pair}: amount_quote must be positive"));
            }
            if params.grid_max == 0 {
                errors.push(format!("{pair}: grid_max must be at least 1"));
            }
            if params.leverage == 0 {
                errors.push(format!("{pair}: leverage must be at least 1"));
            }

            match registry.get(&params.signal.name) {
                Some(signal) => {
                    let needed = signal.min_window(&params.signal.signal_params());
                    if params.max_records < needed {
                        errors.push(format!(
                            "{pair}: max_records {} is below the {} candles signal '{}' needs",
                            params.max_records, needed, params.signal.name
                        ));
                    }
                }
                None => errors.push(format!(
                    "{pair}: unknown signal function '{}'",
                    params.signal.name
                )),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
