//! Directional signal functions
//!
//! A signal function maps a candle window to `{-1, 0, +1}` plus the timestamp
//! of the bar it was computed on. Functions are registered by name and
//! selected from configuration.

mod constant;
mod smi;

pub use constant::ConstantSignal;
pub use smi::SmiCrossSignal;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domain::{Candle, TradeSide};
use crate::error::{GridError, Result};

// ============================================================================
// Signal values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Short,
    Neutral,
    Long,
}

impl Signal {
    pub fn value(&self) -> i8 {
        match self {
            Signal::Short => -1,
            Signal::Neutral => 0,
            Signal::Long => 1,
        }
    }

    /// Map any number onto its sign
    pub fn from_value(value: f64) -> Self {
        if value > 0.0 {
            Signal::Long
        } else if value < 0.0 {
            Signal::Short
        } else {
            Signal::Neutral
        }
    }

    pub fn favors(&self, side: TradeSide) -> bool {
        self.value() == side.favoring_signal()
    }

    pub fn opposes(&self, side: TradeSide) -> bool {
        self.value() == -side.favoring_signal()
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalResult {
    pub signal: Signal,
    /// Open time of the bar the signal was computed on
    pub timestamp: DateTime<Utc>,
}

/// Numeric parameters of a signal function, by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalParams(BTreeMap<String, f64>);

impl SignalParams {
    pub fn from_map(params: BTreeMap<String, f64>) -> Self {
        Self(params)
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Positive integer parameter, falling back to `default` when absent
    pub fn period(&self, name: &str, default: usize) -> Result<usize> {
        match self.get(name) {
            None => Ok(default),
            Some(v) if v >= 1.0 && v.fract() == 0.0 => Ok(v as usize),
            Some(v) => Err(GridError::Validation(format!(
                "signal parameter '{name}' must be a positive integer, got {v}"
            ))),
        }
    }
}

// ============================================================================
// Capability trait
// ============================================================================

/// A pure signal function.
///
/// Identical input must produce identical output.
pub trait SignalEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shortest candle window `evaluate` can produce a value from
    fn min_window(&self, params: &SignalParams) -> usize;

    fn evaluate(&self, window: &[Candle], params: &SignalParams) -> Result<SignalResult>;
}

/// Name -> signal function lookup
#[derive(Clone)]
pub struct SignalRegistry {
    evaluators: HashMap<&'static str, Arc<dyn SignalEvaluator>>,
}

impl SignalRegistry {
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    pub fn register(&mut self, evaluator: Arc<dyn SignalEvaluator>) {
        self.evaluators.insert(evaluator.name(), evaluator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SignalEvaluator>> {
        self.evaluators.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn SignalEvaluator>> {
        self.get(name)
            .ok_or_else(|| GridError::UnknownSignal(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.evaluators.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SmiCrossSignal));
        registry.register(Arc::new(ConstantSignal));
        registry
    }
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("evaluators", &self.names())
            .finish()
    }
}

// ============================================================================
// Staleness gate
// ============================================================================

/// Last signal an engine acted on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalState {
    pub last_signal: Option<Signal>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl SignalState {
    /// Record `result` if it is newer than what was seen; returns false for a stale bar
    pub fn observe(&mut self, result: &SignalResult) -> bool {
        if let Some(seen) = self.last_timestamp {
            if result.timestamp <= seen {
                return false;
            }
        }
        self.last_signal = Some(result.signal);
        self.last_timestamp = Some(result.timestamp);
        true
    }
}

/// Index of the last fully closed bar in `window`
pub(crate) fn closed_bar(window: &[Candle], min_window: usize) -> Result<usize> {
    if window.len() < min_window.max(2) {
        return Err(GridError::InvalidMarketData(format!(
            "need at least {} candles, got {}",
            min_window.max(2),
            window.len()
        )));
    }
    Ok(window.len() - 2)
}
