use super::{closed_bar, Signal, SignalEvaluator, SignalParams, SignalResult};
use crate::domain::Candle;
use crate::error::Result;

/// Fixed signal for a plain grid without a directional filter.
///
/// Reads `value` from the parameters (default `+1`) and stamps it with the
/// last closed bar, so each new candle is one decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantSignal;

impl SignalEvaluator for ConstantSignal {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn min_window(&self, _params: &SignalParams) -> usize {
        2
    }

    fn evaluate(&self, window: &[Candle], params: &SignalParams) -> Result<SignalResult> {
        let idx = closed_bar(window, self.min_window(params))?;
        let mut stamps: Vec<_> = window.iter().map(|c| c.timestamp).collect();
        stamps.sort_unstable();

        Ok(SignalResult {
            signal: Signal::from_value(params.get("value").unwrap_or(1.0)),
            timestamp: stamps[idx],
        })
    }
}
