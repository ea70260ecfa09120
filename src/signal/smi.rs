//! Stochastic Momentum Index cross
//!
//! Long when SMI crosses above its signal line, short when it crosses below.

use rust_decimal::prelude::ToPrimitive;

use super::{closed_bar, Signal, SignalEvaluator, SignalParams, SignalResult};
use crate::domain::Candle;
use crate::error::{GridError, Result};

const DEFAULT_K: usize = 10;
const DEFAULT_D: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct SmiCrossSignal;

impl SmiCrossSignal {
    fn periods(params: &SignalParams) -> Result<(usize, usize)> {
        Ok((params.period("k", DEFAULT_K)?, params.period("d", DEFAULT_D)?))
    }
}

impl SignalEvaluator for SmiCrossSignal {
    fn name(&self) -> &'static str {
        "smi"
    }

    fn min_window(&self, params: &SignalParams) -> usize {
        let (k, d) = Self::periods(params).unwrap_or((DEFAULT_K, DEFAULT_D));
        // rolling k, three stacked EMA(d), one bar of history for the cross,
        // plus the still-forming last bar
        k + 3 * (d - 1) + 2
    }

    fn evaluate(&self, window: &[Candle], params: &SignalParams) -> Result<SignalResult> {
        let (k, d) = Self::periods(params)?;
        let mut bars = window.to_vec();
        bars.sort_by_key(|c| c.timestamp);

        let idx = closed_bar(&bars, self.min_window(params))?;
        let (smi, signal_line) = smi_lines(&bars, k, d)?;

        Ok(SignalResult {
            signal: cross(&smi, &signal_line, idx),
            timestamp: bars[idx].timestamp,
        })
    }
}

/// SMI and its EMA signal line, aligned with `bars`
fn smi_lines(bars: &[Candle], k: usize, d: usize) -> Result<(Vec<Option<f64>>, Vec<Option<f64>>)> {
    let to_f64 = |v: rust_decimal::Decimal| {
        v.to_f64()
            .ok_or_else(|| GridError::InvalidMarketData(format!("price {v} out of range")))
    };

    let mut highs = Vec::with_capacity(bars.len());
    let mut lows = Vec::with_capacity(bars.len());
    let mut closes = Vec::with_capacity(bars.len());
    for bar in bars {
        highs.push(to_f64(bar.high)?);
        lows.push(to_f64(bar.low)?);
        closes.push(to_f64(bar.close)?);
    }

    let mut rdiff = vec![None; bars.len()];
    let mut diff = vec![None; bars.len()];
    for i in k.saturating_sub(1)..bars.len() {
        let start = i + 1 - k;
        let hh = highs[start..=i].iter().copied().fold(f64::MIN, f64::max);
        let ll = lows[start..=i].iter().copied().fold(f64::MAX, f64::min);
        rdiff[i] = Some(closes[i] - (hh + ll) / 2.0);
        diff[i] = Some(hh - ll);
    }

    let avgrel = ema(&ema(&rdiff, d), d);
    let avgdiff = ema(&ema(&diff, d), d);

    let smi: Vec<Option<f64>> = avgrel
        .iter()
        .zip(&avgdiff)
        .map(|(rel, range)| match (rel, range) {
            (Some(rel), Some(range)) if range.abs() > f64::EPSILON => {
                Some(rel * 100.0 / (range / 2.0))
            }
            _ => None,
        })
        .collect();
    let signal_line = ema(&smi, d);

    Ok((smi, signal_line))
}

/// Exponential moving average seeded with the SMA of the first `len` defined values.
///
/// Undefined inputs after the seed yield undefined outputs and leave the average untouched.
fn ema(series: &[Option<f64>], len: usize) -> Vec<Option<f64>> {
    let alpha = 2.0 / (len as f64 + 1.0);
    let mut out = vec![None; series.len()];
    let mut seed = Vec::with_capacity(len);
    let mut current: Option<f64> = None;

    for (i, value) in series.iter().enumerate() {
        let Some(value) = *value else {
            continue;
        };
        match current {
            Some(prev) => {
                let next = alpha * value + (1.0 - alpha) * prev;
                current = Some(next);
                out[i] = Some(next);
            }
            None => {
                seed.push(value);
                if seed.len() == len {
                    let sma = seed.iter().sum::<f64>() / len as f64;
                    current = Some(sma);
                    out[i] = Some(sma);
                }
            }
        }
    }
    out
}

/// Direction in which `a` crossed `b` at bar `i`
fn cross(a: &[Option<f64>], b: &[Option<f64>], i: usize) -> Signal {
    if i == 0 {
        return Signal::Neutral;
    }
    match (a[i], b[i], a[i - 1], b[i - 1]) {
        (Some(a_now), Some(b_now), Some(a_prev), Some(b_prev)) => {
            if a_now > b_now && a_prev < b_prev {
                Signal::Long
            } else if a_now < b_now && a_prev > b_prev {
                Signal::Short
            } else {
                Signal::Neutral
            }
        }
        _ => Signal::Neutral,
    }
}
