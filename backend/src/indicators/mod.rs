// =============================================================================
// Indicators
// =============================================================================
//
// Pure functions over price series.  Column helpers return one slot per input
// element with the warm-up head left as `None`.

pub mod atr;
pub mod ema;
pub mod extrema;
pub mod rsi;

use crate::types::Bar;

/// Price fields an indicator reads.
pub trait Ohlc {
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
}

impl Ohlc for Bar {
    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }
}

#[derive(Debug, Clone, Copy)]
enum Smoothing {
    /// `(prev * (n - 1) + x) / n`
    Wilder,
    /// `x * k + prev * (1 - k)` with `k = 2 / (n + 1)`
    Exponential,
}

/// Running average seeded with the plain mean of its first `period` inputs.
#[derive(Debug, Clone)]
pub(crate) struct Smoothed {
    period: usize,
    kind: Smoothing,
    seen: usize,
    sum: f64,
    value: Option<f64>,
}

impl Smoothed {
    pub(crate) fn wilder(period: usize) -> Self {
        Self::new(period, Smoothing::Wilder)
    }

    pub(crate) fn exponential(period: usize) -> Self {
        Self::new(period, Smoothing::Exponential)
    }

    fn new(period: usize, kind: Smoothing) -> Self {
        Self {
            period,
            kind,
            seen: 0,
            sum: 0.0,
            value: None,
        }
    }

    /// Feed one input; `None` until `period` inputs were seen.
    pub(crate) fn push(&mut self, x: f64) -> Option<f64> {
        let n = self.period as f64;
        let next = match (self.value, self.kind) {
            (Some(prev), Smoothing::Wilder) => (prev * (n - 1.0) + x) / n,
            (Some(prev), Smoothing::Exponential) => {
                let k = 2.0 / (n + 1.0);
                x * k + prev * (1.0 - k)
            }
            (None, _) => {
                self.sum += x;
                self.seen += 1;
                if self.seen < self.period {
                    return None;
                }
                self.sum / n
            }
        };
        self.value = Some(next);
        Some(next)
    }
}

/// Right-align `values` in a column of `len` slots.
pub(crate) fn align_tail(values: Vec<f64>, len: usize) -> Vec<Option<f64>> {
    let pad = len.saturating_sub(values.len());
    std::iter::repeat(None)
        .take(pad)
        .chain(values.into_iter().map(Some))
        .take(len)
        .collect()
}
