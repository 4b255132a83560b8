// =============================================================================
// Average True Range (Wilder)
// =============================================================================
//
//   TR  = max(high - low, |high - prev_close|, |low - prev_close|)
//   ATR = Wilder-smoothed TR, seeded with the mean of the first `period` TRs

use super::{Ohlc, Smoothed};

/// True range of `bar` given the bar before it.
pub fn true_range<B: Ohlc>(prev: &B, bar: &B) -> f64 {
    let prev_close = prev.close();
    (bar.high() - bar.low())
        .max((bar.high() - prev_close).abs())
        .max((bar.low() - prev_close).abs())
}

/// Latest ATR over `bars` (oldest first).
///
/// `None` with a zero period, fewer than `period + 1` bars, or a non-finite
/// intermediate value.
pub fn calculate_atr<B: Ohlc>(bars: &[B], period: usize) -> Option<f64> {
    if period == 0 || bars.len() <= period {
        return None;
    }
    let mut avg = Smoothed::wilder(period);
    let mut latest = None;
    for pair in bars.windows(2) {
        if let Some(atr) = avg.push(true_range(&pair[0], &pair[1])) {
            if !atr.is_finite() {
                return None;
            }
            latest = Some(atr);
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;
    use chrono::Utc;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "XYZ".into(),
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 100,
        }
    }

    #[test]
    fn needs_period_plus_one_bars() {
        let bars = vec![bar(11.0, 9.0, 10.0); 5];
        assert!(calculate_atr(&bars, 0).is_none());
        assert!(calculate_atr(&bars, 5).is_none());
        assert_eq!(calculate_atr(&bars, 4), Some(2.0));
    }

    #[test]
    fn gap_dominates_the_range() {
        assert_eq!(true_range(&bar(105.0, 95.0, 95.0), &bar(115.0, 108.0, 112.0)), 20.0);
        assert_eq!(true_range(&bar(105.0, 95.0, 120.0), &bar(115.0, 108.0, 112.0)), 12.0);
    }

    #[test]
    fn smooths_after_seed() {
        let bars = vec![
            bar(105.0, 95.0, 95.0),
            bar(115.0, 108.0, 112.0),
            bar(118.0, 110.0, 115.0),
            bar(117.0, 113.0, 114.0),
        ];
        // TRs 20, 8, 4 => seed 14, then (14 + 4) / 2
        assert_eq!(calculate_atr(&bars, 2), Some(9.0));
    }
}
