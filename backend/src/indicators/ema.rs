// =============================================================================
// Exponential Moving Average
// =============================================================================
//
//   k     = 2 / (period + 1)
//   EMA_t = close_t * k + EMA_{t-1} * (1 - k)
//
// seeded with the simple mean of the first `period` closes.

use super::{align_tail, Smoothed};

/// EMA values starting at close index `period - 1`; stops at the first
/// non-finite value.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 {
        return Vec::new();
    }
    let mut avg = Smoothed::exponential(period);
    closes
        .iter()
        .filter_map(|&close| avg.push(close))
        .take_while(|v| v.is_finite())
        .collect()
}

/// EMA aligned with `closes`.
pub fn ema_column(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    align_tail(calculate_ema(closes, period), closes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_empty() {
        assert!(calculate_ema(&[], 5).is_empty());
        assert!(calculate_ema(&[1.0, 2.0], 0).is_empty());
        assert!(calculate_ema(&[1.0, 2.0], 3).is_empty());
    }

    #[test]
    fn first_value_is_the_mean() {
        assert_eq!(calculate_ema(&[2.0, 4.0, 6.0, 8.0, 10.0], 5), vec![6.0]);
    }

    #[test]
    fn tracks_a_trend_from_below() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 10);
        assert_eq!(ema.len(), 31);
        assert!(ema.windows(2).all(|w| w[1] > w[0]));
        assert!(ema.iter().zip(&closes[9..]).all(|(e, c)| e <= c));
    }

    #[test]
    fn non_finite_input_ends_the_series() {
        let ema = calculate_ema(&[1.0, 1.0, f64::INFINITY, 1.0], 2);
        assert_eq!(ema, vec![1.0]);
    }

    #[test]
    fn column_pads_warm_up() {
        let col = ema_column(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(col, vec![None, None, Some(2.0), Some(3.0)]);
    }
}
