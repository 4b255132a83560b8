// =============================================================================
// Relative Strength Index (Wilder)
// =============================================================================
//
// Upward and downward moves of consecutive closes are averaged separately with
// Wilder smoothing, each seeded by the mean of its first `period` moves:
//
//   RSI = 100 - 100 / (1 + avg_up / avg_down)
//
// A series that never falls reads 100, one that never moves reads 50.
// =============================================================================

use super::{align_tail, Smoothed};

/// RSI values starting at close index `period`.
///
/// Empty when `period` is zero or fewer than `period + 1` closes are given.
/// The series stops at the first non-finite value.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 {
        return Vec::new();
    }

    let mut up = Smoothed::wilder(period);
    let mut down = Smoothed::wilder(period);
    let mut out = Vec::with_capacity(closes.len().saturating_sub(period));

    for pair in closes.windows(2) {
        let change = pair[1] - pair[0];
        let rise = if change > 0.0 { change } else { 0.0 };
        let fall = if change > 0.0 { 0.0 } else { change.abs() };

        let (Some(avg_up), Some(avg_down)) = (up.push(rise), down.push(fall)) else {
            continue;
        };
        match strength_index(avg_up, avg_down) {
            Some(rsi) => out.push(rsi),
            None => break,
        }
    }
    out
}

/// RSI aligned with `closes`.
pub fn rsi_column(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    align_tail(calculate_rsi(closes, period), closes.len())
}

fn strength_index(avg_up: f64, avg_down: f64) -> Option<f64> {
    let rsi = match (avg_up == 0.0, avg_down == 0.0) {
        (true, true) => 50.0,
        (_, true) => 100.0,
        _ => 100.0 - 100.0 / (1.0 + avg_up / avg_down),
    };
    rsi.is_finite().then_some(rsi)
}
