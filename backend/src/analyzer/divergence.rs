// =============================================================================
// Divergence Detector
// =============================================================================
//
// Finds at most one price/RSI divergence ending at the most recent closed bar
// pair.  The forming (last) bar is never looked at.
//
//   1. Price pattern over the three most recent closed bars (c3, c2, c1):
//        Bearish: c1 < c2 > c3 and high2 > high3
//        Bullish: c1 > c2 < c3 and low2  < low3
//   2. RSI extrema (strict, clipped edges) of the matching kind; the newest
//      one must sit on the middle bar of the pattern.
//   3. Walk older extrema newest → oldest, keep the pairing whose RSI slope
//      and price slope point in opposite directions with the widest angle
//      between them.  RSI slopes must keep tightening from one accepted
//      candidate to the next, and one end of the pair must sit in the zone
//      (>= overbought for bearish, <= oversold for bullish).
// =============================================================================

use std::f64::consts::PI;

use chrono::{DateTime, Utc};

use super::series::AggregatedBar;
use crate::indicators::extrema::{find_extrema, Comparison, ExtremumKind};
use crate::types::{Divergence, DivergenceType, TradingSession};

/// Detector tuning.
#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    pub order: usize,
    pub overbought: f64,
    pub oversold: f64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            order: 3,
            overbought: 70.0,
            oversold: 30.0,
        }
    }
}

/// Detect a divergence on `series`, ignoring its last (forming) bar.
pub fn detect(
    symbol: &str,
    series: &[AggregatedBar],
    params: &DetectorParams,
    session: &TradingSession,
) -> Option<Divergence> {
    let closed = series.split_last()?.1;
    let n = closed.len();
    if n < 3 {
        return None;
    }

    let (c1, c2, c3) = (&closed[n - 1], &closed[n - 2], &closed[n - 3]);
    let kind = if c1.close < c2.close && c2.close > c3.close && c2.high > c3.high {
        DivergenceType::Bearish
    } else if c1.close > c2.close && c2.close < c3.close && c2.low < c3.low {
        DivergenceType::Bullish
    } else {
        return None;
    };

    let rsi: Vec<f64> = closed.iter().map(|b| b.rsi.unwrap_or(f64::NAN)).collect();
    let extremum = match kind {
        DivergenceType::Bearish => ExtremumKind::Max,
        DivergenceType::Bullish => ExtremumKind::Min,
    };
    let extrema = find_extrema(&rsi, params.order, extremum, Comparison::Strict);
    let (&last_idx, prior) = extrema.split_last()?;
    if last_idx != n - 2 {
        return None;
    }

    let price = |b: &AggregatedBar| match kind {
        DivergenceType::Bearish => b.high,
        DivergenceType::Bullish => b.low,
    };
    let end = &closed[last_idx];

    let mut best: Option<(f64, usize)> = None;
    let mut prev_rsi_angle: Option<f64> = None;
    for &idx in prior.iter().rev() {
        let start = &closed[idx];
        let rsi_angle = slope_angle(start.timestamp, rsi[idx], end.timestamp, rsi[last_idx]);

        if let Some(prev) = prev_rsi_angle {
            let loosening = match kind {
                DivergenceType::Bearish => rsi_angle > prev,
                DivergenceType::Bullish => rsi_angle < prev,
            };
            if loosening {
                continue;
            }
        }
        prev_rsi_angle = Some(rsi_angle);

        let in_zone = match kind {
            DivergenceType::Bearish => rsi[idx] >= params.overbought || rsi[last_idx] >= params.overbought,
            DivergenceType::Bullish => rsi[idx] <= params.oversold || rsi[last_idx] <= params.oversold,
        };
        if !in_zone {
            continue;
        }

        let price_angle = slope_angle(start.timestamp, price(start), end.timestamp, price(end));
        if rsi_angle * price_angle >= 0.0 {
            continue;
        }

        let diff = angle_between(rsi_angle, price_angle);
        if best.map_or(true, |(d, _)| diff > d) {
            best = Some((diff, idx));
        }
    }

    let (_, start_idx) = best?;
    let start = &closed[start_idx];
    Some(Divergence {
        symbol: symbol.to_string(),
        kind,
        day: session.day(end.timestamp),
        start: start.timestamp,
        start_price: price(start),
        start_rsi: rsi[start_idx],
        end: end.timestamp,
        end_price: price(end),
        end_rsi: rsi[last_idx],
    })
}

/// Angle of the segment from `(t0, y0)` to `(t1, y1)`, with time in seconds.
fn slope_angle(t0: DateTime<Utc>, y0: f64, t1: DateTime<Utc>, y1: f64) -> f64 {
    let dx = (t1 - t0).num_seconds() as f64;
    (y1 - y0).atan2(dx)
}

/// Absolute difference of two angles folded into `[0, π]`.
fn angle_between(a: f64, b: f64) -> f64 {
    let d = (a - b).abs();
    d.min(2.0 * PI - d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// `(close, high, low, rsi)` per bar, five minutes apart.
    fn series(rows: &[(f64, f64, f64, Option<f64>)]) -> Vec<AggregatedBar> {
        let t0 = Utc.with_ymd_and_hms(2025, 5, 21, 14, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, &(close, high, low, rsi))| AggregatedBar {
                timestamp: t0 + Duration::minutes(5 * i as i64),
                open: close,
                high,
                low,
                close,
                volume: 100,
                rsi,
                ma: None,
            })
            .collect()
    }

    fn flat(close: f64, rsi: f64) -> (f64, f64, f64, Option<f64>) {
        (close, close + 0.5, close - 0.5, Some(rsi))
    }

    fn bearish_fixture() -> Vec<AggregatedBar> {
        series(&[
            flat(100.0, 50.0),
            flat(100.0, 50.0),
            flat(100.0, 50.0),
            (102.0, 103.0, 101.0, Some(78.0)), // first RSI peak
            flat(100.0, 55.0),
            flat(100.0, 52.0),
            flat(100.0, 50.0),
            flat(101.0, 60.0),
            (104.0, 106.0, 103.0, Some(72.0)), // higher high, lower RSI peak
            flat(102.0, 62.0),
            flat(102.0, 62.0), // forming bar
        ])
    }

    #[test]
    fn bearish_divergence_detected() {
        let div = detect("XYZ", &bearish_fixture(), &DetectorParams::default(), &TradingSession::default())
            .expect("divergence");
        assert_eq!(div.kind, DivergenceType::Bearish);
        assert_eq!(div.start_price, 103.0);
        assert_eq!(div.end_price, 106.0);
        assert_eq!(div.start_rsi, 78.0);
        assert_eq!(div.end_rsi, 72.0);
        assert_eq!(div.end - div.start, Duration::minutes(25));
    }

    #[test]
    fn bullish_divergence_detected() {
        let s = series(&[
            flat(100.0, 50.0),
            flat(100.0, 50.0),
            flat(100.0, 50.0),
            (98.0, 99.0, 97.0, Some(22.0)),
            flat(100.0, 45.0),
            flat(100.0, 48.0),
            flat(100.0, 50.0),
            flat(99.0, 40.0),
            (96.0, 97.0, 94.0, Some(28.0)), // lower low, higher RSI trough
            flat(98.0, 38.0),
            flat(98.0, 38.0),
        ]);
        let div = detect("XYZ", &s, &DetectorParams::default(), &TradingSession::default()).unwrap();
        assert_eq!(div.kind, DivergenceType::Bullish);
        assert_eq!(div.start_price, 97.0);
        assert_eq!(div.end_price, 94.0);
    }

    #[test]
    fn ignores_forming_bar() {
        // Same data minus the forming bar: the peak is now the second-to-last
        // bar of the whole series, not of the closed window.
        let mut s = bearish_fixture();
        s.pop();
        assert!(detect("XYZ", &s, &DetectorParams::default(), &TradingSession::default()).is_none());
    }

    #[test]
    fn outside_zone_is_rejected() {
        let mut s = bearish_fixture();
        s[3].rsi = Some(65.0);
        s[8].rsi = Some(64.0);
        s[9].rsi = Some(55.0);
        assert!(detect("XYZ", &s, &DetectorParams::default(), &TradingSession::default()).is_none());
    }

    #[test]
    fn agreeing_slopes_are_not_divergence() {
        let mut s = bearish_fixture();
        // RSI rises with price.
        s[8].rsi = Some(85.0);
        assert!(detect("XYZ", &s, &DetectorParams::default(), &TradingSession::default()).is_none());
    }

    #[test]
    fn too_short_series_yields_nothing() {
        let s = series(&[flat(1.0, 50.0), flat(2.0, 60.0), flat(1.0, 40.0)]);
        assert!(detect("XYZ", &s, &DetectorParams::default(), &TradingSession::default()).is_none());
        assert!(detect("XYZ", &[], &DetectorParams::default(), &TradingSession::default()).is_none());
    }

    #[test]
    fn angle_between_wraps() {
        assert!((angle_between(PI - 0.1, -PI + 0.1) - 0.2).abs() < 1e-12);
        assert!((angle_between(0.3, -0.2) - 0.5).abs() < 1e-12);
    }
}
