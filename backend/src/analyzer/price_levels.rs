// =============================================================================
// Price-Level Clusterer — support/resistance from swing points
// =============================================================================
//
// Swing lows (inclusive local minima of lows) and swing highs (inclusive local
// maxima of highs) are weighted by recency: a swing at time t weighs
// (t - series_start), normalised so all weights sum to one.  Swings are then
// swept in ascending price and merged into the running cluster while they sit
// within `tolerance = (series_high - series_low) * tolerance_ratio` of it.
//
// Adjacent output levels are therefore at least one tolerance apart.
// =============================================================================

use chrono::{DateTime, Utc};

use super::series::AggregatedBar;
use crate::indicators::extrema::{find_extrema, Comparison, ExtremumKind};
use crate::types::PriceLevel;

/// Weights at or below this are treated as zero.
pub const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
pub struct ClusterParams {
    pub order: usize,
    pub tolerance_ratio: f64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            order: 5,
            tolerance_ratio: 0.04,
        }
    }
}

struct Swing {
    price: f64,
    at: DateTime<Utc>,
    weight: f64,
}

/// Cluster swing points of `series` into weighted levels, sorted by price.
pub fn compute_price_levels(series: &[AggregatedBar], params: &ClusterParams) -> Vec<PriceLevel> {
    let Some(first) = series.first() else {
        return Vec::new();
    };

    let lows: Vec<f64> = series.iter().map(|b| b.low).collect();
    let highs: Vec<f64> = series.iter().map(|b| b.high).collect();

    let mut points: Vec<(usize, f64)> = find_extrema(&lows, params.order, ExtremumKind::Min, Comparison::Inclusive)
        .into_iter()
        .map(|i| (i, lows[i]))
        .chain(
            find_extrema(&highs, params.order, ExtremumKind::Max, Comparison::Inclusive)
                .into_iter()
                .map(|i| (i, highs[i])),
        )
        .collect();
    if points.is_empty() {
        return Vec::new();
    }
    points.sort_by_key(|&(i, _)| i);

    let age = |i: usize| (series[i].timestamp - first.timestamp).num_seconds() as f64;
    let total: f64 = points.iter().map(|&(i, _)| age(i)).sum();
    if total <= 0.0 {
        return Vec::new();
    }

    let mut swings: Vec<Swing> = points
        .iter()
        .map(|&(i, price)| Swing {
            price,
            at: series[i].timestamp,
            weight: age(i) / total,
        })
        .filter(|s| s.weight > WEIGHT_EPSILON)
        .collect();
    swings.sort_by(|a, b| a.price.total_cmp(&b.price));

    let series_high = highs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let series_low = lows.iter().copied().fold(f64::INFINITY, f64::min);
    let tolerance = (series_high - series_low) * params.tolerance_ratio;

    let mut levels: Vec<PriceLevel> = Vec::new();
    for swing in swings {
        match levels.last_mut() {
            Some(level) if (swing.price - level.price).abs() < tolerance => {
                let weight = level.weight + swing.weight;
                level.price = (level.price * level.weight + swing.price * swing.weight) / weight;
                level.weight = weight;
                level.at = level.at.min(swing.at);
            }
            _ => levels.push(PriceLevel {
                price: swing.price,
                weight: swing.weight,
                at: swing.at,
            }),
        }
    }

    levels.retain(|l| l.weight > WEIGHT_EPSILON);
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn hourly(rows: &[(f64, f64)]) -> Vec<AggregatedBar> {
        let t0 = Utc.with_ymd_and_hms(2025, 5, 14, 13, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, &(high, low))| AggregatedBar {
                timestamp: t0 + Duration::hours(i as i64),
                open: (high + low) / 2.0,
                high,
                low,
                close: (high + low) / 2.0,
                volume: 1_000,
                rsi: None,
                ma: None,
            })
            .collect()
    }

    fn wave(n: usize) -> Vec<AggregatedBar> {
        let rows: Vec<(f64, f64)> = (0..n)
            .map(|i| {
                let mid = 100.0 + 10.0 * (i as f64 * 0.45).sin() + 0.05 * i as f64;
                (mid + 1.0, mid - 1.0)
            })
            .collect();
        hourly(&rows)
    }

    #[test]
    fn empty_series_has_no_levels() {
        assert!(compute_price_levels(&[], &ClusterParams::default()).is_empty());
    }

    #[test]
    fn levels_sorted_and_spaced_by_tolerance() {
        let series = wave(120);
        let params = ClusterParams::default();
        let levels = compute_price_levels(&series, &params);
        assert!(!levels.is_empty());

        let high = series.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = series.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let tolerance = (high - low) * params.tolerance_ratio;
        for pair in levels.windows(2) {
            assert!(pair[0].price < pair[1].price);
            assert!(pair[1].price - pair[0].price >= tolerance);
        }
    }

    #[test]
    fn weights_are_normalised() {
        let levels = compute_price_levels(&wave(120), &ClusterParams::default());
        let sum: f64 = levels.iter().map(|l| l.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9, "weights sum to {sum}");
        assert!(levels.iter().all(|l| l.weight > 0.0 && l.weight <= 1.0));
    }

    #[test]
    fn nearby_swings_merge_into_one_level() {
        // Two swing highs at 110.0 and 110.2 with a wide range: one level.
        let mut rows = vec![(101.0, 99.0); 30];
        rows[10] = (110.0, 99.0);
        rows[22] = (110.2, 99.0);
        rows[15] = (101.0, 80.0);
        let levels = compute_price_levels(&hourly(&rows), &ClusterParams::default());
        let tops: Vec<_> = levels.iter().filter(|l| l.price > 105.0).collect();
        assert_eq!(tops.len(), 1);
        assert!(tops[0].price > 110.0 && tops[0].price < 110.2);
        // Anchor keeps the earlier swing.
        assert_eq!(tops[0].at, hourly(&rows)[10].timestamp);
    }

    #[test]
    fn oldest_swing_carries_no_weight() {
        // A lone swing at the very first bar has zero age and is dropped.
        let mut rows = vec![(101.0, 99.0); 12];
        rows[0] = (150.0, 99.0);
        let levels = compute_price_levels(&hourly(&rows), &ClusterParams::default());
        assert!(levels.iter().all(|l| l.price < 150.0));
    }
}
