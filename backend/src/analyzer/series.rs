// =============================================================================
// Aggregated Series — fixed-duration resampling with indicator columns
// =============================================================================
//
// Higher time frames are a pure function of the canonical 1-minute history:
// every recompute resamples from scratch.  A bucket starts at the bar
// timestamp truncated to a multiple of the bucket duration (epoch aligned) and
// takes first open, max high, min low, last close and summed volume.  Buckets
// that ended up with zero volume are dropped.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::indicators::{ema::ema_column, rsi::rsi_column, Ohlc};
use crate::types::{Bar, TradingSession};

/// One resampled bar plus its derived indicator columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedBar {
    #[serde(rename = "time", with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub rsi: Option<f64>,
    pub ma: Option<f64>,
}

impl Ohlc for AggregatedBar {
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

/// Resample `bars` (time ordered) into buckets of `minutes` minutes.
pub fn resample(bars: &[Bar], minutes: u32) -> Vec<AggregatedBar> {
    let width = i64::from(minutes.max(1)) * 60;
    let mut buckets: BTreeMap<i64, AggregatedBar> = BTreeMap::new();

    for bar in bars {
        let ts = bar.timestamp.timestamp();
        let start = ts - ts.rem_euclid(width);
        buckets
            .entry(start)
            .and_modify(|agg| {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.volume += bar.volume;
            })
            .or_insert_with(|| AggregatedBar {
                timestamp: DateTime::from_timestamp(start, 0).unwrap_or(bar.timestamp),
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
                rsi: None,
                ma: None,
            });
    }

    buckets.into_values().filter(|b| b.volume > 0).collect()
}

/// Fill the `rsi` and `ma` columns in place.
pub fn add_indicators(series: &mut [AggregatedBar], rsi_period: usize, ema_period: usize) {
    let closes: Vec<f64> = series.iter().map(|b| b.close).collect();
    let rsi = rsi_column(&closes, rsi_period);
    let ma = ema_column(&closes, ema_period);
    for ((bar, r), m) in series.iter_mut().zip(rsi).zip(ma) {
        bar.rsi = r;
        bar.ma = m;
    }
}

/// Keep only the bars of the last `days` distinct session days present.
pub fn trim_days(series: &mut Vec<AggregatedBar>, days: u32, session: &TradingSession) {
    let Some(last) = series.last() else {
        return;
    };
    let mut seen: Vec<NaiveDate> = vec![session.day(last.timestamp)];
    let mut cut = 0;
    for (i, bar) in series.iter().enumerate().rev() {
        let day = session.day(bar.timestamp);
        if !seen.contains(&day) {
            if seen.len() as u32 >= days.max(1) {
                cut = i + 1;
                break;
            }
            seen.push(day);
        }
    }
    series.drain(..cut);
}

/// Duration of one bucket.
pub fn bucket_duration(minutes: u32) -> Duration {
    Duration::minutes(i64::from(minutes.max(1)))
}
