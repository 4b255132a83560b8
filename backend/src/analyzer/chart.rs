// =============================================================================
// Chart — one time frame of a symbol: resampled series + active divergences
// =============================================================================

use serde::Serialize;

use super::divergence::{detect, DetectorParams};
use super::series::{add_indicators, bucket_duration, resample, trim_days, AggregatedBar};
use crate::runtime_config::ChartConfig;
use crate::types::{Bar, Divergence, TradingSession};

/// Serialized form of a chart inside an `UPDATE_CHART` payload.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    /// Bucket width in seconds.
    pub timeframe: i64,
    pub prices: Vec<AggregatedBar>,
    pub rsi_bracket: [f64; 2],
    pub divergences: Vec<Divergence>,
}

#[derive(Debug, Clone)]
pub struct Chart {
    config: ChartConfig,
    series: Vec<AggregatedBar>,
    divergences: Vec<Divergence>,
}

impl Chart {
    pub fn new(config: ChartConfig, divergences: Vec<Divergence>) -> Self {
        let mut divergences = divergences;
        divergences.sort_by_key(|d| d.end);
        Self {
            config,
            series: Vec::new(),
            divergences,
        }
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn series(&self) -> &[AggregatedBar] {
        &self.series
    }

    pub fn divergences(&self) -> &[Divergence] {
        &self.divergences
    }

    /// Rebuild the series from `history` and run divergence detection.
    ///
    /// Returns the divergence when the active list changed because of it.
    pub fn update(
        &mut self,
        symbol: &str,
        history: &[Bar],
        rsi_period: usize,
        detector: &DetectorParams,
        session: &TradingSession,
    ) -> Option<Divergence> {
        let mut series = resample(history, self.config.minutes);
        add_indicators(&mut series, rsi_period, self.config.ema_period);
        trim_days(&mut series, self.config.keep_days, session);

        if self.config.session_scoped {
            if let Some(last_bar) = series.last() {
                self.clear_before(session.day(last_bar.timestamp));
            }
        }
        self.series = series;

        let found = detect(symbol, &self.series, detector, session)?;
        self.record(found.clone()).then_some(found)
    }

    /// Insert `div`, superseding the newest divergences of the same type it
    /// overlaps or trails by at most one bar.  Returns false when `div` is
    /// already the newest entry.
    pub fn record(&mut self, div: Divergence) -> bool {
        if self.divergences.last() == Some(&div) {
            return false;
        }
        let one_bar = bucket_duration(self.config.minutes);
        while let Some(prev) = self.divergences.last() {
            let superseded =
                prev.kind == div.kind && (prev.end >= div.start || div.end - prev.end <= one_bar);
            if !superseded {
                break;
            }
            self.divergences.pop();
        }
        self.divergences.push(div);
        true
    }

    fn clear_before(&mut self, day: chrono::NaiveDate) {
        let stale = self.divergences.last().is_some_and(|d| d.day < day);
        if stale {
            self.divergences.clear();
        }
    }

    pub fn snapshot(&self, detector: &DetectorParams) -> ChartSnapshot {
        ChartSnapshot {
            timeframe: bucket_duration(self.config.minutes).num_seconds(),
            prices: self.series.clone(),
            rsi_bracket: [detector.oversold, detector.overbought],
            divergences: self.divergences.clone(),
        }
    }
}
