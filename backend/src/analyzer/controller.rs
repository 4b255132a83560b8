// =============================================================================
// Controller — per-symbol analytics state
// =============================================================================
//
// Owns one symbol's canonical 1-minute history and the charts derived from
// it.  A tick goes through two phases so the expensive part can leave the
// engine task:
//
//   accept()  cheap, on the owning task: reject stale / untraded bars,
//               append, hand out a `RecomputeJob` over a shared snapshot of
//               the history and cloned chart states.
//   run()     pure, anywhere (spawn_blocking): rebuild every chart, detect
//               divergences, recompute price levels and ATR.
//   apply()   back on the owning task: swap the fresh charts in and report
//               which divergence lists must be persisted.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::chart::{Chart, ChartSnapshot};
use super::divergence::DetectorParams;
use super::price_levels::{compute_price_levels, ClusterParams};
use super::series::resample;
use crate::error::PipelineError;
use crate::indicators::atr::calculate_atr;
use crate::runtime_config::{ChartConfig, RuntimeConfig};
use crate::types::{Bar, Divergence, PriceLevel, TradingSession};

// =============================================================================
// Parameters
// =============================================================================

/// Analytics tuning shared by every controller.
#[derive(Debug, Clone)]
pub struct AnalyticsParams {
    pub charts: Vec<ChartConfig>,
    pub rsi_period: usize,
    pub detector: DetectorParams,
    pub level_minutes: u32,
    pub cluster: ClusterParams,
    pub history_days: u32,
    pub atr_period: usize,
    pub session: TradingSession,
}

impl AnalyticsParams {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            charts: config.charts.clone(),
            rsi_period: config.divergence.rsi_period,
            detector: config.divergence.detector(),
            level_minutes: config.price_levels.minutes,
            cluster: config.price_levels.cluster(),
            history_days: config.history_days,
            atr_period: config.atr_period,
            session: config.session(),
        }
    }
}

impl Default for AnalyticsParams {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// Full divergence list of one chart that must be written to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternUpdate {
    pub symbol: String,
    pub timeframe: String,
    pub divergences: Vec<Divergence>,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub patterns: Vec<PatternUpdate>,
}

/// `UPDATE_CHART` payload.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub symbol: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_updated: DateTime<Utc>,
    pub atr: Option<f64>,
    pub price_levels: Vec<PriceLevel>,
    pub charts: BTreeMap<String, ChartSnapshot>,
}

// =============================================================================
// Recompute job
// =============================================================================

/// Everything a recompute needs, detached from the controller.
pub struct RecomputeJob {
    symbol: String,
    history: Arc<Vec<Bar>>,
    charts: Vec<Chart>,
    params: Arc<AnalyticsParams>,
}

/// Result of a `RecomputeJob`, applied back with `Controller::apply`.
pub struct Recomputed {
    charts: Vec<Chart>,
    detected: Vec<String>,
    price_levels: Vec<PriceLevel>,
    atr: Option<f64>,
}

impl RecomputeJob {
    pub fn run(self) -> Recomputed {
        let RecomputeJob {
            symbol,
            history,
            mut charts,
            params,
        } = self;

        let mut detected = Vec::new();
        for chart in charts.iter_mut() {
            if let Some(div) = chart.update(&symbol, &history, params.rsi_period, &params.detector, &params.session) {
                tracing::info!(
                    symbol = %symbol,
                    timeframe = chart.label(),
                    kind = %div.kind,
                    end = %div.end,
                    "divergence detected"
                );
                detected.push(chart.label().to_string());
            }
        }

        let price_levels = match history.last() {
            Some(last) => {
                let since = params.session.days_ago(last.timestamp, params.history_days);
                let start = history.partition_point(|b| b.timestamp < since);
                let coarse = resample(&history[start..], params.level_minutes);
                compute_price_levels(&coarse, &params.cluster)
            }
            None => Vec::new(),
        };

        let atr = charts
            .last()
            .and_then(|chart| calculate_atr(chart.series(), params.atr_period));

        Recomputed {
            charts,
            detected,
            price_levels,
            atr,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct Controller {
    symbol: String,
    history: Arc<Vec<Bar>>,
    charts: Vec<Chart>,
    price_levels: Vec<PriceLevel>,
    atr: Option<f64>,
    params: Arc<AnalyticsParams>,
}

impl Controller {
    /// Build a controller from stored history and the persisted divergences of
    /// the current day, keyed by chart label.
    ///
    /// Fails when no traded bar is available.
    pub fn seed(
        symbol: &str,
        mut bars: Vec<Bar>,
        mut persisted: HashMap<String, Vec<Divergence>>,
        params: Arc<AnalyticsParams>,
    ) -> Result<(Self, TickOutcome), PipelineError> {
        bars.retain(Bar::is_traded);
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        if bars.is_empty() {
            return Err(PipelineError::NoHistory(symbol.to_string()));
        }

        let charts = params
            .charts
            .iter()
            .map(|cfg| Chart::new(cfg.clone(), persisted.remove(&cfg.label).unwrap_or_default()))
            .collect();

        let mut controller = Self {
            symbol: symbol.to_string(),
            history: Arc::new(bars),
            charts,
            price_levels: Vec::new(),
            atr: None,
            params,
        };
        let job = controller.job();
        let outcome = controller.apply(job.run());
        Ok((controller, outcome))
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|b| b.timestamp)
    }

    #[cfg(test)]
    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub fn price_levels(&self) -> &[PriceLevel] {
        &self.price_levels
    }

    /// Append `bar` when it is newer than the stored history and traded.
    pub fn accept(&mut self, bar: Bar) -> Option<RecomputeJob> {
        if !bar.is_traded() {
            tracing::debug!(symbol = %self.symbol, ts = %bar.timestamp, "untraded bar ignored");
            return None;
        }
        if self.last_timestamp().is_some_and(|last| bar.timestamp <= last) {
            tracing::debug!(symbol = %self.symbol, ts = %bar.timestamp, "stale bar ignored");
            return None;
        }
        Arc::make_mut(&mut self.history).push(bar);
        Some(self.job())
    }

    fn job(&self) -> RecomputeJob {
        RecomputeJob {
            symbol: self.symbol.clone(),
            history: Arc::clone(&self.history),
            charts: self.charts.clone(),
            params: Arc::clone(&self.params),
        }
    }

    pub fn apply(&mut self, result: Recomputed) -> TickOutcome {
        self.charts = result.charts;
        self.price_levels = result.price_levels;
        self.atr = result.atr;

        let patterns = result
            .detected
            .iter()
            .filter_map(|label| self.charts.iter().find(|c| c.label() == label))
            .map(|chart| PatternUpdate {
                symbol: self.symbol.clone(),
                timeframe: chart.label().to_string(),
                divergences: chart.divergences().to_vec(),
            })
            .collect();
        TickOutcome { patterns }
    }

    /// Accept, recompute and apply in one step on the calling thread.
    pub fn on_new_price(&mut self, bar: Bar) -> Option<TickOutcome> {
        let job = self.accept(bar)?;
        Some(self.apply(job.run()))
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            symbol: self.symbol.clone(),
            last_updated: self.last_timestamp().unwrap_or_else(Utc::now),
            atr: self.atr,
            price_levels: self.price_levels.clone(),
            charts: self
                .charts
                .iter()
                .map(|c| (c.label().to_string(), c.snapshot(&self.params.detector)))
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn minute_bars(symbol: &str, start: DateTime<Utc>, closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: symbol.to_string(),
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close + 0.25,
                low: close - 0.25,
                close,
                volume: 100,
            })
            .collect()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 21, 14, 0, 0).unwrap()
    }

    fn seeded() -> Controller {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let bars = minute_bars("XYZ", start(), &closes);
        Controller::seed("XYZ", bars, HashMap::new(), Arc::new(AnalyticsParams::default()))
            .unwrap()
            .0
    }

    fn next_bar(c: &Controller, minutes: i64, volume: u64) -> Bar {
        Bar {
            symbol: "XYZ".into(),
            timestamp: c.last_timestamp().unwrap() + Duration::minutes(minutes),
            open: 101.0,
            high: 102.0,
            low: 100.0,
            close: 101.5,
            volume,
        }
    }

    #[test]
    fn seed_without_bars_fails() {
        let err = Controller::seed("XYZ", Vec::new(), HashMap::new(), Arc::new(AnalyticsParams::default()));
        assert!(matches!(err, Err(PipelineError::NoHistory(s)) if s == "XYZ"));
    }

    #[test]
    fn seed_drops_untraded_and_duplicate_bars() {
        let mut bars = minute_bars("XYZ", start(), &[1.0, 2.0, 3.0]);
        bars.push(bars[1].clone());
        bars[0].volume = 0;
        let (c, _) = Controller::seed("XYZ", bars, HashMap::new(), Arc::new(AnalyticsParams::default())).unwrap();
        assert_eq!(c.history_len(), 2);
    }

    #[test]
    fn seed_builds_every_chart() {
        let c = seeded();
        let snap = c.snapshot();
        assert_eq!(snap.charts.len(), 2);
        assert_eq!(snap.charts["5Min"].prices.len(), 6);
        assert_eq!(snap.charts["30Min"].prices.len(), 1);
        assert_eq!(snap.last_updated, start() + Duration::minutes(29));
    }

    #[test]
    fn in_order_bar_extends_history_by_one() {
        let mut c = seeded();
        let before = c.history_len();
        assert!(c.on_new_price(next_bar(&c, 1, 10)).is_some());
        assert_eq!(c.history_len(), before + 1);
    }

    #[test]
    fn reapplying_a_bar_is_idempotent() {
        let mut c = seeded();
        let bar = next_bar(&c, 1, 10);
        c.on_new_price(bar.clone());
        let len = c.history_len();
        let snap = serde_json::to_string(&c.snapshot()).unwrap();

        assert!(c.on_new_price(bar).is_none());
        assert_eq!(c.history_len(), len);
        assert_eq!(serde_json::to_string(&c.snapshot()).unwrap(), snap);
    }

    #[test]
    fn out_of_order_bar_is_ignored() {
        let mut c = seeded();
        let len = c.history_len();
        assert!(c.on_new_price(next_bar(&c, -3, 10)).is_none());
        assert_eq!(c.history_len(), len);
    }

    #[test]
    fn untraded_bar_is_ignored() {
        let mut c = seeded();
        let len = c.history_len();
        assert!(c.on_new_price(next_bar(&c, 1, 0)).is_none());
        assert_eq!(c.history_len(), len);
    }

    #[test]
    fn persisted_divergences_are_restored_by_label() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let bars = minute_bars("XYZ", start(), &closes);
        let div = Divergence {
            symbol: "XYZ".into(),
            kind: crate::types::DivergenceType::Bullish,
            day: start().date_naive(),
            start: start(),
            start_price: 99.0,
            start_rsi: 25.0,
            end: start() + Duration::minutes(20),
            end_price: 98.0,
            end_rsi: 28.0,
        };
        let persisted = HashMap::from([("30Min".to_string(), vec![div.clone()])]);
        let params = Arc::new(AnalyticsParams {
            session: TradingSession::new(0),
            ..AnalyticsParams::default()
        });
        let (c, outcome) = Controller::seed("XYZ", bars, persisted, params).unwrap();
        assert!(outcome.patterns.is_empty());
        assert_eq!(c.charts()[1].divergences(), &[div]);
        assert!(c.charts()[0].divergences().is_empty());
    }

    #[test]
    fn snapshot_serialises_envelope_fields() {
        let v = serde_json::to_value(seeded().snapshot()).unwrap();
        assert_eq!(v["symbol"], "XYZ");
        assert!(v["charts"]["5Min"]["prices"].is_array());
        assert_eq!(v["charts"]["5Min"]["timeframe"], 300);
        assert!(v["price_levels"].is_array());
    }
}
