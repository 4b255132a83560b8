// =============================================================================
// Runtime Configuration — pipeline settings with atomic save
// =============================================================================
//
// Every tunable parameter of the pipeline lives here: which adapter to run,
// the chart time frames and their indicator periods, divergence and price
// level tuning, queue capacities and the storage location.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analyzer::divergence::DetectorParams;
use crate::analyzer::price_levels::ClusterParams;
use crate::types::{AdapterMode, TradingSession};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_charts() -> Vec<ChartConfig> {
    vec![
        ChartConfig {
            label: "5Min".to_string(),
            minutes: 5,
            ema_period: 20,
            keep_days: 2,
            session_scoped: true,
        },
        ChartConfig {
            label: "30Min".to_string(),
            minutes: 30,
            ema_period: 100,
            keep_days: 5,
            session_scoped: true,
        },
    ]
}

fn default_history_days() -> u32 {
    7
}

fn default_viewer_queue_capacity() -> usize {
    4
}

fn default_persistence_queue_capacity() -> usize {
    256
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_utc_offset_minutes() -> i32 {
    -300
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_rsi_period() -> usize {
    14
}

fn default_divergence_order() -> usize {
    3
}

fn default_overbought() -> f64 {
    70.0
}

fn default_oversold() -> f64 {
    30.0
}

fn default_level_minutes() -> u32 {
    60
}

fn default_level_order() -> usize {
    5
}

fn default_tolerance_ratio() -> f64 {
    0.04
}

fn default_atr_period() -> usize {
    14
}

fn default_api_base_url() -> String {
    "https://api.schwabapi.com".to_string()
}

fn default_replay_interval_ms() -> u64 {
    500
}

fn default_sim_balance() -> f64 {
    2000.0
}

// =============================================================================
// Analytics sections
// =============================================================================

/// One chart time frame maintained per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    /// Key of the chart in `UPDATE_CHART` payloads and persisted records.
    pub label: String,

    /// Bucket width in minutes.
    pub minutes: u32,

    #[serde(default)]
    pub ema_period: usize,

    /// Number of session days of resampled bars kept in the chart.
    #[serde(default)]
    pub keep_days: u32,

    /// Clear the divergence list when a new session day starts.
    #[serde(default = "default_true")]
    pub session_scoped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    /// Neighbourhood for RSI extrema.
    #[serde(default = "default_divergence_order")]
    pub order: usize,

    #[serde(default = "default_overbought")]
    pub overbought: f64,

    #[serde(default = "default_oversold")]
    pub oversold: f64,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            order: default_divergence_order(),
            overbought: default_overbought(),
            oversold: default_oversold(),
        }
    }
}

impl DivergenceConfig {
    pub fn detector(&self) -> DetectorParams {
        DetectorParams {
            order: self.order,
            overbought: self.overbought,
            oversold: self.oversold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevelConfig {
    /// Resample width the swing points are taken from.
    #[serde(default = "default_level_minutes")]
    pub minutes: u32,

    #[serde(default = "default_level_order")]
    pub order: usize,

    /// Merge band as a share of the series' high-low range.
    #[serde(default = "default_tolerance_ratio")]
    pub tolerance_ratio: f64,
}

impl Default for PriceLevelConfig {
    fn default() -> Self {
        Self {
            minutes: default_level_minutes(),
            order: default_level_order(),
            tolerance_ratio: default_tolerance_ratio(),
        }
    }
}

impl PriceLevelConfig {
    pub fn cluster(&self) -> ClusterParams {
        ClusterParams {
            order: self.order,
            tolerance_ratio: self.tolerance_ratio,
        }
    }
}

// =============================================================================
// Adapter sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Include pre- and post-market bars in history requests.
    #[serde(default = "default_true")]
    pub extended_hours: bool,

    /// Bearer token; normally injected from `PULSE_API_TOKEN`.
    #[serde(default, skip_serializing)]
    pub api_token: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            extended_hours: true,
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// JSON file mapping symbol -> bars.  Bars before `replay_start` serve as
    /// history, later ones are replayed into the stream.
    #[serde(default)]
    pub history_file: Option<String>,

    #[serde(default)]
    pub replay_start: Option<DateTime<Utc>>,

    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,

    #[serde(default = "default_sim_balance")]
    pub account_balance: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            history_file: None,
            replay_start: None,
            replay_interval_ms: default_replay_interval_ms(),
            account_balance: default_sim_balance(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    #[serde(default)]
    pub adapter: AdapterMode,

    /// Symbols subscribed at startup in addition to the stored instruments.
    #[serde(default)]
    pub symbols: Vec<String>,

    // --- Analytics ----------------------------------------------------------

    #[serde(default = "default_charts")]
    pub charts: Vec<ChartConfig>,

    #[serde(default)]
    pub divergence: DivergenceConfig,

    #[serde(default)]
    pub price_levels: PriceLevelConfig,

    /// Session days of 1-minute history loaded when a symbol is subscribed.
    #[serde(default = "default_history_days")]
    pub history_days: u32,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// Exchange offset from UTC used to derive session days.
    #[serde(default = "default_utc_offset_minutes")]
    pub exchange_utc_offset_minutes: i32,

    // --- Queues & storage ---------------------------------------------------

    #[serde(default = "default_viewer_queue_capacity")]
    pub viewer_queue_capacity: usize,

    #[serde(default = "default_persistence_queue_capacity")]
    pub persistence_queue_capacity: usize,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Adapters -------------------------------------------------------------

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterMode::Simulated,
            symbols: Vec::new(),
            charts: default_charts(),
            divergence: DivergenceConfig::default(),
            price_levels: PriceLevelConfig::default(),
            history_days: default_history_days(),
            atr_period: default_atr_period(),
            exchange_utc_offset_minutes: default_utc_offset_minutes(),
            viewer_queue_capacity: default_viewer_queue_capacity(),
            persistence_queue_capacity: default_persistence_queue_capacity(),
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            live: LiveConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            adapter = %config.adapter,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn session(&self) -> TradingSession {
        TradingSession::new(self.exchange_utc_offset_minutes)
    }

    /// Apply `PULSE_*` overrides read through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(syms) = var("PULSE_SYMBOLS") {
            self.symbols = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(addr) = var("PULSE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(mode) = var("PULSE_ADAPTER") {
            self.adapter = mode.parse().context("invalid PULSE_ADAPTER")?;
        }
        if let Some(dir) = var("PULSE_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(token) = var("PULSE_API_TOKEN") {
            self.live.api_token = token;
        }
        Ok(())
    }
}
