// =============================================================================
// Shared types used across the chart-pulse pipeline
// =============================================================================

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Bars & quotes
// =============================================================================

/// One OHLCV sample for a fixed interval, keyed by `(symbol, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// Bars without traded volume are non-trading noise.
    pub fn is_traded(&self) -> bool {
        self.volume > 0
    }
}

/// Partial top-of-book update. Absent fields carry no information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub last: Option<f64>,
}

// =============================================================================
// Patterns
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DivergenceType {
    Bullish,
    Bearish,
}

impl std::fmt::Display for DivergenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "Bullish"),
            Self::Bearish => write!(f, "Bearish"),
        }
    }
}

/// A price/RSI divergence between two oscillator extrema.
///
/// Bearish divergences carry bar highs as prices, bullish ones bar lows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub symbol: String,
    #[serde(rename = "divergence")]
    pub kind: DivergenceType,
    /// Exchange-session day of `end`.
    pub day: NaiveDate,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start: DateTime<Utc>,
    pub start_price: f64,
    pub start_rsi: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub end: DateTime<Utc>,
    pub end_price: f64,
    pub end_rsi: f64,
}

/// A horizontal support/resistance level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    /// Share of the total recency weight, in `(0, 1]`.
    pub weight: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub at: DateTime<Utc>,
}

// =============================================================================
// Account
// =============================================================================

/// Brokerage account summary sent to every viewer on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub number: String,
    pub balance: f64,
}

// =============================================================================
// Adapter mode
// =============================================================================

/// Which ingestion adapter the process runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterMode {
    Live,
    Simulated,
}

impl Default for AdapterMode {
    fn default() -> Self {
        Self::Simulated
    }
}

impl std::fmt::Display for AdapterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

impl std::str::FromStr for AdapterMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => anyhow::bail!("unknown adapter mode '{other}'"),
        }
    }
}

// =============================================================================
// Exchange session clock
// =============================================================================

/// Maps UTC instants onto exchange-local trading days.
#[derive(Debug, Clone, Copy)]
pub struct TradingSession {
    offset: FixedOffset,
}

impl TradingSession {
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or(Utc.fix());
        Self { offset }
    }

    /// Exchange-local calendar day of `ts`.
    pub fn day(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.offset).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.day(Utc::now())
    }

    /// Exchange-local midnight `days` days before the day of `now`.
    pub fn days_ago(&self, now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
        let day = self.day(now) - Duration::days(i64::from(days));
        let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
        match self.offset.from_local_datetime(&midnight).single() {
            Some(local) => local.with_timezone(&Utc),
            None => now - Duration::days(i64::from(days)),
        }
    }
}

impl Default for TradingSession {
    fn default() -> Self {
        Self::new(0)
    }
}
