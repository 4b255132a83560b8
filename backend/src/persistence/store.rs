// =============================================================================
// Store — instruments, archived bars and per-day divergence records
// =============================================================================
//
// Synchronous by contract: callers on the async runtime go through
// `spawn_blocking`.  `JsonFileStore` lays data out under one root directory:
//
//   instruments.json                     sorted list of subscribed symbols
//   bars/<SYMBOL>.json                   time-ordered 1-minute bars
//   divergences/<SYMBOL>/<YYYY-MM-DD>.json   timeframe label -> divergences
//
// Every write goes to `<file>.tmp` first and is renamed into place.  With a
// bar retention set, saving bars also drops those older than the retention
// window before the newest stored bar.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::types::{Bar, Divergence};

/// Divergence lists of one (symbol, day), keyed by timeframe label.
pub type DayRecord = BTreeMap<String, Vec<Divergence>>;

pub trait Store: Send + Sync {
    fn list_instruments(&self) -> Result<Vec<String>>;
    fn save_instrument(&self, symbol: &str) -> Result<()>;
    fn delete_instrument(&self, symbol: &str) -> Result<()>;

    /// Bars of `symbol` with `timestamp >= since`, time ordered.
    fn load_bars(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Bar>>;
    fn latest_bar(&self, symbol: &str, since: DateTime<Utc>) -> Result<Option<Bar>>;
    /// Insert or replace by timestamp.
    fn save_bars(&self, symbol: &str, bars: &[Bar]) -> Result<()>;

    /// Empty record when nothing was stored for that day.
    fn load_divergences(&self, symbol: &str, day: NaiveDate) -> Result<DayRecord>;
    fn save_divergences(&self, symbol: &str, day: NaiveDate, record: &DayRecord) -> Result<()>;
}

// =============================================================================
// JSON files
// =============================================================================

pub struct JsonFileStore {
    root: PathBuf,
    bar_retention: Option<Duration>,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join("bars"), root.join("divergences")] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        }
        debug!(root = %root.display(), "json store opened");
        Ok(Self {
            root,
            bar_retention: None,
            lock: Mutex::new(()),
        })
    }

    /// Keep only bars within `keep` of the newest stored bar.
    pub fn with_bar_retention(mut self, keep: Duration) -> Self {
        self.bar_retention = Some(keep);
        self
    }

    fn instruments_path(&self) -> PathBuf {
        self.root.join("instruments.json")
    }

    fn bars_path(&self, symbol: &str) -> PathBuf {
        self.root.join("bars").join(format!("{}.json", file_stem(symbol)))
    }

    fn record_path(&self, symbol: &str, day: NaiveDate) -> PathBuf {
        self.root
            .join("divergences")
            .join(file_stem(symbol))
            .join(format!("{day}.json"))
    }

    fn read_bars(&self, symbol: &str) -> Result<Vec<Bar>> {
        Ok(read_json::<Vec<Bar>>(&self.bars_path(symbol))?.unwrap_or_default())
    }

    fn update_instruments(&self, change: impl FnOnce(&mut BTreeSet<String>)) -> Result<()> {
        let _guard = self.lock.lock();
        let path = self.instruments_path();
        let mut set: BTreeSet<String> = read_json(&path)?.unwrap_or_default();
        change(&mut set);
        write_json_atomic(&path, &set)
    }
}

impl Store for JsonFileStore {
    fn list_instruments(&self) -> Result<Vec<String>> {
        let set: BTreeSet<String> = read_json(&self.instruments_path())?.unwrap_or_default();
        Ok(set.into_iter().collect())
    }

    fn save_instrument(&self, symbol: &str) -> Result<()> {
        self.update_instruments(|set| {
            set.insert(symbol.to_string());
        })
    }

    fn delete_instrument(&self, symbol: &str) -> Result<()> {
        self.update_instruments(|set| {
            set.remove(symbol);
        })
    }

    fn load_bars(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Bar>> {
        let mut bars = self.read_bars(symbol)?;
        bars.retain(|b| b.timestamp >= since);
        Ok(bars)
    }

    fn latest_bar(&self, symbol: &str, since: DateTime<Utc>) -> Result<Option<Bar>> {
        Ok(self.read_bars(symbol)?.into_iter().rfind(|b| b.timestamp >= since))
    }

    fn save_bars(&self, symbol: &str, bars: &[Bar]) -> Result<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock();
        let merged: BTreeMap<DateTime<Utc>, Bar> = self
            .read_bars(symbol)?
            .into_iter()
            .chain(bars.iter().cloned())
            .map(|b| (b.timestamp, b))
            .collect();
        let mut merged: Vec<Bar> = merged.into_values().collect();
        if let (Some(keep), Some(newest)) = (self.bar_retention, merged.last().map(|b| b.timestamp)) {
            let cutoff = newest - keep;
            let before = merged.len();
            merged.retain(|b| b.timestamp >= cutoff);
            if merged.len() < before {
                debug!(symbol, pruned = before - merged.len(), cutoff = %cutoff, "old bars pruned");
            }
        }
        write_json_atomic(&self.bars_path(symbol), &merged)?;
        debug!(symbol, added = bars.len(), total = merged.len(), "bars saved");
        Ok(())
    }

    fn load_divergences(&self, symbol: &str, day: NaiveDate) -> Result<DayRecord> {
        Ok(read_json(&self.record_path(symbol, day))?.unwrap_or_default())
    }

    fn save_divergences(&self, symbol: &str, day: NaiveDate, record: &DayRecord) -> Result<()> {
        let path = self.record_path(symbol, day);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        write_json_atomic(&path, record)
    }
}

/// Tickers may carry characters that are not valid in file names.
fn file_stem(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string(value).context("failed to serialise store record")?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp file to {}", path.display()))?;
    Ok(())
}

// =============================================================================
// In memory
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    instruments: BTreeSet<String>,
    bars: HashMap<String, BTreeMap<DateTime<Utc>, Bar>>,
    records: HashMap<(String, NaiveDate), DayRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn list_instruments(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().instruments.iter().cloned().collect())
    }

    fn save_instrument(&self, symbol: &str) -> Result<()> {
        self.inner.lock().instruments.insert(symbol.to_string());
        Ok(())
    }

    fn delete_instrument(&self, symbol: &str) -> Result<()> {
        self.inner.lock().instruments.remove(symbol);
        Ok(())
    }

    fn load_bars(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Bar>> {
        let inner = self.inner.lock();
        Ok(inner
            .bars
            .get(symbol)
            .map(|bars| bars.range(since..).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    fn latest_bar(&self, symbol: &str, since: DateTime<Utc>) -> Result<Option<Bar>> {
        let inner = self.inner.lock();
        Ok(inner
            .bars
            .get(symbol)
            .and_then(|bars| bars.range(since..).next_back())
            .map(|(_, b)| b.clone()))
    }

    fn save_bars(&self, symbol: &str, bars: &[Bar]) -> Result<()> {
        let mut inner = self.inner.lock();
        let stored = inner.bars.entry(symbol.to_string()).or_default();
        for bar in bars {
            stored.insert(bar.timestamp, bar.clone());
        }
        Ok(())
    }

    fn load_divergences(&self, symbol: &str, day: NaiveDate) -> Result<DayRecord> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .get(&(symbol.to_string(), day))
            .cloned()
            .unwrap_or_default())
    }

    fn save_divergences(&self, symbol: &str, day: NaiveDate, record: &DayRecord) -> Result<()> {
        self.inner
            .lock()
            .records
            .insert((symbol.to_string(), day), record.clone());
        Ok(())
    }
}
