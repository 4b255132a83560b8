// =============================================================================
// Simulated Adapter — in-memory brokerage for demos and tests
// =============================================================================
//
// History, known symbols and option chains live in memory.  Stream traffic is
// pushed by the caller (`push_bars` / `push_quotes`) or replayed from a
// history file at a fixed pace.  Every stream request is recorded, and the
// adapter can be told to reject them to exercise rollback paths.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{StreamEvent, StreamRequest};
use crate::options::{ExpiryChains, OptionsQuery};
use crate::runtime_config::SimulationConfig;
use crate::types::{AccountInfo, Bar, Quote};

pub struct SimulatedAdapter {
    history: RwLock<HashMap<String, Vec<Bar>>>,
    chains: RwLock<HashMap<String, ExpiryChains>>,
    account: AccountInfo,
    requests: Mutex<Vec<StreamRequest>>,
    fail_requests: AtomicBool,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl SimulatedAdapter {
    pub fn new(account: AccountInfo) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            history: RwLock::new(HashMap::new()),
            chains: RwLock::new(HashMap::new()),
            account,
            requests: Mutex::new(Vec::new()),
            fail_requests: AtomicBool::new(false),
            events,
        };
        (adapter, rx)
    }

    /// Build from config.  Returns the bars still to be replayed.
    pub fn from_config(
        config: &SimulationConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StreamEvent>, Vec<Bar>)> {
        let account = AccountInfo {
            number: "SIM".to_string(),
            balance: config.account_balance,
        };
        let (adapter, rx) = Self::new(account);

        let Some(path) = config.history_file.as_deref() else {
            return Ok((adapter, rx, Vec::new()));
        };
        let bars = load_history_file(path)?;
        let (history, replay): (Vec<Bar>, Vec<Bar>) = match config.replay_start {
            Some(start) => bars.into_iter().partition(|b| b.timestamp < start),
            None => (bars, Vec::new()),
        };
        for (symbol, bars) in group_by_symbol(history) {
            adapter.insert_history(&symbol, bars);
        }
        info!(path, symbols = adapter.history.read().len(), "simulation history loaded");
        Ok((adapter, rx, replay))
    }

    pub fn insert_history(&self, symbol: &str, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.timestamp);
        self.history.write().insert(symbol.to_uppercase(), bars);
    }

    pub fn insert_options_chain(&self, symbol: &str, chains: ExpiryChains) {
        self.chains.write().insert(symbol.to_uppercase(), chains);
    }

    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Every stream request seen so far, oldest first.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    pub fn push_bars(&self, bars: Vec<Bar>) -> Result<()> {
        self.events
            .send(StreamEvent::Bars(bars))
            .map_err(|_| anyhow::anyhow!("stream receiver dropped"))
    }

    pub fn push_quotes(&self, quotes: Vec<Quote>) -> Result<()> {
        self.events
            .send(StreamEvent::Quotes(quotes))
            .map_err(|_| anyhow::anyhow!("stream receiver dropped"))
    }

    /// Feed `bars` into the stream, one timestamp per tick of `interval_ms`.
    pub fn replay(&self, bars: Vec<Bar>, interval_ms: u64) -> JoinHandle<()> {
        let tx = self.events.clone();
        let mut batches: BTreeMap<DateTime<Utc>, Vec<Bar>> = BTreeMap::new();
        for bar in bars {
            batches.entry(bar.timestamp).or_default().push(bar);
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
            for (ts, batch) in batches {
                ticker.tick().await;
                debug!(ts = %ts, bars = batch.len(), "replaying batch");
                if tx.send(StreamEvent::Bars(batch)).is_err() {
                    break;
                }
            }
            info!("simulated replay finished");
        })
    }

    pub async fn fetch_historical_bars(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Bar>> {
        let history = self.history.read();
        Ok(history
            .get(symbol)
            .map(|bars| bars.iter().filter(|b| b.timestamp >= since).cloned().collect())
            .unwrap_or_default())
    }

    pub async fn resolve_symbol(&self, query: &str) -> Result<Option<String>> {
        let symbol = query.trim().to_uppercase();
        Ok(self.history.read().contains_key(&symbol).then_some(symbol))
    }

    pub async fn options_chain(&self, query: &OptionsQuery) -> Result<ExpiryChains> {
        let Some(chains) = self.chains.read().get(&query.symbol).cloned() else {
            return Ok(ExpiryChains::default());
        };
        let in_window = |day: &chrono::NaiveDate| *day >= query.from && *day <= query.to;
        Ok(ExpiryChains {
            calls: chains.calls.into_iter().filter(|(d, _)| in_window(d)).collect(),
            puts: chains.puts.into_iter().filter(|(d, _)| in_window(d)).collect(),
        })
    }

    pub fn account(&self) -> AccountInfo {
        self.account.clone()
    }

    pub async fn request(&self, req: StreamRequest) -> Result<()> {
        if self.fail_requests.load(Ordering::SeqCst) {
            bail!("simulated stream rejected {:?} {:?}", req.op, req.kind);
        }
        self.requests.lock().push(req);
        Ok(())
    }
}

fn load_history_file(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read simulation history from {}", path.display()))?;
    let by_symbol: HashMap<String, Vec<Bar>> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse simulation history from {}", path.display()))?;
    Ok(by_symbol
        .into_iter()
        .flat_map(|(symbol, bars)| {
            let symbol = symbol.to_uppercase();
            bars.into_iter().map(move |mut b| {
                b.symbol = symbol.clone();
                b
            })
        })
        .collect())
}

fn group_by_symbol(bars: Vec<Bar>) -> HashMap<String, Vec<Bar>> {
    let mut grouped: HashMap<String, Vec<Bar>> = HashMap::new();
    for bar in bars {
        grouped.entry(bar.symbol.clone()).or_default().push(bar);
    }
    grouped
}
