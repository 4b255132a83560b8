// =============================================================================
// Ingestion Adapters — brokerage boundary
// =============================================================================
//
// The pipeline talks to exactly one adapter, chosen at startup:
//
//   Live       REST history / search / options chains plus a streaming
//                WebSocket for chart bars and level-one quotes.
//   Simulated  in-memory history and a hand-fed or replayed stream.
//
// Both deliver stream traffic as `StreamEvent` batches over an unbounded
// channel.  When that channel closes the stream is lost for good.
// =============================================================================

pub mod live;
pub mod simulated;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

use crate::options::{ExpiryChains, OptionsQuery};
use crate::runtime_config::RuntimeConfig;
use crate::types::{AccountInfo, AdapterMode, Bar, Quote};

pub use live::LiveAdapter;
pub use simulated::SimulatedAdapter;

// =============================================================================
// Stream vocabulary
// =============================================================================

/// Independent external streams, each opened once and then extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Chart,
    Quote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOp {
    /// First subscription of a stream kind.
    Open,
    /// Later subscriptions on an already opened stream.
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub kind: StreamKind,
    pub op: StreamOp,
    pub symbols: Vec<String>,
}

/// One batch of stream traffic.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Bars(Vec<Bar>),
    Quotes(Vec<Quote>),
}

/// Issue open/add/remove requests against the external stream.
pub trait StreamControl: Send + Sync {
    fn request(&self, req: StreamRequest) -> impl Future<Output = Result<()>> + Send;
}

// =============================================================================
// IngestionAdapter
// =============================================================================

pub enum IngestionAdapter {
    Live(LiveAdapter),
    Simulated(SimulatedAdapter),
}

impl IngestionAdapter {
    /// Build the adapter selected by `config.adapter` and its stream receiver.
    pub async fn connect(config: &RuntimeConfig) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>)> {
        match config.adapter {
            AdapterMode::Live => {
                let (adapter, rx) = LiveAdapter::connect(&config.live).await?;
                info!(account = %adapter.account().number, "live adapter connected");
                Ok((Arc::new(Self::Live(adapter)), rx))
            }
            AdapterMode::Simulated => {
                let (adapter, rx, replay) = SimulatedAdapter::from_config(&config.simulation)?;
                let adapter = Arc::new(Self::Simulated(adapter));
                if let Some(sim) = adapter.as_simulated() {
                    if !replay.is_empty() {
                        info!(bars = replay.len(), "starting simulated replay");
                        sim.replay(replay, config.simulation.replay_interval_ms);
                    }
                }
                Ok((adapter, rx))
            }
        }
    }

    /// Traded 1-minute bars of `symbol` from `since` up to now.
    pub async fn fetch_historical_bars(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Bar>> {
        let mut bars = match self {
            Self::Live(a) => a.fetch_historical_bars(symbol, since).await?,
            Self::Simulated(a) => a.fetch_historical_bars(symbol, since).await?,
        };
        bars.retain(Bar::is_traded);
        Ok(bars)
    }

    /// Canonical ticker for a user query, `None` when unknown.
    pub async fn resolve_symbol(&self, query: &str) -> Result<Option<String>> {
        match self {
            Self::Live(a) => a.resolve_symbol(query).await,
            Self::Simulated(a) => a.resolve_symbol(query).await,
        }
    }

    pub async fn options_chain(&self, query: &OptionsQuery) -> Result<ExpiryChains> {
        match self {
            Self::Live(a) => a.options_chain(query).await,
            Self::Simulated(a) => a.options_chain(query).await,
        }
    }

    pub fn account(&self) -> AccountInfo {
        match self {
            Self::Live(a) => a.account(),
            Self::Simulated(a) => a.account(),
        }
    }

    pub fn as_simulated(&self) -> Option<&SimulatedAdapter> {
        match self {
            Self::Simulated(a) => Some(a),
            Self::Live(_) => None,
        }
    }
}

impl StreamControl for IngestionAdapter {
    async fn request(&self, req: StreamRequest) -> Result<()> {
        match self {
            Self::Live(a) => a.request(req).await,
            Self::Simulated(a) => a.request(req).await,
        }
    }
}
