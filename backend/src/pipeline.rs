// =============================================================================
// Pipeline — the engine task and the handle the outside world talks to
// =============================================================================
//
// The engine is the only owner of the subscription registry, every symbol's
// controller and every quote cache; it never shares them behind a lock.
// Everything reaches it as an `EngineCmd` over one channel and is handled in
// arrival order, without awaiting anything:
//
//   Stream     bar / quote batches from the stream reader
//   Install    a freshly seeded, already streaming controller
//   Detach     drop what a stream teardown left behind
//   Snapshots  copies of every controller snapshot
//   Entry      registry lookup
//
// Recomputes run on the blocking pool.  A symbol has at most one in flight;
// bars arriving meanwhile wait in its backlog.  Completions come back on a
// second channel and are dropped when the symbol was replaced since.
//
// `PipelineHandle` is cheap to clone.  Slow work (symbol lookup, backfill,
// seeding, stream requests) runs in the caller's task before the engine is
// involved.  Stream requests go through one `StreamSession` behind an async
// lock, which also serializes subscribe against unsubscribe.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{IngestionAdapter, StreamEvent};
use crate::analyzer::{AnalyticsParams, Controller, ControllerSnapshot, RecomputeJob, Recomputed};
use crate::error::PipelineError;
use crate::fanout::{FanoutHub, ViewerEvent};
use crate::market_data::QuoteCache;
use crate::options::{default_expiry_range, select_single_expiry, OptionsChain, OptionsQuery};
use crate::persistence::{PatternWriter, Store};
use crate::registry::{ChartListener, QuoteListener, StreamSession, SubscriptionEntry, SubscriptionRegistry, Teardown};
use crate::types::{AccountInfo, Bar, Quote};

const DEFAULT_STRIKE_COUNT: u32 = 10;

// =============================================================================
// Engine
// =============================================================================

enum EngineCmd {
    Stream(StreamEvent),
    Install {
        controller: Box<Controller>,
        entry: SubscriptionEntry,
        reply: oneshot::Sender<Result<ControllerSnapshot, PipelineError>>,
    },
    Detach {
        symbol: String,
        teardown: Teardown,
        reply: oneshot::Sender<Result<(), PipelineError>>,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<ControllerSnapshot>>,
    },
    Entry {
        symbol: String,
        reply: oneshot::Sender<Option<SubscriptionEntry>>,
    },
}

struct Completion {
    symbol: String,
    epoch: u64,
    result: Option<Recomputed>,
}

struct Slot {
    controller: Controller,
    epoch: u64,
    in_flight: bool,
    backlog: VecDeque<Bar>,
}

struct Engine {
    registry: SubscriptionRegistry,
    slots: HashMap<String, Slot>,
    quotes: HashMap<String, QuoteCache>,
    fanout: Arc<FanoutHub>,
    writer: PatternWriter,
    done_tx: mpsc::UnboundedSender<Completion>,
    next_epoch: u64,
}

impl Engine {
    async fn run(mut self, mut cmds: mpsc::UnboundedReceiver<EngineCmd>, mut done: mpsc::UnboundedReceiver<Completion>) {
        info!("analytics engine started");
        loop {
            tokio::select! {
                cmd = cmds.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(completion) = done.recv() => self.complete(completion),
            }
        }
        info!("analytics engine stopped");
    }

    fn handle(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Stream(StreamEvent::Bars(bars)) => {
                for (listener, bar) in self.registry.route_bars(bars) {
                    match listener {
                        ChartListener::Analytics => self.on_bar(bar),
                        ChartListener::Archive => {
                            if bar.is_traded() {
                                self.writer.archive(bar);
                            }
                        }
                    }
                }
            }
            EngineCmd::Stream(StreamEvent::Quotes(quotes)) => {
                for (QuoteListener::Cache, quote) in self.registry.route_quotes(quotes) {
                    self.on_quote(quote);
                }
            }
            EngineCmd::Install { controller, entry, reply } => {
                let _ = reply.send(self.install(*controller, entry));
            }
            EngineCmd::Detach { symbol, teardown, reply } => {
                self.detach(&symbol, &teardown);
                let _ = reply.send(teardown.result);
            }
            EngineCmd::Snapshots { reply } => {
                let mut snapshots: Vec<ControllerSnapshot> =
                    self.slots.values().map(|s| s.controller.snapshot()).collect();
                snapshots.sort_by(|a, b| a.symbol.cmp(&b.symbol));
                let _ = reply.send(snapshots);
            }
            EngineCmd::Entry { symbol, reply } => {
                let _ = reply.send(self.registry.entry(&symbol).cloned());
            }
        }
    }

    fn install(&mut self, controller: Controller, entry: SubscriptionEntry) -> Result<ControllerSnapshot, PipelineError> {
        let symbol = controller.symbol().to_string();
        self.registry.insert(&symbol, entry)?;

        self.next_epoch += 1;
        let snapshot = controller.snapshot();
        self.slots.insert(
            symbol.clone(),
            Slot {
                controller,
                epoch: self.next_epoch,
                in_flight: false,
                backlog: VecDeque::new(),
            },
        );
        self.quotes.insert(symbol, QuoteCache::new());

        if self.fanout.has_viewers() {
            self.fanout.publish(&ViewerEvent::UpdateChart(snapshot.clone()));
        }
        Ok(snapshot)
    }

    fn detach(&mut self, symbol: &str, teardown: &Teardown) {
        let gone = self.registry.detach(symbol, teardown);
        if teardown.charts_removed {
            self.slots.remove(symbol);
        }
        if gone {
            self.quotes.remove(symbol);
        }
    }

    fn on_bar(&mut self, bar: Bar) {
        let Some(slot) = self.slots.get_mut(&bar.symbol) else {
            warn!(symbol = %bar.symbol, "bar routed to symbol without controller");
            return;
        };
        if slot.in_flight {
            slot.backlog.push_back(bar);
            return;
        }
        if let Some(job) = slot.controller.accept(bar) {
            slot.in_flight = true;
            spawn_recompute(self.done_tx.clone(), slot.controller.symbol().to_string(), slot.epoch, job);
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { symbol, epoch, result } = completion;
        let Some(slot) = self.slots.get_mut(&symbol) else {
            debug!(symbol = %symbol, "recompute for removed symbol discarded");
            return;
        };
        if slot.epoch != epoch {
            debug!(symbol = %symbol, "recompute for replaced controller discarded");
            return;
        }
        slot.in_flight = false;

        if let Some(result) = result {
            let outcome = slot.controller.apply(result);
            self.writer.enqueue_patterns(outcome.patterns);
            if self.fanout.has_viewers() {
                self.fanout.publish(&ViewerEvent::UpdateChart(slot.controller.snapshot()));
            }
        }

        while let Some(bar) = slot.backlog.pop_front() {
            if let Some(job) = slot.controller.accept(bar) {
                slot.in_flight = true;
                spawn_recompute(self.done_tx.clone(), symbol, slot.epoch, job);
                break;
            }
        }
    }

    fn on_quote(&mut self, quote: Quote) {
        let Some(cache) = self.quotes.get_mut(&quote.symbol) else {
            return;
        };
        let merged = cache.on_quote(quote);
        if self.fanout.has_viewers() {
            self.fanout.publish(&ViewerEvent::UpdateQuote(merged.clone()));
        }
    }
}

fn spawn_recompute(done: mpsc::UnboundedSender<Completion>, symbol: String, epoch: u64, job: RecomputeJob) {
    tokio::spawn(async move {
        let result = match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(symbol = %symbol, error = %e, "recompute task failed");
                None
            }
        };
        let _ = done.send(Completion { symbol, epoch, result });
    });
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Clone)]
pub struct PipelineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    adapter: Arc<IngestionAdapter>,
    session: Arc<Mutex<StreamSession>>,
    store: Arc<dyn Store>,
    fanout: Arc<FanoutHub>,
    writer: PatternWriter,
    params: Arc<AnalyticsParams>,
}

impl PipelineHandle {
    /// Start the engine task.
    pub fn spawn(
        adapter: Arc<IngestionAdapter>,
        store: Arc<dyn Store>,
        fanout: Arc<FanoutHub>,
        writer: PatternWriter,
        params: Arc<AnalyticsParams>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            registry: SubscriptionRegistry::new(),
            slots: HashMap::new(),
            quotes: HashMap::new(),
            fanout: Arc::clone(&fanout),
            writer: writer.clone(),
            done_tx,
            next_epoch: 0,
        };
        let task = tokio::spawn(engine.run(cmd_rx, done_rx));
        let handle = Self {
            cmd_tx,
            adapter,
            session: Arc::new(Mutex::new(StreamSession::new())),
            store,
            fanout,
            writer,
            params,
        };
        (handle, task)
    }

    pub fn fanout(&self) -> &Arc<FanoutHub> {
        &self.fanout
    }

    pub fn account(&self) -> AccountInfo {
        self.adapter.account()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCmd) -> Result<T, PipelineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| PipelineError::EngineStopped)?;
        rx.await.map_err(|_| PipelineError::EngineStopped)
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&dyn Store) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| anyhow::anyhow!("store task failed: {e}"))?
            .map_err(PipelineError::from)
    }

    async fn entry(&self, symbol: &str) -> Result<Option<SubscriptionEntry>, PipelineError> {
        let symbol = symbol.to_string();
        self.call(|reply| EngineCmd::Entry { symbol, reply }).await
    }

    pub async fn is_subscribed(&self, symbol: &str) -> Result<bool, PipelineError> {
        Ok(self.entry(symbol).await?.is_some())
    }

    pub async fn snapshots(&self) -> Result<Vec<ControllerSnapshot>, PipelineError> {
        self.call(|reply| EngineCmd::Snapshots { reply }).await
    }

    /// Resolve `query`, backfill and seed its controller, then start streaming.
    pub async fn subscribe(&self, query: &str) -> Result<ControllerSnapshot, PipelineError> {
        let symbol = self
            .adapter
            .resolve_symbol(query)
            .await?
            .ok_or_else(|| PipelineError::InvalidSymbol(query.trim().to_string()))?;
        if self.is_subscribed(&symbol).await? {
            return Err(PipelineError::AlreadySubscribed(symbol));
        }

        let session = self.params.session;
        let window_start = session.days_ago(Utc::now(), self.params.history_days);
        let latest = {
            let symbol = symbol.clone();
            self.with_store(move |store| store.latest_bar(&symbol, window_start)).await?
        };
        let since = latest.map_or(window_start, |b| b.timestamp + Duration::minutes(1));
        let fetched = self.adapter.fetch_historical_bars(&symbol, since).await?;
        info!(symbol = %symbol, since = %since, fetched = fetched.len(), "history backfilled");

        let (bars, record) = {
            let symbol = symbol.clone();
            let today = session.today();
            self.with_store(move |store| {
                store.save_bars(&symbol, &fetched)?;
                let bars = store.load_bars(&symbol, window_start)?;
                let record = store.load_divergences(&symbol, today)?;
                Ok((bars, record))
            })
            .await?
        };

        let params = Arc::clone(&self.params);
        let seed_symbol = symbol.clone();
        let (controller, outcome) =
            tokio::task::spawn_blocking(move || Controller::seed(&seed_symbol, bars, record.into_iter().collect(), params))
                .await
                .map_err(|e| anyhow::anyhow!("seeding {symbol} failed: {e}"))??;
        self.writer.enqueue_patterns(outcome.patterns);

        let snapshot = {
            let mut streams = self.session.lock().await;
            if self.is_subscribed(&symbol).await? {
                return Err(PipelineError::AlreadySubscribed(symbol));
            }
            let entry = SubscriptionEntry::full();
            streams.open(self.adapter.as_ref(), &symbol, &entry).await?;
            let controller = Box::new(controller);
            self.call(|reply| EngineCmd::Install { controller, entry, reply }).await??
        };

        let saved = {
            let symbol = symbol.clone();
            self.with_store(move |store| store.save_instrument(&symbol)).await
        };
        if let Err(e) = saved {
            warn!(symbol = %symbol, error = %e, "failed to remember instrument");
        }
        Ok(snapshot)
    }

    /// Stop streaming `query`, forget it and tell every viewer.
    pub async fn unsubscribe(&self, query: &str) -> Result<String, PipelineError> {
        let symbol = query.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(PipelineError::InvalidSymbol(query.to_string()));
        }
        {
            let streams = self.session.lock().await;
            let entry = self
                .entry(&symbol)
                .await?
                .ok_or_else(|| PipelineError::NotSubscribed(symbol.clone()))?;
            let teardown = streams.close(self.adapter.as_ref(), &symbol, &entry).await;
            let target = symbol.clone();
            self.call(|reply| EngineCmd::Detach { symbol: target, teardown, reply }).await??;
        }

        let removed = {
            let symbol = symbol.clone();
            self.with_store(move |store| store.delete_instrument(&symbol)).await
        };
        if let Err(e) = removed {
            warn!(symbol = %symbol, error = %e, "failed to forget instrument");
        }
        self.fanout.publish(&ViewerEvent::UnsubscribeChart { symbol: symbol.clone() });
        Ok(symbol)
    }

    /// Single-expiry chain; missing bounds default to two days out through
    /// the following Friday.
    pub async fn options_chain(
        &self,
        symbol: &str,
        strike_count: Option<u32>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<OptionsChain, PipelineError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(PipelineError::InvalidSymbol(symbol));
        }
        let (default_from, default_to) = default_expiry_range(self.params.session.today());
        let query = OptionsQuery {
            symbol,
            strike_count: strike_count.unwrap_or(DEFAULT_STRIKE_COUNT),
            from: from.unwrap_or(default_from),
            to: to.unwrap_or(default_to),
        };
        let raw = self.adapter.options_chain(&query).await?;
        select_single_expiry(&query.symbol, raw)
    }

    /// Forward stream batches to the engine.  Returns an error once the
    /// stream is gone; there is no reconnect.
    pub async fn run_stream_reader(self, mut events: mpsc::UnboundedReceiver<StreamEvent>) -> anyhow::Result<()> {
        info!("stream reader started");
        while let Some(event) = events.recv().await {
            if self.cmd_tx.send(EngineCmd::Stream(event)).is_err() {
                anyhow::bail!("analytics engine stopped while the stream was live");
            }
        }
        anyhow::bail!("market data stream closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{SimulatedAdapter, StreamKind, StreamOp};
    use crate::options::{ExpiryChains, OptionContract};
    use crate::persistence::{MemoryStore, PatternQueue, PersistJob};
    use crate::runtime_config::RuntimeConfig;
    use crate::types::DivergenceType;
    use chrono::{DateTime, TimeZone};

    /// Closes of 21 bars, five minutes apart.  The first 20 are history; the
    /// last one closes bar 19, which completes a bearish divergence between
    /// the RSI peaks at bars 10 and 18.
    const CLOSES: [f64; 21] = [
        100.0, 101.0, 100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0, 107.0, 109.0, 106.0, 104.0, 103.0,
        102.0, 104.0, 106.0, 108.0, 110.0, 108.0, 108.5,
    ];

    struct Harness {
        handle: PipelineHandle,
        adapter: Arc<IngestionAdapter>,
        store: Arc<MemoryStore>,
        queue: PatternQueue,
        t0: DateTime<Utc>,
    }

    impl Harness {
        fn sim(&self) -> &SimulatedAdapter {
            self.adapter.as_simulated().unwrap()
        }

        fn bar(&self, i: usize, volume: u64) -> Bar {
            let close = CLOSES[i];
            Bar {
                symbol: "XYZ".into(),
                timestamp: self.t0 + Duration::minutes(5 * i as i64),
                open: close,
                high: close + 0.25,
                low: close - 0.25,
                close,
                volume,
            }
        }

        /// Next persistence job, waiting briefly.
        async fn next_job(&mut self) -> PersistJob {
            tokio::time::timeout(std::time::Duration::from_secs(5), self.queue.recv())
                .await
                .expect("persistence job in time")
                .expect("writer queue open")
        }
    }

    fn harness() -> Harness {
        let mut config = RuntimeConfig::default();
        config.divergence.rsi_period = 2;

        let (sim, events) = SimulatedAdapter::new(AccountInfo {
            number: "SIM".into(),
            balance: 2000.0,
        });
        let adapter = Arc::new(IngestionAdapter::Simulated(sim));
        let store = Arc::new(MemoryStore::new());
        let fanout = Arc::new(FanoutHub::new(config.viewer_queue_capacity));
        let (writer, queue) = PatternWriter::channel(config.persistence_queue_capacity);
        let params = Arc::new(AnalyticsParams::from_config(&config));
        let (handle, _engine) = PipelineHandle::spawn(adapter.clone(), store.clone(), fanout, writer, params);
        tokio::spawn(handle.clone().run_stream_reader(events));

        let start = Utc::now().timestamp() - 300 * 60;
        let t0 = Utc.timestamp_opt(start - start.rem_euclid(300), 0).unwrap();
        Harness {
            handle,
            adapter,
            store,
            queue,
            t0,
        }
    }

    fn seeded_harness() -> Harness {
        let h = harness();
        let history: Vec<Bar> = (0..20).map(|i| h.bar(i, 100)).collect();
        h.sim().insert_history("XYZ", history);
        h
    }

    #[tokio::test]
    async fn qualifying_tick_yields_one_bearish_divergence() {
        let mut h = seeded_harness();
        let snapshot = h.handle.subscribe("xyz").await.unwrap();
        assert_eq!(snapshot.symbol, "XYZ");
        assert_eq!(snapshot.charts["5Min"].prices.len(), 20);
        assert!(snapshot.charts.values().all(|c| c.divergences.is_empty()));
        assert!(h.queue.try_recv().is_none());

        // The untraded tick is discarded; the traded one at the same time is not.
        h.sim().push_bars(vec![h.bar(20, 0)]).unwrap();
        h.sim().push_bars(vec![h.bar(20, 100)]).unwrap();

        match h.next_job().await {
            PersistJob::Archive(bar) => assert_eq!(bar.volume, 100),
            other => panic!("expected archived bar, got {other:?}"),
        }
        let update = match h.next_job().await {
            PersistJob::Patterns(update) => update,
            other => panic!("expected divergences, got {other:?}"),
        };
        assert_eq!(update.symbol, "XYZ");
        assert_eq!(update.timeframe, "5Min");
        assert_eq!(update.divergences.len(), 1);
        let div = &update.divergences[0];
        assert_eq!(div.kind, DivergenceType::Bearish);
        assert_eq!(div.start, h.t0 + Duration::minutes(50));
        assert_eq!(div.end, h.t0 + Duration::minutes(90));
        assert_eq!(div.end_price, 110.25);

        let snapshots = h.handle.snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].charts["5Min"].divergences.len(), 1);
        assert_eq!(snapshots[0].charts["5Min"].prices.len(), 21);
        assert!(h.queue.try_recv().is_none());
        assert_eq!(h.store.list_instruments().unwrap(), vec!["XYZ"]);
    }

    #[tokio::test]
    async fn bars_flow_while_a_stream_request_is_pending() {
        let mut h = seeded_harness();
        h.handle.subscribe("XYZ").await.unwrap();

        // Stand in for a slow stream round-trip: while the session is busy,
        // the engine must keep consuming ticks.
        let session = h.handle.session.clone();
        let busy = session.lock().await;
        let blocked = tokio::spawn({
            let handle = h.handle.clone();
            async move { handle.unsubscribe("XYZ").await }
        });
        h.sim().push_bars(vec![h.bar(20, 100)]).unwrap();

        assert!(matches!(h.next_job().await, PersistJob::Archive(_)));
        assert!(matches!(h.next_job().await, PersistJob::Patterns(_)));
        assert_eq!(h.handle.snapshots().await.unwrap()[0].charts["5Min"].prices.len(), 21);
        assert!(!blocked.is_finished());

        drop(busy);
        assert_eq!(blocked.await.unwrap().unwrap(), "XYZ");
        assert!(!h.handle.is_subscribed("XYZ").await.unwrap());
    }

    #[tokio::test]
    async fn subscribe_rejects_unknown_and_duplicate() {
        let h = seeded_harness();
        assert!(matches!(h.handle.subscribe("NOPE").await, Err(PipelineError::InvalidSymbol(_))));
        h.handle.subscribe("XYZ").await.unwrap();
        assert!(matches!(h.handle.subscribe("XYZ").await, Err(PipelineError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn subscribe_without_history_fails() {
        let h = harness();
        h.sim().insert_history("EMPTY", Vec::new());
        assert!(matches!(h.handle.subscribe("EMPTY").await, Err(PipelineError::NoHistory(_))));
        assert!(!h.handle.is_subscribed("EMPTY").await.unwrap());
        assert!(h.sim().requests().is_empty());
    }

    #[tokio::test]
    async fn rejected_stream_request_leaves_symbol_unsubscribed() {
        let h = seeded_harness();
        h.sim().set_fail_requests(true);
        assert!(matches!(h.handle.subscribe("XYZ").await, Err(PipelineError::StreamRequest(_))));
        assert!(!h.handle.is_subscribed("XYZ").await.unwrap());
        assert!(h.handle.snapshots().await.unwrap().is_empty());

        h.sim().set_fail_requests(false);
        h.handle.subscribe("XYZ").await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_notifies_viewers_and_forgets_symbol() {
        let h = seeded_harness();
        assert!(matches!(h.handle.unsubscribe("XYZ").await, Err(PipelineError::NotSubscribed(_))));

        h.handle.subscribe("XYZ").await.unwrap();
        let mut viewer = h.handle.fanout().connect();
        assert_eq!(h.handle.unsubscribe("xyz").await.unwrap(), "XYZ");

        let msg: serde_json::Value = serde_json::from_str(&viewer.recv().await.unwrap()).unwrap();
        assert_eq!(msg["action"], "UNSUBSCRIBE_CHART");
        assert_eq!(msg["data"]["symbol"], "XYZ");
        assert!(h.handle.snapshots().await.unwrap().is_empty());
        assert!(h.store.list_instruments().unwrap().is_empty());

        let ops: Vec<(StreamKind, StreamOp)> = h.sim().requests().iter().map(|r| (r.kind, r.op)).collect();
        assert_eq!(
            ops,
            vec![
                (StreamKind::Chart, StreamOp::Open),
                (StreamKind::Quote, StreamOp::Open),
                (StreamKind::Chart, StreamOp::Remove),
                (StreamKind::Quote, StreamOp::Remove),
            ]
        );
    }

    #[tokio::test]
    async fn quotes_are_merged_before_publishing() {
        let h = seeded_harness();
        h.handle.subscribe("XYZ").await.unwrap();
        let mut viewer = h.handle.fanout().connect();

        let quote = |bid: Option<f64>, last: Option<f64>| Quote {
            symbol: "XYZ".into(),
            bid,
            ask: None,
            last,
        };
        h.sim().push_quotes(vec![quote(Some(1.0), None)]).unwrap();
        h.sim().push_quotes(vec![quote(None, Some(1.5))]).unwrap();

        let _first = viewer.recv().await.unwrap();
        let second: serde_json::Value = serde_json::from_str(&viewer.recv().await.unwrap()).unwrap();
        assert_eq!(second["action"], "UPDATE_QUOTE");
        assert_eq!(second["data"]["bid"], 1.0);
        assert_eq!(second["data"]["last"], 1.5);
    }

    #[tokio::test]
    async fn options_chain_uses_earliest_common_expiry() {
        let h = harness();
        let day = |d: u32| NaiveDate::from_ymd_opt(2025, 6, d).unwrap();
        let contract = |strike: f64, expiration: NaiveDate| OptionContract {
            symbol: format!("XYZ_{strike}"),
            strike,
            expiration,
            bid: 1.0,
            ask: 1.2,
            last: 1.1,
            volume: 1,
            open_interest: 1,
            delta: None,
        };
        let mut chains = ExpiryChains::default();
        chains.calls.insert(day(13), vec![contract(100.0, day(13))]);
        chains.calls.insert(day(6), vec![contract(100.0, day(6))]);
        chains.puts.insert(day(13), vec![contract(95.0, day(13))]);
        h.sim().insert_options_chain("XYZ", chains);

        let chain = h
            .handle
            .options_chain("xyz", None, Some(day(1)), Some(day(30)))
            .await
            .unwrap();
        assert_eq!(chain.expiration, day(13));
        assert_eq!(chain.calls.len(), 1);

        let empty = h.handle.options_chain("ABC", Some(5), Some(day(1)), Some(day(30))).await;
        assert!(matches!(empty, Err(PipelineError::EmptyOptionsChain { .. })));
    }

    #[tokio::test]
    async fn stream_loss_is_an_error() {
        let h = harness();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        assert!(h.handle.clone().run_stream_reader(rx).await.is_err());
    }
}
