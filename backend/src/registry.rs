// =============================================================================
// Subscription Registry — which symbols are streamed, and who listens
// =============================================================================
//
// `SubscriptionRegistry` is owned by the engine task and only answers routing
// questions; it never talks to the adapter.  `StreamSession` issues the
// external stream requests.  It remembers per stream kind whether the stream
// was ever opened: the first subscription opens it, later ones add to it, and
// dropping the last listener of a symbol removes the symbol from it.  Callers
// hold it behind a lock so requests are serialized.
//
// Adapter failures are returned to the caller, after undoing any request of
// the same call that already went through.
// =============================================================================

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::adapter::{StreamControl, StreamKind, StreamOp, StreamRequest};
use crate::error::PipelineError;
use crate::types::{Bar, Quote};

/// Receiver of a symbol's chart bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartListener {
    /// The symbol's analytics controller.
    Analytics,
    /// Writes accepted live bars to the bar store.
    Archive,
}

/// Receiver of a symbol's quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteListener {
    Cache,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub charts: Vec<ChartListener>,
    pub quote: Option<QuoteListener>,
}

impl SubscriptionEntry {
    /// Every listener a freshly subscribed symbol gets.
    pub fn full() -> Self {
        Self {
            charts: vec![ChartListener::Analytics, ChartListener::Archive],
            quote: Some(QuoteListener::Cache),
        }
    }
}

/// Result of leaving the streams of one symbol.
#[derive(Debug)]
pub struct Teardown {
    /// The chart stream no longer carries the symbol.
    pub charts_removed: bool,
    pub result: Result<(), PipelineError>,
}

#[derive(Debug, Default)]
pub struct StreamSession {
    opened: HashSet<StreamKind>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start streaming `symbol` for every listener kind of `entry`.
    pub async fn open<S: StreamControl>(
        &mut self,
        stream: &S,
        symbol: &str,
        entry: &SubscriptionEntry,
    ) -> Result<(), PipelineError> {
        let wants_chart = !entry.charts.is_empty();
        if wants_chart {
            self.start(stream, StreamKind::Chart, symbol).await?;
        }
        if entry.quote.is_some() {
            if let Err(e) = self.start(stream, StreamKind::Quote, symbol).await {
                if wants_chart {
                    stop(stream, StreamKind::Chart, symbol).await.unwrap_or_else(|undo| {
                        warn!(symbol, error = %undo, "failed to undo chart subscription");
                    });
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop streaming `symbol` for the listener kinds `entry` still has.
    pub async fn close<S: StreamControl>(&self, stream: &S, symbol: &str, entry: &SubscriptionEntry) -> Teardown {
        if !entry.charts.is_empty() {
            if let Err(e) = stop(stream, StreamKind::Chart, symbol).await {
                return Teardown {
                    charts_removed: false,
                    result: Err(e),
                };
            }
        }
        let result = match entry.quote {
            Some(_) => stop(stream, StreamKind::Quote, symbol).await,
            None => Ok(()),
        };
        Teardown {
            charts_removed: true,
            result,
        }
    }

    async fn start<S: StreamControl>(&mut self, stream: &S, kind: StreamKind, symbol: &str) -> Result<(), PipelineError> {
        let op = if self.opened.contains(&kind) {
            StreamOp::Add
        } else {
            StreamOp::Open
        };
        stream
            .request(StreamRequest {
                kind,
                op,
                symbols: vec![symbol.to_string()],
            })
            .await
            .map_err(PipelineError::StreamRequest)?;
        self.opened.insert(kind);
        Ok(())
    }
}

async fn stop<S: StreamControl>(stream: &S, kind: StreamKind, symbol: &str) -> Result<(), PipelineError> {
    stream
        .request(StreamRequest {
            kind,
            op: StreamOp::Remove,
            symbols: vec![symbol.to_string()],
        })
        .await
        .map_err(PipelineError::StreamRequest)
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn entry(&self, symbol: &str) -> Option<&SubscriptionEntry> {
        self.entries.get(symbol)
    }

    pub fn insert(&mut self, symbol: &str, entry: SubscriptionEntry) -> Result<(), PipelineError> {
        if self.is_subscribed(symbol) {
            return Err(PipelineError::AlreadySubscribed(symbol.to_string()));
        }
        self.entries.insert(symbol.to_string(), entry);
        info!(symbol, subscribed = self.entries.len(), "symbol subscribed");
        Ok(())
    }

    /// Apply the outcome of `StreamSession::close`.  Returns whether the
    /// symbol is gone entirely.
    ///
    /// If the chart stream is left but leaving the quote stream fails, the
    /// entry keeps only its quote listener.
    pub fn detach(&mut self, symbol: &str, teardown: &Teardown) -> bool {
        if teardown.result.is_ok() {
            if self.entries.remove(symbol).is_some() {
                info!(symbol, subscribed = self.entries.len(), "symbol unsubscribed");
            }
            return true;
        }
        if teardown.charts_removed {
            if let Some(kept) = self.entries.get_mut(symbol) {
                kept.charts.clear();
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Pair every bar with each chart listener of its symbol.
    pub fn route_bars(&self, bars: Vec<Bar>) -> Vec<(ChartListener, Bar)> {
        let mut routed = Vec::with_capacity(bars.len());
        for bar in bars {
            match self.entries.get(&bar.symbol) {
                Some(entry) => {
                    for &listener in &entry.charts {
                        routed.push((listener, bar.clone()));
                    }
                }
                None => warn!(symbol = %bar.symbol, "bar for unsubscribed symbol dropped"),
            }
        }
        routed
    }

    pub fn route_quotes(&self, quotes: Vec<Quote>) -> Vec<(QuoteListener, Quote)> {
        let mut routed = Vec::with_capacity(quotes.len());
        for quote in quotes {
            match self.entries.get(&quote.symbol).and_then(|e| e.quote) {
                Some(listener) => routed.push((listener, quote)),
                None => debug!(symbol = %quote.symbol, "quote for unsubscribed symbol dropped"),
            }
        }
        routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::Utc;
    use parking_lot::Mutex;

    /// Records requests; fails those whose kind is listed in `fail`.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<StreamRequest>>,
        fail: Mutex<Vec<(StreamKind, StreamOp)>>,
    }

    impl StreamControl for Recorder {
        async fn request(&self, req: StreamRequest) -> Result<()> {
            if self.fail.lock().contains(&(req.kind, req.op)) {
                anyhow::bail!("rejected");
            }
            self.seen.lock().push(req);
            Ok(())
        }
    }

    fn ops(rec: &Recorder) -> Vec<(StreamKind, StreamOp, String)> {
        rec.seen
            .lock()
            .iter()
            .map(|r| (r.kind, r.op, r.symbols.join(",")))
            .collect()
    }

    fn all_charts() -> Vec<ChartListener> {
        vec![ChartListener::Analytics, ChartListener::Archive]
    }

    fn bar(symbol: &str) -> Bar {
        Bar {
            symbol: symbol.into(),
            timestamp: Utc::now(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
        }
    }

    /// Session and registry driven the way the pipeline drives them.
    #[derive(Default)]
    struct Subscriptions {
        session: StreamSession,
        reg: SubscriptionRegistry,
    }

    impl Subscriptions {
        async fn subscribe(&mut self, rec: &Recorder, symbol: &str, entry: SubscriptionEntry) -> Result<(), PipelineError> {
            if self.reg.is_subscribed(symbol) {
                return Err(PipelineError::AlreadySubscribed(symbol.into()));
            }
            self.session.open(rec, symbol, &entry).await?;
            self.reg.insert(symbol, entry)
        }

        async fn unsubscribe(&mut self, rec: &Recorder, symbol: &str) -> Result<(), PipelineError> {
            let entry = self
                .reg
                .entry(symbol)
                .cloned()
                .ok_or_else(|| PipelineError::NotSubscribed(symbol.into()))?;
            let teardown = self.session.close(rec, symbol, &entry).await;
            self.reg.detach(symbol, &teardown);
            teardown.result
        }
    }

    #[tokio::test]
    async fn first_subscription_opens_later_ones_add() {
        let rec = Recorder::default();
        let mut subs = Subscriptions::default();
        subs.subscribe(&rec, "XYZ", SubscriptionEntry::full()).await.unwrap();
        subs.subscribe(&rec, "ABC", SubscriptionEntry::full()).await.unwrap();

        assert_eq!(
            ops(&rec),
            vec![
                (StreamKind::Chart, StreamOp::Open, "XYZ".into()),
                (StreamKind::Quote, StreamOp::Open, "XYZ".into()),
                (StreamKind::Chart, StreamOp::Add, "ABC".into()),
                (StreamKind::Quote, StreamOp::Add, "ABC".into()),
            ]
        );
        assert!(subs.reg.is_subscribed("ABC"));
        assert!(subs.reg.is_subscribed("XYZ"));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_are_rejected() {
        let rec = Recorder::default();
        let mut subs = Subscriptions::default();
        let charts_only = SubscriptionEntry {
            charts: all_charts(),
            quote: None,
        };
        subs.subscribe(&rec, "XYZ", charts_only.clone()).await.unwrap();

        let dup = subs.subscribe(&rec, "XYZ", charts_only).await;
        assert!(matches!(dup, Err(PipelineError::AlreadySubscribed(_))));
        let unknown = subs.unsubscribe(&rec, "ABC").await;
        assert!(matches!(unknown, Err(PipelineError::NotSubscribed(_))));
        assert_eq!(rec.seen.lock().len(), 1);
        assert!(matches!(
            subs.reg.insert("XYZ", SubscriptionEntry::full()),
            Err(PipelineError::AlreadySubscribed(_))
        ));
    }

    #[tokio::test]
    async fn failed_open_rolls_back() {
        let rec = Recorder::default();
        rec.fail.lock().push((StreamKind::Quote, StreamOp::Open));
        let mut subs = Subscriptions::default();

        let err = subs.subscribe(&rec, "XYZ", SubscriptionEntry::full()).await;
        assert!(matches!(err, Err(PipelineError::StreamRequest(_))));
        assert!(!subs.reg.is_subscribed("XYZ"));
        // chart stream opened, then undone
        assert_eq!(
            ops(&rec),
            vec![
                (StreamKind::Chart, StreamOp::Open, "XYZ".into()),
                (StreamKind::Chart, StreamOp::Remove, "XYZ".into()),
            ]
        );

        // The chart stream stays open, the quote stream was never opened.
        rec.fail.lock().clear();
        subs.subscribe(&rec, "XYZ", SubscriptionEntry::full()).await.unwrap();
        let last_two: Vec<_> = ops(&rec).into_iter().skip(2).collect();
        assert_eq!(
            last_two,
            vec![
                (StreamKind::Chart, StreamOp::Add, "XYZ".into()),
                (StreamKind::Quote, StreamOp::Open, "XYZ".into()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_remove_keeps_entry() {
        let rec = Recorder::default();
        let mut subs = Subscriptions::default();
        subs.subscribe(&rec, "XYZ", SubscriptionEntry::full()).await.unwrap();

        rec.fail.lock().push((StreamKind::Chart, StreamOp::Remove));
        assert!(subs.unsubscribe(&rec, "XYZ").await.is_err());
        assert_eq!(subs.reg.entry("XYZ").unwrap().charts.len(), 2);

        rec.fail.lock().clear();
        rec.fail.lock().push((StreamKind::Quote, StreamOp::Remove));
        assert!(subs.unsubscribe(&rec, "XYZ").await.is_err());
        let entry = subs.reg.entry("XYZ").unwrap();
        assert!(entry.charts.is_empty());
        assert_eq!(entry.quote, Some(QuoteListener::Cache));

        // Only the quote stream is left to leave.
        rec.fail.lock().clear();
        let before = rec.seen.lock().len();
        subs.unsubscribe(&rec, "XYZ").await.unwrap();
        assert_eq!(ops(&rec).split_off(before), vec![(StreamKind::Quote, StreamOp::Remove, "XYZ".into())]);
        assert!(!subs.reg.is_subscribed("XYZ"));
    }

    #[test]
    fn routing_fans_out_and_drops_unknown() {
        let mut reg = SubscriptionRegistry::new();
        reg.insert("XYZ", SubscriptionEntry::full()).unwrap();

        let routed = reg.route_bars(vec![bar("XYZ"), bar("ABC")]);
        let listeners: Vec<ChartListener> = routed.iter().map(|(l, _)| *l).collect();
        assert_eq!(listeners, all_charts());

        let quotes = reg.route_quotes(vec![
            Quote {
                symbol: "ABC".into(),
                ..Quote::default()
            },
            Quote {
                symbol: "XYZ".into(),
                last: Some(1.0),
                ..Quote::default()
            },
        ]);
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].1.symbol, "XYZ");
    }
}
