// =============================================================================
// Pattern Writer — background persistence of divergences and live bars
// =============================================================================
//
// Producers (the engine) enqueue with `try_send` and never wait: a full queue
// drops the job with a warning.  A single consumer drains the queue in arrival
// order.  Whatever is already waiting when it wakes up is handled as one
// batch, in which only the newest divergence list per (symbol, timeframe)
// survives.  Each list replaces its timeframe's slot in the (symbol, day)
// record of its newest divergence, so rewriting is idempotent.  A failed write
// of one symbol's bars or one record is logged and does not stop the rest of
// the batch.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::store::Store;
use crate::analyzer::PatternUpdate;
use crate::types::Bar;

#[derive(Debug, Clone)]
pub enum PersistJob {
    Patterns(PatternUpdate),
    Archive(Bar),
}

/// Producer side, cheap to clone.
#[derive(Clone)]
pub struct PatternWriter {
    tx: mpsc::Sender<PersistJob>,
}

/// Consumer side, handed to `run_writer`.
pub struct PatternQueue {
    rx: mpsc::Receiver<PersistJob>,
}

impl PatternWriter {
    pub fn channel(capacity: usize) -> (Self, PatternQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, PatternQueue { rx })
    }

    pub fn enqueue_patterns(&self, updates: Vec<PatternUpdate>) {
        for update in updates {
            self.offer(PersistJob::Patterns(update));
        }
    }

    pub fn archive(&self, bar: Bar) {
        self.offer(PersistJob::Archive(bar));
    }

    fn offer(&self, job: PersistJob) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => warn!(job = ?job_label(&job), "persistence queue full, job dropped"),
            Err(TrySendError::Closed(_)) => warn!("persistence writer stopped, job dropped"),
        }
    }
}

impl PatternQueue {
    pub async fn recv(&mut self) -> Option<PersistJob> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PersistJob> {
        self.rx.try_recv().ok()
    }

    fn drain_ready(&mut self, into: &mut Vec<PersistJob>) {
        while let Some(job) = self.try_recv() {
            into.push(job);
        }
    }
}

fn job_label(job: &PersistJob) -> (String, String) {
    match job {
        PersistJob::Patterns(p) => (p.symbol.clone(), p.timeframe.clone()),
        PersistJob::Archive(b) => (b.symbol.clone(), "bar".to_string()),
    }
}

/// Newest list per (symbol, timeframe) in first-seen order, and bars per
/// symbol in arrival order.
fn coalesce(jobs: Vec<PersistJob>) -> (Vec<PatternUpdate>, HashMap<String, Vec<Bar>>) {
    let mut patterns: Vec<PatternUpdate> = Vec::new();
    let mut bars: HashMap<String, Vec<Bar>> = HashMap::new();
    for job in jobs {
        match job {
            PersistJob::Patterns(update) => {
                match patterns
                    .iter_mut()
                    .find(|p| p.symbol == update.symbol && p.timeframe == update.timeframe)
                {
                    Some(slot) => *slot = update,
                    None => patterns.push(update),
                }
            }
            PersistJob::Archive(bar) => bars.entry(bar.symbol.clone()).or_default().push(bar),
        }
    }
    (patterns, bars)
}

fn write_batch(store: &dyn Store, jobs: Vec<PersistJob>) -> Result<()> {
    let (patterns, bars) = coalesce(jobs);
    let total = bars.len() + patterns.len();
    let mut failed = 0;

    for (symbol, bars) in &bars {
        if let Err(e) = store.save_bars(symbol, bars) {
            warn!(symbol = %symbol, bars = bars.len(), error = %e, "failed to archive bars");
            failed += 1;
        }
    }

    for update in patterns {
        let symbol = update.symbol.clone();
        let timeframe = update.timeframe.clone();
        if let Err(e) = write_patterns(store, update) {
            warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "failed to persist divergences");
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{failed} of {total} writes failed");
    }
    Ok(())
}

fn write_patterns(store: &dyn Store, update: PatternUpdate) -> Result<()> {
    let Some(day) = update.divergences.last().map(|d| d.day) else {
        debug!(symbol = %update.symbol, timeframe = %update.timeframe, "empty divergence list skipped");
        return Ok(());
    };
    let mut record = store.load_divergences(&update.symbol, day)?;
    record.insert(update.timeframe.clone(), update.divergences);
    store.save_divergences(&update.symbol, day, &record)?;
    debug!(symbol = %update.symbol, timeframe = %update.timeframe, day = %day, "divergences persisted");
    Ok(())
}

/// Drain `queue` into `store` until every producer is gone.
pub async fn run_writer(mut queue: PatternQueue, store: Arc<dyn Store>) {
    info!("pattern writer started");
    while let Some(first) = queue.recv().await {
        let mut batch = vec![first];
        queue.drain_ready(&mut batch);
        let size = batch.len();

        let store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || write_batch(store.as_ref(), batch)).await {
            Ok(Ok(())) => debug!(jobs = size, "persistence batch written"),
            Ok(Err(e)) => warn!(error = %e, jobs = size, "persistence batch failed"),
            Err(e) => warn!(error = %e, "persistence task panicked"),
        }
    }
    info!("pattern writer stopped");
}
