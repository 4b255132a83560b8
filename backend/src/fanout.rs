// =============================================================================
// Fanout Hub — broadcast of viewer events with per-viewer backpressure
// =============================================================================
//
// Every connected viewer owns one bounded queue.  Publishing serializes the
// event once and offers the same payload to every queue with `try_send`:
//
//   - Full queue   => the event is dropped for that viewer only (warn).
//   - Closed queue => the viewer is gone; its entry is pruned.
//
// The publisher never waits on a viewer, so one stalled browser tab cannot
// hold up the analytics engine or other viewers.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::analyzer::ControllerSnapshot;
use crate::types::{AccountInfo, Quote};

// =============================================================================
// Envelope
// =============================================================================

/// `{"action": ..., "data": ...}` message pushed to viewers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewerEvent {
    UpdateChart(ControllerSnapshot),
    UpdateQuote(Quote),
    UnsubscribeChart { symbol: String },
    UpdateAccount(AccountInfo),
}

impl ViewerEvent {
    pub fn to_payload(&self) -> Option<Arc<str>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                warn!(error = %e, "failed to serialise viewer event");
                None
            }
        }
    }
}

/// Delivery counts of one publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

// =============================================================================
// Hub
// =============================================================================

pub struct FanoutHub {
    viewers: RwLock<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// A connected viewer's end of its queue.  Dropping it disconnects.
pub struct Viewer {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    hub: Arc<FanoutHub>,
}

impl Viewer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a viewer and create its queue.
    pub fn connect(self: &Arc<Self>) -> Viewer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.viewers.write().insert(id, tx);
        debug!(viewer = id, viewers = self.viewer_count(), "viewer connected");
        Viewer {
            id,
            rx,
            hub: Arc::clone(self),
        }
    }

    pub fn disconnect(&self, id: u64) {
        if self.viewers.write().remove(&id).is_some() {
            debug!(viewer = id, "viewer disconnected");
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.read().len()
    }

    pub fn has_viewers(&self) -> bool {
        self.viewer_count() > 0
    }

    /// Serialize `event` once and offer it to every viewer.
    pub fn publish(&self, event: &ViewerEvent) -> PublishReport {
        match event.to_payload() {
            Some(payload) => self.publish_payload(payload),
            None => PublishReport::default(),
        }
    }

    pub fn publish_payload(&self, payload: Arc<str>) -> PublishReport {
        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        {
            let viewers = self.viewers.read();
            for (&id, tx) in viewers.iter() {
                match tx.try_send(Arc::clone(&payload)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        report.dropped += 1;
                        warn!(viewer = id, "viewer queue full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(id),
                }
            }
        }
        if !closed.is_empty() {
            let mut viewers = self.viewers.write();
            for id in closed {
                viewers.remove(&id);
            }
        }
        report
    }
}
