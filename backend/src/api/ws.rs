// =============================================================================
// WebSocket Handler — viewer push channel
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. `UPDATE_ACCOUNT` with the brokerage account.
//   2. One `UPDATE_CHART` per subscribed symbol.
//   3. Every event published by the fanout hub from then on.
//
// The viewer is registered with the hub before the greeting is built, so no
// update published in between is lost.  Incoming text is ignored; Ping frames
// are answered with Pong.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::fanout::ViewerEvent;
use crate::pipeline::PipelineHandle;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(ws: WebSocketUpgrade, State(pipeline): State<PipelineHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, pipeline))
}

async fn handle_ws_connection(socket: WebSocket, pipeline: PipelineHandle) {
    let mut viewer = pipeline.fanout().connect();
    info!(viewer = viewer.id(), "viewer connected");

    let (mut sender, mut receiver) = socket.split();

    let greeting = match greeting(&pipeline).await {
        Ok(events) => events,
        Err(e) => {
            warn!(viewer = viewer.id(), error = %e, "failed to build viewer greeting");
            return;
        }
    };
    for payload in greeting {
        if let Err(e) = sender.send(Message::Text(payload.to_string())).await {
            debug!(viewer = viewer.id(), error = %e, "greeting send failed, disconnecting");
            return;
        }
    }

    loop {
        tokio::select! {
            payload = viewer.recv() => {
                let Some(payload) = payload else { break };
                if let Err(e) = sender.send(Message::Text(payload.to_string())).await {
                    debug!(viewer = viewer.id(), error = %e, "send failed, disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(viewer = viewer.id(), error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(viewer = viewer.id(), "viewer disconnected");
}

/// Account first, then one chart snapshot per subscribed symbol.
async fn greeting(pipeline: &PipelineHandle) -> Result<Vec<Arc<str>>, crate::error::PipelineError> {
    let mut events = vec![ViewerEvent::UpdateAccount(pipeline.account())];
    events.extend(pipeline.snapshots().await?.into_iter().map(ViewerEvent::UpdateChart));
    Ok(events.iter().filter_map(ViewerEvent::to_payload).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::adapter::{IngestionAdapter, SimulatedAdapter};
    use crate::analyzer::AnalyticsParams;
    use crate::fanout::FanoutHub;
    use crate::persistence::{MemoryStore, PatternWriter};
    use crate::runtime_config::RuntimeConfig;
    use crate::types::AccountInfo;

    #[tokio::test]
    async fn greeting_starts_with_account() {
        let (sim, _events) = SimulatedAdapter::new(AccountInfo {
            number: "SIM-1".into(),
            balance: 1500.0,
        });
        let (writer, _queue) = PatternWriter::channel(8);
        let (pipeline, _engine) = PipelineHandle::spawn(
            Arc::new(IngestionAdapter::Simulated(sim)),
            Arc::new(MemoryStore::new()),
            Arc::new(FanoutHub::new(4)),
            writer,
            Arc::new(AnalyticsParams::from_config(&RuntimeConfig::default())),
        );

        let payloads = greeting(&pipeline).await.unwrap();
        assert_eq!(payloads.len(), 1);
        let msg: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(msg["action"], "UPDATE_ACCOUNT");
        assert_eq!(msg["data"]["number"], "SIM-1");
        assert_eq!(msg["data"]["balance"], 1500.0);
    }
}
