// =============================================================================
// Pipeline errors surfaced to callers of the command surface
// =============================================================================
//
// Infrastructure code (adapters, stores, config) keeps returning
// `anyhow::Result`; anything a client can trigger through subscribe /
// unsubscribe / options-chain is classified here so the HTTP layer can map it
// onto a status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0} is not a valid ticker")]
    InvalidSymbol(String),

    #[error("{0} is already subscribed")]
    AlreadySubscribed(String),

    #[error("{0} is not subscribed")]
    NotSubscribed(String),

    #[error("no price history found for {0}")]
    NoHistory(String),

    #[error("options chain for {symbol} has no {side}")]
    EmptyOptionsChain { symbol: String, side: &'static str },

    #[error("stream request rejected: {0:#}")]
    StreamRequest(anyhow::Error),

    #[error(transparent)]
    Adapter(#[from] anyhow::Error),

    #[error("analytics engine is not running")]
    EngineStopped,
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSymbol(_) | Self::AlreadySubscribed(_) | Self::NotSubscribed(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NoHistory(_) | Self::EmptyOptionsChain { .. } => StatusCode::NOT_FOUND,
            Self::StreamRequest(_) | Self::Adapter(_) => StatusCode::BAD_GATEWAY,
            Self::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_client_errors() {
        assert_eq!(PipelineError::AlreadySubscribed("XYZ".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(PipelineError::NotSubscribed("XYZ".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            PipelineError::InvalidSymbol("??".into()).to_string(),
            "?? is not a valid ticker"
        );
    }

    #[test]
    fn adapter_failures_are_gateway_errors() {
        let err: PipelineError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_string(), "connection reset");
    }
}
