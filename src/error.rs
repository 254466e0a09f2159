use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::rt::proto::FrameError;

/// Errors produced by realtime transport and protocol handling.
#[derive(Debug, Error)]
pub enum RtError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Token or app id could not be converted to a valid HTTP header value.
    #[error("invalid connect header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// HTTP transport error during host lookup.
    #[error("lookup request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Host lookup returned a non-success status.
    #[error("lookup http {status}: {body}")]
    LookupStatus { status: StatusCode, body: String },

    /// Outbound frame queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    /// Transport connect attempt exceeded the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Application-level failure reported by the server for a method call.
    #[error("server error: {0}")]
    Call(FrameError),

    /// Method call response did not arrive within the configured timeout.
    #[error("method call timed out after {0:?}")]
    CallTimeout(Duration),

    /// Invocation target required but not registered on the shared object.
    #[error("invocation target is not registered")]
    NoInvocationTarget,

    /// Realtime protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}
