//! Websocket transport wrapper.
//!
//! Owns exactly one physical connection. A background worker drains the
//! outbound frame queue into the socket and forwards parsed inbound frames;
//! when the socket drops, the worker emits a `Disconnected` lifecycle event
//! and ends. Recovery is the connection manager's responsibility, never the
//! transport's.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::RtError;
use crate::rt::proto::{ClientFrame, LifecycleEvent, ServerFrame};

/// Bound on a single websocket connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect-time parameters; the token is metadata for this connection only
/// and is never renegotiated (a token change forces a new transport).
pub struct ConnectParams<'a> {
    /// Resolved websocket endpoint.
    pub endpoint: &'a str,
    /// Application id, sent as a connect header.
    pub app_id: &'a str,
    /// Bearer token read at connect time, when one is configured.
    pub token: Option<&'a SecretString>,
    /// Log every inbound/outbound frame at debug level.
    pub log_frames: bool,
}

/// One open websocket connection and its worker task handles.
pub struct Transport {
    sender: FrameSender,
    inbound: Option<mpsc::UnboundedReceiver<ServerFrame>>,
    events: Option<mpsc::UnboundedReceiver<LifecycleEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Transport {
    /// Connects the websocket and spawns the worker task.
    ///
    /// Fails once on connect error or timeout; the caller decides how the
    /// failure surfaces as a lifecycle event.
    pub async fn connect(params: ConnectParams<'_>) -> Result<Transport, RtError> {
        let mut request = params.endpoint.into_client_request()?;
        request
            .headers_mut()
            .insert("x-application-id", params.app_id.parse()?);
        if let Some(token) = params.token {
            let bearer = format!("Bearer {}", token.expose_secret());
            request.headers_mut().insert("authorization", bearer.parse()?);
        }

        let (socket, _) = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(RtError::WebSocket(err)),
            Err(_) => return Err(RtError::ConnectTimeout),
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let _ = events_tx.send(LifecycleEvent::Connected);

        let log_frames = params.log_frames;
        tokio::spawn(async move {
            transport_worker(socket, outbound_rx, inbound_tx, events_tx, shutdown_rx, log_frames)
                .await;
        });

        Ok(Transport {
            sender: FrameSender { tx: outbound_tx },
            inbound: Some(inbound_rx),
            events: Some(events_rx),
            shutdown: Some(shutdown_tx),
        })
    }

    /// Returns a cloneable sender for outbound frames.
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Takes the inbound frame receiver; the dispatch task owns it afterwards.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<ServerFrame>> {
        self.inbound.take()
    }

    /// Takes the lifecycle event receiver.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LifecycleEvent>> {
        self.events.take()
    }

    /// Signals the worker to close the socket gracefully. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable sender for outbound wire frames.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<ClientFrame>,
}

impl FrameSender {
    /// Queues a frame for the transport worker.
    pub fn emit(&self, frame: ClientFrame) -> Result<(), RtError> {
        self.tx.send(frame).map_err(|_| RtError::SendQueueClosed)
    }

    /// Builds a detached sender/receiver pair with no worker behind it.
    ///
    /// The receiver sees every emitted frame; used by unit tests to observe
    /// registry traffic without a socket.
    #[cfg(test)]
    pub(crate) fn detached() -> (FrameSender, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FrameSender { tx }, rx)
    }
}

async fn transport_worker(
    mut socket: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    inbound_tx: mpsc::UnboundedSender<ServerFrame>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    log_frames: bool,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = socket.close(None).await;
                break;
            }
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        let text = match frame.to_text() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(event = "rt_frame_encode_failed", error = %err);
                                continue;
                            }
                        };
                        if log_frames {
                            debug!(event = "rt_frame_out", frame = %text);
                        }
                        if socket.send(Message::Text(text)).await.is_err() {
                            let _ = events_tx.send(LifecycleEvent::Disconnected);
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if log_frames {
                            debug!(event = "rt_frame_in", frame = %text);
                        }
                        match ServerFrame::from_text(&text) {
                            Ok(frame) => {
                                let _ = inbound_tx.send(frame);
                            }
                            Err(err) => {
                                warn!(event = "rt_frame_unparsed", error = %err, frame = %text);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            let _ = events_tx.send(LifecycleEvent::Disconnected);
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(LifecycleEvent::Disconnected);
                        break;
                    }
                    Some(Ok(_)) => {
                        warn!(event = "rt_frame_non_text");
                    }
                    Some(Err(err)) => {
                        let _ = events_tx.send(LifecycleEvent::Error(err.to_string()));
                        let _ = events_tx.send(LifecycleEvent::Disconnected);
                        break;
                    }
                }
            }
        }
    }
}
