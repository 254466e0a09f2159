//! Method call registry.
//!
//! Tracks in-flight one-shot calls by correlation id. A pending call is
//! consumed exactly once by the first matching `met_res` frame and is never
//! resent after a reconnect: an in-flight call across a disconnect is simply
//! lost. The async `invoke` path bounds that loss with a per-call timeout;
//! the callback-style `send` path keeps the historical untimed contract.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::RtError;
use crate::ids::correlation_id;
use crate::rt::connection::ConnectionManager;
use crate::rt::proto::{ClientFrame, FrameError, FrameKind, ServerFrame};

/// One-shot callback for the legacy `send` path; fires at most once.
pub type MethodCallback = Box<dyn FnOnce(Result<Value, FrameError>) + Send>;

enum CallSlot {
    Channel(oneshot::Sender<Result<Value, FrameError>>),
    Callback(MethodCallback),
}

/// Registry of in-flight method calls, owned by one connection manager.
pub struct MethodRegistry {
    manager: ConnectionManager,
    pending: Mutex<HashMap<String, CallSlot>>,
    call_timeout: Option<Duration>,
}

impl MethodRegistry {
    /// Builds the registry and wires its response listener into the manager.
    pub fn new(manager: ConnectionManager, call_timeout: Option<Duration>) -> Arc<Self> {
        let registry = Arc::new(Self {
            manager: manager.clone(),
            pending: Mutex::new(HashMap::new()),
            call_timeout,
        });

        let weak = Arc::downgrade(&registry);
        manager.add_frame_listener(
            FrameKind::MetRes,
            Arc::new(move |frame| {
                if let Some(registry) = weak.upgrade() {
                    registry.on_response(frame);
                }
            }),
        );

        registry
    }

    /// Issues a method call and awaits its response.
    ///
    /// Applies the configured per-call timeout; a timed-out call removes its
    /// pending slot and fails with [`RtError::CallTimeout`].
    pub async fn invoke(&self, name: &str, options: Value) -> Result<Value, RtError> {
        let sender = self.manager.provide().await?;
        let (tx, rx) = oneshot::channel();
        let id = correlation_id();

        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.clone(), CallSlot::Channel(tx));
        if let Err(err) = sender.emit(ClientFrame::MetReq {
            id: id.clone(),
            name: name.to_string(),
            options,
        }) {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(err);
        }

        let outcome = match self.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(&id);
                    return Err(RtError::CallTimeout(timeout));
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(RtError::Call(error)),
            Err(_) => Err(RtError::Protocol(
                "method response channel dropped".to_string(),
            )),
        }
    }

    /// Issues a method call with a one-shot callback and no timeout.
    ///
    /// A response that never arrives leaves the slot stored indefinitely;
    /// `pending_calls` makes that observable. Returns the correlation id.
    pub async fn send(
        &self,
        name: &str,
        options: Value,
        callback: MethodCallback,
    ) -> Result<String, RtError> {
        let sender = self.manager.provide().await?;
        let id = correlation_id();

        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.clone(), CallSlot::Callback(callback));
        if let Err(err) = sender.emit(ClientFrame::MetReq {
            id: id.clone(),
            name: name.to_string(),
            options,
        }) {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Feeds an inbound frame straight into the registry, bypassing the
    /// transport.
    #[cfg(test)]
    pub(crate) fn on_response_for_tests(&self, frame: &ServerFrame) {
        self.on_response(frame);
    }

    fn on_response(&self, frame: &ServerFrame) {
        let ServerFrame::MetRes { id, result, error } = frame else {
            return;
        };
        let slot = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id);
        let Some(slot) = slot else {
            trace!(event = "rt_met_res_unknown_id", id = %id);
            return;
        };

        let payload = match error {
            Some(error) => Err(error.clone()),
            None => Ok(result.clone().unwrap_or(Value::Null)),
        };
        match slot {
            CallSlot::Channel(tx) => {
                let _ = tx.send(payload);
            }
            CallSlot::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(move || callback(payload))).is_err() {
                    warn!(event = "rt_method_callback_panicked", id = %id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::MethodRegistry;
    use crate::error::RtError;
    use crate::rt::connection::test_manager;
    use crate::rt::proto::{ClientFrame, FrameError, ServerFrame};
    use crate::rt::transport::FrameSender;

    fn registry_with_wire(
        call_timeout: Option<Duration>,
    ) -> (Arc<MethodRegistry>, UnboundedReceiver<ClientFrame>) {
        let manager = test_manager();
        let (sender, rx) = FrameSender::detached();
        manager.attach_for_tests(sender);
        (MethodRegistry::new(manager, call_timeout), rx)
    }

    fn met_req_id(frame: &ClientFrame) -> String {
        match frame {
            ClientFrame::MetReq { id, .. } => id.clone(),
            other => panic!("expected met_req, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_resolves_with_the_matching_response() {
        let (registry, mut wire) = registry_with_wire(None);

        let call = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke("RSO_GET", json!({"key": "count"})).await })
        };

        let frame = loop {
            match wire.try_recv() {
                Ok(frame) => break frame,
                Err(_) => tokio::task::yield_now().await,
            }
        };
        let id = met_req_id(&frame);

        registry.on_response(&ServerFrame::MetRes {
            id: "someone-else".to_string(),
            result: Some(json!(99)),
            error: None,
        });
        registry.on_response(&ServerFrame::MetRes {
            id,
            result: Some(json!(7)),
            error: None,
        });

        let result = call.await.expect("join").expect("invoke result");
        assert_eq!(result, json!(7));
        assert_eq!(registry.pending_calls(), 0);
    }

    #[tokio::test]
    async fn invoke_surfaces_server_errors() {
        let (registry, mut wire) = registry_with_wire(None);

        let call = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke("RSO_SET", json!({"key": "k"})).await })
        };
        let id = loop {
            match wire.try_recv() {
                Ok(frame) => break met_req_id(&frame),
                Err(_) => tokio::task::yield_now().await,
            }
        };

        registry.on_response(&ServerFrame::MetRes {
            id,
            result: None,
            error: Some(FrameError {
                code: Some(3),
                message: "forbidden".to_string(),
            }),
        });

        match call.await.expect("join") {
            Err(RtError::Call(error)) => assert_eq!(error.message, "forbidden"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out_and_clears_its_slot() {
        let (registry, _wire) = registry_with_wire(Some(Duration::from_secs(5)));

        let outcome = registry.invoke("RSO_GET", json!({"key": "k"})).await;
        match outcome {
            Err(RtError::CallTimeout(timeout)) => {
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(registry.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unanswered_send_leaves_exactly_one_stored_slot() {
        let (registry, _wire) = registry_with_wire(None);
        let (tx, rx) = std_mpsc::channel();

        registry
            .send(
                "RSO_COMMAND",
                json!({"type": "ping"}),
                Box::new(move |payload| {
                    let _ = tx.send(payload);
                }),
            )
            .await
            .expect("send");

        assert_eq!(registry.pending_calls(), 1);
        assert!(rx.try_recv().is_err(), "callback must not have fired");
    }

    #[tokio::test]
    async fn send_callback_fires_at_most_once() {
        let (registry, _wire) = registry_with_wire(None);
        let (tx, rx) = std_mpsc::channel();

        let id = registry
            .send(
                "RSO_GET",
                json!({"key": "k"}),
                Box::new(move |payload| {
                    let _ = tx.send(payload);
                }),
            )
            .await
            .expect("send");

        registry.on_response(&ServerFrame::MetRes {
            id: id.clone(),
            result: Some(json!(1)),
            error: None,
        });
        registry.on_response(&ServerFrame::MetRes {
            id,
            result: Some(json!(2)),
            error: None,
        });

        assert_eq!(rx.try_recv().expect("first response"), Ok(json!(1)));
        assert!(rx.try_recv().is_err(), "second response must be ignored");
        assert_eq!(registry.pending_calls(), 0);
    }
}
