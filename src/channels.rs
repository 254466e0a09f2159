//! Pub/sub channels.
//!
//! A channel groups three subscription topics under one name: a connect
//! topic whose first delivery marks membership, a message topic with an
//! optional server-evaluated selector, and a user-status topic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::RtError;
use crate::rt::proto::{
    FrameError, SUB_PUB_SUB_CONNECT, SUB_PUB_SUB_MESSAGES, SUB_PUB_SUB_USERS,
};
use crate::rt::subscriptions::{SubscriptionCallback, SubscriptionRegistry};

/// Membership handle for one named channel.
pub struct Channel {
    name: String,
    subscriptions: Arc<SubscriptionRegistry>,
    joined: Arc<AtomicBool>,
    connect_sub: Mutex<Option<String>>,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self {
            name: name.into(),
            subscriptions,
            joined: Arc::new(AtomicBool::new(false)),
            connect_sub: Mutex::new(None),
        }
    }

    /// Name of the channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the join handshake has completed.
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Joins the channel; resolves once the server confirms membership.
    ///
    /// Joining an already-joined channel is a no-op.
    pub async fn join(&self) -> Result<(), RtError> {
        if self.is_joined() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), FrameError>>();
        let ready_tx = Arc::new(Mutex::new(Some(ready_tx)));
        let joined = Arc::clone(&self.joined);
        let channel_name = self.name.clone();
        let callback: SubscriptionCallback = Arc::new(move |payload| {
            let slot = ready_tx.lock().expect("ready lock poisoned").take();
            match payload {
                Ok(_) => {
                    joined.store(true, Ordering::SeqCst);
                    if let Some(tx) = slot {
                        let _ = tx.send(Ok(()));
                    }
                }
                Err(err) => match slot {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    None => warn!(event = "channel_connect_error", channel = %channel_name, error = %err),
                },
            }
        });

        let connect_id = self
            .subscriptions
            .subscribe(SUB_PUB_SUB_CONNECT, self.scope(), callback)
            .await?;
        *self.connect_sub.lock().expect("connect lock poisoned") = Some(connect_id.clone());

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(frame_error)) => {
                self.subscriptions.unsubscribe_by_id(&connect_id);
                *self.connect_sub.lock().expect("connect lock poisoned") = None;
                Err(RtError::Call(frame_error))
            }
            Err(_) => {
                self.subscriptions.unsubscribe_by_id(&connect_id);
                *self.connect_sub.lock().expect("connect lock poisoned") = None;
                Err(RtError::Protocol("join readiness channel dropped".to_string()))
            }
        }
    }

    /// Leaves the channel, dropping the membership, message, and user-status
    /// subscriptions in one sweep.
    pub fn leave(&self) -> Vec<String> {
        let topics = [SUB_PUB_SUB_CONNECT, SUB_PUB_SUB_MESSAGES, SUB_PUB_SUB_USERS];
        let removed = self.subscriptions.unsubscribe_where(|entry| {
            topics.contains(&entry.name.as_str()) && self.matches_channel(&entry.options)
        });
        *self.connect_sub.lock().expect("connect lock poisoned") = None;
        self.joined.store(false, Ordering::SeqCst);
        removed
    }

    /// Listens for messages, optionally narrowed by a selector the server
    /// evaluates against each message.
    pub async fn add_message_listener(
        &self,
        selector: Option<&str>,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        let mut options = self.scope();
        if let Some(selector) = selector {
            if let Some(map) = options.as_object_mut() {
                map.insert("selector".to_string(), json!(selector));
            }
        }
        self.subscriptions
            .subscribe(SUB_PUB_SUB_MESSAGES, options, callback)
            .await
    }

    /// Removes every message listener on this channel.
    pub fn remove_message_listeners(&self) -> Vec<String> {
        self.remove_messages(None, None)
    }

    /// Removes the message listeners registered for `callback`.
    pub fn remove_message_listener(&self, callback: &SubscriptionCallback) -> Vec<String> {
        self.remove_messages(Some(callback), None)
    }

    /// Removes the message listeners registered with exactly this selector.
    pub fn remove_message_listeners_for(&self, selector: &str) -> Vec<String> {
        self.remove_messages(None, Some(selector))
    }

    /// Listens for user presence changes on this channel.
    pub async fn add_user_status_listener(
        &self,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        self.subscriptions
            .subscribe(SUB_PUB_SUB_USERS, self.scope(), callback)
            .await
    }

    /// Removes user-status listeners; `callback` narrows the removal.
    pub fn remove_user_status_listeners(
        &self,
        callback: Option<&SubscriptionCallback>,
    ) -> Vec<String> {
        self.subscriptions.unsubscribe_where(|entry| {
            entry.name == SUB_PUB_SUB_USERS
                && self.matches_channel(&entry.options)
                && callback.map_or(true, |callback| entry.has_callback(callback))
        })
    }

    fn remove_messages(
        &self,
        callback: Option<&SubscriptionCallback>,
        selector: Option<&str>,
    ) -> Vec<String> {
        self.subscriptions.unsubscribe_where(|entry| {
            entry.name == SUB_PUB_SUB_MESSAGES
                && self.matches_channel(&entry.options)
                && callback.map_or(true, |callback| entry.has_callback(callback))
                && selector.map_or(true, |selector| {
                    entry.options.get("selector").and_then(Value::as_str) == Some(selector)
                })
        })
    }

    fn matches_channel(&self, options: &Value) -> bool {
        options.get("channel").and_then(Value::as_str) == Some(self.name.as_str())
    }

    fn scope(&self) -> Value {
        json!({"channel": self.name})
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::Channel;
    use crate::rt::connection::test_manager;
    use crate::rt::proto::{ClientFrame, ServerFrame, SUB_PUB_SUB_CONNECT};
    use crate::rt::subscriptions::{SubscriptionCallback, SubscriptionRegistry};
    use crate::rt::transport::FrameSender;

    fn channel_with_wire() -> (Arc<Channel>, Arc<SubscriptionRegistry>, UnboundedReceiver<ClientFrame>) {
        let manager = test_manager();
        let (sender, wire) = FrameSender::detached();
        manager.attach_for_tests(sender);
        let registry = SubscriptionRegistry::new(manager);
        (
            Arc::new(Channel::new("lobby", Arc::clone(&registry))),
            registry,
            wire,
        )
    }

    fn noop() -> SubscriptionCallback {
        Arc::new(|_| {})
    }

    async fn next_frame(wire: &mut UnboundedReceiver<ClientFrame>) -> ClientFrame {
        loop {
            match wire.try_recv() {
                Ok(frame) => return frame,
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    async fn drive_join(
        channel: Arc<Channel>,
        registry: &Arc<SubscriptionRegistry>,
        wire: &mut UnboundedReceiver<ClientFrame>,
    ) {
        let join_task = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.join().await }
        });
        let connect_id = loop {
            match next_frame(wire).await {
                ClientFrame::SubOn { id, name, .. } if name == SUB_PUB_SUB_CONNECT => break id,
                _ => continue,
            }
        };
        registry.on_response_for_tests(&ServerFrame::SubRes {
            id: connect_id,
            data: Some(json!({})),
            error: None,
        });
        join_task.await.expect("join task").expect("join succeeds");
    }

    #[tokio::test]
    async fn join_completes_on_first_confirmation() {
        let (channel, registry, mut wire) = channel_with_wire();

        assert!(!channel.is_joined());
        drive_join(Arc::clone(&channel), &registry, &mut wire).await;
        assert!(channel.is_joined());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn leave_sweeps_every_channel_topic() {
        let (channel, registry, mut wire) = channel_with_wire();
        drive_join(Arc::clone(&channel), &registry, &mut wire).await;

        channel
            .add_message_listener(None, noop())
            .await
            .expect("message listener");
        channel
            .add_user_status_listener(noop())
            .await
            .expect("user listener");
        assert_eq!(registry.live_count(), 3);

        let removed = channel.leave();
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.live_count(), 0);
        assert!(!channel.is_joined());
    }

    #[tokio::test]
    async fn message_options_carry_channel_and_optional_selector() {
        let (channel, _registry, mut wire) = channel_with_wire();

        channel
            .add_message_listener(None, noop())
            .await
            .expect("bare listener");
        match next_frame(&mut wire).await {
            ClientFrame::SubOn { options, .. } => {
                assert_eq!(options, json!({"channel": "lobby"}));
            }
            other => panic!("expected sub_on, got {other:?}"),
        }

        channel
            .add_message_listener(Some("kind = 'chat'"), noop())
            .await
            .expect("selector listener");
        match next_frame(&mut wire).await {
            ClientFrame::SubOn { options, .. } => {
                assert_eq!(
                    options,
                    json!({"channel": "lobby", "selector": "kind = 'chat'"})
                );
            }
            other => panic!("expected sub_on, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn selector_scoped_removal_keeps_other_listeners() {
        let (channel, registry, _wire) = channel_with_wire();

        channel
            .add_message_listener(Some("kind = 'chat'"), noop())
            .await
            .expect("chat listener");
        let kept = channel
            .add_message_listener(Some("kind = 'system'"), noop())
            .await
            .expect("system listener");

        let removed = channel.remove_message_listeners_for("kind = 'chat'");
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.live_ids(), vec![kept]);
    }

    #[tokio::test]
    async fn removal_does_not_cross_channel_names() {
        let (channel, registry, _wire) = channel_with_wire();
        let other = Channel::new("ops", Arc::clone(&registry));

        channel
            .add_message_listener(None, noop())
            .await
            .expect("lobby listener");
        other
            .add_message_listener(None, noop())
            .await
            .expect("ops listener");

        assert_eq!(channel.remove_message_listeners().len(), 1);
        assert_eq!(registry.live_count(), 1);
    }
}
