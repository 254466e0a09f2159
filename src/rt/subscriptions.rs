//! Subscription registry.
//!
//! Tracks active push-subscriptions by correlation id, routes inbound
//! response/end frames to their callbacks, and replays every surviving
//! subscription with its original id after a reconnect. Removal is supported
//! by exact `(name, options)` match, by id, and by arbitrary predicate, so
//! higher layers never keep shadow bookkeeping of their own.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::error::RtError;
use crate::ids::correlation_id;
use crate::rt::connection::ConnectionManager;
use crate::rt::proto::{ClientFrame, FrameError, FrameKind, ServerFrame};
use crate::rt::transport::FrameSender;

/// Callback invoked for every delivery on one subscription.
///
/// `Arc` identity doubles as callback identity for targeted removal.
pub type SubscriptionCallback = Arc<dyn Fn(Result<Value, FrameError>) + Send + Sync>;

/// One live subscription.
pub struct SubscriptionEntry {
    /// Correlation id; stable across reconnects.
    pub id: String,
    /// Subscription channel name.
    pub name: String,
    /// Channel-specific options payload.
    pub options: Value,
    callback: SubscriptionCallback,
}

impl SubscriptionEntry {
    /// Whether this entry carries the given callback.
    pub fn has_callback(&self, callback: &SubscriptionCallback) -> bool {
        Arc::ptr_eq(&self.callback, callback)
    }
}

/// Registry of live subscriptions, owned by one connection manager.
pub struct SubscriptionRegistry {
    manager: ConnectionManager,
    entries: Mutex<Vec<SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    /// Builds the registry and wires its frame listeners and resume hook into
    /// the manager. Composition happens here, once, at construction.
    pub fn new(manager: ConnectionManager) -> Arc<Self> {
        let registry = Arc::new(Self {
            manager: manager.clone(),
            entries: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&registry);
        {
            let weak = weak.clone();
            manager.add_frame_listener(
                FrameKind::SubRes,
                Arc::new(move |frame| {
                    if let Some(registry) = weak.upgrade() {
                        registry.on_response(frame);
                    }
                }),
            );
        }
        {
            let weak = weak.clone();
            manager.add_frame_listener(
                FrameKind::SubEnd,
                Arc::new(move |frame| {
                    if let Some(registry) = weak.upgrade() {
                        registry.on_end(frame);
                    }
                }),
            );
        }
        manager.add_resume_hook(Arc::new(move |sender| {
            if let Some(registry) = weak.upgrade() {
                registry.resume_all(sender);
            }
        }));

        registry
    }

    /// Opens a subscription and returns its correlation id.
    ///
    /// Lazily establishes the connection. The entry is stored before the
    /// `sub_on` frame goes out; if the transport dies in between, the replay
    /// after reconnect covers it.
    pub async fn subscribe(
        &self,
        name: &str,
        options: Value,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        let sender = self.manager.provide().await?;
        let id = correlation_id();

        let mut entries = self.entries.lock().expect("subscription lock poisoned");
        entries.push(SubscriptionEntry {
            id: id.clone(),
            name: name.to_string(),
            options: options.clone(),
            callback,
        });
        if let Err(err) = sender.emit(ClientFrame::SubOn {
            id: id.clone(),
            name: name.to_string(),
            options,
        }) {
            debug!(event = "rt_sub_on_deferred", id = %id, error = %err);
        }
        Ok(id)
    }

    /// Removes the first entry whose `(name, options)` deep-equal the
    /// arguments and emits its `sub_off`. Local removal is synchronous; the
    /// server-side off notice is fire-and-forget.
    pub fn unsubscribe(&self, name: &str, options: &Value) -> Option<String> {
        let removed = {
            let mut entries = self.entries.lock().expect("subscription lock poisoned");
            let position = entries
                .iter()
                .position(|entry| entry.name == name && entry.options == *options)?;
            entries.remove(position)
        };
        self.emit_off(&removed.id);
        Some(removed.id)
    }

    /// Removes one subscription by its correlation id.
    pub fn unsubscribe_by_id(&self, id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.lock().expect("subscription lock poisoned");
            match entries.iter().position(|entry| entry.id == id) {
                Some(position) => entries.remove(position),
                None => return false,
            }
        };
        self.emit_off(&removed.id);
        true
    }

    /// Removes every entry matching the predicate, emitting one `sub_off`
    /// per removed entry. Returns the removed ids.
    pub fn unsubscribe_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&SubscriptionEntry) -> bool,
    {
        let removed: Vec<SubscriptionEntry> = {
            let mut entries = self.entries.lock().expect("subscription lock poisoned");
            let mut kept = Vec::with_capacity(entries.len());
            let mut taken = Vec::new();
            for entry in entries.drain(..) {
                if predicate(&entry) {
                    taken.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *entries = kept;
            taken
        };

        let mut ids = Vec::with_capacity(removed.len());
        for entry in removed {
            self.emit_off(&entry.id);
            ids.push(entry.id);
        }
        ids
    }

    /// Number of live subscriptions.
    pub fn live_count(&self) -> usize {
        self.entries.lock().expect("subscription lock poisoned").len()
    }

    /// Ids of every live subscription, in insertion order.
    pub fn live_ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("subscription lock poisoned")
            .iter()
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Re-emits `sub_on` for every surviving entry with its original id.
    ///
    /// Holds the registry lock for the whole replay, so a racing `subscribe`
    /// serializes against it.
    pub fn resume_all(&self, sender: &FrameSender) {
        let entries = self.entries.lock().expect("subscription lock poisoned");
        for entry in entries.iter() {
            let _ = sender.emit(ClientFrame::SubOn {
                id: entry.id.clone(),
                name: entry.name.clone(),
                options: entry.options.clone(),
            });
        }
        info!(event = "rt_subscriptions_resumed", count = entries.len());
    }

    fn on_response(&self, frame: &ServerFrame) {
        let ServerFrame::SubRes { id, data, error } = frame else {
            return;
        };
        let callback = {
            let entries = self.entries.lock().expect("subscription lock poisoned");
            entries
                .iter()
                .find(|entry| entry.id == *id)
                .map(|entry| Arc::clone(&entry.callback))
        };
        match callback {
            Some(callback) => dispatch(id, &callback, to_result(data, error)),
            None => trace!(event = "rt_sub_res_unknown_id", id = %id),
        }
    }

    fn on_end(&self, frame: &ServerFrame) {
        let ServerFrame::SubEnd { id, data, error } = frame else {
            return;
        };
        let removed = {
            let mut entries = self.entries.lock().expect("subscription lock poisoned");
            entries
                .iter()
                .position(|entry| entry.id == *id)
                .map(|position| entries.remove(position))
        };
        match removed {
            Some(entry) => dispatch(id, &entry.callback, to_result(data, error)),
            None => trace!(event = "rt_sub_end_unknown_id", id = %id),
        }
    }

    /// Feeds an inbound frame straight into the registry, bypassing the
    /// transport.
    #[cfg(test)]
    pub(crate) fn on_response_for_tests(&self, frame: &ServerFrame) {
        self.on_response(frame);
        self.on_end(frame);
    }

    fn emit_off(&self, id: &str) {
        if let Some(sender) = self.manager.sender_if_connected() {
            let _ = sender.emit(ClientFrame::SubOff { id: id.to_string() });
        }
    }
}

fn to_result(data: &Option<Value>, error: &Option<FrameError>) -> Result<Value, FrameError> {
    match error {
        Some(error) => Err(error.clone()),
        None => Ok(data.clone().unwrap_or(Value::Null)),
    }
}

// Each dispatch is isolated: one panicking callback never prevents delivery
// to the remaining subscribers or corrupts registry state.
fn dispatch(id: &str, callback: &SubscriptionCallback, payload: Result<Value, FrameError>) {
    if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
        warn!(event = "rt_subscription_callback_panicked", id = %id);
    }
}
