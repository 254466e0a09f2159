//! Remote shared object sessions.
//!
//! A shared object is a named, server-mediated state blob with push
//! notifications and peer method invocation. Each session rides the client's
//! subscription and method registries: connecting opens two long-lived
//! subscriptions (readiness and inbound invocations), and every get/set/
//! clear/command/invoke is a single scoped method call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::error::RtError;
use crate::rt::methods::MethodRegistry;
use crate::rt::proto::{
    FrameError, MET_RSO_CLEAR, MET_RSO_COMMAND, MET_RSO_GET, MET_RSO_INVOKE, MET_RSO_SET,
    SUB_RSO_CHANGES, SUB_RSO_CLEARED, SUB_RSO_COMMANDS, SUB_RSO_CONNECT, SUB_RSO_INVOKE,
    SUB_RSO_USERS,
};
use crate::rt::subscriptions::{SubscriptionCallback, SubscriptionRegistry};

/// Handler for method invocations pushed by other peers.
///
/// Implementations are supplied at session construction; there is no runtime
/// rewiring of the method table.
pub trait InvocationTarget: Send + Sync {
    /// Invokes `method` with the peer-supplied arguments.
    ///
    /// Returning an error marks the invocation as failed; it is surfaced in
    /// the log and never sent back over the wire.
    fn invoke(&self, method: &str, args: &[Value]) -> Result<(), RtError>;
}

struct SessionSubs {
    connect_id: String,
    invoke_id: String,
}

/// Stateful session for one named shared object.
pub struct SharedObject {
    name: String,
    subscriptions: Arc<SubscriptionRegistry>,
    methods: Arc<MethodRegistry>,
    invocation_target: Option<Arc<dyn InvocationTarget>>,
    connected: Arc<AtomicBool>,
    // Held across the whole connect sequence: at most one attempt in flight.
    connecting: tokio::sync::Mutex<()>,
    session_subs: Mutex<Option<SessionSubs>>,
}

impl SharedObject {
    pub(crate) fn new(
        name: impl Into<String>,
        subscriptions: Arc<SubscriptionRegistry>,
        methods: Arc<MethodRegistry>,
        invocation_target: Option<Arc<dyn InvocationTarget>>,
    ) -> Self {
        Self {
            name: name.into(),
            subscriptions,
            methods,
            invocation_target,
            connected: Arc::new(AtomicBool::new(false)),
            connecting: tokio::sync::Mutex::new(()),
            session_subs: Mutex::new(None),
        }
    }

    /// Name of the shared object this session is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both session subscriptions are established and ready.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Opens the session: a readiness subscription whose first delivery marks
    /// the session connected, and an invocation subscription dispatching
    /// inbound `{method, args}` payloads to the invocation target.
    ///
    /// Concurrent callers share a single attempt; connecting an already
    /// connected session is a no-op.
    pub async fn connect(&self) -> Result<(), RtError> {
        let _guard = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), FrameError>>();
        let ready_tx = Arc::new(Mutex::new(Some(ready_tx)));
        let connected = Arc::clone(&self.connected);
        let object_name = self.name.clone();
        let connect_callback: SubscriptionCallback = Arc::new(move |payload| {
            let slot = ready_tx.lock().expect("ready lock poisoned").take();
            match payload {
                Ok(_) => {
                    connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = slot {
                        let _ = tx.send(Ok(()));
                    }
                }
                Err(err) => match slot {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    None => warn!(event = "rso_connect_error", object = %object_name, error = %err),
                },
            }
        });
        let connect_id = self
            .subscriptions
            .subscribe(SUB_RSO_CONNECT, self.scope(), connect_callback)
            .await?;

        let target = self.invocation_target.clone();
        let object_name = self.name.clone();
        let invoke_callback: SubscriptionCallback =
            Arc::new(move |payload| dispatch_invocation(&object_name, target.as_deref(), payload));
        let invoke_id = match self
            .subscriptions
            .subscribe(SUB_RSO_INVOKE, self.scope(), invoke_callback)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                self.subscriptions.unsubscribe_by_id(&connect_id);
                return Err(err);
            }
        };

        *self.session_subs.lock().expect("session lock poisoned") = Some(SessionSubs {
            connect_id,
            invoke_id,
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(frame_error)) => {
                self.teardown_session();
                Err(RtError::Call(frame_error))
            }
            Err(_) => {
                self.teardown_session();
                Err(RtError::Protocol(
                    "session readiness channel dropped".to_string(),
                ))
            }
        }
    }

    /// Closes both session subscriptions; `is_connected` becomes false.
    pub fn disconnect(&self) {
        self.teardown_session();
    }

    /// Reads one key of the shared object.
    pub async fn get(&self, key: &str) -> Result<Value, RtError> {
        self.methods
            .invoke(MET_RSO_GET, json!({"name": self.name, "key": key}))
            .await
    }

    /// Writes one key of the shared object.
    pub async fn set(&self, key: &str, data: Value) -> Result<Value, RtError> {
        self.methods
            .invoke(MET_RSO_SET, json!({"name": self.name, "key": key, "data": data}))
            .await
    }

    /// Clears every key of the shared object.
    pub async fn clear(&self) -> Result<Value, RtError> {
        self.methods
            .invoke(MET_RSO_CLEAR, json!({"name": self.name}))
            .await
    }

    /// Broadcasts a command to every connected peer.
    pub async fn send(&self, command_type: &str, data: Value) -> Result<Value, RtError> {
        self.methods
            .invoke(
                MET_RSO_COMMAND,
                json!({"name": self.name, "type": command_type, "data": data}),
            )
            .await
    }

    /// Invokes `method` on every connected peer.
    ///
    /// Rejects before any frame goes out when no invocation target is
    /// registered on this session.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RtError> {
        if self.invocation_target.is_none() {
            return Err(RtError::NoInvocationTarget);
        }
        self.methods
            .invoke(
                MET_RSO_INVOKE,
                json!({"name": self.name, "method": method, "args": args}),
            )
            .await
    }

    /// Invokes `method` on specific peers; an empty target list broadcasts.
    pub async fn invoke_on(
        &self,
        method: &str,
        targets: Vec<String>,
        args: Vec<Value>,
    ) -> Result<Value, RtError> {
        if self.invocation_target.is_none() {
            return Err(RtError::NoInvocationTarget);
        }
        let mut options = json!({"name": self.name, "method": method, "args": args});
        if !targets.is_empty() {
            if let Some(map) = options.as_object_mut() {
                map.insert("targets".to_string(), json!(targets));
            }
        }
        self.methods.invoke(MET_RSO_INVOKE, options).await
    }

    /// Listens for session connect-status notifications.
    pub async fn add_connect_listener(&self, callback: SubscriptionCallback) -> Result<String, RtError> {
        self.add_category_listener(SUB_RSO_CONNECT, callback).await
    }

    /// Listens for peer user-status changes.
    pub async fn add_user_status_listener(
        &self,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        self.add_category_listener(SUB_RSO_USERS, callback).await
    }

    /// Listens for commands broadcast by peers.
    pub async fn add_command_listener(&self, callback: SubscriptionCallback) -> Result<String, RtError> {
        self.add_category_listener(SUB_RSO_COMMANDS, callback).await
    }

    /// Listens for key changes.
    pub async fn add_changes_listener(&self, callback: SubscriptionCallback) -> Result<String, RtError> {
        self.add_category_listener(SUB_RSO_CHANGES, callback).await
    }

    /// Listens for clear notifications.
    pub async fn add_cleared_listener(&self, callback: SubscriptionCallback) -> Result<String, RtError> {
        self.add_category_listener(SUB_RSO_CLEARED, callback).await
    }

    /// Removes category listeners; `callback` narrows removal to the
    /// subscriptions created for that callback, `None` sweeps the category.
    pub fn remove_connect_listeners(&self, callback: Option<&SubscriptionCallback>) -> Vec<String> {
        self.remove_category_listeners(SUB_RSO_CONNECT, callback)
    }

    /// Removes user-status listeners, narrowed to `callback` when given.
    pub fn remove_user_status_listeners(
        &self,
        callback: Option<&SubscriptionCallback>,
    ) -> Vec<String> {
        self.remove_category_listeners(SUB_RSO_USERS, callback)
    }

    /// Removes command listeners, narrowed to `callback` when given.
    pub fn remove_command_listeners(&self, callback: Option<&SubscriptionCallback>) -> Vec<String> {
        self.remove_category_listeners(SUB_RSO_COMMANDS, callback)
    }

    /// Removes key-change listeners, narrowed to `callback` when given.
    pub fn remove_changes_listeners(&self, callback: Option<&SubscriptionCallback>) -> Vec<String> {
        self.remove_category_listeners(SUB_RSO_CHANGES, callback)
    }

    /// Removes cleared-notification listeners, narrowed to `callback` when
    /// given.
    pub fn remove_cleared_listeners(&self, callback: Option<&SubscriptionCallback>) -> Vec<String> {
        self.remove_category_listeners(SUB_RSO_CLEARED, callback)
    }

    /// Sweeps every category and, when connected, tears the session
    /// subscriptions down as well.
    pub fn remove_all_listeners(&self) {
        let channels = [
            SUB_RSO_CONNECT,
            SUB_RSO_USERS,
            SUB_RSO_COMMANDS,
            SUB_RSO_CHANGES,
            SUB_RSO_CLEARED,
            SUB_RSO_INVOKE,
        ];
        let name = self.name.clone();
        self.subscriptions.unsubscribe_where(|entry| {
            channels.contains(&entry.name.as_str())
                && entry.options.get("name").and_then(Value::as_str) == Some(name.as_str())
        });
        *self.session_subs.lock().expect("session lock poisoned") = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn add_category_listener(
        &self,
        channel: &str,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        self.subscriptions
            .subscribe(channel, self.scope(), callback)
            .await
    }

    fn remove_category_listeners(
        &self,
        channel: &str,
        callback: Option<&SubscriptionCallback>,
    ) -> Vec<String> {
        let session = self.session_ids();
        self.subscriptions.unsubscribe_where(|entry| {
            entry.name == channel
                && entry.options.get("name").and_then(Value::as_str) == Some(self.name.as_str())
                && !session.contains(&entry.id)
                && callback.map_or(true, |callback| entry.has_callback(callback))
        })
    }

    fn session_ids(&self) -> Vec<String> {
        self.session_subs
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|subs| vec![subs.connect_id.clone(), subs.invoke_id.clone()])
            .unwrap_or_default()
    }

    fn teardown_session(&self) {
        let subs = self.session_subs.lock().expect("session lock poisoned").take();
        if let Some(subs) = subs {
            self.subscriptions.unsubscribe_by_id(&subs.connect_id);
            self.subscriptions.unsubscribe_by_id(&subs.invoke_id);
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn scope(&self) -> Value {
        json!({"name": self.name})
    }
}

fn dispatch_invocation(
    object_name: &str,
    target: Option<&dyn InvocationTarget>,
    payload: Result<Value, FrameError>,
) {
    let value = match payload {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "rso_invoke_delivery_error", object = %object_name, error = %err);
            return;
        }
    };
    let Some(method) = value.get("method").and_then(Value::as_str) else {
        warn!(event = "rso_invoke_missing_method", object = %object_name);
        return;
    };
    let args = value
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    match target {
        Some(target) => {
            if let Err(err) = target.invoke(method, &args) {
                error!(
                    event = "rso_invocation_failed",
                    object = %object_name,
                    method = %method,
                    error = %err
                );
            }
        }
        None => error!(
            event = "rso_invocation_target_missing",
            object = %object_name,
            method = %method
        ),
    }
}
