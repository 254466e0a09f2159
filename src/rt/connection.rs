//! Connection manager.
//!
//! Single source of truth for connection availability. The manager owns the
//! lazily-created transport, the lifecycle listener buffer, the inbound frame
//! dispatch table, and the disconnect-driven reconnect loop. Registries and
//! adapters never hold a transport reference; everything funnels through
//! [`ConnectionManager::provide`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::RtError;
use crate::lookup;
use crate::rt::proto::{FrameKind, LifecycleEvent, LifecycleEventKind, ServerFrame};
use crate::rt::transport::{ConnectParams, FrameSender, Transport};

/// Listener for inbound wire frames of one kind.
pub type FrameListener = Arc<dyn Fn(&ServerFrame) + Send + Sync>;
/// Listener for transport lifecycle events of one kind.
pub type LifecycleListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;
/// Hook run with the fresh sender after every successful reconnect.
pub type ResumeHook = Arc<dyn Fn(&FrameSender) + Send + Sync>;

/// Static connection configuration, fixed at client construction.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Application id forwarded as connect metadata.
    pub app_id: String,
    /// Base URL of the host lookup endpoint.
    pub lookup_url: String,
    /// Explicit websocket endpoint; skips lookup when set.
    pub endpoint: Option<String>,
    /// Log every inbound/outbound frame at debug level.
    pub log_frames: bool,
}

struct ActiveConnection {
    transport: Transport,
    generation: u64,
}

struct LifecycleEntry {
    id: u64,
    kind: LifecycleEventKind,
    listener: LifecycleListener,
}

struct Inner {
    config: ManagerConfig,
    token: RwLock<Option<SecretString>>,
    http: reqwest::Client,
    // Held across the whole connect sequence: at most one attempt in flight.
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
    current_sender: RwLock<Option<FrameSender>>,
    generation: AtomicU64,
    // Bumped by destroy(); a reconnect loop from an older epoch aborts.
    epoch: AtomicU64,
    next_listener_id: AtomicU64,
    lifecycle: Mutex<Vec<LifecycleEntry>>,
    frame_listeners: Mutex<Vec<(FrameKind, FrameListener)>>,
    resume_hooks: Mutex<Vec<ResumeHook>>,
}

/// Cheap-to-clone handle on the shared connection state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                token: RwLock::new(None),
                http,
                active: tokio::sync::Mutex::new(None),
                current_sender: RwLock::new(None),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                next_listener_id: AtomicU64::new(1),
                lifecycle: Mutex::new(Vec::new()),
                frame_listeners: Mutex::new(Vec::new()),
                resume_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the live frame sender, establishing the connection first if
    /// none exists. Concurrent callers share a single connect attempt.
    pub async fn provide(&self) -> Result<FrameSender, RtError> {
        if let Some(sender) = self.current_sender() {
            return Ok(sender);
        }

        let mut guard = self.inner.active.lock().await;
        if let Some(active) = guard.as_ref() {
            return Ok(active.transport.sender());
        }
        self.open(&mut guard).await
    }

    /// Closes and drops the cached transport. Idempotent; a later `provide`
    /// starts from scratch.
    pub async fn destroy(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        *self.inner.current_sender.write().expect("sender lock poisoned") = None;
        let mut guard = self.inner.active.lock().await;
        if let Some(mut active) = guard.take() {
            active.transport.close();
        }
    }

    /// Destroys, re-provides, and replays registered subscriptions.
    pub async fn reconnect(&self) -> Result<FrameSender, RtError> {
        self.destroy().await;
        let sender = self.provide().await?;
        self.run_resume_hooks(&sender);
        Ok(sender)
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.current_sender().is_some()
    }

    /// Stores the bearer token read at the next connect. A token change on a
    /// live connection forces a new one; tokens are never renegotiated
    /// mid-connection.
    pub fn update_token(&self, token: SecretString) {
        *self.inner.token.write().expect("token lock poisoned") = Some(token);
        if !self.is_connected() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.clone();
                handle.spawn(async move {
                    if let Err(err) = manager.reconnect().await {
                        warn!(event = "rt_token_reconnect_failed", error = %err);
                    }
                });
            }
            Err(_) => {
                warn!(event = "rt_token_reconnect_skipped", reason = "no async runtime");
            }
        }
    }

    /// Registers a lifecycle listener; buffered across reconnects, so
    /// listeners added before any connection exists fire on every transport.
    pub fn add_lifecycle_listener(
        &self,
        kind: LifecycleEventKind,
        listener: LifecycleListener,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .push(LifecycleEntry { id, kind, listener });
        id
    }

    /// Removes a lifecycle listener by the id `add_lifecycle_listener`
    /// returned. Unknown ids are a no-op.
    pub fn remove_lifecycle_listener(&self, id: u64) {
        self.inner
            .lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Attaches a listener for one inbound frame kind. Registered once per
    /// registry at construction time.
    pub fn add_frame_listener(&self, kind: FrameKind, listener: FrameListener) {
        self.inner
            .frame_listeners
            .lock()
            .expect("frame listener lock poisoned")
            .push((kind, listener));
    }

    /// Registers a hook run with the fresh sender after every reconnect.
    pub fn add_resume_hook(&self, hook: ResumeHook) {
        self.inner
            .resume_hooks
            .lock()
            .expect("resume hook lock poisoned")
            .push(hook);
    }

    /// Live sender when connected; used for fire-and-forget `sub_off`
    /// notices that must not trigger a fresh connection.
    pub(crate) fn sender_if_connected(&self) -> Option<FrameSender> {
        self.current_sender()
    }

    fn current_sender(&self) -> Option<FrameSender> {
        self.inner
            .current_sender
            .read()
            .expect("sender lock poisoned")
            .clone()
    }

    async fn open(&self, guard: &mut Option<ActiveConnection>) -> Result<FrameSender, RtError> {
        let token = self
            .inner
            .token
            .read()
            .expect("token lock poisoned")
            .clone();

        let endpoint = match &self.inner.config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                match lookup::lookup_host(
                    &self.inner.http,
                    &self.inner.config.lookup_url,
                    &self.inner.config.app_id,
                    token.as_ref(),
                )
                .await
                {
                    Ok(host) => lookup::realtime_endpoint(&host),
                    Err(err) => {
                        self.dispatch_lifecycle(&LifecycleEvent::ConnectError(err.to_string()));
                        return Err(err);
                    }
                }
            }
        };

        let params = ConnectParams {
            endpoint: &endpoint,
            app_id: &self.inner.config.app_id,
            token: token.as_ref(),
            log_frames: self.inner.config.log_frames,
        };
        let mut transport = match Transport::connect(params).await {
            Ok(transport) => transport,
            Err(RtError::ConnectTimeout) => {
                self.dispatch_lifecycle(&LifecycleEvent::ConnectTimeout);
                return Err(RtError::ConnectTimeout);
            }
            Err(err) => {
                self.dispatch_lifecycle(&LifecycleEvent::ConnectError(err.to_string()));
                return Err(err);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inbound = transport
            .take_inbound()
            .ok_or_else(|| RtError::Protocol("transport inbound already taken".to_string()))?;
        let events = transport
            .take_events()
            .ok_or_else(|| RtError::Protocol("transport events already taken".to_string()))?;
        self.spawn_frame_task(inbound);
        self.spawn_event_task(events, generation);

        let sender = transport.sender();
        *self.inner.current_sender.write().expect("sender lock poisoned") = Some(sender.clone());
        *guard = Some(ActiveConnection {
            transport,
            generation,
        });
        info!(event = "rt_connected", generation, endpoint = %endpoint);
        Ok(sender)
    }

    fn spawn_frame_task(&self, mut inbound: mpsc::UnboundedReceiver<ServerFrame>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                manager.dispatch_frame(&frame);
            }
        });
    }

    fn spawn_event_task(&self, mut events: mpsc::UnboundedReceiver<LifecycleEvent>, generation: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let disconnected = matches!(event, LifecycleEvent::Disconnected);
                manager.dispatch_lifecycle(&event);
                if disconnected {
                    manager.recover(generation).await;
                }
            }
        });
    }

    /// Disconnect-driven recovery: drop the dead transport, then re-provide
    /// with capped backoff until it sticks or the manager is destroyed.
    async fn recover(&self, generation: u64) {
        {
            let mut guard = self.inner.active.lock().await;
            match guard.as_ref() {
                Some(active) if active.generation == generation => {
                    if let Some(mut active) = guard.take() {
                        active.transport.close();
                    }
                }
                // Destroyed or already superseded; nothing to recover.
                _ => return,
            }
        }
        *self.inner.current_sender.write().expect("sender lock poisoned") = None;

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let policy = ReconnectPolicy::default();
        let mut attempt = 1usize;
        loop {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            match self.provide().await {
                Ok(sender) => {
                    self.run_resume_hooks(&sender);
                    return;
                }
                Err(err) => {
                    warn!(event = "rt_reconnect_failed", attempt, error = %err);
                    attempt += 1;
                }
            }
        }
    }

    fn run_resume_hooks(&self, sender: &FrameSender) {
        let hooks: Vec<ResumeHook> = self
            .inner
            .resume_hooks
            .lock()
            .expect("resume hook lock poisoned")
            .clone();
        for hook in hooks {
            hook(sender);
        }
    }

    pub(crate) fn dispatch_frame(&self, frame: &ServerFrame) {
        let kind = frame.kind();
        let listeners: Vec<FrameListener> = self
            .inner
            .frame_listeners
            .lock()
            .expect("frame listener lock poisoned")
            .iter()
            .filter(|(listener_kind, _)| *listener_kind == kind)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(frame))).is_err() {
                warn!(event = "rt_frame_listener_panicked");
            }
        }
    }

    pub(crate) fn dispatch_lifecycle(&self, event: &LifecycleEvent) {
        let kind = event.kind();
        let listeners: Vec<LifecycleListener> = self
            .inner
            .lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Arc::clone(&entry.listener))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(event = "rt_lifecycle_listener_panicked");
            }
        }
    }

    /// Installs a detached sender so registry tests run without a socket.
    #[cfg(test)]
    pub(crate) fn attach_for_tests(&self, sender: FrameSender) {
        *self.inner.current_sender.write().expect("sender lock poisoned") = Some(sender);
    }
}

#[cfg(test)]
pub(crate) fn test_manager() -> ConnectionManager {
    ConnectionManager::new(
        ManagerConfig {
            app_id: "test-app".to_string(),
            lookup_url: "http://localhost:0".to_string(),
            endpoint: None,
            log_frames: false,
        },
        reqwest::Client::new(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use secrecy::SecretString;

    use super::test_manager;
    use crate::rt::proto::{LifecycleEvent, LifecycleEventKind};
    use crate::rt::transport::FrameSender;

    #[test]
    fn lifecycle_listeners_fire_only_for_their_kind() {
        let manager = test_manager();
        let connected = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        {
            let connected = Arc::clone(&connected);
            manager.add_lifecycle_listener(
                LifecycleEventKind::Connected,
                Arc::new(move |_| {
                    connected.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let dropped = Arc::clone(&dropped);
            manager.add_lifecycle_listener(
                LifecycleEventKind::Disconnected,
                Arc::new(move |_| {
                    dropped.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        manager.dispatch_lifecycle(&LifecycleEvent::Connected);
        manager.dispatch_lifecycle(&LifecycleEvent::Connected);
        manager.dispatch_lifecycle(&LifecycleEvent::Disconnected);

        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_lifecycle_listener_stops_firing() {
        let manager = test_manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = {
            let calls = Arc::clone(&calls);
            manager.add_lifecycle_listener(
                LifecycleEventKind::Connected,
                Arc::new(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        manager.dispatch_lifecycle(&LifecycleEvent::Connected);
        manager.remove_lifecycle_listener(id);
        manager.dispatch_lifecycle(&LifecycleEvent::Connected);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_lifecycle_listener_does_not_block_the_next() {
        let manager = test_manager();
        manager.add_lifecycle_listener(
            LifecycleEventKind::Connected,
            Arc::new(|_| panic!("listener boom")),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            manager.add_lifecycle_listener(
                LifecycleEventKind::Connected,
                Arc::new(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        manager.dispatch_lifecycle(&LifecycleEvent::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_token_outside_a_runtime_keeps_the_connection() {
        let manager = test_manager();
        let (sender, _rx) = FrameSender::detached();
        manager.attach_for_tests(sender);

        // No runtime here, so the forced reconnect cannot be spawned; the
        // token is still stored and the live connection stays untouched.
        manager.update_token(SecretString::new("rotated-token".to_string()));
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn destroy_without_a_connection_is_idempotent() {
        let manager = test_manager();
        manager.destroy().await;
        manager.destroy().await;
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn provide_returns_injected_sender_without_network() {
        let manager = test_manager();
        let (sender, _rx) = FrameSender::detached();
        manager.attach_for_tests(sender);
        assert!(manager.is_connected());
        manager
            .provide()
            .await
            .expect("provide should reuse the injected sender");
    }
}
