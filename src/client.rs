//! Client facade.
//!
//! [`RtClient`] assembles the connection manager and both registries at
//! construction and hands out scoped adapters for tables, channels, and
//! shared objects. The client is a cheap-to-clone handle; every clone shares
//! the same connection and registries.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::Channel;
use crate::data::TableEvents;
use crate::error::RtError;
use crate::lookup::LOOKUP_BASE_URL;
use crate::rso::{InvocationTarget, SharedObject};
use crate::rt::connection::{ConnectionManager, LifecycleListener, ManagerConfig};
use crate::rt::methods::MethodRegistry;
use crate::rt::proto::LifecycleEventKind;
use crate::rt::subscriptions::SubscriptionRegistry;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Client construction options.
#[derive(Clone, Debug)]
pub struct RtOptions {
    /// Base URL for the realtime host lookup.
    pub lookup_url: String,
    /// Explicit websocket endpoint; skips lookup entirely when set.
    pub endpoint: Option<String>,
    /// Per-call timeout for awaited method invocations; `None` disables it.
    pub call_timeout: Option<Duration>,
    /// Log every frame in both directions at debug level.
    pub log_frames: bool,
}

impl Default for RtOptions {
    fn default() -> Self {
        Self {
            lookup_url: LOOKUP_BASE_URL.to_string(),
            endpoint: None,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            log_frames: false,
        }
    }
}

struct Shared {
    manager: ConnectionManager,
    subscriptions: Arc<SubscriptionRegistry>,
    methods: Arc<MethodRegistry>,
}

/// Handle on one realtime connection and its registries.
#[derive(Clone)]
pub struct RtClient {
    shared: Arc<Shared>,
}

impl RtClient {
    /// Builds a client with default options.
    pub fn new(app_id: impl Into<String>) -> Result<Self, RtError> {
        Self::with_options(app_id, RtOptions::default())
    }

    /// Builds a client; registries are wired into the manager here, once.
    pub fn with_options(app_id: impl Into<String>, options: RtOptions) -> Result<Self, RtError> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;
        let manager = ConnectionManager::new(
            ManagerConfig {
                app_id: app_id.into(),
                lookup_url: options.lookup_url,
                endpoint: options.endpoint,
                log_frames: options.log_frames,
            },
            http,
        );
        let subscriptions = SubscriptionRegistry::new(manager.clone());
        let methods = MethodRegistry::new(manager.clone(), options.call_timeout);

        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                subscriptions,
                methods,
            }),
        })
    }

    /// Eagerly establishes the connection. Optional: every operation that
    /// needs the wire connects lazily on first use.
    pub async fn connect(&self) -> Result<(), RtError> {
        self.shared.manager.provide().await.map(|_| ())
    }

    /// Tears the connection down; live subscriptions stay registered and
    /// replay on the next connect.
    pub async fn disconnect(&self) {
        self.shared.manager.destroy().await;
    }

    /// Forces a fresh connection and replays live subscriptions.
    pub async fn reconnect(&self) -> Result<(), RtError> {
        self.shared.manager.reconnect().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.manager.is_connected()
    }

    /// Sets the bearer token used from the next connect onward; forces a
    /// reconnect when a connection is live.
    pub fn update_token(&self, token: SecretString) {
        self.shared.manager.update_token(token);
    }

    /// Registers a listener for one lifecycle event kind; returns the id
    /// accepted by [`RtClient::remove_lifecycle_listener`].
    pub fn add_lifecycle_listener(
        &self,
        kind: LifecycleEventKind,
        listener: LifecycleListener,
    ) -> u64 {
        self.shared.manager.add_lifecycle_listener(kind, listener)
    }

    pub fn remove_lifecycle_listener(&self, id: u64) {
        self.shared.manager.remove_lifecycle_listener(id);
    }

    /// The connection manager shared by every adapter of this client.
    pub fn connection(&self) -> &ConnectionManager {
        &self.shared.manager
    }

    /// The shared subscription registry.
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.shared.subscriptions
    }

    /// The shared method call registry.
    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.shared.methods
    }

    /// Change-event handle for one table.
    pub fn table(&self, name: impl Into<String>) -> TableEvents {
        TableEvents::new(name, Arc::clone(&self.shared.subscriptions))
    }

    /// Membership handle for one pub/sub channel.
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        Channel::new(name, Arc::clone(&self.shared.subscriptions))
    }

    /// Session for one shared object, without an invocation target: inbound
    /// peer invocations are logged and dropped, and outbound `invoke` calls
    /// are rejected locally.
    pub fn shared_object(&self, name: impl Into<String>) -> SharedObject {
        SharedObject::new(
            name,
            Arc::clone(&self.shared.subscriptions),
            Arc::clone(&self.shared.methods),
            None,
        )
    }

    /// Session for one shared object with an invocation target fixed for the
    /// session's lifetime.
    pub fn shared_object_with_target(
        &self,
        name: impl Into<String>,
        target: Arc<dyn InvocationTarget>,
    ) -> SharedObject {
        SharedObject::new(
            name,
            Arc::clone(&self.shared.subscriptions),
            Arc::clone(&self.shared.methods),
            Some(target),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{RtClient, RtOptions};

    fn local_client() -> RtClient {
        RtClient::with_options(
            "test-app",
            RtOptions {
                endpoint: Some("ws://127.0.0.1:0/v1/rt".to_string()),
                ..RtOptions::default()
            },
        )
        .expect("client builds")
    }

    #[tokio::test]
    async fn clones_share_one_subscription_registry() {
        let client = local_client();
        let clone = client.clone();
        assert!(Arc::ptr_eq(client.subscriptions(), clone.subscriptions()));
        assert!(Arc::ptr_eq(client.methods(), clone.methods()));
    }

    #[tokio::test]
    async fn adapters_are_scoped_to_their_names() {
        let client = local_client();
        assert_eq!(client.table("Person").table(), "Person");
        assert_eq!(client.channel("lobby").name(), "lobby");
        assert_eq!(client.shared_object("counter").name(), "counter");
    }

    #[tokio::test]
    async fn fresh_client_reports_disconnected() {
        let client = local_client();
        assert!(!client.is_connected());
    }
}
