//! Rust client SDK for the SignalHub realtime service.
//!
//! Everything rides on a single persistent WebSocket: push subscriptions,
//! one-shot method calls, and the remote shared object session protocol are
//! multiplexed over it with string correlation ids.
//!
//! The crate is organized around that connection:
//! - `client`: the `RtClient` facade and its options.
//! - `rt`: transport wrapper, connection manager, and the subscription and
//!   method-call registries.
//! - `rso`: remote shared object sessions.
//! - `data` / `channels`: typed adapters for data-change and pub/sub
//!   listeners.
//! - `lookup`: HTTP host lookup for the realtime endpoint.
//! - `backoff`: reconnect delay policy.

/// Reconnect delay policy.
pub mod backoff;
/// Pub/sub channel adapter.
pub mod channels;
/// Client facade and configuration options.
pub mod client;
/// Data-change listener adapter.
pub mod data;
/// Error types shared across the SDK.
pub mod error;
/// Correlation-id generation.
pub mod ids;
/// Realtime host lookup over HTTP.
pub mod lookup;
/// Remote shared object sessions.
pub mod rso;
/// Realtime protocol core: transport, connection manager, registries.
pub mod rt;

pub use client::{RtClient, RtOptions};
pub use error::RtError;
pub use rt::proto::{FrameError, LifecycleEvent, LifecycleEventKind};
pub use rt::subscriptions::SubscriptionCallback;
