//! Realtime protocol core.
//!
//! - `proto`: logical wire frames and lifecycle events.
//! - `transport`: one WebSocket, its worker task, and the frame send queue.
//! - `connection`: lazily-established shared connection, lifecycle listener
//!   buffer, frame dispatch, and disconnect-driven reconnection.
//! - `subscriptions`: standing push-subscriptions keyed by correlation id.
//! - `methods`: in-flight one-shot method calls keyed by correlation id.

/// Connection manager and frame dispatcher.
pub mod connection;
/// Method call registry.
pub mod methods;
/// Wire frames and lifecycle events.
pub mod proto;
/// Subscription registry.
pub mod subscriptions;
/// Websocket transport wrapper.
pub mod transport;
