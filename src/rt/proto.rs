//! Logical wire frames exchanged with the realtime server.
//!
//! Frames are JSON text messages tagged by `type`. The `id` field correlates
//! subscription and method-call traffic; ids are opaque strings minted by the
//! client and echoed back by the server.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscription channel for table data-change notifications.
pub const SUB_OBJECTS_CHANGES: &str = "OBJECTS_CHANGES";
/// Subscription channel marking pub/sub channel membership.
pub const SUB_PUB_SUB_CONNECT: &str = "PUB_SUB_CONNECT";
/// Subscription channel delivering pub/sub messages.
pub const SUB_PUB_SUB_MESSAGES: &str = "PUB_SUB_MESSAGES";
/// Subscription channel delivering pub/sub user status changes.
pub const SUB_PUB_SUB_USERS: &str = "PUB_SUB_USERS";
/// Subscription channel marking shared object session readiness.
pub const SUB_RSO_CONNECT: &str = "RSO_CONNECT";
/// Subscription channel delivering shared object method invocations.
pub const SUB_RSO_INVOKE: &str = "RSO_INVOKE";
/// Subscription channel delivering shared object key changes.
pub const SUB_RSO_CHANGES: &str = "RSO_CHANGES";
/// Subscription channel delivering shared object clear notifications.
pub const SUB_RSO_CLEARED: &str = "RSO_CLEARED";
/// Subscription channel delivering shared object commands.
pub const SUB_RSO_COMMANDS: &str = "RSO_COMMANDS";
/// Subscription channel delivering shared object user status changes.
pub const SUB_RSO_USERS: &str = "RSO_USERS";

/// Method reading one shared object key.
pub const MET_RSO_GET: &str = "RSO_GET";
/// Method writing one shared object key.
pub const MET_RSO_SET: &str = "RSO_SET";
/// Method clearing a shared object.
pub const MET_RSO_CLEAR: &str = "RSO_CLEAR";
/// Method broadcasting a shared object command.
pub const MET_RSO_COMMAND: &str = "RSO_COMMAND";
/// Method invoking a handler on connected shared object peers.
pub const MET_RSO_INVOKE: &str = "RSO_INVOKE";

/// Outbound frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens or resumes a subscription.
    SubOn {
        id: String,
        name: String,
        options: Value,
    },
    /// Closes a subscription.
    SubOff { id: String },
    /// Issues a one-shot method call.
    MetReq {
        id: String,
        name: String,
        options: Value,
    },
}

/// Inbound frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Subscription delivery; may recur any number of times per id.
    SubRes {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    /// Terminal frame for a subscription id.
    SubEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    /// Response consuming exactly one pending method call.
    MetRes {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
}

impl ServerFrame {
    /// Frame kind used for dispatcher routing.
    pub fn kind(&self) -> FrameKind {
        match self {
            ServerFrame::SubRes { .. } => FrameKind::SubRes,
            ServerFrame::SubEnd { .. } => FrameKind::SubEnd,
            ServerFrame::MetRes { .. } => FrameKind::MetRes,
        }
    }
}

/// Inbound frame kinds a dispatcher listener can attach to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FrameKind {
    SubRes,
    SubEnd,
    MetRes,
}

/// Application-level error payload carried inside response frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameError {
    /// Numeric server error code when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Human-readable failure description.
    pub message: String,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Transport-level lifecycle signals, as opposed to application frames.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// Transport reached the open state.
    Connected,
    /// Connect attempt failed before the transport opened.
    ConnectError(String),
    /// Connect attempt exceeded the connect timeout.
    ConnectTimeout,
    /// Open transport was lost; recovery is the connection manager's job.
    Disconnected,
    /// Non-fatal transport error on an open connection.
    Error(String),
}

impl LifecycleEvent {
    /// Event kind used for listener routing.
    pub fn kind(&self) -> LifecycleEventKind {
        match self {
            LifecycleEvent::Connected => LifecycleEventKind::Connected,
            LifecycleEvent::ConnectError(_) => LifecycleEventKind::ConnectError,
            LifecycleEvent::ConnectTimeout => LifecycleEventKind::ConnectTimeout,
            LifecycleEvent::Disconnected => LifecycleEventKind::Disconnected,
            LifecycleEvent::Error(_) => LifecycleEventKind::Error,
        }
    }
}

/// Lifecycle event kinds a listener can register for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleEventKind {
    Connected,
    ConnectError,
    ConnectTimeout,
    Disconnected,
    Error,
}

impl ClientFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sub_on_wire_shape_is_flat_and_tagged() {
        let frame = ClientFrame::SubOn {
            id: "abc123".to_string(),
            name: SUB_OBJECTS_CHANGES.to_string(),
            options: json!({"tableName": "Person", "event": "created"}),
        };

        let value = serde_json::to_value(&frame).expect("serialize frame");
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("sub_on"));
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some("abc123"));
        assert_eq!(
            value.get("name").and_then(|v| v.as_str()),
            Some("OBJECTS_CHANGES")
        );
        assert_eq!(
            value.pointer("/options/event").and_then(|v| v.as_str()),
            Some("created")
        );
    }

    #[test]
    fn sub_off_carries_only_the_id() {
        let frame = ClientFrame::SubOff {
            id: "abc123".to_string(),
        };
        let value = serde_json::to_value(&frame).expect("serialize frame");
        let object = value.as_object().expect("frame is an object");
        assert_eq!(object.len(), 2);
        assert_eq!(object.get("type").and_then(|v| v.as_str()), Some("sub_off"));
    }

    #[test]
    fn met_res_with_error_parses() {
        let frame =
            ServerFrame::from_text(r#"{"type":"met_res","id":"x1","error":{"code":404,"message":"no such key"}}"#)
                .expect("parse met_res");

        match frame {
            ServerFrame::MetRes { id, result, error } => {
                assert_eq!(id, "x1");
                assert!(result.is_none());
                let error = error.expect("error payload");
                assert_eq!(error.code, Some(404));
                assert_eq!(error.message, "no such key");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn sub_res_without_error_parses_data() {
        let frame = ServerFrame::from_text(r#"{"type":"sub_res","id":"s1","data":{"k":1}}"#)
            .expect("parse sub_res");
        match frame {
            ServerFrame::SubRes { id, data, error } => {
                assert_eq!(id, "s1");
                assert_eq!(data, Some(json!({"k": 1})));
                assert!(error.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_is_a_parse_error() {
        assert!(ServerFrame::from_text(r#"{"type":"mystery","id":"s1"}"#).is_err());
    }

    #[test]
    fn frame_error_display_includes_code_when_present() {
        let with_code = FrameError {
            code: Some(7),
            message: "denied".to_string(),
        };
        assert_eq!(with_code.to_string(), "denied (code 7)");

        let without_code = FrameError {
            code: None,
            message: "denied".to_string(),
        };
        assert_eq!(without_code.to_string(), "denied");
    }
}
