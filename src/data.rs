//! Table change events.
//!
//! Thin adapter over the subscription registry for the server-side data
//! store: each listener is one `OBJECTS_CHANGES` subscription scoped to a
//! table, an event kind, and an optional server-evaluated condition.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::RtError;
use crate::rt::proto::SUB_OBJECTS_CHANGES;
use crate::rt::subscriptions::{SubscriptionCallback, SubscriptionRegistry};

/// Kind of table change a listener observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataEvent {
    Created,
    Updated,
    Deleted,
}

impl DataEvent {
    fn as_str(self) -> &'static str {
        match self {
            DataEvent::Created => "created",
            DataEvent::Updated => "updated",
            DataEvent::Deleted => "deleted",
        }
    }
}

/// Change-event handle for one table.
pub struct TableEvents {
    table: String,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl TableEvents {
    pub(crate) fn new(table: impl Into<String>, subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self {
            table: table.into(),
            subscriptions,
        }
    }

    /// Table this handle is scoped to.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn add_created_listener(
        &self,
        condition: Option<&str>,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        self.add_listener(DataEvent::Created, condition, callback).await
    }

    pub async fn add_updated_listener(
        &self,
        condition: Option<&str>,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        self.add_listener(DataEvent::Updated, condition, callback).await
    }

    pub async fn add_deleted_listener(
        &self,
        condition: Option<&str>,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        self.add_listener(DataEvent::Deleted, condition, callback).await
    }

    /// Subscribes to one change event, optionally narrowed by a condition
    /// the server evaluates. Returns the subscription id.
    pub async fn add_listener(
        &self,
        event: DataEvent,
        condition: Option<&str>,
        callback: SubscriptionCallback,
    ) -> Result<String, RtError> {
        self.subscriptions
            .subscribe(
                SUB_OBJECTS_CHANGES,
                change_options(&self.table, event, condition),
                callback,
            )
            .await
    }

    /// Removes every listener for one event kind on this table.
    pub fn remove_listeners(&self, event: DataEvent) -> Vec<String> {
        self.remove_matching(event, None, None)
    }

    /// Removes the listeners registered for `callback` on one event kind.
    pub fn remove_listener(
        &self,
        event: DataEvent,
        callback: &SubscriptionCallback,
    ) -> Vec<String> {
        self.remove_matching(event, Some(callback), None)
    }

    /// Removes the listeners registered with exactly this condition.
    pub fn remove_listeners_for(&self, event: DataEvent, condition: &str) -> Vec<String> {
        self.remove_matching(event, None, Some(condition))
    }

    /// Removes every listener on this table across all event kinds.
    pub fn remove_all_listeners(&self) -> Vec<String> {
        self.subscriptions.unsubscribe_where(|entry| {
            entry.name == SUB_OBJECTS_CHANGES && self.matches_table(&entry.options)
        })
    }

    fn remove_matching(
        &self,
        event: DataEvent,
        callback: Option<&SubscriptionCallback>,
        condition: Option<&str>,
    ) -> Vec<String> {
        self.subscriptions.unsubscribe_where(|entry| {
            entry.name == SUB_OBJECTS_CHANGES
                && self.matches_table(&entry.options)
                && entry.options.get("event").and_then(Value::as_str) == Some(event.as_str())
                && callback.map_or(true, |callback| entry.has_callback(callback))
                && condition.map_or(true, |condition| {
                    entry.options.get("condition").and_then(Value::as_str) == Some(condition)
                })
        })
    }

    fn matches_table(&self, options: &Value) -> bool {
        options.get("tableName").and_then(Value::as_str) == Some(self.table.as_str())
    }
}

// The condition key is present only when a condition was supplied; a null
// condition would subscribe to a different server-side topic.
fn change_options(table: &str, event: DataEvent, condition: Option<&str>) -> Value {
    let mut options = json!({"tableName": table, "event": event.as_str()});
    if let Some(condition) = condition {
        if let Some(map) = options.as_object_mut() {
            map.insert("condition".to_string(), json!(condition));
        }
    }
    options
}
