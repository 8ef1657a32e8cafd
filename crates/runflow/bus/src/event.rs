//! Events carried by the bus

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use runflow_types::Scope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Result a collaborator sends back for a capability request
pub type ReplyResult = Result<Value, String>;

/// Unique event identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-shot reply slot shared by every clone of an event.
///
/// The first reply wins; later replies are dropped.
#[derive(Clone)]
pub struct ReplyHandle(Arc<Mutex<Option<oneshot::Sender<ReplyResult>>>>);

impl ReplyHandle {
    pub fn channel() -> (Self, oneshot::Receiver<ReplyResult>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// Send the reply; false if already replied or nobody is waiting
    pub fn send(&self, result: ReplyResult) -> bool {
        match self.0.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.0.lock().as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// An event published on the bus
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    reply: Option<ReplyHandle>,
}

impl Event {
    pub fn new(scope: Scope, event_type: impl Into<String>) -> Self {
        Self {
            id: EventId::generate(),
            scope,
            event_type: event_type.into(),
            collection: None,
            payload: Value::Null,
            actor: None,
            timestamp: Utc::now(),
            reply: None,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    /// Attach a reply slot, turning the event into a capability request
    pub fn with_reply(mut self, reply: ReplyHandle) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer a capability request; false when the event has no pending reply
    pub fn reply(&self, result: ReplyResult) -> bool {
        self.reply.as_ref().map(|r| r.send(result)).unwrap_or(false)
    }

    /// Re-publishable copy under another type; keeps scope, payload, actor
    /// and reply slot
    pub fn derived(&self, event_type: impl Into<String>) -> Self {
        Self {
            id: EventId::generate(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    /// `type.collection` when a collection is set
    pub fn qualified_type(&self) -> String {
        match &self.collection {
            Some(collection) => format!("{}.{}", self.event_type, collection),
            None => self.event_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_reply_wins() {
        let (handle, rx) = ReplyHandle::channel();
        let event = Event::new(Scope::platform(), "http.request").with_reply(handle);
        let copy = event.clone();
        assert!(event.expects_reply());
        assert!(event.reply(Ok(json!({"status": 200}))));
        assert!(!copy.reply(Ok(json!({"status": 500}))));
        assert_eq!(rx.await.unwrap(), Ok(json!({"status": 200})));
    }

    #[test]
    fn test_derived_event() {
        let event = Event::new(Scope::tenant("acme"), "workflow.start")
            .with_collection("orders")
            .with_payload(json!({"definitionCode": "po"}));
        let derived = event.derived(event.qualified_type());
        assert_eq!(derived.event_type, "workflow.start.orders");
        assert_eq!(derived.scope, Scope::tenant("acme"));
        assert_eq!(derived.payload, event.payload);
        assert_ne!(derived.id, event.id);
    }

    #[test]
    fn test_serialized_shape() {
        let event = Event::new(Scope::platform(), "run.started").with_payload(json!({"runId": "r1"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("run.started"));
        assert_eq!(value["scope"], json!("*"));
        assert!(value.get("reply").is_none());
    }
}
