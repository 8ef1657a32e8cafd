//! Capability requests answered by external collaborators
//!
//! A step never performs a side effect itself. It publishes a request event
//! carrying a reply slot (`record.operation`, `http.request`,
//! `workflow.action`) and waits for the answer within a timeout.

use runflow_bus::{Event, EventBus, ReplyHandle};
use runflow_script::HostBridge;
use runflow_types::{RunflowError, RunflowResult, Scope};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

// ── Topics ───────────────────────────────────────────────────────────

pub const RECORD_OPERATION: &str = "record.operation";
pub const NOTIFICATION_SEND: &str = "notification.send";
pub const HTTP_REQUEST: &str = "http.request";
pub const APPROVAL_CREATE: &str = "approval.create";
pub const WORKFLOW_ACTION: &str = "workflow.action";

// ── Client ───────────────────────────────────────────────────────────

/// Publishes capability requests on the bus and awaits their replies
#[derive(Clone, Debug)]
pub struct CapabilityClient {
    bus: EventBus,
    timeout: Duration,
}

impl CapabilityClient {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Publish `topic` and wait for the first reply.
    ///
    /// No reply within the window is a [`RunflowError::CapabilityTimeout`];
    /// an error reply, or every handler finishing without answering, is a
    /// [`RunflowError::StepFailed`].
    pub async fn request(
        &self,
        scope: &Scope,
        topic: &str,
        payload: Value,
        actor: Option<String>,
        timeout: Option<Duration>,
    ) -> RunflowResult<Value> {
        let timeout = timeout.unwrap_or(self.timeout);
        let (handle, rx) = ReplyHandle::channel();
        let event = Event::new(scope.clone(), topic)
            .with_payload(payload)
            .with_actor(actor)
            .with_reply(handle);
        self.bus
            .emit(event)
            .map_err(|e| RunflowError::StepFailed(format!("{}: {}", topic, e)))?;

        debug!(topic, timeout_ms = timeout.as_millis() as u64, "Capability requested");
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(RunflowError::StepFailed(format!(
                "{} failed: {}",
                topic, message
            ))),
            Ok(Err(_)) => Err(RunflowError::StepFailed(format!(
                "No handler answered {}",
                topic
            ))),
            Err(_) => Err(RunflowError::CapabilityTimeout {
                topic: topic.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Fire-and-forget publish
    pub fn dispatch(
        &self,
        scope: &Scope,
        topic: &str,
        payload: Value,
        actor: Option<String>,
    ) -> RunflowResult<()> {
        let event = Event::new(scope.clone(), topic)
            .with_payload(payload)
            .with_actor(actor);
        self.bus
            .emit(event)
            .map_err(|e| RunflowError::StepFailed(format!("{}: {}", topic, e)))
    }
}

// ── Script host ──────────────────────────────────────────────────────

/// Routes sandbox `http.*` and `data.*` calls to capability requests.
///
/// The sandbox calls the bridge from a blocking thread, so the request is
/// driven to completion on the captured runtime handle.
pub struct ScriptHost {
    client: CapabilityClient,
    scope: Scope,
    runtime: tokio::runtime::Handle,
}

impl ScriptHost {
    pub fn new(client: CapabilityClient, scope: Scope, runtime: tokio::runtime::Handle) -> Self {
        Self {
            client,
            scope,
            runtime,
        }
    }
}

impl HostBridge for ScriptHost {
    fn http_request(&self, request: Value, timeout: Duration) -> Result<Value, String> {
        self.runtime
            .block_on(
                self.client
                    .request(&self.scope, HTTP_REQUEST, request, None, Some(timeout)),
            )
            .map_err(|e| e.to_string())
    }

    fn data_query(&self, collection: &str, query: Value, timeout: Duration) -> Result<Value, String> {
        let payload = json!({
            "operation": "query",
            "collection": collection,
            "query": query,
        });
        self.runtime
            .block_on(
                self.client
                    .request(&self.scope, RECORD_OPERATION, payload, None, Some(timeout)),
            )
            .map_err(|e| e.to_string())
    }
}
