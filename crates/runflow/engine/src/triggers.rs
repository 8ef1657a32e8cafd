//! Bus subscriptions that drive the engine from events
//!
//! | topic                | effect                                         |
//! |----------------------|------------------------------------------------|
//! | `approval.response`  | [`OrchestrationEngine::submit_approval`]       |
//! | `workflow.start`     | [`OrchestrationEngine::start_run`]             |
//! | `processFlow.start`  | start run, re-announced per collection         |

use crate::engine::OrchestrationEngine;
use runflow_bus::{handler_fn, BusError, BusResult, Event, SubscriptionId};
use runflow_types::{RunId, Scope, StepId};
use serde_json::Value;
use tracing::{info, warn};

pub const APPROVAL_RESPONSE: &str = "approval.response";
pub const WORKFLOW_START: &str = "workflow.start";
pub const PROCESS_FLOW_START: &str = "processFlow.start";

/// Subscribe the engine to its trigger topics in every scope
pub fn install(engine: &OrchestrationEngine) -> BusResult<Vec<SubscriptionId>> {
    let bus = engine.bus().clone();
    let mut ids = Vec::with_capacity(3);

    let approvals = engine.clone();
    ids.push(bus.subscribe(
        Scope::platform(),
        APPROVAL_RESPONSE,
        handler_fn(move |event: Event| {
            let engine = approvals.clone();
            async move { on_approval_response(&engine, event).await }
        }),
    )?);

    let starts = engine.clone();
    ids.push(bus.subscribe(
        Scope::platform(),
        WORKFLOW_START,
        handler_fn(move |event: Event| {
            let engine = starts.clone();
            async move { on_start(&engine, event).await }
        }),
    )?);

    let process_starts = engine.clone();
    ids.push(bus.subscribe(
        Scope::platform(),
        PROCESS_FLOW_START,
        handler_fn(move |event: Event| {
            let engine = process_starts.clone();
            async move {
                if let Some(collection) = event.collection.clone() {
                    let qualified = Event::new(event.scope.clone(), event.qualified_type())
                        .with_collection(collection.clone())
                        .with_payload(event.payload.clone())
                        .with_actor(event.actor.clone());
                    if let Err(err) = engine.bus().emit(qualified) {
                        warn!(collection = %collection, error = %err, "Collection start not announced");
                    }
                }
                on_start(&engine, event).await
            }
        }),
    )?);

    info!(subscriptions = ids.len(), "Engine triggers installed");
    Ok(ids)
}

async fn on_approval_response(engine: &OrchestrationEngine, event: Event) -> BusResult<()> {
    let payload = &event.payload;
    let run_id = RunId::new(required_str(payload, "runId")?);
    let step_id = StepId::new(required_str(payload, "stepId")?);
    let approver = payload
        .get("approver")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| event.actor.clone())
        .ok_or_else(|| BusError::handler("approval response has no approver"))?;
    let approved = payload
        .get("approved")
        .and_then(Value::as_bool)
        .ok_or_else(|| BusError::handler("approval response has no 'approved' flag"))?;
    let comments = payload
        .get("comments")
        .and_then(Value::as_str)
        .map(str::to_string);

    let result = engine
        .submit_approval(&run_id, &step_id, &approver, approved, comments)
        .await
        .map_err(|e| BusError::handler(e.to_string()));
    reply(&event, result.map(|run| {
        run.map(|r| serde_json::json!({ "runId": r.id, "state": r.state }))
            .unwrap_or(Value::Null)
    }))
}

async fn on_start(engine: &OrchestrationEngine, event: Event) -> BusResult<()> {
    let payload = &event.payload;
    let code = required_str(payload, "definitionCode")?;
    let input = payload.get("input").cloned().unwrap_or(Value::Null);
    let triggered_by = payload
        .get("triggeredBy")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| event.actor.clone());

    let result = engine
        .start_run(&event.scope, code, input, triggered_by)
        .await
        .map_err(|e| BusError::handler(e.to_string()));
    reply(
        &event,
        result.map(|run| serde_json::json!({ "runId": run.id, "state": run.state })),
    )
}

/// Answer a request-style event, then surface the outcome to the bus
fn reply(event: &Event, result: BusResult<Value>) -> BusResult<()> {
    match result {
        Ok(value) => {
            event.reply(Ok(value));
            Ok(())
        }
        Err(err) => {
            event.reply(Err(err.to_string()));
            Err(err)
        }
    }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> BusResult<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BusError::handler(format!("missing '{}'", field)))
}
