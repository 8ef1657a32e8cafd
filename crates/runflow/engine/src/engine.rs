//! Orchestration Engine: the step-graph interpreter
//!
//! ```text
//!  start_run ──► drive ──► execute_step ──► perform (by step kind)
//!                  ▲             │
//!                  │             ├── continue ──► next edge
//!                  │             └── suspend  ──► persist, release deferred effects
//!                  │
//!  resume_run ─────┘   approval response · queue job · child run finished
//! ```
//!
//! Suspension happens at `approval`, `wait` and awaited `sub_run` steps.
//! A suspending step returns its side effects (approval request, resume job,
//! child run) as deferred work; they are released only after the waiting
//! state and step record are stored, so a fast responder never finds the
//! run still running.
//!
//! Resumption goes through a conditional transition in the [`RunStore`]:
//! of two deliveries of the same resume job only the first moves the run
//! out of its waiting state. The other is logged and ignored.

use crate::capability::{self, CapabilityClient, ScriptHost};
use crate::config::EngineConfig;
use crate::registry::DefinitionRegistry;
use crate::store::{InMemoryRunStore, RunStore};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use runflow_bus::{Event, EventBus};
use runflow_queue::{JobProcessor, JobQueue};
use runflow_rules::expression;
use runflow_script::value::truthy;
use runflow_script::{Capabilities, ExecuteOptions, Sandbox, ScriptContext, ScriptError};
use runflow_types::path;
use runflow_types::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Lifecycle topics ─────────────────────────────────────────────────

pub const RUN_STARTED: &str = "run.started";
pub const RUN_COMPLETED: &str = "run.completed";
pub const RUN_FAILED: &str = "run.failed";
pub const RUN_CANCELLED: &str = "run.cancelled";
pub const RUN_STEP_COMPLETED: &str = "run.step_completed";
pub const RUN_SLA_BREACHED: &str = "run.sla_breached";

// ── Step results ─────────────────────────────────────────────────────

/// What a step asks the interpreter to do
enum StepOutcome {
    Continue {
        output: Value,
        next: Option<StepId>,
    },
    Suspend {
        state: RunState,
        output: Value,
        deferred: Vec<Deferred>,
    },
}

/// Side effects released only after a suspension is stored
enum Deferred {
    Schedule { payload: JobPayload, delay: Duration },
    Dispatch { topic: &'static str, payload: Value },
    StartChild {
        definition: RunDefinition,
        input: Value,
        link: ParentLink,
    },
}

enum Flow {
    Next(Option<StepId>),
    Suspend(Vec<Deferred>),
}

// ── Engine ───────────────────────────────────────────────────────────

/// Starts, executes, suspends and resumes runs
#[derive(Clone)]
pub struct OrchestrationEngine {
    config: Arc<EngineConfig>,
    registry: Arc<DefinitionRegistry>,
    runs: Arc<dyn RunStore>,
    bus: EventBus,
    queue: Arc<JobQueue>,
    sandbox: Sandbox,
    resolver: Arc<dyn ScopeResolver>,
    capabilities: CapabilityClient,
    /// Serializes approval tallies per run
    approval_locks: Arc<DashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
}

impl OrchestrationEngine {
    pub fn new(config: EngineConfig, bus: EventBus, queue: Arc<JobQueue>, sandbox: Sandbox) -> Self {
        let capabilities = CapabilityClient::new(
            bus.clone(),
            Duration::from_millis(config.capability_timeout_ms),
        );
        Self {
            config: Arc::new(config),
            registry: Arc::new(DefinitionRegistry::new()),
            runs: Arc::new(InMemoryRunStore::new()),
            bus,
            queue,
            sandbox,
            resolver: Arc::new(TenantThenPlatform),
            capabilities,
            approval_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_registry(mut self, registry: Arc<DefinitionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ScopeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Validate and register a definition under the next version of its code
    pub fn register_definition(&self, definition: RunDefinition) -> RunflowResult<RunDefinition> {
        self.registry.register(definition)
    }

    // ── Starting runs ────────────────────────────────────────────────

    /// Start a run of the latest definition with `code` visible from `scope`
    /// and execute it until it completes, fails or suspends.
    ///
    /// A run that fails is returned, not raised: it is inspectable through
    /// its `error` detail and execution path.
    pub async fn start_run(
        &self,
        scope: &Scope,
        code: &str,
        input: Value,
        triggered_by: Option<String>,
    ) -> RunflowResult<RunInstance> {
        let definition = self.registry.resolve(scope, code, self.resolver.as_ref())?;
        self.start_definition(&definition, scope.clone(), input, triggered_by, None)
            .await
    }

    /// Create a pending run and hand its execution to the queue
    pub async fn schedule_run(
        &self,
        scope: &Scope,
        code: &str,
        input: Value,
        triggered_by: Option<String>,
        delay: Duration,
    ) -> RunflowResult<RunInstance> {
        let definition = self.registry.resolve(scope, code, self.resolver.as_ref())?;
        let run = self.new_run(&definition, scope.clone(), input, triggered_by, None);
        self.runs.create_run(run.clone()).await?;
        self.schedule(JobPayload::new(JobType::Execute, run.id.clone()), delay)
            .await;
        debug!(run_id = %run.id, definition = %definition.code, "Run scheduled");
        Ok(run)
    }

    async fn start_definition(
        &self,
        definition: &RunDefinition,
        scope: Scope,
        input: Value,
        triggered_by: Option<String>,
        parent: Option<ParentLink>,
    ) -> RunflowResult<RunInstance> {
        let start = definition
            .start_step()
            .ok_or(RunflowError::NoStartStep)?
            .id
            .clone();
        let mut run = self.new_run(definition, scope, input, triggered_by, parent);
        run.transition(RunState::Running)?;
        self.runs.create_run(run.clone()).await?;
        self.begin(definition, &run).await;
        self.drive(definition, run, Some(start)).await
    }

    fn new_run(
        &self,
        definition: &RunDefinition,
        scope: Scope,
        input: Value,
        triggered_by: Option<String>,
        parent: Option<ParentLink>,
    ) -> RunInstance {
        let mut run = RunInstance::new(
            definition.id.clone(),
            definition.code.clone(),
            definition.version,
            scope,
            RunContext::new(input, triggered_by),
        );
        if let Some(parent) = parent {
            run = run.with_parent(parent);
        }
        let created_at = run.created_at;
        run.sla_deadline = definition
            .sla_minutes
            .or(self.config.default_sla_minutes)
            .map(|minutes| created_at + chrono::Duration::minutes(minutes as i64));
        run
    }

    /// Announce a run that just entered `running` for the first time
    async fn begin(&self, definition: &RunDefinition, run: &RunInstance) {
        if let Some(deadline) = run.sla_deadline {
            let delay = (deadline - Utc::now()).to_std().unwrap_or_default();
            self.schedule(JobPayload::new(JobType::SlaCheck, run.id.clone()), delay)
                .await;
        }
        info!(
            run_id = %run.id,
            definition = %definition.code,
            version = definition.version,
            scope = %run.scope,
            "Run started"
        );
        self.lifecycle(
            run,
            RUN_STARTED,
            json!({
                "definitionCode": definition.code,
                "version": definition.version,
                "input": run.context.input,
            }),
        );
    }

    // ── Traversal ────────────────────────────────────────────────────

    /// Execute steps from `from` until the run completes, fails or suspends
    fn drive<'a>(
        &'a self,
        definition: &'a RunDefinition,
        mut run: RunInstance,
        from: Option<StepId>,
    ) -> BoxFuture<'a, RunflowResult<RunInstance>> {
        Box::pin(async move {
            let mut cursor = from;
            while let Some(step_id) = cursor.take() {
                let step = match definition.require_step(&step_id) {
                    Ok(step) => step,
                    Err(err) => return self.fail_run(run, err.to_string(), Some(step_id)).await,
                };

                match self.execute_step(definition, &mut run, step).await {
                    Ok(Flow::Next(next)) => {
                        if !self.persist(&run).await? {
                            return self.get_run(&run.id).await;
                        }
                        cursor = next;
                    }
                    Ok(Flow::Suspend(deferred)) => {
                        if !self.persist(&run).await? {
                            return self.get_run(&run.id).await;
                        }
                        info!(
                            run_id = %run.id,
                            step_id = %step.id,
                            state = %run.state,
                            "Run suspended"
                        );
                        for effect in deferred {
                            self.release(&run, effect).await;
                        }
                        return self.get_run(&run.id).await;
                    }
                    Err(err) => match &step.on_error {
                        Some(target) => {
                            warn!(
                                run_id = %run.id,
                                step_id = %step.id,
                                target = %target,
                                error = %err,
                                "Step failed; following error edge"
                            );
                            run.context
                                .set_output(&step.id, json!({ "error": err.to_string() }));
                            cursor = Some(target.clone());
                        }
                        None => {
                            return self
                                .fail_run(run, err.to_string(), Some(step.id.clone()))
                                .await
                        }
                    },
                }
            }
            self.complete_run(run).await
        })
    }

    /// Run one step, keeping exactly one execution record for the visit
    async fn execute_step(
        &self,
        definition: &RunDefinition,
        run: &mut RunInstance,
        step: &Step,
    ) -> RunflowResult<Flow> {
        run.enter_step(&step.id);
        let mut record = StepExecutionRecord::started(
            run.id.clone(),
            step.id.clone(),
            step.step_type(),
            run.context.scope(),
        );
        self.runs.append_record(record.clone()).await?;
        debug!(run_id = %run.id, step_id = %step.id, step_type = %step.step_type(), "Executing step");

        match self.perform(definition, run, step).await {
            Ok(StepOutcome::Continue { output, next }) => {
                if !output.is_null() {
                    run.context.set_output(&step.id, output.clone());
                }
                record.complete(output.clone());
                self.runs.update_record(&record).await?;
                self.lifecycle(
                    run,
                    RUN_STEP_COMPLETED,
                    json!({
                        "stepId": step.id,
                        "stepType": step.step_type(),
                        "output": output,
                    }),
                );
                Ok(Flow::Next(next))
            }
            Ok(StepOutcome::Suspend {
                state,
                output,
                deferred,
            }) => {
                record.wait(output);
                self.runs.update_record(&record).await?;
                run.transition(state)?;
                Ok(Flow::Suspend(deferred))
            }
            Err(err) => {
                record.fail(err.to_string());
                self.runs.update_record(&record).await?;
                Err(err)
            }
        }
    }

    /// Execute a nested step list in order (parallel branch, loop body);
    /// returns the outputs of those steps
    async fn run_sequence(
        &self,
        definition: &RunDefinition,
        run: &mut RunInstance,
        container: &StepId,
        steps: &[StepId],
    ) -> RunflowResult<Map<String, Value>> {
        let mut outputs = Map::new();
        for step_id in steps {
            let step = definition.require_step(step_id)?;
            match self.execute_step(definition, run, step).await? {
                Flow::Next(_) => {}
                Flow::Suspend(_) => {
                    return Err(RunflowError::SuspensionInBranch {
                        container: container.clone(),
                        step: step_id.clone(),
                    })
                }
            }
            let output = run
                .context
                .step_outputs
                .get(step_id.as_str())
                .cloned()
                .unwrap_or(Value::Null);
            outputs.insert(step_id.0.clone(), output);
        }
        Ok(outputs)
    }

    fn perform<'a>(
        &'a self,
        definition: &'a RunDefinition,
        run: &'a mut RunInstance,
        step: &'a Step,
    ) -> BoxFuture<'a, RunflowResult<StepOutcome>> {
        Box::pin(async move {
            let next = step.next.clone();
            let actor = run.context.triggered_by.clone();
            let outcome = match &step.kind {
                StepKind::Start => StepOutcome::Continue {
                    output: Value::Null,
                    next,
                },
                StepKind::End => StepOutcome::Continue {
                    output: Value::Null,
                    next: None,
                },

                StepKind::Action(config) => {
                    let scope = run.context.scope();
                    let payload = json!({
                        "runId": run.id,
                        "stepId": step.id,
                        "actionType": config.action_type,
                        "config": path::render_value(&config.config, &scope),
                        "context": scope,
                    });
                    let output = self
                        .capabilities
                        .request(
                            &run.scope,
                            capability::WORKFLOW_ACTION,
                            payload,
                            actor,
                            config.timeout_ms.map(Duration::from_millis),
                        )
                        .await?;
                    StepOutcome::Continue { output, next }
                }

                StepKind::Http(config) => {
                    let scope = run.context.scope();
                    let headers: Map<String, Value> = config
                        .headers
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(path::render_string(v, &scope))))
                        .collect();
                    let payload = json!({
                        "url": path::render_string(&config.url, &scope),
                        "method": config.method,
                        "headers": headers,
                        "body": config.body.as_ref().map(|b| path::render_value(b, &scope)),
                        "runId": run.id,
                        "stepId": step.id,
                    });
                    let output = self
                        .capabilities
                        .request(
                            &run.scope,
                            capability::HTTP_REQUEST,
                            payload,
                            actor,
                            config.timeout_ms.map(Duration::from_millis),
                        )
                        .await?;
                    StepOutcome::Continue { output, next }
                }

                StepKind::Notification(config) => {
                    let scope = run.context.scope();
                    let recipients: Vec<String> = config
                        .recipients
                        .iter()
                        .flat_map(|r| render_list(r, &scope))
                        .collect();
                    self.capabilities.dispatch(
                        &run.scope,
                        capability::NOTIFICATION_SEND,
                        json!({
                            "templateCode": config.template_code,
                            "recipients": recipients,
                            "channels": config.channels,
                            "data": path::render_value(&config.data, &scope),
                            "runId": run.id,
                        }),
                        actor,
                    )?;
                    StepOutcome::Continue {
                        output: json!({
                            "templateCode": config.template_code,
                            "recipients": recipients.len(),
                        }),
                        next,
                    }
                }

                StepKind::RecordOperation(config) => {
                    let scope = run.context.scope();
                    let payload = json!({
                        "operation": config.operation,
                        "collection": config.collection,
                        "data": config.data.as_ref().map(|d| path::render_value(d, &scope)),
                        "query": config.query.as_ref().map(|q| path::render_value(q, &scope)),
                        "runId": run.id,
                        "stepId": step.id,
                    });
                    let output = self
                        .capabilities
                        .request(
                            &run.scope,
                            capability::RECORD_OPERATION,
                            payload,
                            actor,
                            config.timeout_ms.map(Duration::from_millis),
                        )
                        .await?;
                    StepOutcome::Continue { output, next }
                }

                StepKind::Script(config) => {
                    let capabilities = Capabilities::none()
                        .with_http(config.allow_http)
                        .with_data_query(config.allow_data_query);
                    let mut options = ExecuteOptions::new()
                        .with_timeout_ms(config.timeout_ms)
                        .with_capabilities(capabilities);
                    if config.allow_http || config.allow_data_query {
                        options = options.with_host(Arc::new(ScriptHost::new(
                            self.capabilities.clone(),
                            run.scope.clone(),
                            tokio::runtime::Handle::current(),
                        )));
                    }
                    let outcome = self
                        .sandbox
                        .execute(&config.script, &script_context(run), options)
                        .await;
                    for line in &outcome.logs {
                        debug!(run_id = %run.id, step_id = %step.id, "script: {}", line);
                    }
                    let markers = outcome.markers.clone();
                    let result = outcome
                        .into_result()
                        .map_err(|e| RunflowError::StepFailed(e.to_string()))?;
                    if let Some(message) = markers.abort {
                        return Err(RunflowError::StepFailed(message));
                    }
                    for (name, value) in markers.set_fields {
                        assign_variable(&mut run.context.variables, &name, value);
                    }
                    StepOutcome::Continue {
                        output: result,
                        next,
                    }
                }

                StepKind::SetVariable { assignments } => {
                    let mut assigned = Map::new();
                    for assignment in assignments {
                        let value = match &assignment.expression {
                            Some(expr) => self.evaluate(expr, run).await.map_err(|e| {
                                RunflowError::StepFailed(format!("{}: {}", assignment.name, e))
                            })?,
                            None => path::render_value(
                                assignment.value.as_ref().unwrap_or(&Value::Null),
                                &run.context.scope(),
                            ),
                        };
                        assign_variable(&mut run.context.variables, &assignment.name, value.clone());
                        assigned.insert(assignment.name.clone(), value);
                    }
                    StepOutcome::Continue {
                        output: Value::Object(assigned),
                        next,
                    }
                }

                StepKind::Condition(check) => {
                    let result = match check {
                        ConditionCheck::Field {
                            field,
                            comparator,
                            value,
                        } => {
                            let scope = run.context.scope();
                            let actual = path::lookup(&scope, field)
                                .or_else(|| path::lookup(&run.context.input, field))
                                .cloned()
                                .unwrap_or(Value::Null);
                            let expected = path::render_value(value, &scope);
                            expression::compare(&actual, *comparator, &expected, None)
                        }
                        ConditionCheck::Expression { expression } => {
                            match self.evaluate(expression, run).await {
                                Ok(value) => truthy(&value),
                                Err(err) => {
                                    warn!(
                                        run_id = %run.id,
                                        step_id = %step.id,
                                        error = %err,
                                        "Condition failed; treating as false"
                                    );
                                    false
                                }
                            }
                        }
                    };
                    let labels: &[&str] = if result {
                        &["true", "yes"]
                    } else {
                        &["false", "no"]
                    };
                    StepOutcome::Continue {
                        output: json!({ "result": result }),
                        next: step.resolve_edge(labels).cloned(),
                    }
                }

                StepKind::Approval(config) => {
                    let approvers = self.resolve_approvers(config, run).await?;
                    let scope = run.context.scope();
                    let title = config
                        .title
                        .as_deref()
                        .map(|t| path::render_string(t, &scope))
                        .unwrap_or_else(|| step.name.clone());
                    run.pending_approval = Some(PendingApproval::new(
                        step.id.clone(),
                        approvers.clone(),
                        config.policy,
                    ));

                    let mut deferred = vec![Deferred::Dispatch {
                        topic: capability::APPROVAL_CREATE,
                        payload: json!({
                            "runId": run.id,
                            "stepId": step.id,
                            "title": title,
                            "approvers": approvers,
                            "policy": config.policy,
                            "timeoutMinutes": config.timeout_minutes,
                        }),
                    }];
                    if let Some(minutes) = config.timeout_minutes {
                        deferred.push(Deferred::Schedule {
                            payload: JobPayload::new(JobType::ApprovalTimeout, run.id.clone())
                                .with_step(step.id.clone()),
                            delay: Duration::from_secs(minutes.saturating_mul(60)),
                        });
                    }
                    StepOutcome::Suspend {
                        state: RunState::WaitingApproval,
                        output: json!({ "approvers": approvers, "policy": config.policy }),
                        deferred,
                    }
                }

                StepKind::Wait(config) => {
                    let delay_ms = config.to_millis();
                    StepOutcome::Suspend {
                        state: RunState::WaitingCondition,
                        output: json!({ "delayMs": delay_ms }),
                        deferred: vec![Deferred::Schedule {
                            payload: JobPayload::new(JobType::WaitComplete, run.id.clone())
                                .with_step(step.id.clone()),
                            delay: Duration::from_millis(delay_ms),
                        }],
                    }
                }

                StepKind::Parallel { branches } => {
                    let base = run.clone();
                    let tasks = branches.iter().map(|branch| {
                        let mut branch_run = base.clone();
                        async move {
                            let outputs = self
                                .run_sequence(definition, &mut branch_run, &step.id, branch)
                                .await?;
                            Ok::<_, RunflowError>((branch_run, outputs))
                        }
                    });
                    let results = join_all(tasks).await;

                    let mut branch_outputs = Vec::with_capacity(results.len());
                    for result in results {
                        let (branch_run, outputs) = result?;
                        merge_changes(
                            &mut run.context.variables,
                            &base.context.variables,
                            branch_run.context.variables,
                        );
                        merge_changes(
                            &mut run.context.step_outputs,
                            &base.context.step_outputs,
                            branch_run.context.step_outputs,
                        );
                        run.execution_path.extend(
                            branch_run
                                .execution_path
                                .into_iter()
                                .skip(base.execution_path.len()),
                        );
                        branch_outputs.push(Value::Object(outputs));
                    }
                    run.current_step = Some(step.id.clone());
                    StepOutcome::Continue {
                        output: json!({ "branches": branch_outputs }),
                        next,
                    }
                }

                StepKind::Loop(config) => {
                    let items = self.resolve_collection(&config.collection, run).await?;
                    let limit = config
                        .max_iterations
                        .unwrap_or(self.config.max_loop_iterations)
                        .min(self.config.max_loop_iterations);
                    if items.len() > limit {
                        return Err(RunflowError::StepFailed(format!(
                            "loop over {} items exceeds the limit of {}",
                            items.len(),
                            limit
                        )));
                    }

                    let saved_item = run.context.variables.remove("item");
                    let saved_index = run.context.variables.remove("index");
                    let mut iterations = Vec::with_capacity(items.len());
                    let mut failure = None;
                    for (index, item) in items.into_iter().enumerate() {
                        run.context.variables.insert("item".into(), item);
                        run.context.variables.insert("index".into(), json!(index));
                        match self.run_sequence(definition, run, &step.id, &config.body).await {
                            Ok(outputs) => iterations.push(Value::Object(outputs)),
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    run.context.variables.remove("item");
                    run.context.variables.remove("index");
                    if let Some(item) = saved_item {
                        run.context.variables.insert("item".into(), item);
                    }
                    if let Some(index) = saved_index {
                        run.context.variables.insert("index".into(), index);
                    }
                    run.current_step = Some(step.id.clone());
                    if let Some(err) = failure {
                        return Err(err);
                    }
                    StepOutcome::Continue {
                        output: json!({ "count": iterations.len(), "iterations": iterations }),
                        next,
                    }
                }

                StepKind::SubRun(config) => {
                    let child = self.registry.resolve(
                        &run.scope,
                        &config.definition_code,
                        self.resolver.as_ref(),
                    )?;
                    let scope = run.context.scope();
                    let input = if config.input_mapping.is_empty() {
                        run.context.input.clone()
                    } else {
                        let mut input = Value::Object(Map::new());
                        for (target, source) in &config.input_mapping {
                            path::assign(&mut input, target, map_source(source, &scope));
                        }
                        input
                    };
                    let link = ParentLink {
                        run_id: run.id.clone(),
                        step_id: step.id.clone(),
                        await_completion: config.await_completion,
                    };

                    if config.await_completion {
                        StepOutcome::Suspend {
                            state: RunState::WaitingCondition,
                            output: json!({ "definitionCode": child.code, "awaiting": true }),
                            deferred: vec![Deferred::StartChild {
                                definition: child,
                                input,
                                link,
                            }],
                        }
                    } else {
                        let child_run = self
                            .start_definition(&child, run.scope.clone(), input, actor, Some(link))
                            .await?;
                        StepOutcome::Continue {
                            output: json!({
                                "runId": child_run.id,
                                "state": child_run.state,
                                "variables": child_run.context.variables,
                            }),
                            next,
                        }
                    }
                }
            };
            Ok(outcome)
        })
    }

    async fn release(&self, run: &RunInstance, effect: Deferred) {
        match effect {
            Deferred::Schedule { payload, delay } => {
                let job_type = payload.job_type;
                let job_id = self.schedule(payload, delay).await;
                debug!(
                    run_id = %run.id,
                    job_type = job_type.as_str(),
                    durable = job_id.is_some(),
                    "Resume scheduled"
                );
            }
            Deferred::Dispatch { topic, payload } => {
                if let Err(err) = self.capabilities.dispatch(
                    &run.scope,
                    topic,
                    payload,
                    run.context.triggered_by.clone(),
                ) {
                    warn!(run_id = %run.id, topic, error = %err, "Capability event not published");
                }
            }
            Deferred::StartChild {
                definition,
                input,
                link,
            } => {
                match self
                    .start_definition(
                        &definition,
                        run.scope.clone(),
                        input,
                        run.context.triggered_by.clone(),
                        Some(link),
                    )
                    .await
                {
                    Ok(child) => {
                        debug!(run_id = %run.id, child_run_id = %child.id, state = %child.state, "Child run started")
                    }
                    Err(err) => {
                        warn!(run_id = %run.id, error = %err, "Child run could not be started")
                    }
                }
            }
        }
    }

    // ── Resumption ───────────────────────────────────────────────────

    /// Continue a waiting run after `step_id`.
    ///
    /// `data` is merged into the run variables. Returns `None` when the run
    /// is not waiting at that step (already resumed, finished, cancelled);
    /// a duplicate delivery is therefore a no-op.
    pub async fn resume_run(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        data: Value,
    ) -> RunflowResult<Option<RunInstance>> {
        self.resume_with(run_id, step_id, data, None).await
    }

    async fn resume_with(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        data: Value,
        labels: Option<Vec<&'static str>>,
    ) -> RunflowResult<Option<RunInstance>> {
        let current = self.get_run(run_id).await?;
        if !current.is_waiting() || current.current_step.as_ref() != Some(step_id) {
            info!(
                run_id = %run_id,
                step_id = %step_id,
                state = %current.state,
                "Resume ignored; run is not waiting at this step"
            );
            return Ok(None);
        }
        let definition = self.registry.get(&current.definition_id)?;
        let step = definition.require_step(step_id)?;

        let mut run = match self
            .runs
            .transition_run(run_id, &[current.state], RunState::Running)
            .await
        {
            Ok(run) => run,
            Err(StoreError::InvariantViolation(reason)) => {
                warn!(run_id = %run_id, step_id = %step_id, reason = %reason, "Duplicate resume ignored");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let labels = labels.unwrap_or_else(|| resume_labels(step, &data));
        run.context.merge_variables(&data);
        if !data.is_null() {
            run.context.set_output(step_id, data.clone());
        }
        run.pending_approval = None;
        if let Some(mut record) = self.runs.waiting_record(run_id, step_id).await? {
            record.complete(data.clone());
            self.runs.update_record(&record).await?;
        }

        info!(run_id = %run_id, step_id = %step_id, edge = ?labels.first(), "Run resumed");
        self.lifecycle(
            &run,
            RUN_STEP_COMPLETED,
            json!({
                "stepId": step.id,
                "stepType": step.step_type(),
                "output": data,
            }),
        );

        let next = step.resolve_edge(&labels).cloned();
        self.drive(&definition, run, next).await.map(Some)
    }

    /// Record one approver's response and resume the run once the policy
    /// reaches a decision.
    ///
    /// Returns the updated run, or `None` when the response was ignored
    /// (run not waiting at that step, or not a listed approver).
    pub async fn submit_approval(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        approver: &str,
        approved: bool,
        comments: Option<String>,
    ) -> RunflowResult<Option<RunInstance>> {
        // Unknown runs fail before any per-run lock entry is created.
        let current = self.get_run(run_id).await?;
        if !awaits_approval(&current, step_id) {
            info!(run_id = %run_id, step_id = %step_id, state = %current.state, "Approval response ignored");
            return Ok(None);
        }
        let lock = self
            .approval_locks
            .entry(run_id.clone())
            .or_default()
            .clone();

        let (decision, responses) = {
            let _guard = lock.lock().await;
            let run = self.get_run(run_id).await?;
            if !awaits_approval(&run, step_id) {
                info!(run_id = %run_id, step_id = %step_id, state = %run.state, "Approval response ignored");
                if run.state != RunState::WaitingApproval {
                    self.approval_locks.remove(run_id);
                }
                return Ok(None);
            }
            let Some(expected) = run.pending_approval.as_ref() else {
                return Ok(None);
            };
            if !expected.approvers.is_empty() && !expected.approvers.iter().any(|a| a == approver) {
                warn!(run_id = %run_id, step_id = %step_id, approver, "Response from a non-approver ignored");
                return Ok(None);
            }

            let mut pending = expected.clone();
            pending.record(ApprovalResponse {
                approver: approver.to_string(),
                approved,
                comments,
                at: Utc::now(),
            });
            let decision = pending.decision();
            let responses = serde_json::to_value(&pending.responses).unwrap_or(Value::Null);
            // The tally only lands while this exact request is still pending;
            // a timeout that resumed the run first wins.
            let run = match self.runs.record_approval(run_id, expected, pending).await {
                Ok(run) => run,
                Err(StoreError::InvariantViolation(reason)) => {
                    info!(run_id = %run_id, step_id = %step_id, reason = %reason, "Approval response arrived after resumption");
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
            match decision {
                Some(decision) => (decision, responses),
                None => {
                    info!(run_id = %run_id, step_id = %step_id, approver, "Approval response recorded");
                    return Ok(Some(run));
                }
            }
        };

        let data = json!({
            "approved": decision == ApprovalDecision::Approved,
            "decision": decision.as_str(),
            "responses": responses,
        });
        self.resume_with(run_id, step_id, data, Some(decision.edge_labels().to_vec()))
            .await
    }

    /// Move a non-terminal run to `cancelled` and drop its queued jobs.
    ///
    /// A step already in flight is not interrupted; the run stops at the
    /// next step boundary.
    pub async fn cancel_run(&self, run_id: &RunId) -> RunflowResult<RunInstance> {
        let current = self.get_run(run_id).await?;
        if current.is_terminal() {
            return Err(RunflowError::InvalidTransition {
                from: current.state,
                to: RunState::Cancelled,
            });
        }
        let run = match self
            .runs
            .transition_run(
                run_id,
                &[
                    RunState::Pending,
                    RunState::Running,
                    RunState::WaitingApproval,
                    RunState::WaitingCondition,
                ],
                RunState::Cancelled,
            )
            .await
        {
            Ok(run) => run,
            Err(StoreError::InvariantViolation(_)) => {
                let latest = self.get_run(run_id).await?;
                return Err(RunflowError::InvalidTransition {
                    from: latest.state,
                    to: RunState::Cancelled,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(step_id) = current.current_step.as_ref().filter(|_| current.is_waiting()) {
            if let Some(mut record) = self.runs.waiting_record(run_id, step_id).await? {
                record.fail("run cancelled");
                self.runs.update_record(&record).await?;
            }
        }
        match self.queue.cancel_instance_jobs(run_id).await {
            Ok(removed) => debug!(run_id = %run_id, removed, "Queued jobs removed"),
            Err(err) => warn!(run_id = %run_id, error = %err, "Could not remove queued jobs"),
        }

        info!(run_id = %run_id, "Run cancelled");
        self.lifecycle(&run, RUN_CANCELLED, json!({ "definitionCode": run.definition_code }));
        self.settle(&run).await;
        Ok(run)
    }

    // ── Jobs ─────────────────────────────────────────────────────────

    /// Apply a scheduled job to its run
    pub async fn handle_job(&self, job: &ScheduledJob) -> RunflowResult<()> {
        let payload = &job.payload;
        let run_id = &payload.instance_id;
        debug!(job_id = %job.id, job_type = payload.job_type.as_str(), run_id = %run_id, "Handling job");

        match payload.job_type {
            JobType::Execute => self
                .execute_pending(run_id, payload.node_id.clone())
                .await
                .map(|_| ()),
            JobType::Resume => {
                let step_id = job_step(payload)?;
                let data = payload.data.clone().unwrap_or(Value::Null);
                self.resume_run(run_id, step_id, data).await.map(|_| ())
            }
            JobType::WaitComplete => {
                let step_id = job_step(payload)?;
                let data = payload.data.clone().unwrap_or(Value::Null);
                self.resume_with(run_id, step_id, data, None).await.map(|_| ())
            }
            JobType::ApprovalTimeout => {
                let step_id = job_step(payload)?;
                self.resume_with(
                    run_id,
                    step_id,
                    json!({ "approved": false, "timedOut": true }),
                    Some(ApprovalDecision::TimedOut.edge_labels().to_vec()),
                )
                .await
                .map(|_| ())
            }
            JobType::SlaCheck => self.check_sla(run_id).await,
        }
    }

    async fn execute_pending(
        &self,
        run_id: &RunId,
        from: Option<StepId>,
    ) -> RunflowResult<Option<RunInstance>> {
        let current = self.get_run(run_id).await?;
        if current.state != RunState::Pending {
            info!(run_id = %run_id, state = %current.state, "Execute ignored; run already started");
            return Ok(None);
        }
        let definition = self.registry.get(&current.definition_id)?;
        let from = match from {
            Some(step_id) => step_id,
            None => definition
                .start_step()
                .ok_or(RunflowError::NoStartStep)?
                .id
                .clone(),
        };
        let run = match self
            .runs
            .transition_run(run_id, &[RunState::Pending], RunState::Running)
            .await
        {
            Ok(run) => run,
            Err(StoreError::InvariantViolation(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        self.begin(&definition, &run).await;
        self.drive(&definition, run, Some(from)).await.map(Some)
    }

    async fn check_sla(&self, run_id: &RunId) -> RunflowResult<()> {
        let run = self.get_run(run_id).await?;
        if run.is_terminal() {
            debug!(run_id = %run_id, state = %run.state, "SLA check on finished run");
            return Ok(());
        }
        warn!(run_id = %run_id, state = %run.state, deadline = ?run.sla_deadline, "Run SLA breached");
        self.lifecycle(
            &run,
            RUN_SLA_BREACHED,
            json!({
                "definitionCode": run.definition_code,
                "currentStep": run.current_step,
                "deadline": run.sla_deadline,
            }),
        );
        Ok(())
    }

    /// Enqueue a durable job, or fall back to an in-process timer when the
    /// queue is unavailable. Returns the job id when durable.
    async fn schedule(&self, payload: JobPayload, delay: Duration) -> Option<JobId> {
        if let Some(id) = self.queue.add_job(payload.clone(), Some(delay)).await {
            return Some(id);
        }

        debug!(
            run_id = %payload.instance_id,
            job_type = payload.job_type.as_str(),
            delay_ms = delay.as_millis() as u64,
            "Queue unavailable; using in-process timer"
        );
        let engine = self.clone();
        let job_id = JobId::deterministic(
            self.queue.deployment_id(),
            payload.job_type,
            &payload.instance_id,
            payload.node_id.as_ref(),
            Utc::now().timestamp_millis(),
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let job = ScheduledJob::new(job_id, payload, Utc::now());
            if let Err(err) = engine.process(&job).await {
                warn!(job_id = %job.id, error = %err, "In-process job failed");
            }
        });
        None
    }

    // ── Finishing ────────────────────────────────────────────────────

    async fn complete_run(&self, mut run: RunInstance) -> RunflowResult<RunInstance> {
        run.pending_approval = None;
        run.transition(RunState::Completed)?;
        if !self.persist(&run).await? {
            return self.get_run(&run.id).await;
        }
        info!(
            run_id = %run.id,
            definition = %run.definition_code,
            steps = run.execution_path.len(),
            "Run completed"
        );
        self.lifecycle(
            &run,
            RUN_COMPLETED,
            json!({
                "definitionCode": run.definition_code,
                "variables": run.context.variables,
                "stepOutputs": run.context.step_outputs,
            }),
        );
        self.settle(&run).await;
        Ok(run)
    }

    async fn fail_run(
        &self,
        mut run: RunInstance,
        message: String,
        step_id: Option<StepId>,
    ) -> RunflowResult<RunInstance> {
        run.fail(message.clone(), step_id.clone())?;
        if !self.persist(&run).await? {
            return self.get_run(&run.id).await;
        }
        warn!(
            run_id = %run.id,
            step_id = ?step_id.as_ref().map(|s| s.as_str()),
            error = %message,
            "Run failed"
        );
        let trace = run.error.as_ref().map(|e| e.trace.clone()).unwrap_or_default();
        self.lifecycle(
            &run,
            RUN_FAILED,
            json!({
                "definitionCode": run.definition_code,
                "error": message,
                "stepId": step_id,
                "trace": trace,
            }),
        );
        self.settle(&run).await;
        Ok(run)
    }

    /// Release per-run state and wake an awaiting parent
    async fn settle(&self, run: &RunInstance) {
        self.approval_locks.remove(&run.id);

        let Some(parent) = run.parent.as_ref().filter(|p| p.await_completion) else {
            return;
        };
        let data = Value::Object(run.context.variables.clone());
        match self
            .resume_with(&parent.run_id, &parent.step_id, data, Some(vec![run.state.as_str()]))
            .await
        {
            Ok(Some(parent_run)) => {
                debug!(run_id = %run.id, parent_run_id = %parent_run.id, "Parent run resumed")
            }
            Ok(None) => {}
            Err(err) => {
                warn!(run_id = %run.id, parent_run_id = %parent.run_id, error = %err, "Parent run not resumed")
            }
        }
    }

    /// Store the run; false when it was finished elsewhere (cancelled)
    async fn persist(&self, run: &RunInstance) -> RunflowResult<bool> {
        match self.runs.update_run(run).await {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict(reason)) => {
                info!(run_id = %run.id, reason = %reason, "Run finished elsewhere; stopping");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn lifecycle(&self, run: &RunInstance, topic: &str, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("runId".into(), json!(run.id));
            map.insert("state".into(), json!(run.state));
        }
        let event = Event::new(run.scope.clone(), topic)
            .with_payload(payload)
            .with_actor(run.context.triggered_by.clone());
        if let Err(err) = self.bus.emit(event) {
            debug!(topic, error = %err, "Lifecycle event dropped");
        }
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub async fn get_run(&self, run_id: &RunId) -> RunflowResult<RunInstance> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunflowError::RunNotFound(run_id.clone()))
    }

    pub async fn list_runs(&self, state: Option<RunState>) -> RunflowResult<Vec<RunInstance>> {
        Ok(self.runs.list_runs(state).await?)
    }

    /// Step records of a run in visit order
    pub async fn execution_records(&self, run_id: &RunId) -> RunflowResult<Vec<StepExecutionRecord>> {
        Ok(self.runs.records(run_id).await?)
    }

    // ── Expressions ──────────────────────────────────────────────────

    async fn evaluate(&self, expression: &str, run: &RunInstance) -> Result<Value, ScriptError> {
        self.sandbox
            .execute(expression, &script_context(run), ExecuteOptions::default())
            .await
            .into_result()
    }

    async fn resolve_collection(&self, expr: &str, run: &RunInstance) -> RunflowResult<Vec<Value>> {
        let value = match path::lookup(&run.context.scope(), expr) {
            Some(value) => value.clone(),
            None => self
                .evaluate(expr, run)
                .await
                .map_err(|e| RunflowError::StepFailed(format!("loop collection: {}", e)))?,
        };
        match value {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            _ => Err(RunflowError::StepFailed(format!(
                "loop collection '{}' is not an array",
                expr
            ))),
        }
    }

    async fn resolve_approvers(
        &self,
        config: &ApprovalConfig,
        run: &RunInstance,
    ) -> RunflowResult<Vec<String>> {
        let scope = run.context.scope();
        let mut approvers: Vec<String> = config
            .approvers
            .iter()
            .flat_map(|a| render_list(a, &scope))
            .collect();
        if let Some(expr) = &config.approvers_expression {
            let value = self
                .evaluate(expr, run)
                .await
                .map_err(|e| RunflowError::StepFailed(format!("approvers: {}", e)))?;
            match value {
                Value::Array(items) => approvers.extend(items.iter().map(path::display)),
                other => approvers.push(path::display(&other)),
            }
        }
        let mut seen = std::collections::HashSet::new();
        approvers.retain(|a| !a.is_empty() && seen.insert(a.clone()));
        Ok(approvers)
    }
}

#[async_trait]
impl JobProcessor for OrchestrationEngine {
    async fn process(&self, job: &ScheduledJob) -> Result<(), String> {
        match self.handle_job(job).await {
            Ok(()) => Ok(()),
            Err(RunflowError::RunNotFound(run_id)) => {
                warn!(job_id = %job.id, run_id = %run_id, "Job for unknown run dropped");
                Ok(())
            }
            Err(RunflowError::ValidationError(reason)) => {
                warn!(job_id = %job.id, reason = %reason, "Malformed job dropped");
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("config", &self.config)
            .field("definitions", &self.registry.count())
            .field("queue_enabled", &self.queue.is_enabled())
            .finish()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn script_context(run: &RunInstance) -> ScriptContext {
    let ctx = &run.context;
    let mut script = ScriptContext::new()
        .with_input(ctx.input.clone())
        .with_variables(Value::Object(ctx.variables.clone()))
        .with_step_outputs(Value::Object(ctx.step_outputs.clone()))
        .with_user(json!({ "id": ctx.triggered_by }));
    for name in ["item", "index"] {
        if let Some(value) = ctx.variables.get(name) {
            script = script.with_global(name, value.clone());
        }
    }
    script
}

fn job_step(payload: &JobPayload) -> RunflowResult<&StepId> {
    payload.node_id.as_ref().ok_or_else(|| {
        RunflowError::ValidationError(format!(
            "{} job for run {} has no step",
            payload.job_type.as_str(),
            payload.instance_id
        ))
    })
}

/// Whether `run` is waiting for an approval decision at `step_id`
fn awaits_approval(run: &RunInstance, step_id: &StepId) -> bool {
    run.state == RunState::WaitingApproval && run.current_step.as_ref() == Some(step_id)
}

/// Edge labels for a resume that carries an approval decision
fn resume_labels(step: &Step, data: &Value) -> Vec<&'static str> {
    if !matches!(step.kind, StepKind::Approval(_)) {
        return Vec::new();
    }
    let decision = if data.get("timedOut").and_then(Value::as_bool) == Some(true) {
        Some(ApprovalDecision::TimedOut)
    } else {
        data.get("approved").and_then(Value::as_bool).map(|approved| {
            if approved {
                ApprovalDecision::Approved
            } else {
                ApprovalDecision::Rejected
            }
        })
    };
    decision
        .map(|d| d.edge_labels().to_vec())
        .unwrap_or_default()
}

/// Write a variable by name; `variables.` prefix optional, dots nest
fn assign_variable(variables: &mut Map<String, Value>, name: &str, value: Value) {
    let name = name.strip_prefix("variables.").unwrap_or(name);
    let mut root = Value::Object(std::mem::take(variables));
    path::assign(&mut root, name, value);
    if let Value::Object(map) = root {
        *variables = map;
    }
}

/// Copy entries a branch changed relative to `base`
fn merge_changes(target: &mut Map<String, Value>, base: &Map<String, Value>, branch: Map<String, Value>) {
    for (key, value) in branch {
        if base.get(&key) != Some(&value) {
            target.insert(key, value);
        }
    }
}

/// `{{template}}` or a dotted path into the run scope
fn map_source(source: &str, scope: &Value) -> Value {
    if source.contains("{{") {
        path::render(source, scope)
    } else {
        path::lookup_or_null(scope, source)
    }
}

/// Render a template that names one or many values (recipients, approvers)
fn render_list(template: &str, scope: &Value) -> Vec<String> {
    let items = match path::render(template, scope) {
        Value::Array(items) => items.iter().map(path::display).collect(),
        Value::Null => Vec::new(),
        other => vec![path::display(&other)],
    };
    items.into_iter().filter(|s: &String| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use runflow_bus::handler_fn;

    fn make_engine() -> OrchestrationEngine {
        OrchestrationEngine::new(
            EngineConfig::default(),
            EventBus::new(),
            Arc::new(JobQueue::in_memory("test")),
            Sandbox::default(),
        )
    }

    fn linear(code: &str, body: Vec<Step>) -> RunDefinition {
        let mut definition = RunDefinition::new(code, Scope::platform());
        let first = body.first().map(|s| s.id.0.clone()).unwrap_or_else(|| "end".into());
        definition = definition.with_step(Step::start("start").then(first));
        let count = body.len();
        for (i, step) in body.into_iter().enumerate() {
            let next = if i + 1 < count { format!("s{}", i + 1) } else { "end".into() };
            definition = definition.with_step(step.then(next));
        }
        definition.with_step(Step::end("end"))
    }

    fn set(name: &str, expression: &str) -> Assignment {
        Assignment {
            name: name.into(),
            value: None,
            expression: Some(expression.into()),
        }
    }

    #[tokio::test]
    async fn test_set_variable_and_script_steps() {
        let engine = make_engine();
        engine
            .register_definition(linear(
                "calc",
                vec![
                    Step::new(
                        "s0",
                        StepKind::SetVariable {
                            assignments: vec![
                                set("total", "input.amount * 2"),
                                set("label", "`total=${variables.total}`"),
                            ],
                        },
                    ),
                    Step::new(
                        "s1",
                        StepKind::Script(ScriptConfig {
                            script: "setField('doubled', variables.total > 100); variables.total + 1"
                                .into(),
                            timeout_ms: None,
                            allow_http: false,
                            allow_data_query: false,
                        }),
                    ),
                ],
            ))
            .unwrap();

        let run = engine
            .start_run(&Scope::tenant("t1"), "calc", json!({"amount": 60}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.context.variables["total"], json!(120));
        assert_eq!(run.context.variables["label"], json!("total=120"));
        assert_eq!(run.context.variables["doubled"], json!(true));
        assert_eq!(run.context.step_outputs["s1"], json!(121));
    }

    #[tokio::test]
    async fn test_condition_field_check() {
        let engine = make_engine();
        engine
            .register_definition(
                RunDefinition::new("route", Scope::platform())
                    .with_step(Step::start("start").then("check"))
                    .with_step(
                        Step::new(
                            "check",
                            StepKind::Condition(ConditionCheck::Field {
                                field: "input.region".into(),
                                comparator: Comparator::Eq,
                                value: json!("eu"),
                            }),
                        )
                        .on("true", "eu")
                        .on("false", "end"),
                    )
                    .with_step(
                        Step::new(
                            "eu",
                            StepKind::SetVariable {
                                assignments: vec![Assignment {
                                    name: "vat".into(),
                                    value: Some(json!(true)),
                                    expression: None,
                                }],
                            },
                        )
                        .then("end"),
                    )
                    .with_step(Step::end("end")),
            )
            .unwrap();

        let eu = engine
            .start_run(&Scope::platform(), "route", json!({"region": "eu"}), None)
            .await
            .unwrap();
        assert_eq!(eu.context.variables.get("vat"), Some(&json!(true)));

        let us = engine
            .start_run(&Scope::platform(), "route", json!({"region": "us"}), None)
            .await
            .unwrap();
        assert_eq!(us.state, RunState::Completed);
        assert!(us.context.variables.get("vat").is_none());
        let visited: Vec<&str> = us.visited_steps().iter().map(|s| s.as_str()).collect();
        assert_eq!(visited, vec!["start", "check", "end"]);
    }

    #[tokio::test]
    async fn test_failing_condition_script_is_false() {
        let engine = make_engine();
        engine
            .register_definition(
                RunDefinition::new("broken", Scope::platform())
                    .with_step(Step::start("start").then("check"))
                    .with_step(
                        Step::new(
                            "check",
                            StepKind::Condition(ConditionCheck::Expression {
                                expression: "undefinedHelper(input) > 1".into(),
                            }),
                        )
                        .on("true", "yes")
                        .on("false", "end"),
                    )
                    .with_step(Step::new("yes", StepKind::SetVariable { assignments: vec![] }).then("end"))
                    .with_step(Step::end("end")),
            )
            .unwrap();

        let run = engine
            .start_run(&Scope::platform(), "broken", json!({}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.context.step_outputs["check"], json!({"result": false}));
    }

    #[tokio::test]
    async fn test_parallel_branches_merge() {
        let engine = make_engine();
        engine
            .register_definition(
                RunDefinition::new("fanout", Scope::platform())
                    .with_step(Step::start("start").then("split"))
                    .with_step(
                        Step::new(
                            "split",
                            StepKind::Parallel {
                                branches: vec![vec![StepId::new("a")], vec![StepId::new("b")]],
                            },
                        )
                        .then("end"),
                    )
                    .with_step(Step::new(
                        "a",
                        StepKind::SetVariable {
                            assignments: vec![set("left", "1")],
                        },
                    ))
                    .with_step(Step::new(
                        "b",
                        StepKind::SetVariable {
                            assignments: vec![set("right", "2")],
                        },
                    ))
                    .with_step(Step::end("end")),
            )
            .unwrap();

        let run = engine
            .start_run(&Scope::platform(), "fanout", json!({}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.context.variables["left"], json!(1));
        assert_eq!(run.context.variables["right"], json!(2));
        assert_eq!(
            run.context.step_outputs["split"]["branches"],
            json!([{"a": {"left": 1}}, {"b": {"right": 2}}])
        );
        let records = engine.execution_records(&run.id).await.unwrap();
        assert_eq!(records.len(), 5);
    }

    #[tokio::test]
    async fn test_loop_collects_iterations() {
        let engine = make_engine();
        engine
            .register_definition(
                RunDefinition::new("each", Scope::platform())
                    .with_step(Step::start("start").then("loop"))
                    .with_step(
                        Step::new(
                            "loop",
                            StepKind::Loop(LoopConfig {
                                collection: "input.items".into(),
                                body: vec![StepId::new("square")],
                                max_iterations: None,
                            }),
                        )
                        .then("end"),
                    )
                    .with_step(Step::new(
                        "square",
                        StepKind::SetVariable {
                            assignments: vec![set("last", "item * item + index")],
                        },
                    ))
                    .with_step(Step::end("end")),
            )
            .unwrap();

        let run = engine
            .start_run(&Scope::platform(), "each", json!({"items": [2, 3]}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.context.step_outputs["loop"]["count"], json!(2));
        assert_eq!(run.context.variables["last"], json!(10));
        assert!(run.context.variables.get("item").is_none());
    }

    #[tokio::test]
    async fn test_loop_limit() {
        let config = EngineConfig {
            max_loop_iterations: 2,
            ..EngineConfig::default()
        };
        let engine = OrchestrationEngine::new(
            config,
            EventBus::new(),
            Arc::new(JobQueue::in_memory("test")),
            Sandbox::default(),
        );
        engine
            .register_definition(
                RunDefinition::new("big", Scope::platform())
                    .with_step(Step::start("start").then("loop"))
                    .with_step(
                        Step::new(
                            "loop",
                            StepKind::Loop(LoopConfig {
                                collection: "input.items".into(),
                                body: vec![StepId::new("noop")],
                                max_iterations: None,
                            }),
                        )
                        .then("end"),
                    )
                    .with_step(Step::new("noop", StepKind::SetVariable { assignments: vec![] }))
                    .with_step(Step::end("end")),
            )
            .unwrap();

        let run = engine
            .start_run(&Scope::platform(), "big", json!({"items": [1, 2, 3]}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Failed);
        let error = run.error.unwrap();
        assert!(error.message.contains("exceeds the limit of 2"));
        assert_eq!(error.step_id, Some(StepId::new("loop")));
    }

    #[tokio::test]
    async fn test_error_edge_recovers() {
        let engine = make_engine();
        engine
            .register_definition(
                RunDefinition::new("guarded", Scope::platform())
                    .with_step(Step::start("start").then("risky"))
                    .with_step(
                        Step::new(
                            "risky",
                            StepKind::Script(ScriptConfig {
                                script: "abort('no stock')".into(),
                                timeout_ms: None,
                                allow_http: false,
                                allow_data_query: false,
                            }),
                        )
                        .then("end")
                        .on_error("recover"),
                    )
                    .with_step(
                        Step::new(
                            "recover",
                            StepKind::SetVariable {
                                assignments: vec![set("recovered", "true")],
                            },
                        )
                        .then("end"),
                    )
                    .with_step(Step::end("end")),
            )
            .unwrap();

        let run = engine
            .start_run(&Scope::platform(), "guarded", json!({}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.context.variables["recovered"], json!(true));
        assert_eq!(run.context.step_outputs["risky"]["error"], json!("Step failed: no stock"));

        let records = engine.execution_records(&run.id).await.unwrap();
        let risky = records.iter().find(|r| r.step_id.as_str() == "risky").unwrap();
        assert_eq!(risky.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_unanswered_action_fails_run() {
        let engine = make_engine();
        let mut failures = engine.bus().tap();
        engine
            .register_definition(linear(
                "act",
                vec![Step::new(
                    "s0",
                    StepKind::Action(ActionConfig {
                        action_type: "erp.sync".into(),
                        config: json!({}),
                        timeout_ms: Some(50),
                    }),
                )],
            ))
            .unwrap();

        let run = engine
            .start_run(&Scope::platform(), "act", json!({}), Some("u1".into()))
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Failed);
        let error = run.error.as_ref().unwrap();
        assert!(error.message.contains("workflow.action"));
        assert_eq!(error.trace, vec!["start".to_string(), "s0".to_string()]);

        loop {
            let event = failures.recv().await.unwrap();
            if event.event_type == RUN_FAILED {
                assert_eq!(event.payload["runId"], json!(run.id));
                assert_eq!(event.actor.as_deref(), Some("u1"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_action_uses_capability_reply() {
        let engine = make_engine();
        engine
            .bus()
            .subscribe(
                Scope::platform(),
                capability::WORKFLOW_ACTION,
                handler_fn(|event: Event| async move {
                    let action = event.payload["actionType"].clone();
                    event.reply(Ok(json!({"ok": true, "action": action})));
                    Ok(())
                }),
            )
            .unwrap();
        engine
            .register_definition(linear(
                "act",
                vec![Step::new(
                    "s0",
                    StepKind::Action(ActionConfig {
                        action_type: "erp.sync".into(),
                        config: json!({"order": "{{input.order}}"}),
                        timeout_ms: None,
                    }),
                )],
            ))
            .unwrap();

        let run = engine
            .start_run(&Scope::tenant("t1"), "act", json!({"order": 7}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.context.step_outputs["s0"], json!({"ok": true, "action": "erp.sync"}));
    }

    #[tokio::test]
    async fn test_cancel_waiting_run() {
        let engine = make_engine();
        engine
            .register_definition(linear(
                "slow",
                vec![Step::new(
                    "s0",
                    StepKind::Wait(WaitConfig {
                        amount: 1,
                        unit: DurationUnit::Hours,
                    }),
                )],
            ))
            .unwrap();

        let run = engine
            .start_run(&Scope::platform(), "slow", json!({}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::WaitingCondition);
        assert_eq!(engine.queue().stats().await.unwrap().delayed, 1);

        let cancelled = engine.cancel_run(&run.id).await.unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert_eq!(engine.queue().stats().await.unwrap().delayed, 0);

        let records = engine.execution_records(&run.id).await.unwrap();
        assert!(records.iter().all(|r| r.status != StepStatus::Waiting));

        let again = engine.cancel_run(&run.id).await;
        assert!(matches!(again, Err(RunflowError::InvalidTransition { .. })));
        let resumed = engine
            .resume_run(&run.id, &StepId::new("s0"), Value::Null)
            .await
            .unwrap();
        assert!(resumed.is_none());
    }

    #[tokio::test]
    async fn test_stray_approval_responses_leave_no_lock() {
        let engine = make_engine();
        engine.register_definition(linear("quick", vec![])).unwrap();
        let step = StepId::new("approve");

        let missing = engine
            .submit_approval(&RunId::new("no-such-run"), &step, "mgr1", true, None)
            .await;
        assert!(matches!(missing, Err(RunflowError::RunNotFound(_))));

        let run = engine
            .start_run(&Scope::platform(), "quick", json!({}), None)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        let ignored = engine
            .submit_approval(&run.id, &step, "mgr1", true, None)
            .await
            .unwrap();
        assert!(ignored.is_none());
        assert!(engine.approval_locks.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_definition_code() {
        let engine = make_engine();
        let result = engine
            .start_run(&Scope::tenant("t1"), "missing", json!({}), None)
            .await;
        assert!(matches!(result, Err(RunflowError::DefinitionCodeNotFound { .. })));
    }

    #[test]
    fn test_render_list_flattens_arrays() {
        let scope = json!({"input": {"owners": ["a", "", "b"], "one": "c"}});
        assert_eq!(render_list("{{input.owners}}", &scope), vec!["a", "b"]);
        assert_eq!(render_list("{{input.one}}", &scope), vec!["c"]);
        assert!(render_list("{{input.none}}", &scope).is_empty());
    }

    #[test]
    fn test_resume_labels() {
        let approval = Step::new("a", StepKind::Approval(ApprovalConfig::default()));
        assert_eq!(
            resume_labels(&approval, &json!({"approved": true})),
            vec!["approved", "true"]
        );
        assert_eq!(
            resume_labels(&approval, &json!({"approved": false, "timedOut": true})),
            vec!["timeout", "rejected", "false"]
        );
        let wait = Step::new("w", StepKind::Wait(WaitConfig::millis(0)));
        assert!(resume_labels(&wait, &json!({"approved": true})).is_empty());
    }
}
