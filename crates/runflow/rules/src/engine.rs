//! Rule chain execution

use crate::context::{RuleContext, RuleExecutionResult, RuleOutcome};
use crate::errors::{RuleError, RuleResult};
use crate::expression;
use crate::store::RuleStore;
use regex::RegexBuilder;
use runflow_bus::{handler_fn, BusError, Event, EventBus, SubscriptionId};
use runflow_script::{value::truthy, ExecuteOptions, Sandbox, ScriptContext};
use runflow_types::{
    path, BusinessRule, CheckKind, ErrorPolicy, FieldMapping, MappingSource, RuleAction,
    RuleCondition, RuleTrigger, Scope, ScopeResolver, TenantThenPlatform, ValidationCheck,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// What an action asks the chain to do next
enum ActionEffect {
    Continue { modifications: Map<String, Value> },
    Abort {
        modifications: Map<String, Value>,
        message: String,
    },
}

/// Evaluates business rules against record mutations.
///
/// Rules run strictly in ascending priority. `set_value` modifications are
/// merged into the working record before the next rule's condition is
/// evaluated. Orchestration, notification and external-call actions are
/// published on the bus rather than performed here.
#[derive(Clone)]
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    sandbox: Sandbox,
    bus: EventBus,
    resolver: Arc<dyn ScopeResolver>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>, sandbox: Sandbox, bus: EventBus) -> Self {
        Self {
            store,
            sandbox,
            bus,
            resolver: Arc::new(TenantThenPlatform),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ScopeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    /// Check a rule's scripts and patterns, then store it
    pub async fn register(&self, rule: BusinessRule) -> RuleResult<()> {
        self.validate_rule(&rule)?;
        self.store.upsert_rule(rule).await?;
        Ok(())
    }

    /// Authoring-time validation: scripts parse and patterns compile
    pub fn validate_rule(&self, rule: &BusinessRule) -> RuleResult<()> {
        let invalid = |reason: String| RuleError::InvalidRule {
            rule: rule.name.clone(),
            reason,
        };
        if let RuleCondition::Script { script } = &rule.condition {
            self.sandbox
                .validate(script)
                .map_err(|e| invalid(format!("condition script: {}", e)))?;
        }
        match &rule.action {
            RuleAction::Script { script } => self
                .sandbox
                .validate(script)
                .map_err(|e| invalid(format!("action script: {}", e)))?,
            RuleAction::SetValue { mappings } => {
                for mapping in mappings {
                    if let MappingSource::Script { script } = &mapping.source {
                        self.sandbox
                            .validate(script)
                            .map_err(|e| invalid(format!("mapping '{}': {}", mapping.field, e)))?;
                    }
                }
            }
            RuleAction::Validate { checks } => {
                for check in checks {
                    match &check.kind {
                        CheckKind::Script { script } => self
                            .sandbox
                            .validate(script)
                            .map_err(|e| invalid(format!("check '{}': {}", check.field, e)))?,
                        CheckKind::Regex { pattern } => {
                            build_regex(pattern)
                                .map_err(|e| invalid(format!("check '{}': {}", check.field, e)))?;
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Run the applicable rule chain for one record mutation
    pub async fn execute_rules(&self, ctx: &RuleContext) -> RuleResult<RuleExecutionResult> {
        let rules = self
            .store
            .applicable_rules(&ctx.scope, &ctx.collection, ctx.trigger, self.resolver.as_ref())
            .await?;
        let mut result = RuleExecutionResult::new(ctx.record.clone());
        let mut changed = ctx.changed_fields();

        debug!(
            collection = %ctx.collection,
            trigger = %ctx.trigger,
            scope = %ctx.scope,
            rules = rules.len(),
            "Executing rule chain"
        );

        for rule in &rules {
            if !self.condition_holds(rule, ctx, &result.record, &changed).await {
                result.results.push(RuleOutcome {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    executed: false,
                    success: true,
                    modifications: Map::new(),
                    message: None,
                    error: None,
                });
                continue;
            }

            match self.execute_action(rule, ctx, &result.record, &changed).await {
                Ok(ActionEffect::Continue { modifications }) => {
                    apply(&mut result.record, &mut changed, &modifications);
                    result.results.push(RuleOutcome {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        executed: true,
                        success: true,
                        modifications,
                        message: None,
                        error: None,
                    });
                }
                Ok(ActionEffect::Abort {
                    modifications,
                    message,
                }) => {
                    apply(&mut result.record, &mut changed, &modifications);
                    info!(rule = %rule.name, message = %message, "Rule chain aborted");
                    result.results.push(RuleOutcome {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        executed: true,
                        success: false,
                        modifications,
                        message: Some(message.clone()),
                        error: None,
                    });
                    result.abort(message);
                    break;
                }
                Err(err) => {
                    let error = err.to_string();
                    result.results.push(RuleOutcome {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        executed: true,
                        success: false,
                        modifications: Map::new(),
                        message: None,
                        error: Some(error.clone()),
                    });
                    match rule.on_error {
                        ErrorPolicy::AbortChain => {
                            warn!(rule = %rule.name, error = %error, "Rule action failed, aborting chain");
                            result.abort(format!("Rule '{}' failed: {}", rule.name, error));
                            break;
                        }
                        ErrorPolicy::NotifyAdmin => {
                            warn!(rule = %rule.name, error = %error, "Rule action failed, notifying admin");
                            self.report_rule_error(rule, ctx, &error);
                        }
                        ErrorPolicy::LogAndContinue => {
                            warn!(rule = %rule.name, error = %error, "Rule action failed, continuing");
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    /// Condition failures are logged and count as false
    async fn condition_holds(
        &self,
        rule: &BusinessRule,
        ctx: &RuleContext,
        record: &Value,
        changed: &[String],
    ) -> bool {
        match &rule.condition {
            RuleCondition::Always => true,
            RuleCondition::FieldChanged { fields } => fields.iter().any(|f| changed.contains(f)),
            RuleCondition::Expression { tree } => {
                expression::evaluate(tree, record, ctx.previous.as_ref())
            }
            RuleCondition::Script { script } => {
                let outcome = self
                    .sandbox
                    .execute(script, &ctx.script_context(record, changed), ExecuteOptions::default())
                    .await;
                match outcome.into_result() {
                    Ok(value) => truthy(&value),
                    Err(err) => {
                        warn!(rule = %rule.name, error = %err, "Rule condition failed, treating as false");
                        false
                    }
                }
            }
        }
    }

    async fn execute_action(
        &self,
        rule: &BusinessRule,
        ctx: &RuleContext,
        record: &Value,
        changed: &[String],
    ) -> RuleResult<ActionEffect> {
        let scope = ctx.template_scope(record);
        match &rule.action {
            RuleAction::SetValue { mappings } => {
                let modifications = self.resolve_mappings(mappings, ctx, record, changed).await?;
                Ok(ActionEffect::Continue { modifications })
            }
            RuleAction::Validate { checks } => {
                for check in checks {
                    if let Some(message) = self.run_check(check, ctx, record, changed).await? {
                        return Ok(ActionEffect::Abort {
                            modifications: Map::new(),
                            message,
                        });
                    }
                }
                Ok(ActionEffect::Continue {
                    modifications: Map::new(),
                })
            }
            RuleAction::Abort { message } => Ok(ActionEffect::Abort {
                modifications: Map::new(),
                message: path::render_string(message, &scope),
            }),
            RuleAction::Script { script } => {
                let outcome = self
                    .sandbox
                    .execute(script, &ctx.script_context(record, changed), ExecuteOptions::default())
                    .await;
                if let Some(err) = outcome.error {
                    return Err(err.into());
                }
                let modifications = outcome.markers.set_fields;
                match outcome.markers.abort {
                    Some(message) => Ok(ActionEffect::Abort {
                        modifications,
                        message,
                    }),
                    None => Ok(ActionEffect::Continue { modifications }),
                }
            }
            RuleAction::StartOrchestration {
                definition_code,
                input_mapping,
            } => {
                let input = if input_mapping.is_empty() {
                    record.clone()
                } else {
                    let mut input = Value::Object(Map::new());
                    for (target, source) in input_mapping {
                        path::assign(&mut input, target, map_source(source, &scope));
                    }
                    input
                };
                self.emit(
                    ctx,
                    "workflow.start",
                    json!({
                        "definitionCode": definition_code,
                        "input": input,
                        "triggeredBy": ctx.actor(),
                        "ruleId": rule.id,
                    }),
                )?;
                Ok(ActionEffect::Continue {
                    modifications: Map::new(),
                })
            }
            RuleAction::Notify {
                template_code,
                recipients,
                data,
            } => {
                let recipients: Vec<String> = recipients
                    .iter()
                    .map(|r| path::render_string(r, &scope))
                    .filter(|r| !r.is_empty())
                    .collect();
                self.emit(
                    ctx,
                    "notification.send",
                    json!({
                        "templateCode": template_code,
                        "recipients": recipients,
                        "data": path::render_value(data, &scope),
                    }),
                )?;
                Ok(ActionEffect::Continue {
                    modifications: Map::new(),
                })
            }
            RuleAction::ExternalCall {
                url,
                method,
                headers,
                body,
            } => {
                let body = body
                    .as_ref()
                    .map(|b| path::render_value(b, &scope))
                    .unwrap_or_else(|| record.clone());
                self.emit(
                    ctx,
                    "http.request",
                    json!({
                        "url": path::render_string(url, &scope),
                        "method": method,
                        "headers": headers,
                        "body": body,
                    }),
                )?;
                Ok(ActionEffect::Continue {
                    modifications: Map::new(),
                })
            }
        }
    }

    async fn resolve_mappings(
        &self,
        mappings: &[FieldMapping],
        ctx: &RuleContext,
        record: &Value,
        changed: &[String],
    ) -> RuleResult<Map<String, Value>> {
        let mut working = record.clone();
        let mut modifications = Map::new();
        for mapping in mappings {
            let value = match &mapping.source {
                MappingSource::Literal { value } => value.clone(),
                MappingSource::Field { path: source } => path::lookup_or_null(&working, source),
                MappingSource::Template { template } => {
                    path::render(template, &ctx.template_scope(&working))
                }
                MappingSource::Script { script } => {
                    self.sandbox
                        .execute(
                            script,
                            &ctx.script_context(&working, changed),
                            ExecuteOptions::default(),
                        )
                        .await
                        .into_result()?
                }
            };
            path::assign(&mut working, &mapping.field, value.clone());
            modifications.insert(mapping.field.clone(), value);
        }
        Ok(modifications)
    }

    /// `Some(message)` when the check fails
    async fn run_check(
        &self,
        check: &ValidationCheck,
        ctx: &RuleContext,
        record: &Value,
        changed: &[String],
    ) -> RuleResult<Option<String>> {
        let value = path::lookup_or_null(record, &check.field);
        let present = !is_blank(&value);
        let (passed, default_message) = match &check.kind {
            CheckKind::Required => (present, format!("{} is required", check.field)),
            CheckKind::Email => (
                !present || value.as_str().map(looks_like_email).unwrap_or(false),
                format!("{} must be a valid email address", check.field),
            ),
            CheckKind::Regex { pattern } => {
                let regex = build_regex(pattern).map_err(|e| RuleError::InvalidRule {
                    rule: check.field.clone(),
                    reason: e,
                })?;
                (
                    !present || regex.is_match(&path::display(&value)),
                    format!("{} has an invalid format", check.field),
                )
            }
            CheckKind::Min { value: min } => (
                !present || as_number(&value).map(|n| n >= *min).unwrap_or(false),
                format!("{} must be at least {}", check.field, min),
            ),
            CheckKind::Max { value: max } => (
                !present || as_number(&value).map(|n| n <= *max).unwrap_or(false),
                format!("{} must be at most {}", check.field, max),
            ),
            CheckKind::Script { script } => {
                let context: ScriptContext = ctx
                    .script_context(record, changed)
                    .with_global("value", value.clone());
                let result = self
                    .sandbox
                    .execute(script, &context, ExecuteOptions::default())
                    .await
                    .into_result()?;
                (truthy(&result), format!("{} is invalid", check.field))
            }
        };
        Ok((!passed).then(|| check.message.clone().unwrap_or(default_message)))
    }

    fn emit(&self, ctx: &RuleContext, topic: &str, payload: Value) -> Result<(), BusError> {
        self.bus.emit(
            Event::new(ctx.scope.clone(), topic)
                .with_collection(ctx.collection.clone())
                .with_actor(ctx.actor())
                .with_payload(payload),
        )
    }

    fn report_rule_error(&self, rule: &BusinessRule, ctx: &RuleContext, error: &str) {
        let published = self.emit(
            ctx,
            "rule.error",
            json!({
                "ruleId": rule.id,
                "ruleName": rule.name,
                "collection": ctx.collection,
                "trigger": ctx.trigger,
                "error": error,
            }),
        );
        if let Err(err) = published {
            warn!(rule = %rule.name, error = %err, "Could not publish rule.error");
        }
    }

    /// Run rules for `record.<trigger>` events published on the bus.
    ///
    /// The event payload is a [`RuleContext`] body (`record`, `previous`,
    /// `user`); scope and collection come from the event. If the event
    /// expects a reply, the [`RuleExecutionResult`] is sent back.
    pub fn listen(&self) -> Result<SubscriptionId, BusError> {
        let engine = self.clone();
        self.bus.subscribe(
            Scope::platform(),
            "record.*",
            handler_fn(move |event: Event| {
                let engine = engine.clone();
                async move { engine.on_record_event(event).await }
            }),
        )
    }

    async fn on_record_event(&self, event: Event) -> Result<(), BusError> {
        let trigger_name = event.event_type.trim_start_matches("record.");
        let trigger: RuleTrigger = match serde_json::from_value(json!(trigger_name)) {
            Ok(trigger) => trigger,
            Err(_) => return Ok(()),
        };
        let Some(collection) = event.collection.clone() else {
            return Err(BusError::handler("record event without a collection"));
        };
        let mut ctx = RuleContext::new(
            event.scope.clone(),
            collection,
            trigger,
            event.payload.get("record").cloned().unwrap_or(Value::Null),
        );
        ctx.previous = event.payload.get("previous").cloned().filter(|p| !p.is_null());
        ctx.user = event.payload.get("user").cloned().unwrap_or(Value::Null);

        let reply = match self.execute_rules(&ctx).await {
            Ok(result) => serde_json::to_value(&result).map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };
        let failed = reply.as_ref().err().cloned();
        event.reply(reply);
        match failed {
            Some(err) => Err(BusError::handler(err)),
            None => Ok(()),
        }
    }
}

fn apply(record: &mut Value, changed: &mut Vec<String>, modifications: &Map<String, Value>) {
    for (field, value) in modifications {
        path::assign(record, field, value.clone());
        if !changed.contains(field) {
            changed.push(field.clone());
        }
    }
}

/// A mapping source is a `{{template}}`, a path rooted at one of the scope
/// keys (`record.`, `previous.`, `user.`), or a path into the record
fn map_source(source: &str, scope: &Value) -> Value {
    if source.contains("{{") {
        return path::render(source, scope);
    }
    let rooted = path::segments(source)
        .first()
        .map(|head| matches!(head.as_str(), "record" | "previous" | "user" | "collection"))
        .unwrap_or(false);
    if rooted {
        path::lookup_or_null(scope, source)
    } else {
        path::lookup_or_null(&scope["record"], source)
    }
}

fn build_regex(pattern: &str) -> Result<regex::Regex, String> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| e.to_string())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !s.chars().any(char::is_whitespace)
                && domain.split('.').filter(|p| !p.is_empty()).count() >= 2
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        }
        None => false,
    }
}
