//! Sandbox entry points: validate, execute and evaluate scripts

use crate::context::ScriptContext;
use crate::errors::{ScriptError, ScriptErrorKind, ScriptResult};
use crate::host::{Capabilities, HostBridge};
use crate::interpreter::{Halt, Interpreter, Limits};
use crate::parser::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Slack given to the blocking task beyond the script's own deadline
const GUARD_MARGIN_MS: u64 = 250;

/// Sandbox limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_steps: u64,
    pub max_log_entries: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
            max_steps: 50_000_000,
            max_log_entries: 100,
        }
    }
}

/// Per-execution options
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Requested timeout; clamped to the configured maximum
    pub timeout_ms: Option<u64>,
    pub capabilities: Capabilities,
    pub host: Option<Arc<dyn HostBridge>>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn HostBridge>) -> Self {
        self.host = Some(host);
        self
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("timeout_ms", &self.timeout_ms)
            .field("capabilities", &self.capabilities)
            .field("host", &self.host.is_some())
            .finish()
    }
}

/// Side effects a script asks the caller to apply
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptMarkers {
    /// `setField(name, value)` calls, in order
    #[serde(default)]
    pub set_fields: Map<String, Value>,
    /// Message passed to `abort(...)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<String>,
}

impl ScriptMarkers {
    pub fn is_empty(&self) -> bool {
        self.set_fields.is_empty() && self.abort.is_none()
    }
}

/// Result of executing a script
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutcome {
    pub success: bool,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptError>,
    #[serde(default)]
    pub logs: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub markers: ScriptMarkers,
}

impl ScriptOutcome {
    fn failure(error: ScriptError, logs: Vec<String>, started: Instant) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error),
            logs,
            duration_ms: started.elapsed().as_millis() as u64,
            markers: ScriptMarkers::default(),
        }
    }

    /// The result value, or the script error
    pub fn into_result(self) -> ScriptResult<Value> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

/// Least-privilege, time-boxed script runner.
///
/// Scripts see a read-only snapshot of their context and a fixed set of
/// helpers. Network and data access exist only as capabilities granted per
/// execution and routed through a [`HostBridge`].
#[derive(Clone, Debug, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Check that a script parses
    pub fn validate(&self, script: &str) -> ScriptResult<()> {
        Parser::parse(script).map(|_| ())
    }

    /// Requested timeout, defaulted and clamped to the configured maximum
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.config.default_timeout_ms)
            .clamp(1, self.config.max_timeout_ms.max(1));
        Duration::from_millis(ms)
    }

    /// Run a script on the current thread
    pub fn execute_sync(
        &self,
        script: &str,
        context: &ScriptContext,
        options: &ExecuteOptions,
    ) -> ScriptOutcome {
        let started = Instant::now();
        let program = match Parser::parse(script) {
            Ok(program) => program,
            Err(err) => return ScriptOutcome::failure(err, Vec::new(), started),
        };

        let limits = Limits {
            timeout: self.effective_timeout(options.timeout_ms),
            max_steps: self.config.max_steps,
            max_logs: self.config.max_log_entries,
        };
        let mut interpreter = Interpreter::new(
            context.to_globals(),
            limits,
            options.capabilities,
            options.host.as_deref(),
        );
        let result = interpreter.run(&program);
        let logs = std::mem::take(&mut interpreter.logs);
        let set_fields = std::mem::take(&mut interpreter.set_fields);
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                debug!(duration_ms, "Script completed");
                ScriptOutcome {
                    success: true,
                    result: value,
                    error: None,
                    logs,
                    duration_ms,
                    markers: ScriptMarkers {
                        set_fields,
                        abort: None,
                    },
                }
            }
            Err(Halt::Abort(message)) => {
                debug!(duration_ms, message = %message, "Script requested abort");
                ScriptOutcome {
                    success: true,
                    result: Value::Null,
                    error: None,
                    logs,
                    duration_ms,
                    markers: ScriptMarkers {
                        set_fields,
                        abort: Some(message),
                    },
                }
            }
            Err(Halt::Error(err)) => {
                if matches!(err.kind, ScriptErrorKind::Timeout | ScriptErrorKind::Limit) {
                    warn!(duration_ms, error = %err, "Script stopped by sandbox limits");
                } else {
                    debug!(duration_ms, error = %err, "Script failed");
                }
                ScriptOutcome::failure(err, logs, started)
            }
        }
    }

    /// Run a script on the blocking pool so a slow script never stalls the
    /// async runtime
    pub async fn execute(
        &self,
        script: &str,
        context: &ScriptContext,
        options: ExecuteOptions,
    ) -> ScriptOutcome {
        let started = Instant::now();
        let timeout = self.effective_timeout(options.timeout_ms);
        let sandbox = self.clone();
        let script = script.to_string();
        let context = context.clone();
        let handle = tokio::task::spawn_blocking(move || {
            sandbox.execute_sync(&script, &context, &options)
        });

        match tokio::time::timeout(timeout + Duration::from_millis(GUARD_MARGIN_MS), handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "Script task failed");
                ScriptOutcome::failure(
                    ScriptError::runtime("script execution aborted unexpectedly"),
                    Vec::new(),
                    started,
                )
            }
            Err(_) => ScriptOutcome::failure(
                ScriptError::timeout(timeout.as_millis() as u64),
                Vec::new(),
                started,
            ),
        }
    }

    /// Evaluate a single expression (or short script) with no capabilities
    pub fn evaluate(&self, expression: &str, context: &ScriptContext) -> ScriptResult<Value> {
        let outcome = self.execute_sync(expression, context, &ExecuteOptions::default());
        if let Some(message) = outcome.markers.abort {
            return Err(ScriptError::runtime(format!("abort is not allowed here: {}", message)));
        }
        outcome.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn run(script: &str, ctx: &ScriptContext) -> ScriptOutcome {
        Sandbox::default().execute_sync(script, ctx, &ExecuteOptions::default())
    }

    fn eval(script: &str) -> Value {
        run(script, &ScriptContext::default())
            .into_result()
            .unwrap()
    }

    struct EchoHost;

    impl HostBridge for EchoHost {
        fn http_request(&self, request: Value, _timeout: Duration) -> Result<Value, String> {
            Ok(json!({"status": 200, "echo": request}))
        }

        fn data_query(&self, collection: &str, query: Value, _timeout: Duration) -> Result<Value, String> {
            Ok(json!([{"collection": collection, "query": query}]))
        }
    }

    #[test]
    fn test_arithmetic_and_last_expression() {
        assert_eq!(eval("let a = 2; let b = 3; a * b + 1"), json!(7));
        assert_eq!(eval("'n=' + 5"), json!("n=5"));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("return 4; 5"), json!(4));
    }

    #[test]
    fn test_context_globals() {
        let ctx = ScriptContext::new()
            .with_record(json!({"amount": 5000, "customer": {"name": "Ada"}}))
            .with_previous(Some(json!({"amount": 100})))
            .with_changed_fields(vec!["amount".into()]);
        let outcome = run(
            "record.amount > 1000 && changed('amount') && previousValue('amount') === 100 && record.customer.name === 'Ada'",
            &ctx,
        );
        assert_eq!(outcome.into_result().unwrap(), json!(true));
    }

    #[test]
    fn test_context_is_read_only() {
        let ctx = ScriptContext::new().with_record(json!({"amount": 1}));
        let outcome = run("record.amount = 2", &ctx);
        assert_eq!(outcome.error.unwrap().kind, ScriptErrorKind::Type);
    }

    #[test]
    fn test_undeclared_global_is_reference_error() {
        let outcome = run("require('fs').readFileSync('/etc/passwd')", &ScriptContext::default());
        let err = outcome.error.unwrap();
        assert_eq!(err.kind, ScriptErrorKind::Reference);
        assert_eq!(err.message, "require is not defined");

        let err = run("process.env.SECRET", &ScriptContext::default()).error.unwrap();
        assert_eq!(err.kind, ScriptErrorKind::Reference);
        assert_eq!(eval("typeof process"), json!("undefined"));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let sandbox = Sandbox::default();
        let started = Instant::now();
        let outcome = sandbox.execute_sync(
            "while (true) {}",
            &ScriptContext::default(),
            &ExecuteOptions::new().with_timeout_ms(Some(100)),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().kind, ScriptErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_step_budget() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_steps: 1_000,
            ..SandboxConfig::default()
        });
        let outcome = sandbox.execute_sync(
            "let i = 0; while (i < 1000000) { i += 1 }",
            &ScriptContext::default(),
            &ExecuteOptions::default(),
        );
        assert_eq!(outcome.error.unwrap().kind, ScriptErrorKind::Limit);
    }

    #[test]
    fn test_array_growth_is_limited() {
        let sandbox = Sandbox::default();
        let started = Instant::now();
        let outcome = sandbox.execute_sync(
            "let a = [1]; let i = 0; while (i < 24) { a = a.concat(a); i = i + 1; } a.length",
            &ScriptContext::default(),
            &ExecuteOptions::new().with_timeout_ms(Some(1_000)),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().kind, ScriptErrorKind::Limit);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_nested_growth_is_limited() {
        for script in [
            "let a = [1]; let i = 0; while (i < 24) { a = [a, a]; i = i + 1; } 1",
            "let a = [1]; let i = 0; while (i < 24) { a = {x: a, y: a}; i = i + 1; } 1",
            "let a = []; let i = 0; while (i < 200000) { a.push(i); i = i + 1; } 1",
            "let a = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]; let i = 0; while (i < 5) { a = a.map(x => a); i = i + 1; } 1",
        ] {
            let outcome = run(script, &ScriptContext::default());
            assert_eq!(
                outcome.error.map(|e| e.kind),
                Some(ScriptErrorKind::Limit),
                "{}",
                script
            );
        }
    }

    #[test]
    fn test_bulk_work_spends_step_budget() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_steps: 50_000,
            ..SandboxConfig::default()
        });
        let outcome = sandbox.execute_sync(
            "let a = []; let i = 0; while (i < 1000) { a.push(i); i = i + 1; } \
             let n = 0; while (n < 1000) { a = a.concat([]); n = n + 1; } a.length",
            &ScriptContext::default(),
            &ExecuteOptions::default(),
        );
        assert_eq!(outcome.error.unwrap().kind, ScriptErrorKind::Limit);

        let small = sandbox.execute_sync(
            "[1, 2, 3].concat([4], 5).length",
            &ScriptContext::default(),
            &ExecuteOptions::default(),
        );
        assert_eq!(small.result, json!(5));
    }

    #[test]
    fn test_timeout_is_clamped() {
        let sandbox = Sandbox::default();
        assert_eq!(sandbox.effective_timeout(None), Duration::from_millis(5_000));
        assert_eq!(sandbox.effective_timeout(Some(999_999)), Duration::from_millis(30_000));
    }

    #[test]
    fn test_capabilities_denied_by_default() {
        let outcome = run("http.get('https://example.com')", &ScriptContext::default());
        let err = outcome.error.unwrap();
        assert_eq!(err.kind, ScriptErrorKind::Permission);

        let err = run("data.query('users', {})", &ScriptContext::default()).error.unwrap();
        assert_eq!(err.kind, ScriptErrorKind::Permission);
    }

    #[test]
    fn test_capabilities_granted_route_through_host() {
        let options = ExecuteOptions::new()
            .with_capabilities(Capabilities::none().with_http(true).with_data_query(true))
            .with_host(Arc::new(EchoHost));
        let sandbox = Sandbox::default();
        let ctx = ScriptContext::default();

        let outcome = sandbox.execute_sync("http.get('https://example.com').status", &ctx, &options);
        assert_eq!(outcome.into_result().unwrap(), json!(200));

        let outcome = sandbox.execute_sync("data.query('users', {active: true})[0].collection", &ctx, &options);
        assert_eq!(outcome.into_result().unwrap(), json!("users"));
    }

    #[test]
    fn test_markers() {
        let outcome = run("setField('status', 'flagged'); abort('too large')", &ScriptContext::default());
        assert!(outcome.success);
        assert_eq!(outcome.markers.set_fields["status"], json!("flagged"));
        assert_eq!(outcome.markers.abort.as_deref(), Some("too large"));
    }

    #[test]
    fn test_logs_are_captured_and_capped() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_log_entries: 3,
            ..SandboxConfig::default()
        });
        let outcome = sandbox.execute_sync(
            "for (const i of [1, 2, 3, 4, 5]) { console.log('item', i) }",
            &ScriptContext::default(),
            &ExecuteOptions::default(),
        );
        assert_eq!(outcome.logs.len(), 4);
        assert_eq!(outcome.logs[0], "item 1");
        assert_eq!(outcome.logs[3], "... log output truncated");
    }

    #[test]
    fn test_array_callbacks() {
        assert_eq!(eval("[1, 2, 3].map(x => x * 2)"), json!([2, 4, 6]));
        assert_eq!(eval("[1, 2, 3, 4].filter(x => x % 2 === 0).length"), json!(2));
        assert_eq!(eval("[1, 2, 3].reduce((acc, x) => acc + x, 10)"), json!(16));
        assert_eq!(eval("[{id: 1}, {id: 2}].find(r => r.id === 2).id"), json!(2));
        assert_eq!(eval("let out = []; for (const x of [3, 1, 2]) { out.push(x) } out.sort()"), json!([1, 2, 3]));
    }

    #[test]
    fn test_string_helpers_and_templates() {
        assert_eq!(eval("'  Hello '.trim().toUpperCase()"), json!("HELLO"));
        assert_eq!(eval("let n = 'Ada'; `hi ${n}, ${1 + 1}`"), json!("hi Ada, 2"));
        assert_eq!(eval("'a,b,c'.split(',').join('-')"), json!("a-b-c"));
        assert_eq!(eval("(12.5).toFixed(2)"), json!("12.50"));
        assert_eq!(eval("isEmail('ada@example.com') && !isEmpty('x')"), json!(true));
        assert_eq!(eval("matches('INV-0042', '^INV-\\\\d+$')"), json!(true));
    }

    #[test]
    fn test_locals_shadow_nothing_and_const_is_enforced() {
        let outcome = run("const x = 1; x = 2", &ScriptContext::default());
        assert_eq!(outcome.error.unwrap().kind, ScriptErrorKind::Type);
        assert_eq!(eval("const o = {a: 1}; o.b = 2; o"), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_errors_are_sanitized() {
        let outcome = run("JSON.parse('{')\n", &ScriptContext::default());
        let err = outcome.error.unwrap();
        assert!(!err.message.contains('\n'));
        assert!(err.message.len() <= 303);
    }

    #[test]
    fn test_validate() {
        let sandbox = Sandbox::default();
        assert!(sandbox.validate("let a = 1; a + 1").is_ok());
        let err = sandbox.validate("let = ;").unwrap_err();
        assert_eq!(err.kind, ScriptErrorKind::Syntax);
        assert!(sandbox.validate("function f() {}").is_err());
    }

    #[test]
    fn test_evaluate_rejects_abort() {
        let sandbox = Sandbox::default();
        assert!(sandbox.evaluate("abort('no')", &ScriptContext::default()).is_err());
        assert_eq!(
            sandbox.evaluate("input.qty * 2", &ScriptContext::new().with_input(json!({"qty": 4}))).unwrap(),
            json!(8)
        );
    }

    #[tokio::test]
    async fn test_async_execute_guards_runtime() {
        let sandbox = Sandbox::default();
        let outcome = sandbox
            .execute(
                "while (true) {}",
                &ScriptContext::default(),
                ExecuteOptions::new().with_timeout_ms(Some(50)),
            )
            .await;
        assert_eq!(outcome.error.unwrap().kind, ScriptErrorKind::Timeout);

        let outcome = sandbox
            .execute("1 + 1", &ScriptContext::default(), ExecuteOptions::default())
            .await;
        assert_eq!(outcome.result, json!(2));
    }

    proptest! {
        #[test]
        fn prop_arbitrary_source_never_panics(src in ".{0,64}") {
            let sandbox = Sandbox::new(SandboxConfig { max_steps: 10_000, ..SandboxConfig::default() });
            let _ = sandbox.execute_sync(&src, &ScriptContext::default(), &ExecuteOptions::new().with_timeout_ms(Some(50)));
        }

        #[test]
        fn prop_integer_addition_matches(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
            let value = Sandbox::default().evaluate(&format!("{} + ({})", a, b), &ScriptContext::default()).unwrap();
            prop_assert_eq!(value, json!(a + b));
        }
    }
}
