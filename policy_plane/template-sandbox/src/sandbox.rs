// Sandbox runner: scan, parse and execute a script on an isolated worker.
//
// Design Principles:
// 1. One fresh worker thread and budget per invocation, nothing shared
// 2. The host waits with a hard deadline; on expiry it flips the cancel flag
//    and detaches the worker instead of waiting for it
// 3. Every failure is returned as a value, never raised across the boundary
// 4. Callers depend on the `Isolator` trait, not on this implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{ScriptPayload, UtilityRegistry};
use crate::error::{SandboxError, SandboxErrorKind};
use crate::limits::{ExecutionBudget, SandboxLimits};
use crate::scanner::{has_blocking_issues, CodeIssue, CodeScanner};
use crate::script::interpreter::Interpreter;
use crate::script::parse_program;
use crate::script::value::measure;

/// Largest script accepted for execution
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

const WORKER_STACK_BYTES: usize = 64 * 1024 * 1024;
/// Slack granted to the worker past its own deadline before the host gives up
const DEADLINE_GRACE: Duration = Duration::from_millis(100);

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_time_ms: u64,
    /// Bytes held by bindings when the script finished
    pub memory_used_bytes: u64,
    pub peak_memory_bytes: u64,
    pub steps: u64,
}

/// Outcome of one sandboxed invocation
///
/// `result` is untrusted data produced by the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub result: Option<Value>,
    #[serde(skip)]
    pub error: Option<SandboxError>,
    pub metrics: ExecutionMetrics,
    pub logs: Vec<String>,
    /// Static scan findings for the executed code
    pub issues: Vec<CodeIssue>,
}

impl ExecutionResult {
    fn ok(value: Value, metrics: ExecutionMetrics, logs: Vec<String>) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
            metrics,
            logs,
            issues: Vec::new(),
        }
    }

    fn failed(error: SandboxError, metrics: ExecutionMetrics, logs: Vec<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            metrics,
            logs,
            issues: Vec::new(),
        }
    }

    fn with_issues(mut self, issues: Vec<CodeIssue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn error_kind(&self) -> Option<SandboxErrorKind> {
        self.error.as_ref().map(SandboxError::kind)
    }

    pub fn into_result(self) -> Result<Value, SandboxError> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }
}

// ============================================================================
// Isolator seam
// ============================================================================

/// One invocation: payload, global bindings and optional per-call overrides
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub payload: ScriptPayload,
    pub bindings: Vec<(String, Value)>,
    /// Overrides the isolator's default limits
    pub limits: Option<SandboxLimits>,
    /// Overrides the isolator's registered utilities
    pub utilities: Option<Arc<UtilityRegistry>>,
}

impl ExecutionRequest {
    pub fn new(payload: ScriptPayload) -> Self {
        Self {
            payload,
            bindings: Vec::new(),
            limits: None,
            utilities: None,
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.push((name.into(), value));
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_utilities(mut self, utilities: Arc<UtilityRegistry>) -> Self {
        self.utilities = Some(utilities);
        self
    }
}

/// Narrow execution interface the engine is written against
pub trait Isolator: Send + Sync {
    fn run(&self, request: ExecutionRequest) -> ExecutionResult;

    fn validate_code(&self, code: &str) -> Vec<CodeIssue>;

    /// Run `code` with `context` bound as the global `context`
    fn execute(&self, code: &str, context: &Value) -> ExecutionResult {
        self.run(ExecutionRequest::new(ScriptPayload::new(code)).bind("context", context.clone()))
    }

    /// Run `code` with positional arguments bound as the global `args`
    fn execute_function(&self, code: &str, args: &[Value]) -> ExecutionResult {
        self.run(
            ExecutionRequest::new(ScriptPayload::new(code))
                .bind("args", Value::Array(args.to_vec())),
        )
    }
}

// ============================================================================
// Sandbox
// ============================================================================

pub struct Sandbox {
    limits: SandboxLimits,
    scanner: Arc<CodeScanner>,
    utilities: Arc<UtilityRegistry>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::with_limits(SandboxLimits::default())
    }

    pub fn with_limits(limits: SandboxLimits) -> Self {
        Self {
            limits,
            scanner: Arc::new(CodeScanner::new()),
            utilities: Arc::new(UtilityRegistry::new()),
        }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Expose a pure host function to scripts as `utils.<name>`
    pub fn register_utility<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.utilities).register(name, f);
    }

    pub fn with_utilities(mut self, utilities: UtilityRegistry) -> Self {
        self.utilities = Arc::new(utilities);
        self
    }

    /// Execute under explicit limits instead of the sandbox defaults
    pub fn execute_with_limits(
        &self,
        payload: &ScriptPayload,
        bindings: Vec<(String, Value)>,
        limits: &SandboxLimits,
    ) -> ExecutionResult {
        self.execute_inner(payload, bindings, limits, self.utilities.clone())
    }

    fn execute_inner(
        &self,
        payload: &ScriptPayload,
        bindings: Vec<(String, Value)>,
        limits: &SandboxLimits,
        utilities: Arc<UtilityRegistry>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let elapsed_metrics = || ExecutionMetrics {
            execution_time_ms: started.elapsed().as_millis() as u64,
            ..ExecutionMetrics::default()
        };

        if let Err(e) = limits.validate() {
            return ExecutionResult::failed(
                SandboxError::Module(e.to_string()),
                elapsed_metrics(),
                Vec::new(),
            );
        }

        // Step 1: static scan, blocking findings refuse execution
        let issues = self.scanner.scan(&payload.code);
        if has_blocking_issues(&issues) {
            let worst = issues
                .iter()
                .find(|i| i.severity.is_blocking())
                .map(|i| format!("{} (line {}): {}", i.rule_id, i.line, i.message))
                .unwrap_or_default();
            warn!("Sandbox refused script: {}", worst);
            return ExecutionResult::failed(
                SandboxError::Security(format!("code scan rejected script: {}", worst)),
                elapsed_metrics(),
                Vec::new(),
            )
            .with_issues(issues);
        }

        if payload.code.len() > MAX_SCRIPT_BYTES {
            return ExecutionResult::failed(
                SandboxError::Module(format!(
                    "script is {} bytes, limit {}",
                    payload.code.len(),
                    MAX_SCRIPT_BYTES
                )),
                elapsed_metrics(),
                Vec::new(),
            )
            .with_issues(issues);
        }

        // Step 2: run on a dedicated worker
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let worker_cancel = cancel.clone();
        let worker_limits = limits.clone();
        let worker_payload = payload.clone();

        let spawned = thread::Builder::new()
            .name("template-sandbox".to_string())
            .stack_size(WORKER_STACK_BYTES)
            .spawn(move || {
                let outcome = run_script(
                    &worker_payload,
                    bindings,
                    worker_limits,
                    worker_cancel,
                    &utilities,
                );
                // Receiver may have given up already
                let _ = tx.send(outcome);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return ExecutionResult::failed(
                    SandboxError::Module(format!("failed to start sandbox worker: {}", e)),
                    elapsed_metrics(),
                    Vec::new(),
                )
                .with_issues(issues)
            }
        };

        // Step 3: wait with a hard deadline
        let result = match rx.recv_timeout(limits.timeout() + DEADLINE_GRACE) {
            Ok(outcome) => {
                let _ = handle.join();
                outcome
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // A worker stuck in a host utility never observes the flag
                cancel.store(true, Ordering::Relaxed);
                drop(handle);
                ExecutionResult::failed(
                    SandboxError::Timeout {
                        limit_ms: limits.timeout_ms,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                    elapsed_metrics(),
                    Vec::new(),
                )
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                ExecutionResult::failed(
                    SandboxError::Runtime("sandbox worker terminated abnormally".to_string()),
                    elapsed_metrics(),
                    Vec::new(),
                )
            }
        };

        if let Some(err) = &result.error {
            warn!("Sandbox execution failed ({}): {}", err.kind(), err);
        } else {
            debug!(
                "Sandbox execution finished in {}ms ({} steps)",
                result.metrics.execution_time_ms, result.metrics.steps
            );
        }

        result.with_issues(issues)
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("limits", &self.limits)
            .field("utilities", &self.utilities)
            .finish()
    }
}

impl Isolator for Sandbox {
    fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let limits = request.limits.unwrap_or_else(|| self.limits.clone());
        let utilities = request.utilities.unwrap_or_else(|| self.utilities.clone());
        self.execute_inner(&request.payload, request.bindings, &limits, utilities)
    }

    fn validate_code(&self, code: &str) -> Vec<CodeIssue> {
        self.scanner.scan(code)
    }
}

/// Worker body: parse, bind, interpret
fn run_script(
    payload: &ScriptPayload,
    bindings: Vec<(String, Value)>,
    limits: SandboxLimits,
    cancel: Arc<AtomicBool>,
    utilities: &UtilityRegistry,
) -> ExecutionResult {
    let mut budget = ExecutionBudget::new(limits, cancel);

    let program = match parse_program(&payload.code) {
        Ok(program) => program,
        Err(e) => return ExecutionResult::failed(e, metrics_of(&budget), Vec::new()),
    };

    let mut interpreter = Interpreter::new(&mut budget, utilities, &payload.capabilities);
    let mut outcome = Ok(Value::Null);
    for (name, value) in bindings {
        if let Err(e) = interpreter.bind_global(&name, value) {
            outcome = Err(e);
            break;
        }
    }
    if outcome.is_ok() {
        outcome = interpreter.run(&program);
    }
    let logs = interpreter.into_logs();

    // The returned value counts against the ceiling like any binding
    let outcome = outcome.and_then(|value| {
        let (size, _) = measure(&value);
        budget.reserve_transient(size).map(|_| value)
    });

    let metrics = metrics_of(&budget);
    match outcome {
        Ok(value) => ExecutionResult::ok(value, metrics, logs),
        Err(e) => ExecutionResult::failed(e, metrics, logs),
    }
}

fn metrics_of(budget: &ExecutionBudget) -> ExecutionMetrics {
    ExecutionMetrics {
        execution_time_ms: budget.elapsed_ms(),
        memory_used_bytes: budget.live_bytes(),
        peak_memory_bytes: budget.peak_bytes(),
        steps: budget.steps(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use serde_json::json;

    #[test]
    fn test_execute_with_context() {
        let sandbox = Sandbox::new();
        let ctx = json!({"rules": {"deny": ["eval(", "rm -rf"], "allow": ["*"]}});
        let result = sandbox.execute(
            "let wild = context.rules.allow.includes('*'); return { isValid: !wild, message: 'wildcard allow' };",
            &ctx,
        );
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.result,
            Some(json!({"isValid": false, "message": "wildcard allow"}))
        );
        assert!(result.metrics.steps > 0);
    }

    #[test]
    fn test_execute_function_binds_args() {
        let sandbox = Sandbox::new();
        let result = sandbox.execute_function("return args[0] + args[1];", &[json!(2), json!(3)]);
        assert_eq!(result.into_result().unwrap(), json!(5));
    }

    #[test]
    fn test_environment_access_is_refused() {
        let sandbox = Sandbox::new();
        let result = sandbox.execute("return process.env.HOME;", &json!({}));
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Security));
        assert!(!result.issues.is_empty());

        // Obfuscated access that slips past the scanner still hits the stub
        let result = sandbox.execute("let k = 'proto'; return context[k + 'type'];", &json!({}));
        assert!(result.issues.is_empty());
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Security));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let sandbox = Sandbox::with_limits(SandboxLimits::new(200, 16).with_max_steps(u64::MAX));
        let started = Instant::now();
        let result = sandbox.execute("let i = 0; while (true) { i = i + 1; }", &json!({}));
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_millis(500));
    }

    #[test]
    fn test_timeout_does_not_wait_for_blocked_utility() {
        let mut sandbox = Sandbox::with_limits(SandboxLimits::new(200, 16));
        sandbox.register_utility("slow", |_: &[Value]| {
            thread::sleep(Duration::from_secs(3));
            Ok(Value::Null)
        });
        let started = Instant::now();
        let result = sandbox.execute("return utils.slow();", &json!({}));
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_millis(700));
    }

    #[test]
    fn test_memory_limit() {
        let sandbox = Sandbox::with_limits(SandboxLimits::new(2000, 1));
        let result = sandbox.execute(
            "let s = 'ab'; let i = 0; while (i < 30) { s = s + s; i += 1; } return s.length;",
            &json!({}),
        );
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Memory));
    }

    #[test]
    fn test_syntax_error_is_module_error() {
        let sandbox = Sandbox::new();
        let result = sandbox.execute("let = ;", &json!({}));
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Module));
    }

    #[test]
    fn test_registered_utilities_and_capabilities() {
        let mut sandbox = Sandbox::new();
        sandbox.register_utility("isStrict", |args: &[Value]| {
            Ok(Value::Bool(args.first() == Some(&json!("strict"))))
        });
        let result = sandbox.execute("return utils.isStrict(context.mode);", &json!({"mode": "strict"}));
        assert_eq!(result.result, Some(json!(true)));

        let payload = ScriptPayload::new("return utils.isStrict('strict');")
            .with_capabilities([Capability::Math]);
        let result = sandbox.run(ExecutionRequest::new(payload));
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Security));
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let sandbox = Sandbox::new();
        let result = sandbox.execute_with_limits(
            &ScriptPayload::new("return 1;"),
            Vec::new(),
            &SandboxLimits::new(0, 1),
        );
        assert!(!result.success);
    }

    #[test]
    fn test_request_overrides() {
        let sandbox = Sandbox::new();
        let mut utilities = UtilityRegistry::new();
        utilities.register("answer", |_: &[Value]| Ok(json!(42)));
        let request = ExecutionRequest::new(ScriptPayload::new("return utils.answer() + context.n;"))
            .bind("context", json!({"n": 1}))
            .with_limits(SandboxLimits::validation_rule())
            .with_utilities(Arc::new(utilities));
        assert_eq!(sandbox.run(request).into_result().unwrap(), json!(43));
    }

    #[test]
    fn test_console_logs_collected() {
        let sandbox = Sandbox::new();
        let result = sandbox.execute("console.log('checking', context.id); return true;", &json!({"id": "t1"}));
        assert_eq!(result.logs, vec!["checking t1".to_string()]);
    }
}
