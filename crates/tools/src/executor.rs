//! Central tool dispatcher.
//!
//! Every call yields a terminal [`ToolCallRecord`], so conversation history
//! stays consistent even when a tool is unknown, its arguments are malformed,
//! the peer fails, the handler panics, or the caller cancels.
//!
//! Handlers are looked up under the read lock; execution happens outside it
//! on a spawned task so panics surface as join errors.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_TOOL_EXECUTION_TIMEOUT;
use crate::error::FabricError;
use crate::gateway::HttpGateway;
use crate::handler::{HttpProtocolHandler, JsonObject, ProtocolHandler};
use crate::record::ToolCallRecord;

/// Cancellation signal and optional deadline supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A terminal record plus the error that failed it, if any.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub record: ToolCallRecord,
    pub error: Option<FabricError>,
}

impl ToolCallOutcome {
    pub fn into_result(self) -> Result<ToolCallRecord, FabricError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.record),
        }
    }
}

pub struct ToolExecutor {
    handlers: RwLock<BTreeMap<String, Arc<dyn ProtocolHandler>>>,
    schemas: RwLock<HashMap<String, Arc<jsonschema::Validator>>>,
    gateway: Arc<dyn HttpGateway>,
    execution_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(gateway: Arc<dyn HttpGateway>) -> Self {
        Self::with_timeout(gateway, DEFAULT_TOOL_EXECUTION_TIMEOUT)
    }

    /// `execution_timeout` is the HTTP timeout given to protocol handlers
    /// built by [`register_protocol_handler`](Self::register_protocol_handler).
    pub fn with_timeout(gateway: Arc<dyn HttpGateway>, execution_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            schemas: RwLock::new(HashMap::new()),
            gateway,
            execution_timeout,
        }
    }

    // ── Handler registry ─────────────────────────────────────────────────────

    /// Register `handler`, replacing any handler for the same scenario.
    pub fn register_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        let scenario = handler.scenario_name().to_string();
        info!(scenario = %scenario, tools = handler.tool_names().len(), "registered tool handler");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scenario, handler);
    }

    pub fn unregister_handler(&self, scenario: &str) -> Option<Arc<dyn ProtocolHandler>> {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(scenario);
        if removed.is_some() {
            info!(scenario, "unregistered tool handler");
        }
        removed
    }

    /// Bind an [`HttpProtocolHandler`] for `scenario` at `base_url`.
    pub fn register_protocol_handler<I, S>(
        &self,
        scenario: &str,
        base_url: &str,
        tool_names: I,
    ) -> Arc<dyn ProtocolHandler>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handler: Arc<dyn ProtocolHandler> = Arc::new(HttpProtocolHandler::new(
            scenario,
            base_url,
            tool_names,
            self.gateway.clone(),
            self.execution_timeout,
        ));
        self.register_handler(handler.clone());
        handler
    }

    pub fn handler(&self, scenario: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scenario)
            .cloned()
    }

    pub fn scenarios(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn find_handler(&self, tool_name: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|h| h.can_handle(tool_name))
            .cloned()
    }

    pub fn is_known_tool(&self, tool_name: &str) -> bool {
        self.find_handler(tool_name).is_some()
    }

    /// Owning scenario of `tool_name`, or `""` when unknown.
    pub fn get_tool_scenario(&self, tool_name: &str) -> String {
        self.find_handler(tool_name)
            .map(|h| h.scenario_name().to_string())
            .unwrap_or_default()
    }

    // ── Argument schemas ─────────────────────────────────────────────────────

    /// Validate future arguments for `tool_name` against `schema`.
    ///
    /// Empty or uncompilable schemas disable validation for the tool.
    pub fn set_tool_schema(&self, tool_name: &str, schema: &Value) {
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        if schema.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            schemas.remove(tool_name);
            return;
        }
        match jsonschema::validator_for(schema) {
            Ok(validator) => {
                schemas.insert(tool_name.to_string(), Arc::new(validator));
            }
            Err(e) => {
                warn!(tool = tool_name, error = %e, "ignoring uncompilable parameter schema");
                schemas.remove(tool_name);
            }
        }
    }

    pub fn clear_tool_schema(&self, tool_name: &str) {
        self.schemas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_name);
    }

    fn validate_arguments(&self, tool_name: &str, arguments: &JsonObject) -> Result<(), FabricError> {
        let validator = self
            .schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool_name)
            .cloned();
        let Some(validator) = validator else {
            return Ok(());
        };
        let instance = Value::Object(arguments.clone());
        let problems: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(FabricError::ArgValidationFailed {
                tool_name: tool_name.to_string(),
                message: problems.join("; "),
            })
        }
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Dispatch one model tool call and return its terminal record.
    ///
    /// Safe to call concurrently for distinct `tool_call_id`s.
    pub async fn execute_tool(
        &self,
        ctx: &ExecutionContext,
        chat_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        arguments_json: &str,
    ) -> ToolCallOutcome {
        let handler = self.find_handler(tool_name);
        let scenario = handler
            .as_ref()
            .map(|h| h.scenario_name().to_string())
            .unwrap_or_default();
        let record = ToolCallRecord::start(tool_call_id, chat_id, tool_name, scenario, arguments_json);

        let arguments = match parse_arguments(arguments_json) {
            Ok(args) => args,
            Err(e) => return finish_failed(record, e),
        };

        let Some(handler) = handler else {
            return finish_failed(
                record,
                FabricError::UnknownTool {
                    tool_name: tool_name.to_string(),
                },
            );
        };

        if let Err(e) = self.validate_arguments(tool_name, &arguments) {
            return finish_failed(record, e);
        }

        debug!(
            tool = tool_name,
            scenario = %record.scenario_name,
            tool_call_id,
            "dispatching tool call"
        );
        let started = Instant::now();
        match run_handler(ctx, handler, tool_name, arguments).await {
            Ok(result) => {
                let record = record.complete(&result);
                info!(
                    tool = tool_name,
                    scenario = %record.scenario_name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    external_run_id = record.external_run_id.as_deref().unwrap_or(""),
                    "tool call completed"
                );
                ToolCallOutcome {
                    record,
                    error: None,
                }
            }
            Err(e) => finish_failed(record, e),
        }
    }
}

fn finish_failed(record: ToolCallRecord, error: FabricError) -> ToolCallOutcome {
    warn!(
        tool = %record.tool_name,
        tool_call_id = %record.id,
        code = error.code(),
        error = %error,
        "tool call failed"
    );
    ToolCallOutcome {
        record: record.fail(&error),
        error: Some(error),
    }
}

/// Parse the model's raw arguments. Blank input is an empty object.
fn parse_arguments(raw: &str) -> Result<JsonObject, FabricError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(FabricError::ArgParseFailed {
            message: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(e) => Err(FabricError::ArgParseFailed {
            message: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Run the handler on its own task, racing caller cancellation and deadline.
async fn run_handler(
    ctx: &ExecutionContext,
    handler: Arc<dyn ProtocolHandler>,
    tool_name: &str,
    arguments: JsonObject,
) -> Result<JsonObject, FabricError> {
    let name = tool_name.to_string();
    let task = tokio::spawn(async move { handler.execute(&name, arguments).await });
    let abort = task.abort_handle();

    let deadline = ctx.deadline;
    let expired = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        joined = task => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(FabricError::ToolExecFailed {
                message: format!("tool handler panicked: {}", panic_message(e.into_panic())),
                code: "HANDLER_PANIC".to_string(),
            }),
            Err(e) => Err(FabricError::Cancelled {
                reason: format!("handler task aborted: {}", e),
            }),
        },
        _ = ctx.cancel.cancelled() => {
            abort.abort();
            Err(FabricError::Cancelled {
                reason: "cancelled by caller".to_string(),
            })
        }
        _ = expired => {
            abort.abort();
            Err(FabricError::Cancelled {
                reason: "deadline exceeded".to_string(),
            })
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::UreqGateway;
    use crate::handler::InProcessHandler;
    use crate::record::ToolCallStatus;
    use serde_json::json;

    fn executor() -> ToolExecutor {
        ToolExecutor::new(Arc::new(UreqGateway))
    }

    fn local_tools() -> InProcessHandler {
        InProcessHandler::new("local")
            .with_tool("echo", |args| async move { Ok(args) })
            .with_tool("explode", |_args| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(JsonObject::new())
            })
            .with_tool("slow", |_args| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(JsonObject::new())
            })
    }

    #[test]
    fn arguments_must_be_a_json_object() {
        assert!(parse_arguments("{}").unwrap().is_empty());
        assert_eq!(parse_arguments("").unwrap_err().code(), "ARG_PARSE_FAILED");
        assert_eq!(parse_arguments("  ").unwrap_err().code(), "ARG_PARSE_FAILED");
        assert_eq!(parse_arguments("[1]").unwrap_err().code(), "ARG_PARSE_FAILED");
    }

    #[tokio::test]
    async fn unknown_tool_yields_failed_record() {
        let outcome = executor()
            .execute_tool(&ExecutionContext::new(), "c", "tc", "nope", "{}")
            .await;
        assert_eq!(outcome.record.status, ToolCallStatus::Failed);
        assert_eq!(outcome.record.error_message.as_deref(), Some("unknown tool: nope"));
        assert_eq!(outcome.record.scenario_name, "");
        assert!(matches!(outcome.error, Some(FabricError::UnknownTool { .. })));
    }

    #[tokio::test]
    async fn malformed_arguments_fail_before_dispatch() {
        let exec = executor();
        exec.register_handler(Arc::new(local_tools()));
        let outcome = exec
            .execute_tool(&ExecutionContext::new(), "c", "tc", "echo", "{not json")
            .await;
        let record = outcome.record;
        assert_eq!(record.status, ToolCallStatus::Failed);
        assert_eq!(record.scenario_name, "local");
        assert!(record.error_message.unwrap().starts_with("invalid arguments:"));
        let result: Value = serde_json::from_str(record.result.as_deref().unwrap()).unwrap();
        assert!(result.get("error").is_some());
    }

    #[tokio::test]
    async fn successful_call_records_serialized_result() {
        let exec = executor();
        exec.register_handler(Arc::new(local_tools()));
        assert!(exec.is_known_tool("echo"));
        assert_eq!(exec.get_tool_scenario("echo"), "local");

        let outcome = exec
            .execute_tool(
                &ExecutionContext::new(),
                "chat-1",
                "call-1",
                "echo",
                r#"{"run_id":"r-1","n":2}"#,
            )
            .await;
        let record = outcome.into_result().unwrap();
        assert_eq!(record.status, ToolCallStatus::Completed);
        assert_eq!(record.external_run_id.as_deref(), Some("r-1"));
        let result: Value = serde_json::from_str(record.result.as_deref().unwrap()).unwrap();
        assert_eq!(result, json!({"run_id": "r-1", "n": 2}));
        assert!(record.started_at <= record.completed_at.unwrap());
    }

    #[tokio::test]
    async fn handler_panic_becomes_exec_failure() {
        let exec = executor();
        exec.register_handler(Arc::new(local_tools()));
        let outcome = exec
            .execute_tool(&ExecutionContext::new(), "c", "tc", "explode", "{}")
            .await;
        assert_eq!(outcome.record.status, ToolCallStatus::Failed);
        let err = outcome.error.unwrap();
        assert_eq!(err.code(), "TOOL_EXEC_FAILED");
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn cancellation_fails_the_record() {
        let exec = executor();
        exec.register_handler(Arc::new(local_tools()));
        let token = CancellationToken::new();
        let ctx = ExecutionContext::with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let outcome = exec.execute_tool(&ctx, "c", "tc", "slow", "{}").await;
        canceller.await.unwrap();
        assert_eq!(outcome.record.status, ToolCallStatus::Failed);
        assert_eq!(outcome.error.unwrap().code(), "TOOL_CANCELLED");
    }

    #[tokio::test]
    async fn deadline_fails_the_record() {
        let exec = executor();
        exec.register_handler(Arc::new(local_tools()));
        let ctx = ExecutionContext::new().with_timeout(Duration::from_millis(20));
        let outcome = exec.execute_tool(&ctx, "c", "tc", "slow", "{}").await;
        assert!(outcome
            .record
            .error_message
            .unwrap()
            .contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn schema_violations_are_rejected() {
        let exec = executor();
        exec.register_handler(Arc::new(local_tools()));
        exec.set_tool_schema(
            "echo",
            &json!({
                "type": "object",
                "properties": {"n": {"type": "integer"}},
                "required": ["n"]
            }),
        );
        let outcome = exec
            .execute_tool(&ExecutionContext::new(), "c", "tc", "echo", r#"{"n":"two"}"#)
            .await;
        assert_eq!(outcome.error.unwrap().code(), "ARG_VALIDATION_FAILED");

        let ok = exec
            .execute_tool(&ExecutionContext::new(), "c", "tc2", "echo", r#"{"n":2}"#)
            .await;
        assert!(ok.error.is_none());
    }

    #[tokio::test]
    async fn unregister_removes_tools() {
        let exec = executor();
        exec.register_handler(Arc::new(local_tools()));
        assert!(exec.unregister_handler("local").is_some());
        assert!(!exec.is_known_tool("echo"));
        assert!(exec.scenarios().is_empty());
    }
}
