use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::FabricError;
use crate::handler::JsonObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ToolCallStatus::Running)
    }
}

/// One tool invocation as seen by the model layer.
///
/// Produced by [`ToolExecutor::execute_tool`](crate::ToolExecutor::execute_tool)
/// in a terminal state; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Caller-supplied tool_call_id.
    pub id: String,
    pub chat_id: String,
    pub tool_name: String,
    /// Empty when the tool was unknown at dispatch.
    pub scenario_name: String,
    /// Raw arguments string as received from the model.
    pub arguments: String,
    pub status: ToolCallStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// JSON-encoded success payload, or `{"error": …}` on failure.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// `run_id` of a long-running peer operation started by this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_run_id: Option<String>,
}

impl ToolCallRecord {
    pub(crate) fn start(
        id: &str,
        chat_id: &str,
        tool_name: &str,
        scenario_name: String,
        arguments: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            tool_name: tool_name.to_string(),
            scenario_name,
            arguments: arguments.to_string(),
            status: ToolCallStatus::Running,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            result: None,
            error_message: None,
            error_code: None,
            external_run_id: None,
        }
    }

    pub(crate) fn complete(mut self, result: &JsonObject) -> Self {
        if let Some(Value::String(run_id)) = result.get("run_id") {
            self.external_run_id = Some(run_id.clone());
        }
        self.result = Some(Value::Object(result.clone()).to_string());
        self.status = ToolCallStatus::Completed;
        self.completed_at = Some(OffsetDateTime::now_utc());
        self
    }

    pub(crate) fn fail(mut self, error: &FabricError) -> Self {
        let message = error.to_string();
        self.result = Some(serde_json::json!({ "error": message }).to_string());
        self.error_message = Some(message);
        self.error_code = Some(error.code().to_string());
        self.status = ToolCallStatus::Failed;
        self.completed_at = Some(OffsetDateTime::now_utc());
        self
    }

    /// Wall-clock execution time, once terminal.
    pub fn duration(&self) -> Option<time::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}
