//! Remote peer handler: `POST <base>/api/v1/tools/execute`.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{JsonObject, ProtocolHandler};
use crate::error::FabricError;
use crate::gateway::{GatewayRequest, HttpGateway};
use crate::manifest::{ExecutionProtocolResponse, ExecutionRequest, PeerOutcome, EXECUTE_PATH};

pub struct HttpProtocolHandler {
    scenario: String,
    base_url: String,
    tool_names: RwLock<BTreeSet<String>>,
    gateway: Arc<dyn HttpGateway>,
    timeout: Duration,
}

impl HttpProtocolHandler {
    pub fn new<I, S>(
        scenario: &str,
        base_url: &str,
        tool_names: I,
        gateway: Arc<dyn HttpGateway>,
        timeout: Duration,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scenario: scenario.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tool_names: RwLock::new(tool_names.into_iter().map(Into::into).collect()),
            gateway,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Decode a peer body into the map handed back to the caller.
    ///
    /// Async acknowledgements additionally carry `is_async`, `run_id` and
    /// `status` so callers can track the long-running operation.
    pub fn interpret_response(body: &[u8]) -> Result<JsonObject, FabricError> {
        let envelope: ExecutionProtocolResponse =
            serde_json::from_slice(body).map_err(|e| FabricError::InvalidProtocolResponse {
                message: e.to_string(),
                body: String::from_utf8_lossy(body).into_owned(),
            })?;

        match PeerOutcome::from(envelope) {
            PeerOutcome::Failure { message, code } => {
                Err(FabricError::ToolExecFailed { message, code })
            }
            PeerOutcome::Success { result } => Ok(result),
            PeerOutcome::Async {
                run_id,
                status,
                mut result,
            } => {
                result.insert("is_async".to_string(), Value::Bool(true));
                result.insert("run_id".to_string(), Value::String(run_id));
                result.insert("status".to_string(), Value::String(status));
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for HttpProtocolHandler {
    fn scenario_name(&self) -> &str {
        &self.scenario
    }

    fn can_handle(&self, tool_name: &str) -> bool {
        self.tool_names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tool_name)
    }

    fn tool_names(&self) -> Vec<String> {
        self.tool_names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn execute(&self, tool_name: &str, arguments: JsonObject) -> Result<JsonObject, FabricError> {
        let request = ExecutionRequest {
            tool_name: tool_name.to_string(),
            arguments,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| FabricError::ArgParseFailed {
            message: format!("could not encode arguments: {}", e),
        })?;

        let url = format!("{}{}", self.base_url, EXECUTE_PATH);
        debug!(scenario = %self.scenario, tool = tool_name, %url, "executing remote tool");

        let response = self
            .gateway
            .send(GatewayRequest::post_json(url, payload, self.timeout))
            .await
            .map_err(|e| FabricError::UpstreamUnavailable {
                scenario: self.scenario.clone(),
                message: e.message,
            })?;

        Self::interpret_response(&response.body)
    }

    fn add_tool(&self, tool_name: &str) {
        self.tool_names
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool_name.to_string());
    }

    fn remove_tool(&self, tool_name: &str) {
        self.tool_names
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_name);
    }
}
