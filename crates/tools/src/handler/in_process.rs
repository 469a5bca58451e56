//! In-process handler wrapping async closures behind [`ProtocolHandler`].

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{JsonObject, ProtocolHandler};
use crate::error::FabricError;

type ToolFuture = Pin<Box<dyn Future<Output = Result<JsonObject, FabricError>> + Send>>;
type ToolFn = Arc<dyn Fn(JsonObject) -> ToolFuture + Send + Sync>;

/// Tools implemented in this process, exposed under a scenario name.
///
/// `remove_tool` disables a registered function; `add_tool` re-enables it.
/// Names without a registered function cannot be enabled.
pub struct InProcessHandler {
    scenario: String,
    functions: HashMap<String, ToolFn>,
    enabled: RwLock<BTreeSet<String>>,
}

impl InProcessHandler {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            functions: HashMap::new(),
            enabled: RwLock::new(BTreeSet::new()),
        }
    }

    /// Register `function` under `tool_name`, enabled.
    pub fn with_tool<F, Fut>(mut self, tool_name: &str, function: F) -> Self
    where
        F: Fn(JsonObject) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonObject, FabricError>> + Send + 'static,
    {
        let wrapped: ToolFn = Arc::new(move |args| -> ToolFuture { Box::pin(function(args)) });
        self.functions.insert(tool_name.to_string(), wrapped);
        self.enabled
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool_name.to_string());
        self
    }
}

#[async_trait]
impl ProtocolHandler for InProcessHandler {
    fn scenario_name(&self) -> &str {
        &self.scenario
    }

    fn can_handle(&self, tool_name: &str) -> bool {
        self.enabled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tool_name)
    }

    fn tool_names(&self) -> Vec<String> {
        self.enabled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn execute(&self, tool_name: &str, arguments: JsonObject) -> Result<JsonObject, FabricError> {
        let function = match self.functions.get(tool_name) {
            Some(f) if self.can_handle(tool_name) => f.clone(),
            _ => {
                return Err(FabricError::UnknownTool {
                    tool_name: tool_name.to_string(),
                })
            }
        };
        function(arguments).await
    }

    fn add_tool(&self, tool_name: &str) {
        if self.functions.contains_key(tool_name) {
            self.enabled
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(tool_name.to_string());
        }
    }

    fn remove_tool(&self, tool_name: &str) {
        self.enabled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_handler() -> InProcessHandler {
        InProcessHandler::new("local").with_tool("echo", |args| async move { Ok(args) })
    }

    #[tokio::test]
    async fn runs_registered_closure() {
        let handler = echo_handler();
        let mut args = JsonObject::new();
        args.insert("msg".to_string(), json!("hi"));
        let out = handler.execute("echo", args).await.unwrap();
        assert_eq!(out.get("msg"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn disabled_tool_is_unknown() {
        let handler = echo_handler();
        handler.remove_tool("echo");
        assert!(!handler.can_handle("echo"));
        let err = handler.execute("echo", JsonObject::new()).await.unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_TOOL");

        handler.add_tool("echo");
        handler.add_tool("never-registered");
        assert_eq!(handler.tool_names(), vec!["echo".to_string()]);
    }
}
