//! Uniform tool-execution contract, one handler per scenario.
//!
//! - [`http::HttpProtocolHandler`]: remote peer over the Tool Execution Protocol
//! - [`in_process::InProcessHandler`]: async closures in this process

pub mod http;
pub mod in_process;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::FabricError;

pub use http::HttpProtocolHandler;
pub use in_process::InProcessHandler;

/// Arguments and results are schemaless JSON objects at this boundary.
pub type JsonObject = Map<String, Value>;

/// Executes the tools of one scenario.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Owning scenario; the executor keys handlers by this.
    fn scenario_name(&self) -> &str;

    fn can_handle(&self, tool_name: &str) -> bool;

    /// Names of every tool this handler currently accepts.
    fn tool_names(&self) -> Vec<String>;

    async fn execute(&self, tool_name: &str, arguments: JsonObject) -> Result<JsonObject, FabricError>;

    fn add_tool(&self, tool_name: &str);

    fn remove_tool(&self, tool_name: &str);
}
