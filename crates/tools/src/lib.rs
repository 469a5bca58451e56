//! Scenario tooling fabric: discover, cache and invoke tools hosted by
//! sibling scenarios over HTTP.
//!
//! Data flow for a model tool call:
//! model response → [`ToolExecutor`] → [`ProtocolHandler`] →
//! `POST <peer>/api/v1/tools/execute` → [`ToolCallRecord`].
//!
//! Discovery: [`ToolRegistry`] → [`ScenarioClient`] ([`ManifestCache`],
//! [`UrlResolver`], [`HttpGateway`]) → `GET <peer>/api/v1/tools`.

pub mod cache;
pub mod client;
pub mod config;
mod error;
pub mod executor;
pub mod gateway;
pub mod handler;
pub mod manifest;
mod record;
pub mod registry;
pub mod resolver;

pub use cache::{CachedManifest, ManifestCache};
pub use client::{FetchResults, ScenarioClient, ScenarioStatus};
pub use config::ClientConfig;
pub use error::FabricError;
pub use executor::{ExecutionContext, ToolCallOutcome, ToolExecutor};
pub use gateway::{GatewayError, GatewayRequest, GatewayResponse, HttpGateway, HttpMethod, UreqGateway};
pub use handler::{HttpProtocolHandler, InProcessHandler, JsonObject, ProtocolHandler};
pub use manifest::{
    ExecutionProtocolResponse, ExecutionRequest, PeerOutcome, ScenarioInfo, ToolDefinition,
    ToolManifest, ToolMetadata, TOOL_PROTOCOL_VERSION,
};
pub use record::{ToolCallRecord, ToolCallStatus};
pub use registry::{RefreshReport, RegisteredTool, SyncReport, ToolRegistry};
pub use resolver::{ChainedUrlResolver, CommandUrlResolver, StaticUrlResolver, UrlResolver};

pub use tokio_util::sync::CancellationToken;
