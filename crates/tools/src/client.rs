//! Discovery client: resolves peers, fetches and caches their tool manifests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::ManifestCache;
use crate::config::ClientConfig;
use crate::error::FabricError;
use crate::gateway::{GatewayRequest, HttpGateway};
use crate::manifest::{protocol_versions_match, ToolManifest, TOOLS_PATH, TOOL_PROTOCOL_VERSION};
use crate::resolver::UrlResolver;

/// Availability summary for one peer scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioStatus {
    pub scenario: String,
    pub available: bool,
    pub tool_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a concurrent fanout. Individual failures never abort the batch.
#[derive(Debug, Default)]
pub struct FetchResults {
    pub manifests: HashMap<String, Arc<ToolManifest>>,
    pub errors: HashMap<String, FabricError>,
}

pub struct ScenarioClient {
    resolver: Arc<dyn UrlResolver>,
    gateway: Arc<dyn HttpGateway>,
    cache: ManifestCache,
    fetch_timeout: Duration,
}

impl ScenarioClient {
    pub fn new(
        resolver: Arc<dyn UrlResolver>,
        gateway: Arc<dyn HttpGateway>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            resolver,
            gateway,
            cache: ManifestCache::new(config.manifest_cache_ttl),
            fetch_timeout: config.manifest_fetch_timeout,
        }
    }

    pub fn gateway(&self) -> Arc<dyn HttpGateway> {
        self.gateway.clone()
    }

    pub fn cache(&self) -> &ManifestCache {
        &self.cache
    }

    pub async fn resolve_url(&self, scenario: &str) -> Result<String, FabricError> {
        self.resolver.resolve(scenario).await
    }

    /// Cached manifest if fresh, otherwise `GET <base>/api/v1/tools`.
    ///
    /// Manifests with an unsupported `protocol_version` are rejected and
    /// not cached, so the next call retries.
    pub async fn fetch_tool_manifest(&self, scenario: &str) -> Result<Arc<ToolManifest>, FabricError> {
        if let Some(manifest) = self.cache.get(scenario) {
            debug!(scenario, "manifest cache hit");
            return Ok(manifest);
        }

        let base_url = self.resolver.resolve(scenario).await?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), TOOLS_PATH);
        debug!(scenario, %url, "fetching tool manifest");

        let response = self
            .gateway
            .send(GatewayRequest::get_json(url, self.fetch_timeout))
            .await
            .map_err(|e| FabricError::UpstreamUnavailable {
                scenario: scenario.to_string(),
                message: e.message,
            })?;

        if response.status != 200 {
            return Err(FabricError::UpstreamStatus {
                scenario: scenario.to_string(),
                status: response.status,
                body: response.body_text(),
            });
        }

        let manifest: ToolManifest =
            serde_json::from_slice(&response.body).map_err(|e| {
                FabricError::InvalidProtocolResponse {
                    message: format!("could not decode manifest from {}: {}", scenario, e),
                    body: response.body_text(),
                }
            })?;

        if !protocol_versions_match(&manifest.protocol_version, TOOL_PROTOCOL_VERSION) {
            warn!(
                scenario,
                advertised = %manifest.protocol_version,
                "rejecting manifest with unsupported protocol version"
            );
            return Err(FabricError::ProtocolMismatch {
                scenario: scenario.to_string(),
                expected: TOOL_PROTOCOL_VERSION.to_string(),
                actual: manifest.protocol_version,
            });
        }

        let manifest = Arc::new(manifest);
        self.cache.set(scenario, manifest.clone());
        info!(scenario, tools = manifest.tools.len(), "cached tool manifest");
        Ok(manifest)
    }

    /// Fetch every named manifest concurrently, one task per name.
    pub async fn fetch_multiple(self: &Arc<Self>, scenarios: &[String]) -> FetchResults {
        let manifests = Arc::new(Mutex::new(HashMap::new()));
        let errors = Arc::new(Mutex::new(HashMap::new()));

        let mut tasks = JoinSet::new();
        for scenario in scenarios {
            let client = Arc::clone(self);
            let scenario = scenario.clone();
            let manifests = Arc::clone(&manifests);
            let errors = Arc::clone(&errors);
            tasks.spawn(async move {
                match client.fetch_tool_manifest(&scenario).await {
                    Ok(manifest) => {
                        manifests
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(scenario, manifest);
                    }
                    Err(e) => {
                        warn!(scenario = %scenario, error = %e, "manifest fetch failed");
                        errors
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(scenario, e);
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "manifest fetch task aborted");
            }
        }

        let mut results = FetchResults {
            manifests: std::mem::take(&mut *manifests.lock().unwrap_or_else(|e| e.into_inner())),
            errors: std::mem::take(&mut *errors.lock().unwrap_or_else(|e| e.into_inner())),
        };
        for scenario in scenarios {
            if !results.manifests.contains_key(scenario) && !results.errors.contains_key(scenario) {
                results.errors.insert(
                    scenario.clone(),
                    FabricError::UpstreamUnavailable {
                        scenario: scenario.clone(),
                        message: "fetch task aborted".to_string(),
                    },
                );
            }
        }
        results
    }

    pub async fn check_scenario_status(&self, scenario: &str) -> ScenarioStatus {
        match self.fetch_tool_manifest(scenario).await {
            Ok(manifest) => ScenarioStatus {
                scenario: scenario.to_string(),
                available: true,
                tool_count: manifest.tools.len(),
                version: Some(manifest.scenario.version.clone()).filter(|v| !v.is_empty()),
                error: None,
            },
            Err(e) => ScenarioStatus {
                scenario: scenario.to_string(),
                available: false,
                tool_count: 0,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn invalidate_cache(&self, scenario: &str) {
        self.cache.invalidate(scenario);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
