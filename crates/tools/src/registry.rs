//! Global tool index across peer scenarios.
//!
//! [`ToolRegistry::refresh`] fans out over the configured peers and rebuilds
//! the `tool name → scenario` index. On a name collision the scenario that
//! sorts first keeps the tool. [`ToolRegistry::sync_executor`] then binds one
//! protocol handler per available peer into a [`ToolExecutor`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::ScenarioClient;
use crate::executor::ToolExecutor;
use crate::manifest::{ToolDefinition, ToolManifest};

/// Result of one refresh pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub available: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub tool_count: usize,
}

/// Result of binding the registry into an executor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub registered: Vec<String>,
    pub unregistered: Vec<String>,
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTool {
    pub scenario: String,
    #[serde(flatten)]
    pub definition: ToolDefinition,
}

#[derive(Default)]
struct Index {
    manifests: BTreeMap<String, Arc<ToolManifest>>,
    owners: BTreeMap<String, String>,
}

pub struct ToolRegistry {
    client: Arc<ScenarioClient>,
    scenarios: RwLock<BTreeSet<String>>,
    index: RwLock<Index>,
}

impl ToolRegistry {
    pub fn new<I, S>(client: Arc<ScenarioClient>, scenarios: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            client,
            scenarios: RwLock::new(scenarios.into_iter().map(Into::into).collect()),
            index: RwLock::new(Index::default()),
        }
    }

    pub fn client(&self) -> &Arc<ScenarioClient> {
        &self.client
    }

    pub fn scenarios(&self) -> Vec<String> {
        self.scenarios
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn add_scenario(&self, scenario: &str) {
        self.scenarios
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scenario.to_string());
    }

    pub fn remove_scenario(&self, scenario: &str) {
        self.scenarios
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(scenario);
        self.client.invalidate_cache(scenario);
    }

    /// Fetch every peer manifest and rebuild the index.
    ///
    /// Peers that fail drop out of the index until a later refresh succeeds.
    pub async fn refresh(&self) -> RefreshReport {
        let scenarios = self.scenarios();
        let fetched = self.client.fetch_multiple(&scenarios).await;

        let mut index = Index {
            manifests: fetched.manifests.into_iter().collect(),
            owners: BTreeMap::new(),
        };
        for (scenario, manifest) in &index.manifests {
            for tool in manifest.tool_names() {
                match index.owners.get(tool) {
                    Some(owner) => warn!(
                        tool,
                        kept = %owner,
                        ignored = %scenario,
                        "tool name published by more than one scenario"
                    ),
                    None => {
                        index.owners.insert(tool.to_string(), scenario.clone());
                    }
                }
            }
        }

        let report = RefreshReport {
            available: index.manifests.keys().cloned().collect(),
            errors: fetched
                .errors
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            tool_count: index.owners.len(),
        };
        info!(
            available = report.available.len(),
            failed = report.errors.len(),
            tools = report.tool_count,
            "tool registry refreshed"
        );
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = index;
        report
    }

    pub fn scenario_for_tool(&self, tool_name: &str) -> Option<String> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .owners
            .get(tool_name)
            .cloned()
    }

    pub fn manifest(&self, scenario: &str) -> Option<Arc<ToolManifest>> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .manifests
            .get(scenario)
            .cloned()
    }

    /// Every indexed tool with its owning scenario, sorted by tool name.
    pub fn tools(&self) -> Vec<RegisteredTool> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index
            .owners
            .iter()
            .filter_map(|(tool, scenario)| {
                let definition = index.manifests.get(scenario)?.tool(tool)?.clone();
                Some(RegisteredTool {
                    scenario: scenario.clone(),
                    definition,
                })
            })
            .collect()
    }

    /// Function-calling definitions for tools enabled by default.
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.tools()
            .into_iter()
            .filter(|t| t.definition.metadata.enabled_by_default)
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.definition.name,
                        "description": t.definition.description,
                        "parameters": t.definition.parameters,
                    }
                })
            })
            .collect()
    }

    /// Bind indexed tools into `executor`.
    ///
    /// Existing handlers have their tool sets re-synced in place; new peers
    /// get an HTTP protocol handler; configured peers without a manifest are
    /// unregistered. Handlers for scenarios outside the configured set (for
    /// example in-process ones) are left alone.
    pub async fn sync_executor(&self, executor: &ToolExecutor) -> SyncReport {
        let (owned, definitions) = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            let mut owned: BTreeMap<String, BTreeSet<String>> = index
                .manifests
                .keys()
                .map(|s| (s.clone(), BTreeSet::new()))
                .collect();
            let mut definitions = Vec::new();
            for (tool, scenario) in &index.owners {
                owned.entry(scenario.clone()).or_default().insert(tool.clone());
                if let Some(def) = index.manifests.get(scenario).and_then(|m| m.tool(tool)) {
                    definitions.push(def.clone());
                }
            }
            (owned, definitions)
        };

        let mut report = SyncReport::default();
        for (scenario, tools) in &owned {
            match executor.handler(scenario) {
                Some(handler) => {
                    for stale in handler.tool_names() {
                        if !tools.contains(&stale) {
                            handler.remove_tool(&stale);
                            executor.clear_tool_schema(&stale);
                        }
                    }
                    for tool in tools {
                        handler.add_tool(tool);
                    }
                    report.registered.push(scenario.clone());
                }
                None => match self.client.resolve_url(scenario).await {
                    Ok(base_url) => {
                        executor.register_protocol_handler(scenario, &base_url, tools.iter().cloned());
                        report.registered.push(scenario.clone());
                    }
                    Err(e) => {
                        warn!(scenario = %scenario, error = %e, "cannot bind handler");
                        report.errors.insert(scenario.clone(), e.to_string());
                    }
                },
            }
        }

        for definition in &definitions {
            executor.set_tool_schema(&definition.name, &definition.parameters);
        }

        for scenario in self.scenarios() {
            if !owned.contains_key(&scenario) && executor.unregister_handler(&scenario).is_some() {
                report.unregistered.push(scenario);
            }
        }
        report
    }
}
