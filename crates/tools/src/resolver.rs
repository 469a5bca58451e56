//! Scenario name → HTTP base URL.
//!
//! Lookup order for [`CommandUrlResolver`]:
//! 1. `<NAME_UPPERCASE_UNDERSCORED>_API_URL` env var, returned unchanged
//! 2. `vrooli scenario port <name> API_PORT` on stdout, composed as
//!    `http://localhost:<port>`
//!
//! [`StaticUrlResolver`] serves fixed entries (config file, tests) and
//! [`ChainedUrlResolver`] tries resolvers in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::DEFAULT_RESOLVE_TIMEOUT;
use crate::error::FabricError;

/// Host CLI used for port discovery.
pub const DEFAULT_CLI_PROGRAM: &str = "vrooli";

/// Resolves a scenario name to the base URL of its API.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, scenario: &str) -> Result<String, FabricError>;
}

/// Env key consulted before the CLI: `my-scenario` → `MY_SCENARIO_API_URL`.
pub fn scenario_env_key(scenario: &str) -> String {
    format!("{}_API_URL", scenario.to_uppercase().replace('-', "_"))
}

/// Env override, then `vrooli scenario port`.
#[derive(Debug, Clone)]
pub struct CommandUrlResolver {
    program: String,
    timeout: Duration,
}

impl Default for CommandUrlResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CLI_PROGRAM, DEFAULT_RESOLVE_TIMEOUT)
    }
}

impl CommandUrlResolver {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn lookup_port(&self, scenario: &str) -> Result<String, FabricError> {
        let unavailable = |message: String| FabricError::ScenarioUnavailable {
            scenario: scenario.to_string(),
            message,
        };

        let mut command = Command::new(&self.program);
        command
            .args(["scenario", "port", scenario, "API_PORT"])
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| unavailable(format!("{} timed out after {:?}", self.program, self.timeout)))?
            .map_err(|e| unavailable(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(unavailable(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let port = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if port.is_empty() {
            return Err(unavailable("no API_PORT reported".to_string()));
        }
        port.parse::<u16>()
            .map_err(|_| unavailable(format!("invalid port '{}'", port)))?;
        Ok(port)
    }
}

#[async_trait]
impl UrlResolver for CommandUrlResolver {
    async fn resolve(&self, scenario: &str) -> Result<String, FabricError> {
        if let Ok(url) = std::env::var(scenario_env_key(scenario)) {
            if !url.is_empty() {
                return Ok(url);
            }
        }
        let port = self.lookup_port(scenario).await?;
        Ok(format!("http://localhost:{}", port))
    }
}

/// Fixed scenario → URL table.
#[derive(Debug, Clone, Default)]
pub struct StaticUrlResolver {
    urls: HashMap<String, String>,
}

impl StaticUrlResolver {
    pub fn new(urls: HashMap<String, String>) -> Self {
        Self { urls }
    }

    pub fn with(mut self, scenario: &str, url: &str) -> Self {
        self.urls.insert(scenario.to_string(), url.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[async_trait]
impl UrlResolver for StaticUrlResolver {
    async fn resolve(&self, scenario: &str) -> Result<String, FabricError> {
        self.urls
            .get(scenario)
            .cloned()
            .ok_or_else(|| FabricError::ScenarioUnavailable {
                scenario: scenario.to_string(),
                message: "no static URL configured".to_string(),
            })
    }
}

/// First resolver to succeed wins; the last error is reported otherwise.
pub struct ChainedUrlResolver {
    resolvers: Vec<Arc<dyn UrlResolver>>,
}

impl ChainedUrlResolver {
    pub fn new(resolvers: Vec<Arc<dyn UrlResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl UrlResolver for ChainedUrlResolver {
    async fn resolve(&self, scenario: &str) -> Result<String, FabricError> {
        let mut last_error = FabricError::ScenarioUnavailable {
            scenario: scenario.to_string(),
            message: "no resolvers configured".to_string(),
        };
        for resolver in &self.resolvers {
            match resolver.resolve(scenario).await {
                Ok(url) => return Ok(url),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_key_uppercases_and_underscores() {
        assert_eq!(scenario_env_key("app-issue-tracker"), "APP_ISSUE_TRACKER_API_URL");
        assert_eq!(scenario_env_key("x"), "X_API_URL");
    }

    #[tokio::test]
    async fn env_override_is_returned_unchanged() {
        std::env::set_var("RESOLVER_ENV_OVERRIDE_TEST_API_URL", "http://10.0.0.7:9000/");
        let resolver = CommandUrlResolver::new("definitely-not-a-real-cli", Duration::from_secs(1));
        let url = resolver.resolve("resolver-env-override-test").await.unwrap();
        assert_eq!(url, "http://10.0.0.7:9000/");
    }

    #[tokio::test]
    async fn missing_cli_is_scenario_unavailable() {
        let resolver = CommandUrlResolver::new("definitely-not-a-real-cli", Duration::from_secs(1));
        let err = resolver.resolve("resolver-missing-cli-test").await.unwrap_err();
        assert_eq!(err.code(), "SCENARIO_UNAVAILABLE");
    }

    #[tokio::test]
    async fn chained_falls_through_to_next() {
        let chained = ChainedUrlResolver::new(vec![
            Arc::new(StaticUrlResolver::default()),
            Arc::new(StaticUrlResolver::default().with("peer", "http://localhost:1234")),
        ]);
        assert_eq!(chained.resolve("peer").await.unwrap(), "http://localhost:1234");
        assert!(chained.resolve("other").await.is_err());
    }
}
