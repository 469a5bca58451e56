//! Runtime settings for the `fabric` binary.
//!
//! Each value is taken from the first source that provides it: command-line
//! flag, environment variable (both handled by clap), the optional TOML file,
//! then the built-in default.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fabric_tools::resolver::DEFAULT_CLI_PROGRAM;
use fabric_tools::{ChainedUrlResolver, ClientConfig, CommandUrlResolver, StaticUrlResolver, UrlResolver};
use serde::Deserialize;

pub(crate) const DEFAULT_PORT: u16 = 8095;
pub(crate) const DEFAULT_SCENARIO: &str = "scenario-fabric";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot determine home directory; set DATA_DIR or --data-dir")]
    NoHomeDir,
}

// ──────────────────────────────────────────────
// TOML file
// ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) port: Option<u16>,
    pub(crate) scenario: Option<String>,
    pub(crate) data_dir: Option<PathBuf>,
    pub(crate) peers: Option<Vec<String>>,
    pub(crate) timeouts: TimeoutsConfig,
    pub(crate) scenarios: BTreeMap<String, ScenarioEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct TimeoutsConfig {
    pub(crate) manifest_fetch_secs: Option<u64>,
    pub(crate) tool_execution_secs: Option<u64>,
    pub(crate) manifest_cache_ttl_secs: Option<u64>,
    pub(crate) resolve_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ScenarioEntry {
    pub(crate) url: String,
}

pub(crate) fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_file(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_file(text: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(text)
}

// ──────────────────────────────────────────────
// Resolved settings
// ──────────────────────────────────────────────

/// Values supplied on the command line or through the environment.
#[derive(Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) port: Option<u16>,
    pub(crate) scenario: Option<String>,
    pub(crate) data_dir: Option<PathBuf>,
    pub(crate) peers: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) port: u16,
    pub(crate) scenario: String,
    pub(crate) data_dir: PathBuf,
    pub(crate) peers: Vec<String>,
    pub(crate) client: ClientConfig,
    pub(crate) static_urls: HashMap<String, String>,
}

impl Settings {
    pub(crate) fn resolve(overrides: Overrides, file: FileConfig) -> Result<Self, ConfigError> {
        let scenario = overrides
            .scenario
            .filter(|s| !s.is_empty())
            .or(file.scenario)
            .unwrap_or_else(|| DEFAULT_SCENARIO.to_string());

        let data_dir = match overrides.data_dir.or(file.data_dir) {
            Some(dir) => dir,
            None => default_data_dir(&scenario)?,
        };

        let mut peers = split_peers(overrides.peers);
        if peers.is_empty() {
            peers = split_peers(file.peers.unwrap_or_default());
        }

        Ok(Self {
            port: overrides.port.or(file.port).unwrap_or(DEFAULT_PORT),
            scenario,
            data_dir,
            peers,
            client: client_config(&file.timeouts),
            static_urls: file
                .scenarios
                .into_iter()
                .map(|(name, entry)| (name, entry.url))
                .collect(),
        })
    }

    /// Static `[scenarios]` entries first, then env override and the host CLI.
    pub(crate) fn url_resolver(&self) -> Arc<dyn UrlResolver> {
        let command: Arc<dyn UrlResolver> = Arc::new(CommandUrlResolver::new(
            DEFAULT_CLI_PROGRAM,
            self.client.resolve_timeout,
        ));
        if self.static_urls.is_empty() {
            return command;
        }
        Arc::new(ChainedUrlResolver::new(vec![
            Arc::new(StaticUrlResolver::new(self.static_urls.clone())),
            command,
        ]))
    }
}

fn default_data_dir(scenario: &str) -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".vrooli").join(scenario))
}

/// Accepts repeated flags as well as comma separated lists, dropping blanks
/// and duplicates while keeping first-seen order.
fn split_peers(raw: Vec<String>) -> Vec<String> {
    let mut peers: Vec<String> = Vec::new();
    for entry in raw.iter().flat_map(|s| s.split(',')) {
        let name = entry.trim();
        if !name.is_empty() && !peers.iter().any(|p| p == name) {
            peers.push(name.to_string());
        }
    }
    peers
}

fn client_config(timeouts: &TimeoutsConfig) -> ClientConfig {
    let defaults = ClientConfig::default();
    let secs = |v: Option<u64>, fallback: Duration| v.map(Duration::from_secs).unwrap_or(fallback);
    ClientConfig {
        manifest_fetch_timeout: secs(timeouts.manifest_fetch_secs, defaults.manifest_fetch_timeout),
        manifest_cache_ttl: secs(timeouts.manifest_cache_ttl_secs, defaults.manifest_cache_ttl),
        tool_execution_timeout: secs(timeouts.tool_execution_secs, defaults.tool_execution_timeout),
        resolve_timeout: secs(timeouts.resolve_secs, defaults.resolve_timeout),
    }
}
