//! Persisted pipeline state and the reports derived from it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::StateError;

/// Newest state file layout this build reads and writes.
pub const STATE_SCHEMA_VERSION: u32 = 1;

// ──────────────────────────────────────────────
// Stages
// ──────────────────────────────────────────────

/// Pipeline stage. Declaration order is pipeline order, so `Ord` and
/// `BTreeMap<Stage, _>` iteration follow the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Bundle,
    Preflight,
    Generate,
    Build,
    Smoketest,
}

pub const STAGE_ORDER: [Stage; 5] = [
    Stage::Bundle,
    Stage::Preflight,
    Stage::Generate,
    Stage::Build,
    Stage::Smoketest,
];

impl Stage {
    /// Position in [`STAGE_ORDER`].
    pub fn index(self) -> usize {
        match self {
            Stage::Bundle => 0,
            Stage::Preflight => 1,
            Stage::Generate => 2,
            Stage::Build => 3,
            Stage::Smoketest => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Bundle => "bundle",
            Stage::Preflight => "preflight",
            Stage::Generate => "generate",
            Stage::Build => "build",
            Stage::Smoketest => "smoketest",
        }
    }

    /// This stage and every stage after it.
    pub fn downstream(self) -> &'static [Stage] {
        &STAGE_ORDER[self.index()..]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STAGE_ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| StateError::invalid(format!("unknown stage '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Valid,
    Stale,
    Invalid,
    None,
}

// ──────────────────────────────────────────────
// Persisted state
// ──────────────────────────────────────────────

/// Everything persisted for one scenario's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioState {
    pub scenario_name: String,
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    /// SHA-256 of the canonical JSON of this state with `hash` blanked.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub form_state: FormState,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageState>,
    /// Keyed by `service_id`.
    #[serde(default)]
    pub compressed_logs: BTreeMap<String, CompressedLog>,
    /// Keyed by `platform`.
    #[serde(default)]
    pub build_artifacts: BTreeMap<String, BuildArtifact>,
}

impl ScenarioState {
    /// Empty state for a scenario that has never been saved.
    pub fn new(scenario_name: &str) -> Self {
        Self {
            scenario_name: scenario_name.to_string(),
            schema_version: STATE_SCHEMA_VERSION,
            created_at: None,
            updated_at: None,
            hash: String::new(),
            form_state: FormState::default(),
            stages: BTreeMap::new(),
            compressed_logs: BTreeMap::new(),
            build_artifacts: BTreeMap::new(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageState> {
        self.stages.get(&stage)
    }

    /// Copy without the bulky compressed log payloads.
    pub fn without_logs(&self) -> Self {
        Self {
            compressed_logs: BTreeMap::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub input_fingerprint: InputFingerprint,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub validated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness_reason: Option<String>,
}

/// User-editable pipeline configuration.
///
/// Unknown keys are carried through untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormState {
    #[serde(default)]
    pub bundle_manifest_path: String,
    /// Only the key set survives persistence; values are blanked on save.
    #[serde(default)]
    pub preflight_secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub template_type: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub deployment_mode: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_display_name: String,
    #[serde(default)]
    pub app_description: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub icon_path: String,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub signing_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_config: Option<Value>,
    #[serde(default)]
    pub output_location: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Every input a stage depends on. Only the fields relevant to a stage are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_mtime: Option<i64>,
    /// Sorted. Never values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<String>,
    /// Sorted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_config_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
}

/// A service's log tail, gzip-compressed and base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedLog {
    pub service_id: String,
    pub content: String,
    pub original_lines: usize,
    /// Size of the gzip stream before base64 encoding.
    pub compressed_size: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub platform: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub built_at: Option<OffsetDateTime>,
}

// ──────────────────────────────────────────────
// Staleness reports
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    ManifestPath,
    ManifestContent,
    /// Same path and content, newer modification time.
    ManifestTouched,
    PreflightSecrets,
    Template,
    Framework,
    DeploymentMode,
    AppMetadata,
    Icon,
    Platforms,
    Signing,
    SigningConfig,
    OutputLocation,
}

/// One detected input difference, attributed to the earliest stage it affects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub change_type: ChangeType,
    pub affected_stage: Stage,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Valid,
    Partial,
    Stale,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatusReport {
    pub status: StageStatus,
    pub can_reuse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness_reason: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub validated_at: Option<OffsetDateTime>,
}

/// Which stages may be reused and which must re-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationStatus {
    pub scenario_name: String,
    pub overall_status: OverallStatus,
    pub stages: BTreeMap<Stage, StageStatusReport>,
    #[serde(default)]
    pub pending_changes: Vec<StateChange>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_validated: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_order_matches_ord() {
        let mut sorted = STAGE_ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, STAGE_ORDER.to_vec());
        for (i, stage) in STAGE_ORDER.iter().enumerate() {
            assert_eq!(stage.index(), i);
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), *stage);
        }
        assert_eq!(
            Stage::Generate.downstream(),
            &[Stage::Generate, Stage::Build, Stage::Smoketest]
        );
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn stages_serialize_as_lowercase_map_keys() {
        let mut state = ScenarioState::new("demo");
        state.stages.insert(
            Stage::Preflight,
            StageState {
                stage: Stage::Preflight,
                status: StageStatus::Valid,
                input_fingerprint: InputFingerprint::default(),
                validated_at: None,
                result: json!({"ok": true}),
                staleness_reason: None,
            },
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["stages"]["preflight"]["status"], "valid");
        let back: ScenarioState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn form_state_keeps_unknown_keys() {
        let form: FormState = serde_json::from_value(json!({
            "template_type": "spa",
            "custom_flag": 3
        }))
        .unwrap();
        assert_eq!(form.template_type, "spa");
        assert_eq!(form.extra["custom_flag"], 3);
        let value = serde_json::to_value(&form).unwrap();
        assert_eq!(value["custom_flag"], 3);
    }
}
