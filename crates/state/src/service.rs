//! Load/save/check/clear/invalidate orchestration over a [`StateStore`].
//!
//! Saves use optimistic concurrency: a caller that read the state with hash
//! `H` sends `expected_hash = H`, and the save is refused (not failed) if the
//! persisted hash has moved on.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::StateError;
use crate::fingerprint::{compute_manifest_hash, current_fingerprint, stage_fingerprint, ManifestDigest};
use crate::logs::{compress_log, decompress_log};
use crate::staleness::{build_validation_status, check_manifest_freshness, compute_affected_stages, detect_changes};
use crate::store::StateStore;
use crate::types::{
    BuildArtifact, CompressedLog, FormState, InputFingerprint, OverallStatus, ScenarioState, Stage,
    StageState, StageStatus, StateChange, ValidationStatus,
};

// ──────────────────────────────────────────────
// Requests and responses
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadStateRequest {
    #[serde(default)]
    pub include_logs: bool,
    #[serde(default)]
    pub validate_manifest: bool,
    #[serde(default)]
    pub manifest_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadStateResponse {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ScenarioState>,
    #[serde(default)]
    pub manifest_changed: bool,
    /// Manifest hash recorded by the bundle stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_hash: Option<String>,
    /// Manifest hash on disk now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
}

/// Raw log text for one service, compressed on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTail {
    pub service_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveStateRequest {
    #[serde(default)]
    pub form_state: FormState,
    /// Hash the caller last saw. Empty skips the concurrency check.
    #[serde(default)]
    pub expected_hash: String,
    /// Hash the manifest on disk and refresh the bundle fingerprint.
    #[serde(default)]
    pub compute_hash: bool,
    /// Defaults to `form_state.bundle_manifest_path`.
    #[serde(default)]
    pub manifest_path: Option<String>,
    #[serde(default)]
    pub log_tails: Vec<LogTail>,
    #[serde(default)]
    pub build_artifacts: Vec<BuildArtifact>,
    /// Results of stages that just ran; each becomes `valid`.
    #[serde(default)]
    pub stage_results: BTreeMap<Stage, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveStateResponse {
    pub success: bool,
    #[serde(default)]
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_state: Option<ScenarioState>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckStalenessRequest {
    #[serde(default)]
    pub current_config: FormState,
    /// Manifest to hash when `manifest_hash` is not supplied.
    #[serde(default)]
    pub manifest_path: Option<String>,
    #[serde(default)]
    pub manifest_hash: Option<String>,
    #[serde(default)]
    pub manifest_mtime: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStalenessResponse {
    pub valid: bool,
    pub changed: bool,
    pub changes: Vec<StateChange>,
    pub affected_stages: Vec<Stage>,
    pub status: ValidationStatus,
    /// Hash of the stored state; empty when none exists.
    pub stored_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearStateResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLogsResponse {
    pub service_id: String,
    pub content: String,
    pub lines: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub from_stage: Stage,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkStageValidRequest {
    #[serde(default)]
    pub fingerprint: InputFingerprint,
    #[serde(default)]
    pub result: Value,
}

/// One row of the state listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSummary {
    pub scenario_name: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub hash: String,
    pub overall_status: OverallStatus,
    pub stages: BTreeMap<Stage, StageStatus>,
}

// ──────────────────────────────────────────────
// Service
// ──────────────────────────────────────────────

pub struct StateService {
    store: Arc<dyn StateStore>,
}

impl StateService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Discovery read: a missing state is `found=false`, not an error.
    pub async fn load_state(&self, scenario: &str, req: &LoadStateRequest) -> Result<LoadStateResponse, StateError> {
        let Some(state) = self.store.get(scenario).await? else {
            return Ok(LoadStateResponse {
                found: false,
                state: None,
                manifest_changed: false,
                stored_hash: None,
                current_hash: None,
            });
        };

        let mut response = LoadStateResponse {
            found: true,
            state: None,
            manifest_changed: false,
            stored_hash: None,
            current_hash: None,
        };

        if req.validate_manifest {
            let path = req
                .manifest_path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| state.form_state.bundle_manifest_path.clone());
            if !path.is_empty() {
                let stored = state
                    .stage(Stage::Bundle)
                    .and_then(|b| b.input_fingerprint.manifest_hash.clone());
                let current = match compute_manifest_hash(&path).await {
                    Ok(digest) => Some(digest.hash),
                    Err(e) => {
                        warn!(scenario, path = %path, error = %e, "cannot hash bundle manifest");
                        None
                    }
                };
                response.manifest_changed = matches!((&stored, &current), (Some(s), Some(c)) if s != c);
                response.stored_hash = stored;
                response.current_hash = current;
            }
        }

        response.state = Some(if req.include_logs {
            state
        } else {
            state.without_logs()
        });
        Ok(response)
    }

    pub async fn save_state(&self, scenario: &str, req: SaveStateRequest) -> Result<SaveStateResponse, StateError> {
        let manifest_path = req
            .manifest_path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| req.form_state.bundle_manifest_path.clone());
        let digest = if req.compute_hash && !manifest_path.is_empty() {
            Some(compute_manifest_hash(&manifest_path).await?)
        } else {
            None
        };
        let logs = req
            .log_tails
            .iter()
            .map(|tail| compress_log(&tail.service_id, &tail.content))
            .collect::<Result<Vec<CompressedLog>, StateError>>()?;

        let expected_hash = req.expected_hash;
        let form_state = req.form_state;
        let artifacts = req.build_artifacts;
        let stage_results = req.stage_results;

        let modifier = Box::new(move |state: &mut ScenarioState| {
            if !expected_hash.is_empty() && !state.hash.is_empty() && state.hash != expected_hash {
                return Err(StateError::Conflict {
                    server_state: Box::new(state.clone()),
                });
            }

            state.form_state = form_state;

            if let Some(digest) = &digest {
                let bundle = state.stages.entry(Stage::Bundle).or_insert_with(|| StageState {
                    stage: Stage::Bundle,
                    status: StageStatus::None,
                    input_fingerprint: InputFingerprint::default(),
                    validated_at: None,
                    result: Value::Null,
                    staleness_reason: None,
                });
                bundle.input_fingerprint.manifest_path = Some(digest.path.clone());
                bundle.input_fingerprint.manifest_hash = Some(digest.hash.clone());
                bundle.input_fingerprint.manifest_mtime = digest.mtime;
            }

            for log in logs {
                state.compressed_logs.insert(log.service_id.clone(), log);
            }
            for artifact in artifacts {
                state.build_artifacts.insert(artifact.platform.clone(), artifact);
            }

            let manifest = digest.or_else(|| known_manifest(state));
            let now = OffsetDateTime::now_utc();
            for (stage, result) in stage_results {
                let input_fingerprint = stage_fingerprint(stage, &state.form_state, manifest.as_ref());
                state.stages.insert(
                    stage,
                    StageState {
                        stage,
                        status: StageStatus::Valid,
                        input_fingerprint,
                        validated_at: Some(now),
                        result,
                        staleness_reason: None,
                    },
                );
            }
            Ok(())
        });

        match self.store.update(scenario, modifier).await {
            Ok(saved) => {
                info!(scenario, hash = %saved.hash, "state saved");
                Ok(SaveStateResponse {
                    success: true,
                    conflict: false,
                    server_state: None,
                    updated_at: saved.updated_at,
                    hash: saved.hash,
                    message: None,
                })
            }
            Err(StateError::Conflict { server_state }) => {
                warn!(scenario, server_hash = %server_state.hash, "save rejected: state changed since read");
                Ok(SaveStateResponse {
                    success: false,
                    conflict: true,
                    updated_at: server_state.updated_at,
                    hash: server_state.hash.clone(),
                    message: Some("state was modified by another client".to_string()),
                    server_state: Some(*server_state),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn clear_state(&self, scenario: &str) -> Result<ClearStateResponse, StateError> {
        let deleted = self.store.delete(scenario).await?;
        Ok(ClearStateResponse {
            success: true,
            message: if deleted {
                format!("state for {} cleared", scenario)
            } else {
                format!("no state stored for {}", scenario)
            },
        })
    }

    pub async fn check_staleness(
        &self,
        scenario: &str,
        req: CheckStalenessRequest,
    ) -> Result<CheckStalenessResponse, StateError> {
        let mut config = req.current_config;
        let path = req.manifest_path.filter(|p| !p.is_empty());
        if let Some(path) = &path {
            if config.bundle_manifest_path.is_empty() {
                config.bundle_manifest_path = path.clone();
            }
        }
        let digest = match (path, req.manifest_hash.filter(|h| !h.is_empty())) {
            (path, Some(hash)) => Some(ManifestDigest {
                path: path.unwrap_or_else(|| config.bundle_manifest_path.clone()),
                hash,
                mtime: req.manifest_mtime,
            }),
            (Some(path), None) => Some(compute_manifest_hash(&path).await?),
            (None, None) => None,
        };

        let stored = self.store.get(scenario).await?;
        let current = current_fingerprint(&config, digest.as_ref());
        let changes = detect_changes(stored.as_ref(), &current);
        let affected_stages = compute_affected_stages(&changes);
        let status = build_validation_status(scenario, stored.as_ref(), &changes);
        if !changes.is_empty() {
            info!(
                scenario,
                changes = changes.len(),
                first_affected = %affected_stages[0],
                "pipeline inputs changed"
            );
        }

        Ok(CheckStalenessResponse {
            valid: changes.is_empty(),
            changed: !changes.is_empty(),
            changes,
            affected_stages,
            status,
            stored_hash: stored.map(|s| s.hash).unwrap_or_default(),
        })
    }

    /// Differences between stored fingerprints and `current`.
    pub async fn detect_changes(&self, scenario: &str, current: &InputFingerprint) -> Result<Vec<StateChange>, StateError> {
        let stored = self.store.get(scenario).await?;
        Ok(detect_changes(stored.as_ref(), current))
    }

    /// Hash the manifest at `path` and compare it to the bundle stage's record.
    pub async fn check_manifest_freshness(
        &self,
        scenario: &str,
        path: &str,
    ) -> Result<(bool, Option<StateChange>), StateError> {
        let digest = compute_manifest_hash(path).await?;
        let stored = self.store.get(scenario).await?;
        Ok(check_manifest_freshness(stored.as_ref(), &digest))
    }

    /// Decompressed log for `service_id`, or `None`.
    pub async fn get_logs(&self, scenario: &str, service_id: &str) -> Result<Option<GetLogsResponse>, StateError> {
        let Some(state) = self.store.get(scenario).await? else {
            return Ok(None);
        };
        let Some(log) = state.compressed_logs.get(service_id) else {
            return Ok(None);
        };
        let content = decompress_log(log).map_err(|e| match e {
            StateError::CorruptState { message, .. } => StateError::CorruptState {
                scenario: scenario.to_string(),
                message,
            },
            other => other,
        })?;
        Ok(Some(GetLogsResponse {
            service_id: log.service_id.clone(),
            content,
            lines: log.original_lines,
            captured_at: log.captured_at,
        }))
    }

    /// Mark `from_stage` and every later stored stage stale.
    ///
    /// A scenario without state is left uncreated.
    pub async fn invalidate_stages_from(
        &self,
        scenario: &str,
        from_stage: Stage,
        reason: &str,
    ) -> Result<ValidationStatus, StateError> {
        if !self.store.exists(scenario).await? {
            return Ok(build_validation_status(scenario, None, &[]));
        }
        let reason = if reason.is_empty() {
            format!("invalidated from {}", from_stage)
        } else {
            reason.to_string()
        };
        let applied = reason.clone();
        let state = self
            .store
            .update(
                scenario,
                Box::new(move |state: &mut ScenarioState| {
                    for stage in from_stage.downstream() {
                        if let Some(entry) = state.stages.get_mut(stage) {
                            entry.status = StageStatus::Stale;
                            entry.staleness_reason = Some(applied.clone());
                        }
                    }
                    Ok(())
                }),
            )
            .await?;
        info!(scenario, from = %from_stage, reason = %reason, "stages invalidated");
        Ok(build_validation_status(scenario, Some(&state), &[]))
    }

    /// Replace the stage entry with a valid one. Idempotent.
    pub async fn mark_stage_valid(
        &self,
        scenario: &str,
        stage: Stage,
        fingerprint: InputFingerprint,
        result: Value,
    ) -> Result<ScenarioState, StateError> {
        let state = self
            .store
            .update(
                scenario,
                Box::new(move |state: &mut ScenarioState| {
                    state.stages.insert(
                        stage,
                        StageState {
                            stage,
                            status: StageStatus::Valid,
                            input_fingerprint: fingerprint,
                            validated_at: Some(OffsetDateTime::now_utc()),
                            result,
                            staleness_reason: None,
                        },
                    );
                    Ok(())
                }),
            )
            .await?;
        info!(scenario, %stage, "stage marked valid");
        Ok(state)
    }

    pub async fn list_states(&self) -> Result<Vec<StateSummary>, StateError> {
        let states = self.store.list().await?;
        Ok(states
            .into_iter()
            .map(|state| {
                let overall_status = build_validation_status(&state.scenario_name, Some(&state), &[]).overall_status;
                StateSummary {
                    stages: state.stages.iter().map(|(k, v)| (*k, v.status)).collect(),
                    scenario_name: state.scenario_name,
                    updated_at: state.updated_at,
                    hash: state.hash,
                    overall_status,
                }
            })
            .collect())
    }
}

/// Manifest digest recorded by the bundle stage, if it still matches the form.
fn known_manifest(state: &ScenarioState) -> Option<ManifestDigest> {
    let fp = &state.stage(Stage::Bundle)?.input_fingerprint;
    let path = fp.manifest_path.clone()?;
    if path != state.form_state.bundle_manifest_path {
        return None;
    }
    Some(ManifestDigest {
        path,
        hash: fp.manifest_hash.clone()?,
        mtime: fp.manifest_mtime,
    })
}
