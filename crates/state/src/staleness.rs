//! Stored-versus-current fingerprint comparison and downstream invalidation.
//!
//! Each detected difference is attributed to the earliest stage it affects,
//! which is not always the stage that stored the input: the manifest path is
//! consumed by `bundle`, but its content is first read by `preflight`.

use serde_json::Value;

use crate::fingerprint::ManifestDigest;
use crate::types::{
    ChangeType, InputFingerprint, OverallStatus, ScenarioState, Stage, StageStatus,
    StageStatusReport, StateChange, ValidationStatus, STAGE_ORDER,
};

fn change<T: serde::Serialize>(
    change_type: ChangeType,
    affected_stage: Stage,
    reason: String,
    old: &Option<T>,
    new: &Option<T>,
) -> StateChange {
    let to_value = |v: &Option<T>| v.as_ref().and_then(|v| serde_json::to_value(v).ok());
    StateChange {
        change_type,
        affected_stage,
        reason,
        old_value: to_value(old),
        new_value: to_value(new),
    }
}

fn describe(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("(unset)")
}

fn compare_field(
    changes: &mut Vec<StateChange>,
    change_type: ChangeType,
    affected_stage: Stage,
    label: &str,
    stored: &Option<String>,
    current: &Option<String>,
) {
    if stored != current {
        changes.push(change(
            change_type,
            affected_stage,
            format!("{} changed from {} to {}", label, describe(stored), describe(current)),
            stored,
            current,
        ));
    }
}

fn compare_manifest(changes: &mut Vec<StateChange>, stored: &InputFingerprint, current: &InputFingerprint) {
    if stored.manifest_path != current.manifest_path {
        changes.push(change(
            ChangeType::ManifestPath,
            Stage::Bundle,
            format!(
                "bundle manifest path changed from {} to {}",
                describe(&stored.manifest_path),
                describe(&current.manifest_path)
            ),
            &stored.manifest_path,
            &current.manifest_path,
        ));
        return;
    }
    // A hash that was not computed for this check says nothing about content.
    let (Some(old_hash), Some(new_hash)) = (&stored.manifest_hash, &current.manifest_hash) else {
        return;
    };
    if old_hash != new_hash {
        changes.push(change(
            ChangeType::ManifestContent,
            Stage::Preflight,
            "bundle manifest content changed".to_string(),
            &stored.manifest_hash,
            &current.manifest_hash,
        ));
    } else if let (Some(old), Some(new)) = (stored.manifest_mtime, current.manifest_mtime) {
        if old != new {
            changes.push(change(
                ChangeType::ManifestTouched,
                Stage::Preflight,
                "bundle manifest was touched without content changes".to_string(),
                &Some(old),
                &Some(new),
            ));
        }
    }
}

fn compare_preflight(changes: &mut Vec<StateChange>, stored: &InputFingerprint, current: &InputFingerprint) {
    if stored.secret_keys != current.secret_keys {
        changes.push(change(
            ChangeType::PreflightSecrets,
            Stage::Preflight,
            "preflight secret keys changed".to_string(),
            &stored.secret_keys,
            &current.secret_keys,
        ));
    }
}

fn compare_generate(changes: &mut Vec<StateChange>, stored: &InputFingerprint, current: &InputFingerprint) {
    let fields = [
        (ChangeType::Template, "template", &stored.template_type, &current.template_type),
        (ChangeType::Framework, "framework", &stored.framework, &current.framework),
        (
            ChangeType::DeploymentMode,
            "deployment mode",
            &stored.deployment_mode,
            &current.deployment_mode,
        ),
        (ChangeType::AppMetadata, "app name", &stored.app_name, &current.app_name),
        (
            ChangeType::AppMetadata,
            "app display name",
            &stored.app_display_name,
            &current.app_display_name,
        ),
        (
            ChangeType::AppMetadata,
            "app description",
            &stored.app_description,
            &current.app_description,
        ),
        (ChangeType::AppMetadata, "app version", &stored.app_version, &current.app_version),
        (ChangeType::Icon, "icon", &stored.icon_path, &current.icon_path),
    ];
    for (change_type, label, old, new) in fields {
        compare_field(changes, change_type, Stage::Generate, label, old, new);
    }
}

fn compare_build(changes: &mut Vec<StateChange>, stored: &InputFingerprint, current: &InputFingerprint) {
    if stored.platforms != current.platforms {
        changes.push(change(
            ChangeType::Platforms,
            Stage::Build,
            "target platforms changed".to_string(),
            &stored.platforms,
            &current.platforms,
        ));
    }
    if stored.signing_enabled != current.signing_enabled {
        changes.push(change(
            ChangeType::Signing,
            Stage::Build,
            "code signing toggled".to_string(),
            &stored.signing_enabled,
            &current.signing_enabled,
        ));
    }
    if stored.signing_config_hash != current.signing_config_hash {
        changes.push(change(
            ChangeType::SigningConfig,
            Stage::Build,
            "signing configuration changed".to_string(),
            &stored.signing_config_hash,
            &current.signing_config_hash,
        ));
    }
    compare_field(
        changes,
        ChangeType::OutputLocation,
        Stage::Build,
        "output location",
        &stored.output_location,
        &current.output_location,
    );
}

/// Differences between every stored stage fingerprint and `current`.
///
/// No stored state means nothing to invalidate.
pub fn detect_changes(stored: Option<&ScenarioState>, current: &InputFingerprint) -> Vec<StateChange> {
    let Some(stored) = stored else {
        return Vec::new();
    };
    let mut changes = Vec::new();
    for (stage, state) in &stored.stages {
        let fp = &state.input_fingerprint;
        match stage {
            Stage::Bundle => compare_manifest(&mut changes, fp, current),
            Stage::Preflight => compare_preflight(&mut changes, fp, current),
            Stage::Generate => compare_generate(&mut changes, fp, current),
            Stage::Build => compare_build(&mut changes, fp, current),
            Stage::Smoketest => {}
        }
    }
    changes
}

/// Suffix of the pipeline starting at the earliest affected stage.
pub fn compute_affected_stages(changes: &[StateChange]) -> Vec<Stage> {
    changes
        .iter()
        .map(|c| c.affected_stage)
        .min()
        .map(|first| first.downstream().to_vec())
        .unwrap_or_default()
}

/// Compare a freshly hashed manifest to the bundle stage's stored hash.
///
/// Returns `(fresh, change)`. Without a stored bundle hash the manifest is
/// considered fresh.
pub fn check_manifest_freshness(
    stored: Option<&ScenarioState>,
    digest: &ManifestDigest,
) -> (bool, Option<StateChange>) {
    let stored_hash = stored
        .and_then(|s| s.stage(Stage::Bundle))
        .and_then(|b| b.input_fingerprint.manifest_hash.clone());
    match stored_hash {
        Some(hash) if hash != digest.hash => {
            let change = StateChange {
                change_type: ChangeType::ManifestContent,
                affected_stage: Stage::Preflight,
                reason: format!("bundle manifest {} changed on disk", digest.path),
                old_value: Some(Value::String(hash)),
                new_value: Some(Value::String(digest.hash.clone())),
            };
            (false, Some(change))
        }
        _ => (true, None),
    }
}

/// Per-stage reuse decision for `stored` given `changes`.
pub fn build_validation_status(
    scenario_name: &str,
    stored: Option<&ScenarioState>,
    changes: &[StateChange],
) -> ValidationStatus {
    let affected = compute_affected_stages(changes);
    let mut stages = std::collections::BTreeMap::new();

    for stage in STAGE_ORDER {
        let report = match stored {
            None => StageStatusReport {
                status: StageStatus::None,
                can_reuse: false,
                staleness_reason: None,
                validated_at: None,
            },
            Some(state) => {
                let entry = state.stage(stage);
                let validated_at = entry.and_then(|e| e.validated_at);
                if affected.contains(&stage) {
                    // Downstream stages inherit the reason of the change that reached them.
                    let reason = changes
                        .iter()
                        .find(|c| c.affected_stage == stage)
                        .or_else(|| changes.iter().find(|c| c.affected_stage <= stage))
                        .map(|c| c.reason.clone());
                    StageStatusReport {
                        status: StageStatus::Stale,
                        can_reuse: false,
                        staleness_reason: reason,
                        validated_at,
                    }
                } else {
                    let status = entry.map(|e| e.status).unwrap_or(StageStatus::None);
                    StageStatusReport {
                        status,
                        can_reuse: status == StageStatus::Valid,
                        staleness_reason: entry.and_then(|e| e.staleness_reason.clone()),
                        validated_at,
                    }
                }
            }
        };
        stages.insert(stage, report);
    }

    let any_valid = stages.values().any(|r| r.status == StageStatus::Valid);
    let any_stale = stages.values().any(|r| r.status == StageStatus::Stale);
    let overall_status = if stages.values().all(|r| r.status == StageStatus::Valid) {
        OverallStatus::Valid
    } else if any_valid && any_stale {
        OverallStatus::Partial
    } else if any_stale {
        OverallStatus::Stale
    } else {
        OverallStatus::None
    };
    let last_validated = stages
        .values()
        .filter(|r| r.can_reuse)
        .filter_map(|r| r.validated_at)
        .max();

    ValidationStatus {
        scenario_name: scenario_name.to_string(),
        overall_status,
        stages,
        pending_changes: changes.to_vec(),
        last_validated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{current_fingerprint, stage_fingerprint};
    use crate::types::{FormState, StageState};
    use time::OffsetDateTime;

    fn form() -> FormState {
        FormState {
            bundle_manifest_path: "/bundles/app.json".into(),
            template_type: "spa".into(),
            framework: "electron".into(),
            platforms: vec!["linux".into()],
            ..FormState::default()
        }
    }

    fn digest(hash: &str, mtime: i64) -> ManifestDigest {
        ManifestDigest {
            path: "/bundles/app.json".into(),
            hash: hash.into(),
            mtime: Some(mtime),
        }
    }

    fn all_valid(form: &FormState, manifest: &ManifestDigest) -> ScenarioState {
        let mut state = ScenarioState::new("demo");
        for stage in STAGE_ORDER {
            state.stages.insert(
                stage,
                StageState {
                    stage,
                    status: StageStatus::Valid,
                    input_fingerprint: stage_fingerprint(stage, form, Some(manifest)),
                    validated_at: Some(OffsetDateTime::now_utc()),
                    result: Value::Null,
                    staleness_reason: None,
                },
            );
        }
        state
    }

    #[test]
    fn unchanged_inputs_produce_no_changes() {
        let manifest = digest("aaa", 10);
        let state = all_valid(&form(), &manifest);
        let current = current_fingerprint(&form(), Some(&manifest));
        assert!(detect_changes(Some(&state), &current).is_empty());
        assert!(detect_changes(None, &current).is_empty());
    }

    #[test]
    fn manifest_changes_are_attributed_by_kind() {
        let state = all_valid(&form(), &digest("aaa", 10));

        let content = detect_changes(Some(&state), &current_fingerprint(&form(), Some(&digest("bbb", 11))));
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].change_type, ChangeType::ManifestContent);
        assert_eq!(content[0].affected_stage, Stage::Preflight);

        let touched = detect_changes(Some(&state), &current_fingerprint(&form(), Some(&digest("aaa", 99))));
        assert_eq!(touched[0].change_type, ChangeType::ManifestTouched);
        assert_eq!(touched[0].affected_stage, Stage::Preflight);

        let mut moved = form();
        moved.bundle_manifest_path = "/bundles/other.json".into();
        let path = detect_changes(Some(&state), &current_fingerprint(&moved, None));
        assert_eq!(path[0].change_type, ChangeType::ManifestPath);
        assert_eq!(path[0].affected_stage, Stage::Bundle);
    }

    #[test]
    fn unknown_mtime_with_same_hash_is_no_change() {
        let state = all_valid(&form(), &digest("aaa", 10));
        let without_mtime = ManifestDigest {
            mtime: None,
            ..digest("aaa", 0)
        };
        let current = current_fingerprint(&form(), Some(&without_mtime));
        assert_eq!(current.manifest_mtime, None);
        assert!(detect_changes(Some(&state), &current).is_empty());
    }

    #[test]
    fn uncomputed_manifest_hash_is_not_a_change() {
        let state = all_valid(&form(), &digest("aaa", 10));
        assert!(detect_changes(Some(&state), &current_fingerprint(&form(), None)).is_empty());
    }

    #[test]
    fn affected_stages_is_a_pipeline_suffix() {
        assert!(compute_affected_stages(&[]).is_empty());
        let state = all_valid(&form(), &digest("aaa", 10));
        let mut next = form();
        next.platforms.push("win".into());
        next.framework = "tauri".into();
        let changes = detect_changes(Some(&state), &current_fingerprint(&next, None));
        assert_eq!(changes.len(), 2);
        assert_eq!(
            compute_affected_stages(&changes),
            vec![Stage::Generate, Stage::Build, Stage::Smoketest]
        );
    }

    #[test]
    fn validation_status_without_state_is_none() {
        let status = build_validation_status("demo", None, &[]);
        assert_eq!(status.overall_status, OverallStatus::None);
        assert!(status.stages.values().all(|r| r.status == StageStatus::None && !r.can_reuse));
    }

    #[test]
    fn validation_status_marks_suffix_stale() {
        let state = all_valid(&form(), &digest("aaa", 10));
        assert_eq!(
            build_validation_status("demo", Some(&state), &[]).overall_status,
            OverallStatus::Valid
        );

        let mut next = form();
        next.output_location = "/out".into();
        let changes = detect_changes(Some(&state), &current_fingerprint(&next, None));
        let status = build_validation_status("demo", Some(&state), &changes);
        assert_eq!(status.overall_status, OverallStatus::Partial);
        assert!(status.stages[&Stage::Generate].can_reuse);
        assert_eq!(status.stages[&Stage::Build].status, StageStatus::Stale);
        assert_eq!(
            status.stages[&Stage::Smoketest].staleness_reason.as_deref(),
            Some("output location changed from (unset) to /out")
        );
        assert!(status.last_validated.is_some());
    }

    #[test]
    fn manifest_freshness() {
        let state = all_valid(&form(), &digest("aaa", 10));
        assert_eq!(check_manifest_freshness(Some(&state), &digest("aaa", 50)), (true, None));
        let (fresh, change) = check_manifest_freshness(Some(&state), &digest("zzz", 50));
        assert!(!fresh);
        assert_eq!(change.unwrap().affected_stage, Stage::Preflight);
        assert!(check_manifest_freshness(None, &digest("zzz", 50)).0);
    }
}
