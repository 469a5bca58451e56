//! Canonical hashing of stage inputs, manifest files and whole states.
//!
//! "Canonical JSON" is `serde_json` output of a `Value`: object keys are
//! sorted because `serde_json::Map` is a `BTreeMap` without the
//! `preserve_order` feature, so field order never affects a hash.

use std::time::UNIX_EPOCH;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::StateError;
use crate::types::{FormState, InputFingerprint, ScenarioState, Stage};

/// Content hash and modification time of a bundle manifest on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDigest {
    pub path: String,
    /// Hex SHA-256 of the file contents. Empty when `path` is empty.
    pub hash: String,
    /// Seconds since the Unix epoch. `None` when unknown.
    pub mtime: Option<i64>,
}

/// Hex SHA-256 of a serializable value's canonical JSON.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(value)?.to_string();
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

/// Read the manifest once and hash it. An empty path is not an error.
pub async fn compute_manifest_hash(path: &str) -> Result<ManifestDigest, StateError> {
    if path.is_empty() {
        return Ok(ManifestDigest::default());
    }
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StateError::io(format!("reading manifest {}", path), e))?;
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| StateError::io(format!("stat manifest {}", path), e))?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    Ok(ManifestDigest {
        path: path.to_string(),
        hash: format!("{:x}", Sha256::digest(&bytes)),
        mtime,
    })
}

/// Content hash of `state` with its `hash` field blanked.
pub fn compute_state_hash(state: &ScenarioState) -> Result<String, StateError> {
    let mut unhashed = state.clone();
    unhashed.hash.clear();
    canonical_hash(&unhashed).map_err(|e| StateError::CorruptState {
        scenario: state.scenario_name.clone(),
        message: format!("state is not serializable: {}", e),
    })
}

/// Full hex SHA-256 of a fingerprint. The only value used for equality.
pub fn compute_fingerprint_hash(fp: &InputFingerprint) -> String {
    // A struct of strings, integers and booleans always serializes.
    canonical_hash(fp).unwrap_or_default()
}

/// First 16 hex characters, for display only.
pub fn display_hash(fp: &InputFingerprint) -> String {
    compute_fingerprint_hash(fp).chars().take(16).collect()
}

pub fn fingerprints_equal(a: Option<&InputFingerprint>, b: Option<&InputFingerprint>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => compute_fingerprint_hash(a) == compute_fingerprint_hash(b),
        _ => false,
    }
}

// ──────────────────────────────────────────────
// Extractors
// ──────────────────────────────────────────────

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

fn apply_manifest(fp: &mut InputFingerprint, form: &FormState, manifest: Option<&ManifestDigest>) {
    fp.manifest_path = non_empty(&form.bundle_manifest_path);
    if let Some(digest) = manifest.filter(|d| !d.hash.is_empty()) {
        fp.manifest_hash = Some(digest.hash.clone());
        fp.manifest_mtime = digest.mtime;
    }
}

fn apply_preflight(fp: &mut InputFingerprint, form: &FormState) {
    fp.secret_keys = Some(form.preflight_secrets.keys().cloned().collect());
}

fn apply_generate(fp: &mut InputFingerprint, form: &FormState) {
    fp.template_type = non_empty(&form.template_type);
    fp.framework = non_empty(&form.framework);
    fp.deployment_mode = non_empty(&form.deployment_mode);
    fp.app_name = non_empty(&form.app_name);
    fp.app_display_name = non_empty(&form.app_display_name);
    fp.app_description = non_empty(&form.app_description);
    fp.app_version = non_empty(&form.app_version);
    fp.icon_path = non_empty(&form.icon_path);
}

fn apply_build(fp: &mut InputFingerprint, form: &FormState) {
    fp.platforms = Some(sorted(form.platforms.clone()));
    fp.signing_enabled = Some(form.signing_enabled);
    fp.signing_config_hash = form
        .signing_config
        .as_ref()
        .and_then(|config| canonical_hash(config).ok());
    fp.output_location = non_empty(&form.output_location);
}

/// Inputs `stage` depends on, taken from `form` and the manifest digest.
pub fn stage_fingerprint(
    stage: Stage,
    form: &FormState,
    manifest: Option<&ManifestDigest>,
) -> InputFingerprint {
    let mut fp = InputFingerprint::default();
    match stage {
        Stage::Bundle => apply_manifest(&mut fp, form, manifest),
        Stage::Preflight => apply_preflight(&mut fp, form),
        Stage::Generate => apply_generate(&mut fp, form),
        Stage::Build => apply_build(&mut fp, form),
        Stage::Smoketest => fp.platforms = Some(sorted(form.platforms.clone())),
    }
    fp
}

/// Every input of every stage, for comparison against stored fingerprints.
pub fn current_fingerprint(form: &FormState, manifest: Option<&ManifestDigest>) -> InputFingerprint {
    let mut fp = InputFingerprint::default();
    apply_manifest(&mut fp, form, manifest);
    apply_preflight(&mut fp, form);
    apply_generate(&mut fp, form);
    apply_build(&mut fp, form);
    fp
}
