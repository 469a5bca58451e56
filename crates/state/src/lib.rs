//! Pipeline state engine: persists per-scenario stage results and decides,
//! from input fingerprints, which stages can be reused and which must re-run.

mod error;
pub mod fingerprint;
pub mod logs;
mod service;
pub mod staleness;
mod store;
mod types;

pub use error::StateError;
pub use fingerprint::{
    compute_fingerprint_hash, compute_manifest_hash, compute_state_hash, current_fingerprint,
    display_hash, fingerprints_equal, stage_fingerprint, ManifestDigest,
};
pub use service::{
    CheckStalenessRequest, CheckStalenessResponse, ClearStateResponse, GetLogsResponse,
    InvalidateRequest, LoadStateRequest, LoadStateResponse, LogTail, MarkStageValidRequest,
    SaveStateRequest, SaveStateResponse, StateService, StateSummary,
};
pub use staleness::{build_validation_status, compute_affected_stages, detect_changes};
pub use store::{
    decode_state, prepare_for_save, validate_scenario_name, FileStateStore, StateModifier,
    StateStore,
};
pub use types::{
    BuildArtifact, ChangeType, CompressedLog, FormState, InputFingerprint, OverallStatus,
    ScenarioState, Stage, StageState, StageStatus, StageStatusReport, StateChange,
    ValidationStatus, STAGE_ORDER, STATE_SCHEMA_VERSION,
};
