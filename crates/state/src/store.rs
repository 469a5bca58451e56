use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::fingerprint::compute_state_hash;
use crate::types::{ScenarioState, STATE_SCHEMA_VERSION};

/// Read-modify-write callback for [`StateStore::update`]. Returning an error
/// aborts the update without touching the persisted state.
pub type StateModifier = Box<dyn FnOnce(&mut ScenarioState) -> Result<(), StateError> + Send>;

/// Persistence for per-scenario pipeline state.
///
/// ## Save preparation
///
/// Every write goes through [`prepare_for_save`]: timestamps and the schema
/// version are stamped, secret values are blanked and `hash` is recomputed.
/// What a caller gets back from `save`/`update` is exactly what is on disk.
///
/// ## Missing state
///
/// `get` on a scenario that was never saved returns `Ok(None)`, not an error.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to live in axum
/// application state. Operations on the same scenario are serialized.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, scenario: &str) -> Result<Option<ScenarioState>, StateError>;

    /// Prepare and persist `state`, returning the persisted copy.
    async fn save(&self, state: ScenarioState) -> Result<ScenarioState, StateError>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, scenario: &str) -> Result<bool, StateError>;

    async fn exists(&self, scenario: &str) -> Result<bool, StateError>;

    /// Every readable state. Unreadable files are skipped with a warning.
    async fn list(&self) -> Result<Vec<ScenarioState>, StateError>;

    /// Sorted scenario names with persisted state.
    async fn list_scenarios(&self) -> Result<Vec<String>, StateError>;

    /// Load (or create empty), apply `modifier`, persist, all under the
    /// scenario's lock.
    async fn update(
        &self,
        scenario: &str,
        modifier: StateModifier,
    ) -> Result<ScenarioState, StateError>;

    /// Wait for in-flight writes to finish.
    async fn close(&self) -> Result<(), StateError>;
}

/// Reject names that could escape the state directory.
pub fn validate_scenario_name(scenario: &str) -> Result<(), StateError> {
    let bad = scenario.is_empty()
        || scenario.contains('/')
        || scenario.contains('\\')
        || scenario.contains("..")
        || scenario.contains('\0')
        || scenario.starts_with('.');
    if bad {
        return Err(StateError::invalid(format!(
            "invalid scenario name '{}'",
            scenario
        )));
    }
    Ok(())
}

/// Stamp timestamps and schema version, strip secret values, recompute `hash`.
pub fn prepare_for_save(state: &mut ScenarioState) -> Result<(), StateError> {
    let now = OffsetDateTime::now_utc();
    state.updated_at = Some(now);
    state.created_at.get_or_insert(now);
    state.schema_version = STATE_SCHEMA_VERSION;
    for value in state.form_state.preflight_secrets.values_mut() {
        value.clear();
    }
    // `null` would decode back as `None` and change the hash.
    if state.form_state.signing_config == Some(Value::Null) {
        state.form_state.signing_config = None;
    }
    state.hash = compute_state_hash(state)?;
    Ok(())
}

/// Decode a persisted state, checking schema version and content hash.
pub fn decode_state(scenario: &str, bytes: &[u8]) -> Result<ScenarioState, StateError> {
    let corrupt = |message: String| StateError::CorruptState {
        scenario: scenario.to_string(),
        message,
    };
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;

    // Checked before the typed decode so a newer layout reports its version.
    let found = raw
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if found > u64::from(STATE_SCHEMA_VERSION) {
        return Err(StateError::SchemaIncompatible {
            scenario: scenario.to_string(),
            found: u32::try_from(found).unwrap_or(u32::MAX),
            supported: STATE_SCHEMA_VERSION,
        });
    }

    let mut state: ScenarioState = serde_json::from_value(raw).map_err(|e| corrupt(e.to_string()))?;
    if state.scenario_name.is_empty() {
        state.scenario_name = scenario.to_string();
    }
    if !state.hash.is_empty() {
        let computed = compute_state_hash(&state)?;
        if computed != state.hash {
            return Err(StateError::HashMismatch {
                scenario: scenario.to_string(),
                stored: state.hash.clone(),
                computed,
            });
        }
    }
    Ok(state)
}

// ──────────────────────────────────────────────
// File-backed store
// ──────────────────────────────────────────────

/// One JSON file per scenario under `<data_dir>/state/`.
///
/// Writes go to a temp file in the same directory, are fsynced, then renamed
/// over the target, so readers never observe a partial file.
pub struct FileStateStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileStateStore {
    /// Open (creating if needed) the state directory under `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StateError> {
        let dir = data_dir.as_ref().join("state");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StateError::io(format!("creating {}", dir.display()), e))?;
        info!(dir = %dir.display(), "opened state store");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, scenario: &str) -> Result<PathBuf, StateError> {
        validate_scenario_name(scenario)?;
        Ok(self.dir.join(format!("{}.json", scenario)))
    }

    /// Hold the per-scenario lock until the returned lease is dropped.
    async fn lock_scenario(&self, scenario: &str) -> LockLease<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(scenario.to_string())
            .or_default()
            .clone();
        LockLease {
            locks: &self.locks,
            scenario: scenario.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn read_unlocked(&self, scenario: &str, path: &Path) -> Result<Option<ScenarioState>, StateError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => decode_state(scenario, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn write_unlocked(&self, state: &ScenarioState, path: PathBuf) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| StateError::CorruptState {
            scenario: state.scenario_name.clone(),
            message: format!("state is not serializable: {}", e),
        })?;
        let dir = self.dir.clone();
        let context = format!("writing {}", path.display());

        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StateError::io(context.clone(), std::io::Error::other(e)))?;
        written.map_err(|e| StateError::io(context, e))
    }
}

/// Exclusive hold on one scenario's lock. The map entry is removed on drop
/// once no other task holds or waits on it.
struct LockLease<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    scenario: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        if locks
            .get(&self.scenario)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.scenario);
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, scenario: &str) -> Result<Option<ScenarioState>, StateError> {
        let path = self.path_for(scenario)?;
        let _lease = self.lock_scenario(scenario).await;
        self.read_unlocked(scenario, &path).await
    }

    async fn save(&self, mut state: ScenarioState) -> Result<ScenarioState, StateError> {
        let scenario = state.scenario_name.clone();
        let path = self.path_for(&scenario)?;
        let _lease = self.lock_scenario(&scenario).await;
        prepare_for_save(&mut state)?;
        self.write_unlocked(&state, path).await?;
        debug!(scenario = %scenario, hash = %state.hash, "saved state");
        Ok(state)
    }

    async fn delete(&self, scenario: &str) -> Result<bool, StateError> {
        let path = self.path_for(scenario)?;
        let _lease = self.lock_scenario(scenario).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(scenario, "deleted state");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::io(format!("removing {}", path.display()), e)),
        }
    }

    async fn exists(&self, scenario: &str) -> Result<bool, StateError> {
        let path = self.path_for(scenario)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StateError::io(format!("stat {}", path.display()), e))
    }

    async fn list(&self) -> Result<Vec<ScenarioState>, StateError> {
        let mut states = Vec::new();
        for scenario in self.list_scenarios().await? {
            match self.get(&scenario).await {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => warn!(scenario = %scenario, code = e.code(), error = %e, "skipping unreadable state"),
            }
        }
        Ok(states)
    }

    async fn list_scenarios(&self) -> Result<Vec<String>, StateError> {
        let context = || format!("listing {}", self.dir.display());
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StateError::io(context(), e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::io(context(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_scenario_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn update(
        &self,
        scenario: &str,
        modifier: StateModifier,
    ) -> Result<ScenarioState, StateError> {
        let path = self.path_for(scenario)?;
        let _lease = self.lock_scenario(scenario).await;

        let mut state = self
            .read_unlocked(scenario, &path)
            .await?
            .unwrap_or_else(|| ScenarioState::new(scenario));
        modifier(&mut state)?;
        state.scenario_name = scenario.to_string();
        prepare_for_save(&mut state)?;
        self.write_unlocked(&state, path).await?;
        debug!(scenario, hash = %state.hash, "updated state");
        Ok(state)
    }

    async fn close(&self) -> Result<(), StateError> {
        let locks: Vec<_> = self
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for lock in locks {
            let _guard = lock.lock().await;
        }
        debug!(dir = %self.dir.display(), "state store closed");
        Ok(())
    }
}
