use crate::types::ScenarioState;

/// All errors that can be returned by a [`StateStore`](crate::StateStore)
/// or the [`StateService`](crate::StateService).
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No persisted state (or log entry) for the scenario.
    #[error("{what} not found for scenario {scenario}")]
    NotFound { scenario: String, what: String },

    /// Optimistic concurrency failure: the caller's `expected_hash` no longer
    /// matches the persisted state. Carries the current server copy.
    #[error("state for {} changed since it was read (server hash {})", server_state.scenario_name, server_state.hash)]
    Conflict { server_state: Box<ScenarioState> },

    /// The persisted `schema_version` is newer than this build understands.
    #[error("scenario {scenario} has schema version {found}, newest supported is {supported}")]
    SchemaIncompatible {
        scenario: String,
        found: u32,
        supported: u32,
    },

    /// The state file did not decode.
    #[error("corrupt state for scenario {scenario}: {message}")]
    CorruptState { scenario: String, message: String },

    /// The stored `hash` does not match the recomputed content hash.
    #[error("hash mismatch for scenario {scenario}: stored {stored}, computed {computed}")]
    HashMismatch {
        scenario: String,
        stored: String,
        computed: String,
    },

    /// Malformed request or unusable scenario name.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Filesystem failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StateError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        StateError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Machine-readable taxonomy code.
    pub fn code(&self) -> &'static str {
        match self {
            StateError::NotFound { .. } => "STATE_NOT_FOUND",
            StateError::Conflict { .. } => "STATE_CONFLICT",
            StateError::SchemaIncompatible { .. } => "SCHEMA_INCOMPATIBLE",
            StateError::CorruptState { .. } => "CORRUPT_STATE",
            StateError::HashMismatch { .. } => "HASH_MISMATCH",
            StateError::InvalidRequest { .. } => "INVALID_REQUEST",
            StateError::Io { .. } => "IO_ERROR",
        }
    }

    /// HTTP status an API surface should answer with.
    ///
    /// Conflicts map to 409 for completeness, but the save route reports them
    /// as a 200 with `conflict=true`.
    pub fn http_status(&self) -> u16 {
        match self {
            StateError::InvalidRequest { .. } => 400,
            StateError::NotFound { .. } => 404,
            StateError::Conflict { .. } => 409,
            StateError::SchemaIncompatible { .. }
            | StateError::CorruptState { .. }
            | StateError::HashMismatch { .. }
            | StateError::Io { .. } => 500,
        }
    }
}
