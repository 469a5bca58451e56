/// All errors produced while discovering or invoking peer-scenario tools.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FabricError {
    /// The peer advertised a `protocol_version` this fabric does not speak.
    /// Never cached; the next fetch retries.
    #[error("scenario {scenario} speaks tool protocol {actual}, expected {expected}")]
    ProtocolMismatch {
        scenario: String,
        expected: String,
        actual: String,
    },

    /// Transport-level failure reaching the peer (connect, timeout, read).
    #[error("scenario {scenario} unreachable: {message}")]
    UpstreamUnavailable { scenario: String, message: String },

    /// The peer answered with a non-200 status.
    #[error("scenario {scenario} returned status {status}: {body}")]
    UpstreamStatus {
        scenario: String,
        status: u16,
        body: String,
    },

    /// No base URL could be resolved for the scenario.
    #[error("scenario {scenario} unavailable: {message}")]
    ScenarioUnavailable { scenario: String, message: String },

    /// No registered handler claims the tool.
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    /// The raw tool arguments were not a JSON object.
    #[error("invalid arguments: {message}")]
    ArgParseFailed { message: String },

    /// The arguments parsed but do not satisfy the tool's parameter schema.
    #[error("arguments rejected by schema for {tool_name}: {message}")]
    ArgValidationFailed { tool_name: String, message: String },

    /// The peer reported `success=false`.
    #[error("tool execution failed: {message} (code: {code})")]
    ToolExecFailed { message: String, code: String },

    /// The peer's body did not decode as the expected envelope.
    #[error("invalid protocol response: {message}; body: {body}")]
    InvalidProtocolResponse { message: String, body: String },

    /// The caller cancelled the execution or its deadline elapsed.
    #[error("tool execution cancelled: {reason}")]
    Cancelled { reason: String },
}

impl FabricError {
    /// Machine-readable taxonomy code.
    pub fn code(&self) -> &'static str {
        match self {
            FabricError::ProtocolMismatch { .. } => "PROTOCOL_MISMATCH",
            FabricError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            FabricError::UpstreamStatus { .. } => "UPSTREAM_STATUS",
            FabricError::ScenarioUnavailable { .. } => "SCENARIO_UNAVAILABLE",
            FabricError::UnknownTool { .. } => "UNKNOWN_TOOL",
            FabricError::ArgParseFailed { .. } => "ARG_PARSE_FAILED",
            FabricError::ArgValidationFailed { .. } => "ARG_VALIDATION_FAILED",
            FabricError::ToolExecFailed { .. } => "TOOL_EXEC_FAILED",
            FabricError::InvalidProtocolResponse { .. } => "INVALID_PROTOCOL_RESPONSE",
            FabricError::Cancelled { .. } => "TOOL_CANCELLED",
        }
    }

    /// Whether the next natural poll cycle may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FabricError::UpstreamUnavailable { .. }
                | FabricError::UpstreamStatus { .. }
                | FabricError::ScenarioUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tool_message_names_the_tool() {
        let err = FabricError::UnknownTool {
            tool_name: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "unknown tool: nope");
        assert_eq!(err.code(), "UNKNOWN_TOOL");
    }

    #[test]
    fn exec_failure_carries_peer_code_verbatim() {
        let err = FabricError::ToolExecFailed {
            message: "deploy target busy".to_string(),
            code: "BUSY".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "tool execution failed: deploy target busy (code: BUSY)"
        );
        assert!(!err.is_transient());
    }
}
