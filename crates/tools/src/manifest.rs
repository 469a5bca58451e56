//! Wire types for the Tool Discovery and Tool Execution protocols.
//!
//! Peers may be written against a protobuf-JSON encoder, so decoding accepts
//! camelCase aliases and timestamps either as RFC 3339 text or as a
//! `{"seconds": …, "nanos": …}` object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// The tool protocol version this fabric speaks.
pub const TOOL_PROTOCOL_VERSION: &str = "1.0";

/// Path of the discovery endpoint on every peer.
pub const TOOLS_PATH: &str = "/api/v1/tools";

/// Path of the execution endpoint on every peer.
pub const EXECUTE_PATH: &str = "/api/v1/tools/execute";

/// A peer scenario's published tool catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    #[serde(alias = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub scenario: ScenarioInfo,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// Informational only; an unreadable value decodes as `None`.
    #[serde(
        default,
        alias = "generatedAt",
        with = "wire_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub generated_at: Option<OffsetDateTime>,
}

impl ToolManifest {
    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema describing the `arguments` object.
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default)]
    pub metadata: ToolMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    #[serde(default, alias = "enabledByDefault")]
    pub enabled_by_default: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Compare protocol versions ignoring trailing `.0` components and a leading `v`.
///
/// `"1"`, `"1.0"` and `"v1.0.0"` are the same version; `"1.1"` and `"99.0"` are not.
pub fn protocol_versions_match(a: &str, b: &str) -> bool {
    normalize_version(a) == normalize_version(b)
}

fn normalize_version(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let mut parts: Vec<String> = trimmed.split('.').map(|p| p.trim().to_string()).collect();
    while parts.len() > 1 && parts.last().map(|p| p == "0").unwrap_or(false) {
        parts.pop();
    }
    parts
}

// ──────────────────────────────────────────────
// Execution protocol
// ──────────────────────────────────────────────

/// Body of `POST /api/v1/tools/execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// The envelope every peer answers `POST /api/v1/tools/execute` with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProtocolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, alias = "isAsync")]
    pub is_async: bool,
    #[serde(default, alias = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Tagged view of [`ExecutionProtocolResponse`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerOutcome {
    Success {
        result: Map<String, Value>,
    },
    Async {
        run_id: String,
        status: String,
        result: Map<String, Value>,
    },
    Failure {
        message: String,
        code: String,
    },
}

impl From<ExecutionProtocolResponse> for PeerOutcome {
    fn from(response: ExecutionProtocolResponse) -> Self {
        if !response.success {
            return PeerOutcome::Failure {
                message: response.error.unwrap_or_default(),
                code: response.code.unwrap_or_default(),
            };
        }
        let result = response.result.unwrap_or_default();
        if response.is_async {
            PeerOutcome::Async {
                run_id: response.run_id.unwrap_or_default(),
                status: response.status.unwrap_or_default(),
                result,
            }
        } else {
            PeerOutcome::Success { result }
        }
    }
}

/// Lenient (de)serialization for optional wire timestamps.
mod wire_timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        value: &Option<OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => {
                let text = ts.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&text)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<OffsetDateTime>, D::Error> {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(from_value))
    }

    fn from_value(value: &Value) -> Option<OffsetDateTime> {
        match value {
            Value::String(text) => OffsetDateTime::parse(text, &Rfc3339).ok(),
            Value::Object(obj) => {
                let seconds = match obj.get("seconds") {
                    Some(Value::Number(n)) => n.as_i64()?,
                    Some(Value::String(s)) => s.parse().ok()?,
                    None => 0,
                    _ => return None,
                };
                let nanos = obj.get("nanos").and_then(Value::as_i64).unwrap_or(0);
                if !(0..1_000_000_000).contains(&nanos) {
                    return None;
                }
                let base = OffsetDateTime::from_unix_timestamp(seconds).ok()?;
                base.checked_add(time::Duration::nanoseconds(nanos))
            }
            _ => None,
        }
    }
}
