//! Provider-agnostic value types shared by every subsystem.
//!
//! These types are the lingua franca between the orchestration loop, the
//! plugin registry, the permission engine, and the concrete model providers.
//! Provider SDK shapes never leak past [`crate::jaato::provider`]; everything
//! above that boundary speaks in terms of [`Message`], [`Part`],
//! [`FunctionCall`], [`ToolResult`], and [`ProviderResponse`].
//!
//! Serialization is stable JSON: every [`Part`] variant round-trips,
//! including binary inline data (base64 in the `data` field), so histories
//! can be persisted and restored across processes.
//!
//! # Example
//!
//! ```rust
//! use jaato::types::{Message, Part, Role};
//!
//! let msg = Message::from_text(Role::User, "hello");
//! assert_eq!(msg.text().as_deref(), Some("hello"));
//! assert!(msg.function_calls().is_empty());
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A user authored message (or tool output travelling on the user turn
    /// for providers that use that convention).
    User,
    /// A model authored message, including function-call requests.
    Model,
    /// A tool-result message correlated with a prior [`FunctionCall`].
    Tool,
}

/// A function/tool call requested by the model.
///
/// The `id` is runtime-generated when the backing SDK does not carry call
/// identifiers, so results can always be correlated back to their request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Unique identifier for this call, e.g. `"call_1f9a..."`.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Structured arguments supplied by the model.
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

impl FunctionCall {
    /// Create a call with a fresh runtime-generated id.
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, Value>) -> Self {
        Self {
            id: generate_call_id(),
            name: name.into(),
            args,
        }
    }

    /// Arguments as a `serde_json::Value` object (cheap clone of the map).
    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }
}

/// Generate a short correlation id for a function call.
pub fn generate_call_id() -> String {
    format!("call_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Multimodal attachment carried by a tool result.
///
/// Binary data is base64 in the serialized form; in memory it is raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type of the payload (e.g. `"image/png"`).
    pub mime_type: String,
    /// Raw payload bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Optional name for referencing the attachment in responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Attachment {
    /// Parse an attachment from the tool-invocation envelope shape
    /// (`{"mime_type", "base64_data" | "data", "display_name"?}`).
    pub fn from_envelope(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mime_type = obj.get("mime_type")?.as_str()?.to_string();
        let encoded = obj
            .get("base64_data")
            .or_else(|| obj.get("data"))?
            .as_str()?;
        let data = crate::jaato::types::base64_bytes::decode(encoded).ok()?;
        let display_name = obj
            .get("display_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Some(Self {
            mime_type,
            data,
            display_name,
        })
    }
}

/// Result of executing a tool/function.
///
/// `is_error` marks executor failures; a permission denial is NOT an error
/// but a normal result whose payload carries `{"denied": true, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the [`FunctionCall`] this result answers.
    pub call_id: String,
    /// Name of the tool that was invoked.
    pub name: String,
    /// JSON result payload.
    pub result: Value,
    /// Whether the execution failed.
    #[serde(default)]
    pub is_error: bool,
    /// Optional multimodal payloads returned by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl ToolResult {
    /// Successful result for a call.
    pub fn ok(call: &FunctionCall, result: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result,
            is_error: false,
            attachments: None,
        }
    }

    /// Error result carrying the stringified failure.
    pub fn error(call: &FunctionCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result: Value::String(message.into()),
            is_error: true,
            attachments: None,
        }
    }
}

/// Inline binary data embedded directly in a message part.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineData {
    /// MIME type of the payload.
    pub mime_type: String,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

/// A single content part of a [`Message`].
///
/// Exactly one variant is present per part; an empty text is permitted.
/// Parts serialize with a `"type"` tag ∈ {`text`, `function_call`,
/// `function_response`, `inline_data`, `unknown`} so persisted histories are
/// self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PartRepr", into = "PartRepr")]
pub enum Part {
    /// Plain text.
    Text(String),
    /// A model-issued tool call.
    FunctionCall(FunctionCall),
    /// A tool result being returned to the model.
    FunctionResponse(ToolResult),
    /// Binary data with a MIME type (multimodal input).
    InlineData(InlineData),
    /// A part whose serialized form was not recognized; the original
    /// representation is preserved rather than dropped.
    Unknown(String),
}

impl Part {
    /// Text content of this part, if it is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Function call carried by this part, if any.
    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(c) => Some(c),
            _ => None,
        }
    }
}

/// Stable wire representation of [`Part`].
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PartRepr {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        args: serde_json::Map<String, Value>,
    },
    FunctionResponse {
        #[serde(default)]
        call_id: String,
        name: String,
        result: Value,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<Attachment>>,
    },
    InlineData {
        mime_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Unknown {
        repr: String,
    },
}

impl From<PartRepr> for Part {
    fn from(repr: PartRepr) -> Self {
        match repr {
            PartRepr::Text { text } => Part::Text(text),
            PartRepr::FunctionCall { id, name, args } => {
                Part::FunctionCall(FunctionCall { id, name, args })
            }
            PartRepr::FunctionResponse {
                call_id,
                name,
                result,
                is_error,
                attachments,
            } => Part::FunctionResponse(ToolResult {
                call_id,
                name,
                result,
                is_error,
                attachments,
            }),
            PartRepr::InlineData { mime_type, data } => {
                Part::InlineData(InlineData { mime_type, data })
            }
            PartRepr::Unknown { repr } => Part::Unknown(repr),
        }
    }
}

impl From<Part> for PartRepr {
    fn from(part: Part) -> Self {
        match part {
            Part::Text(text) => PartRepr::Text { text },
            Part::FunctionCall(c) => PartRepr::FunctionCall {
                id: c.id,
                name: c.name,
                args: c.args,
            },
            Part::FunctionResponse(r) => PartRepr::FunctionResponse {
                call_id: r.call_id,
                name: r.name,
                result: r.result,
                is_error: r.is_error,
                attachments: r.attachments,
            },
            Part::InlineData(d) => PartRepr::InlineData {
                mime_type: d.mime_type,
                data: d.data,
            },
            Part::Unknown(repr) => PartRepr::Unknown { repr },
        }
    }
}

/// A message in a conversation: a role plus an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who authored the message.
    pub role: Role,
    /// Ordered content parts.
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Message {
    /// Build a single-part text message.
    pub fn from_text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Concatenated text of all text parts, or `None` when there are none.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        let mut found = false;
        for part in &self.parts {
            if let Part::Text(t) = part {
                out.push_str(t);
                found = true;
            }
        }
        if found {
            Some(out)
        } else {
            None
        }
    }

    /// All function calls carried by this message, in part order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts
            .iter()
            .filter_map(|p| p.as_function_call())
            .collect()
    }
}

/// Provider-agnostic tool/function declaration.
///
/// Names are globally unique within an exposed plugin set; the registry
/// enforces that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool name.
    pub name: String,
    /// Description surfaced to the model for tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    #[serde(default)]
    pub parameters: Value,
}

impl ToolSchema {
    /// Create a schema with an empty parameter object.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    /// Attach a JSON Schema parameter object.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal completion.
    Stop,
    /// Output token limit reached.
    MaxTokens,
    /// Stopped to execute tools.
    ToolUse,
    /// Safety filter triggered.
    Safety,
    /// An error occurred upstream.
    Error,
    /// The provider did not report a reason.
    Unknown,
}

impl Default for FinishReason {
    fn default() -> Self {
        FinishReason::Unknown
    }
}

/// Token accounting reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens billed for the prompt/input.
    pub prompt_tokens: usize,
    /// Tokens generated in the response.
    pub output_tokens: usize,
    /// Total tokens for the call.
    pub total_tokens: usize,
}

/// Unified response from any model provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Text content of the response, if any.
    pub text: Option<String>,
    /// Function calls requested by the model, in issue order.
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
    /// Token usage for this call.
    #[serde(default)]
    pub usage: TokenUsage,
    /// Why the model stopped.
    #[serde(default)]
    pub finish_reason: FinishReason,
    /// Parsed JSON when a response schema was requested and honored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    /// Opaque provider payload kept for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ProviderResponse {
    /// Whether the model requested any tool executions.
    pub fn has_function_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }
}

/// Wall-clock timing of one tool execution within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallTiming {
    /// Tool name.
    pub name: String,
    /// Execution duration in seconds.
    pub duration_seconds: f64,
}

/// Accounting row for one turn (one user request to final answer cycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnAccounting {
    /// Prompt tokens accumulated across all model calls of the turn.
    pub prompt_tokens: usize,
    /// Output tokens accumulated across all model calls of the turn.
    pub output_tokens: usize,
    /// Total tokens for the turn.
    pub total_tokens: usize,
    /// When the turn started.
    pub start_time: DateTime<Utc>,
    /// When the turn finished (equal to `start_time` until closed).
    pub end_time: DateTime<Utc>,
    /// Turn duration in seconds.
    pub duration_seconds: f64,
    /// Per-tool timings, in dispatch order.
    #[serde(default)]
    pub function_calls: Vec<FunctionCallTiming>,
    /// Whether the turn was cancelled before completion.
    #[serde(default)]
    pub cancelled: bool,
    /// Whether history was collapsed by the GC plugin during this turn.
    #[serde(default)]
    pub gc_performed: bool,
    /// Whether the tool-iteration cap stopped the turn.
    #[serde(default)]
    pub max_iterations_hit: bool,
}

impl TurnAccounting {
    /// Open a fresh accounting row stamped now.
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            prompt_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            start_time: now,
            end_time: now,
            duration_seconds: 0.0,
            function_calls: Vec::new(),
            cancelled: false,
            gc_performed: false,
            max_iterations_hit: false,
        }
    }

    /// Fold one model call's usage into the turn totals.
    pub fn add_usage(&mut self, usage: TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage.total_tokens;
    }

    /// Close the row, stamping the end time and duration.
    pub fn close(&mut self) {
        self.end_time = Utc::now();
        self.duration_seconds = (self.end_time - self.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }
}

/// Context-window usage snapshot for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextUsage {
    /// Active model name, if connected.
    pub model: Option<String>,
    /// Context window size for that model.
    pub context_limit: usize,
    /// Total tokens reported by the most recent model call.
    pub total_tokens: usize,
    /// `total_tokens / context_limit` as a percentage.
    pub percent_used: f64,
}

/// A user-typable command contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCommand {
    /// Command name, invoked as `/<name>`.
    pub name: String,
    /// Help text shown in command listings.
    pub description: String,
    /// Whether the command output is echoed to the model.
    #[serde(default)]
    pub share_with_model: bool,
}

/// A completion candidate for a user command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Replacement text.
    pub value: String,
    /// Optional description shown next to the candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Completion {
    /// Plain completion without a description.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            description: None,
        }
    }
}

/// Outcome of threading a prompt through plugin enrichment.
#[derive(Debug, Clone, Default)]
pub struct EnrichedPrompt {
    /// The (possibly rewritten) prompt text.
    pub prompt: String,
    /// Metadata accumulated from each enriching plugin, keyed by plugin name.
    pub metadata: HashMap<String, Value>,
}

/// Canonical JSON rendering with object keys sorted recursively.
///
/// Used for argument digests so that logically identical argument maps hash
/// identically regardless of key order.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Base64 (de)serialization for byte fields.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        decode(&encoded).map_err(serde::de::Error::custom)
    }

    /// Decode a base64 string, tolerating missing padding.
    pub fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(encoded).or_else(|_| {
            let mut padded = encoded.trim_end_matches('=').to_string();
            while padded.len() % 4 != 0 {
                padded.push('=');
            }
            STANDARD.decode(padded)
        })
    }
}
