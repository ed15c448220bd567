//! Provider for OpenAI-compatible `/chat/completions` endpoints.
//!
//! One implementation covers every vendor that speaks the Chat Completions
//! wire shape (OpenAI itself, Anthropic's and xAI's compatibility surfaces,
//! LM Studio, Ollama, vLLM, …): construct it with the vendor's base URL and
//! the rest is identical. Native function calling is used: the model's
//! tool calls come back as structured `tool_calls` entries, never parsed out
//! of prose. Automatic tool execution does not exist at this layer by
//! construction; the orchestrator owns dispatch.
//!
//! Wire converters preserve role identity, part ordering, call names and
//! argument maps, and inline-data MIME types. Tool declarations are
//! deduplicated by name, first wins.
//!
//! # Example
//!
//! ```rust,no_run
//! use jaato::provider::{ModelProvider, ProviderConfig};
//! use jaato::providers::openai_compat::OpenAiCompatProvider;
//!
//! # async fn demo() -> jaato::Result<()> {
//! let mut provider = OpenAiCompatProvider::new("http://localhost:1234/v1");
//! provider
//!     .initialize(&ProviderConfig::ApiKey { api_key: "lm-studio".into() })
//!     .await?;
//! provider.connect("qwen2.5-32b-instruct");
//! provider.create_session(Some("You are terse.".into()), Vec::new(), Vec::new());
//! let reply = provider.send_message("Two plus two?", None).await?;
//! println!("{}", reply.text.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::jaato::error::{JaatoError, Result};
use crate::jaato::provider::{ModelProvider, ProviderConfig};
use crate::jaato::providers::common::{map_reqwest_error, map_status_error, shared_http_client};
use crate::jaato::types::{
    FinishReason, FunctionCall, InlineData, Message, Part, ProviderResponse, Role, TokenUsage,
    ToolResult, ToolSchema,
};

/// Marker inserted when a tool result carries attachments the wire format
/// cannot embed.
const ATTACHMENT_FALLBACK: &str = "Failed to attach multimodal data";

/// [`ModelProvider`] over any OpenAI-compatible chat endpoint.
pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: Option<String>,
    initialized: bool,
    system_instruction: Option<String>,
    tools: Vec<ToolSchema>,
    history: Vec<Message>,
    last_usage: TokenUsage,
}

impl OpenAiCompatProvider {
    /// Provider pointed at `base_url` (e.g. `"https://api.openai.com/v1"`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: shared_http_client().clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: String::new(),
            model: None,
            initialized: false,
            system_instruction: None,
            tools: Vec::new(),
            history: Vec::new(),
            last_usage: TokenUsage::default(),
        }
    }

    async fn post_chat(&mut self, body: Value) -> Result<ProviderResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }

        let wire: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| JaatoError::Permanent(format!("malformed chat response: {}", e)))?;
        Ok(self.convert_response(wire))
    }

    /// Convert a wire response into the uniform shape and append the model
    /// turn to history.
    fn convert_response(&mut self, wire: ChatCompletionResponse) -> ProviderResponse {
        let choice = wire.choices.into_iter().next().unwrap_or_default();
        let text = choice.message.content.clone().filter(|t| !t.is_empty());

        let mut function_calls = Vec::new();
        let mut parts = Vec::new();
        if let Some(t) = &text {
            parts.push(Part::Text(t.clone()));
        }
        for wire_call in choice.message.tool_calls.unwrap_or_default() {
            let args = serde_json::from_str::<Value>(&wire_call.function.arguments)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            let call = FunctionCall {
                id: if wire_call.id.is_empty() {
                    crate::jaato::types::generate_call_id()
                } else {
                    wire_call.id
                },
                name: wire_call.function.name,
                args,
            };
            parts.push(Part::FunctionCall(call.clone()));
            function_calls.push(call);
        }
        if !parts.is_empty() {
            self.history.push(Message {
                role: Role::Model,
                parts,
            });
        }

        let usage = TokenUsage {
            prompt_tokens: wire.usage.prompt_tokens,
            output_tokens: wire.usage.completion_tokens,
            total_tokens: wire.usage.total_tokens,
        };
        self.last_usage = usage;

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::MaxTokens,
            Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
            Some("content_filter") => FinishReason::Safety,
            Some(_) => FinishReason::Unknown,
            None if !function_calls.is_empty() => FinishReason::ToolUse,
            None => FinishReason::Unknown,
        };

        let structured_output = text
            .as_deref()
            .and_then(|t| serde_json::from_str::<Value>(t).ok());

        ProviderResponse {
            text,
            function_calls,
            usage,
            finish_reason,
            // Cleared again in round_trip() unless a schema was requested.
            structured_output,
            raw: None,
        }
    }

    fn request_body(&self, response_schema: Option<&Value>) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_instruction {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &self.history {
            messages.extend(message_to_wire(message));
        }

        let mut body = json!({
            "model": self.model.as_deref().unwrap_or_default(),
            "messages": messages,
        });
        let tools = tools_to_wire(&self.tools);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if let Some(schema) = response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema},
            });
        }
        body
    }

    /// One request/response round. On failure the just-appended outbound
    /// message is popped again so a retried call does not duplicate it.
    async fn round_trip(&mut self, response_schema: Option<&Value>) -> Result<ProviderResponse> {
        let body = self.request_body(response_schema);
        let mut response = match self.post_chat(body).await {
            Ok(response) => response,
            Err(err) => {
                self.history.pop();
                return Err(err);
            }
        };
        if response_schema.is_none() {
            // structured_output only means something when a schema was
            // requested; silent fall-through otherwise.
            response.structured_output = None;
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn initialize(&mut self, config: &ProviderConfig) -> Result<()> {
        match config {
            ProviderConfig::ApiKey { api_key } => {
                if api_key.is_empty() {
                    return Err(JaatoError::CredentialsNotFound {
                        auth_method: "api_key".into(),
                        remediation:
                            "  1. Obtain an API key from your provider's console\n  2. Set JAATO_API_KEY=<your key>"
                                .into(),
                    });
                }
                self.api_key = api_key.clone();
            }
            ProviderConfig::ServiceAccountFile { path, project, location } => {
                let raw = std::fs::read_to_string(path).map_err(|_| {
                    JaatoError::CredentialsNotFound {
                        auth_method: "service_account_file".into(),
                        remediation: format!(
                            "  Checked location: {}\n  Set JAATO_CREDENTIALS_PATH to a readable service-account key file",
                            path
                        ),
                    }
                })?;
                let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
                    JaatoError::CredentialsInvalid {
                        auth_method: "service_account_file".into(),
                        reason: format!("file is not valid JSON: {}", e),
                        remediation:
                            "  1. Verify the key file is valid JSON\n  2. Re-download the key from your cloud console"
                                .into(),
                    }
                })?;
                if parsed.get("type").and_then(|v| v.as_str()) != Some("service_account") {
                    return Err(JaatoError::CredentialsInvalid {
                        auth_method: "service_account_file".into(),
                        reason: "file does not contain a service_account credential".into(),
                        remediation:
                            "  Ensure the file contains \"type\": \"service_account\"".into(),
                    });
                }
                if project.is_none() || location.is_none() {
                    return Err(JaatoError::ProjectMisconfigured {
                        project: project.clone(),
                        location: location.clone(),
                        remediation: "  1. Set JAATO_PROJECT\n  2. Set JAATO_LOCATION (e.g. 'us-central1')".into(),
                    });
                }
                self.api_key = parsed
                    .get("private_key_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
            }
            ProviderConfig::Adc { project, location } => {
                if project.is_none() || location.is_none() {
                    return Err(JaatoError::ProjectMisconfigured {
                        project: project.clone(),
                        location: location.clone(),
                        remediation: "  1. Set JAATO_PROJECT\n  2. Set JAATO_LOCATION (e.g. 'us-central1')".into(),
                    });
                }
                // ADC flows carry no bearer key; the gateway in front of the
                // compatible endpoint authenticates the workload itself.
                self.api_key = String::new();
            }
            ProviderConfig::Impersonation {
                target_service_account,
                ..
            } => {
                if target_service_account.is_empty() {
                    return Err(JaatoError::ImpersonationFailed {
                        target: None,
                        remediation:
                            "  Set JAATO_TARGET_SERVICE_ACCOUNT=<sa>@<project>.iam.gserviceaccount.com"
                                .into(),
                    });
                }
                self.api_key = String::new();
            }
        }
        self.initialized = true;

        // Connectivity probe: the model list must answer.
        let probe = self.list_models(None).await;
        if let Err(err) = probe {
            self.initialized = false;
            return Err(match err {
                JaatoError::Permanent(message) if message.contains("401") => {
                    JaatoError::CredentialsInvalid {
                        auth_method: config.auth_method().into(),
                        reason: message,
                        remediation: "  Verify the API key is current and not revoked".into(),
                    }
                }
                JaatoError::Permanent(message) if message.contains("403") => {
                    JaatoError::CredentialsPermissionDenied {
                        project: None,
                        remediation:
                            "  Grant the calling principal access to the models API".into(),
                    }
                }
                other => other,
            });
        }
        Ok(())
    }

    fn connect(&mut self, model: &str) {
        self.model = Some(model.to_string());
    }

    fn is_connected(&self) -> bool {
        self.initialized && self.model.is_some()
    }

    fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn list_models(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }
        let listing: ModelListResponse = serde_json::from_str(&text)
            .map_err(|e| JaatoError::Permanent(format!("malformed model list: {}", e)))?;
        let mut models: Vec<String> = listing
            .data
            .into_iter()
            .map(|m| m.id)
            .filter(|id| prefix.map(|p| id.starts_with(p)).unwrap_or(true))
            .collect();
        models.sort();
        Ok(models)
    }

    fn create_session(
        &mut self,
        system_instruction: Option<String>,
        tools: Vec<ToolSchema>,
        history: Vec<Message>,
    ) {
        self.system_instruction = system_instruction;
        // First declaration wins on duplicate names so ids stay stable.
        let mut seen = HashSet::new();
        self.tools = tools
            .into_iter()
            .filter(|t| seen.insert(t.name.clone()))
            .collect();
        self.history = history;
        self.last_usage = TokenUsage::default();
    }

    fn history(&self) -> &[Message] {
        &self.history
    }

    fn set_history(&mut self, history: Vec<Message>) {
        self.history = history;
    }

    async fn send_message(
        &mut self,
        text: &str,
        response_schema: Option<&Value>,
    ) -> Result<ProviderResponse> {
        self.history.push(Message::from_text(Role::User, text));
        self.round_trip(response_schema).await
    }

    async fn send_message_with_parts(
        &mut self,
        parts: Vec<Part>,
        response_schema: Option<&Value>,
    ) -> Result<ProviderResponse> {
        self.history.push(Message {
            role: Role::User,
            parts,
        });
        self.round_trip(response_schema).await
    }

    async fn send_tool_results(
        &mut self,
        results: Vec<ToolResult>,
        response_schema: Option<&Value>,
    ) -> Result<ProviderResponse> {
        self.history.push(Message {
            role: Role::Tool,
            parts: results.into_iter().map(Part::FunctionResponse).collect(),
        });
        self.round_trip(response_schema).await
    }

    fn token_usage(&self) -> TokenUsage {
        self.last_usage
    }

    fn supports_structured_output(&self) -> bool {
        true
    }
}

// ---- Wire shapes ----

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ---- Converters ----

/// Convert tool declarations to the wire `tools` array, deduplicating by
/// name (first wins).
fn tools_to_wire(tools: &[ToolSchema]) -> Vec<Value> {
    let mut seen = HashSet::new();
    tools
        .iter()
        .filter(|t| seen.insert(t.name.clone()))
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect()
}

/// Convert one internal message into its wire messages, preserving part
/// order. A model message with calls becomes one assistant entry with a
/// `tool_calls` array; a tool message becomes one `tool` entry per result.
fn message_to_wire(message: &Message) -> Vec<Value> {
    match message.role {
        Role::User => vec![user_to_wire(message)],
        Role::Model => vec![model_to_wire(message)],
        Role::Tool => message
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::FunctionResponse(result) => Some(tool_result_to_wire(result)),
                _ => None,
            })
            .collect(),
    }
}

fn user_to_wire(message: &Message) -> Value {
    let has_inline = message
        .parts
        .iter()
        .any(|p| matches!(p, Part::InlineData(_)));
    if !has_inline {
        return json!({
            "role": "user",
            "content": message.text().unwrap_or_default(),
        });
    }
    // Multimodal user content uses the content-array form with data URLs.
    let content: Vec<Value> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text(text) => Some(json!({"type": "text", "text": text})),
            Part::InlineData(InlineData { mime_type, data }) => Some(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", mime_type, BASE64.encode(data)),
                },
            })),
            _ => None,
        })
        .collect();
    json!({"role": "user", "content": content})
}

fn model_to_wire(message: &Message) -> Value {
    let mut wire = json!({
        "role": "assistant",
        "content": message.text().unwrap_or_default(),
    });
    let calls: Vec<Value> = message
        .function_calls()
        .into_iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": Value::Object(call.args.clone()).to_string(),
                },
            })
        })
        .collect();
    if !calls.is_empty() {
        wire["tool_calls"] = Value::Array(calls);
    }
    wire
}

/// Convert one tool result to its wire `tool` message. The wire format has
/// no multimodal tool content, so attachments degrade to the documented
/// fallback marker alongside the JSON payload.
fn tool_result_to_wire(result: &ToolResult) -> Value {
    let content = if result.attachments.is_some() {
        json!({
            "result": result.result,
            "error": ATTACHMENT_FALLBACK,
        })
        .to_string()
    } else {
        result.result.to_string()
    };
    json!({
        "role": "tool",
        "tool_call_id": result.call_id,
        "content": content,
    })
}
