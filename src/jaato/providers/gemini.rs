//! Provider for Google's Generative Language (Gemini) REST API.
//!
//! Speaks `models/{model}:generateContent` on
//! `generativelanguage.googleapis.com`, authenticated either with an API
//! key (`x-goog-api-key`) or an OAuth bearer token for the
//! service-account/ADC/impersonation methods. Automatic function execution
//! does not exist at this layer; the orchestrator owns dispatch.
//!
//! This wire format is the multimodal-friendly one: tool results with
//! attachments embed them NATIVELY as sibling `inlineData` parts in the
//! same tool turn, and function calls/results are structured parts rather
//! than stringified arguments. Gemini does not carry call ids, so the
//! runtime generates correlation ids on conversion.
//!
//! # Example
//!
//! ```rust,no_run
//! use jaato::provider::{ModelProvider, ProviderConfig};
//! use jaato::providers::gemini::GeminiProvider;
//!
//! # async fn demo() -> jaato::Result<()> {
//! let mut provider = GeminiProvider::new();
//! provider
//!     .initialize(&ProviderConfig::ApiKey { api_key: std::env::var("JAATO_API_KEY").unwrap() })
//!     .await?;
//! provider.connect("gemini-2.5-flash");
//! provider.create_session(None, Vec::new(), Vec::new());
//! let reply = provider.send_message("Two plus two?", None).await?;
//! println!("{}", reply.text.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use crate::jaato::error::{JaatoError, Result};
use crate::jaato::provider::{ModelProvider, ProviderConfig};
use crate::jaato::providers::common::{map_reqwest_error, map_status_error, shared_http_client};
use crate::jaato::types::{
    generate_call_id, FinishReason, FunctionCall, InlineData, Message, Part, ProviderResponse,
    Role, TokenUsage, ToolResult, ToolSchema,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// How requests are authenticated.
enum GeminiAuth {
    /// AI Studio mode: `x-goog-api-key` header.
    ApiKey(String),
    /// Cloud modes: `Authorization: Bearer` with a pre-minted access token.
    Bearer(String),
}

/// [`ModelProvider`] over the Gemini REST surface.
pub struct GeminiProvider {
    http: reqwest::Client,
    base_url: String,
    auth: Option<GeminiAuth>,
    /// Billed project for cloud-auth modes (`x-goog-user-project`).
    project: Option<String>,
    model: Option<String>,
    system_instruction: Option<String>,
    tools: Vec<ToolSchema>,
    history: Vec<Message>,
    last_usage: TokenUsage,
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiProvider {
    /// Provider pointed at the public Generative Language endpoint.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Provider pointed at a custom endpoint (test servers, proxies).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: shared_http_client().clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: None,
            project: None,
            model: None,
            system_instruction: None,
            tools: Vec::new(),
            history: Vec::new(),
            last_usage: TokenUsage::default(),
        }
    }

    fn request(&self, url: &str) -> Result<reqwest::RequestBuilder> {
        let builder = self.http.post(url);
        let builder = match &self.auth {
            Some(GeminiAuth::ApiKey(key)) => builder.header("x-goog-api-key", key.as_str()),
            Some(GeminiAuth::Bearer(token)) => {
                let builder = builder.header("Authorization", format!("Bearer {}", token));
                match &self.project {
                    Some(project) => builder.header("x-goog-user-project", project.as_str()),
                    None => builder,
                }
            }
            None => {
                return Err(JaatoError::NotConnected);
            }
        };
        Ok(builder)
    }

    /// Read the pre-minted OAuth token cloud-auth modes rely on.
    fn bearer_from_env(auth_method: &str) -> Result<String> {
        std::env::var("JAATO_ACCESS_TOKEN").map_err(|_| JaatoError::CredentialsNotFound {
            auth_method: auth_method.to_string(),
            remediation:
                "  1. Mint a token: gcloud auth print-access-token\n  2. Export it: JAATO_ACCESS_TOKEN=<token>"
                    .to_string(),
        })
    }

    async fn round_trip(&mut self, response_schema: Option<&Value>) -> Result<ProviderResponse> {
        let model = self.model.clone().ok_or(JaatoError::NotConnected)?;
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = self.request_body(response_schema);

        let outcome = async {
            let response = self
                .request(&url)?
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let status = response.status();
            let text = response.text().await.map_err(map_reqwest_error)?;
            if !status.is_success() {
                return Err(map_status_error(status, &text));
            }
            serde_json::from_str::<Value>(&text)
                .map_err(|e| JaatoError::Permanent(format!("malformed generate response: {}", e)))
        }
        .await;

        let wire = match outcome {
            Ok(wire) => wire,
            Err(err) => {
                // The just-appended outbound message must not survive a
                // failed round, or a ledger retry would duplicate it.
                self.history.pop();
                return Err(err);
            }
        };
        Ok(self.convert_response(&wire, response_schema.is_some()))
    }

    fn request_body(&self, response_schema: Option<&Value>) -> Value {
        let contents: Vec<Value> = self.history.iter().map(message_to_wire).collect();
        let mut body = json!({ "contents": contents });
        if let Some(system) = &self.system_instruction {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !self.tools.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": declarations_to_wire(&self.tools) }]);
        }
        if let Some(schema) = response_schema {
            body["generationConfig"] = json!({
                "responseMimeType": "application/json",
                "responseSchema": schema,
            });
        }
        body
    }

    fn convert_response(&mut self, wire: &Value, schema_requested: bool) -> ProviderResponse {
        let candidate = &wire["candidates"][0];
        let empty = Vec::new();
        let wire_parts = candidate["content"]["parts"].as_array().unwrap_or(&empty);

        let mut text_out = String::new();
        let mut has_text = false;
        let mut function_calls = Vec::new();
        let mut parts = Vec::new();
        for part in wire_parts {
            if let Some(text) = part["text"].as_str() {
                text_out.push_str(text);
                has_text = true;
                parts.push(Part::Text(text.to_string()));
            } else if part.get("functionCall").is_some() {
                let call = FunctionCall {
                    // Gemini carries no call ids; generate the correlation
                    // id the runtime's contract requires.
                    id: generate_call_id(),
                    name: part["functionCall"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    args: part["functionCall"]["args"]
                        .as_object()
                        .cloned()
                        .unwrap_or_else(Map::new),
                };
                parts.push(Part::FunctionCall(call.clone()));
                function_calls.push(call);
            }
        }
        if !parts.is_empty() {
            self.history.push(Message {
                role: Role::Model,
                parts,
            });
        }

        let usage = TokenUsage {
            prompt_tokens: wire["usageMetadata"]["promptTokenCount"]
                .as_u64()
                .unwrap_or(0) as usize,
            output_tokens: wire["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0) as usize,
            total_tokens: wire["usageMetadata"]["totalTokenCount"]
                .as_u64()
                .unwrap_or(0) as usize,
        };
        self.last_usage = usage;

        let finish_reason = match candidate["finishReason"].as_str() {
            Some("STOP") if !function_calls.is_empty() => FinishReason::ToolUse,
            Some("STOP") => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::MaxTokens,
            Some("SAFETY") | Some("PROHIBITED_CONTENT") => FinishReason::Safety,
            Some(_) => FinishReason::Unknown,
            None if !function_calls.is_empty() => FinishReason::ToolUse,
            None => FinishReason::Unknown,
        };

        let text = if has_text { Some(text_out) } else { None };
        let structured_output = if schema_requested {
            // Silent fall-through when the model strayed from the schema.
            text.as_deref().and_then(|t| serde_json::from_str(t).ok())
        } else {
            None
        };

        ProviderResponse {
            text,
            function_calls,
            usage,
            finish_reason,
            structured_output,
            raw: Some(wire.clone()),
        }
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn initialize(&mut self, config: &ProviderConfig) -> Result<()> {
        match config {
            ProviderConfig::ApiKey { api_key } => {
                if api_key.is_empty() {
                    return Err(JaatoError::CredentialsNotFound {
                        auth_method: "api_key".into(),
                        remediation:
                            "  1. Create an API key in AI Studio\n  2. Set JAATO_API_KEY=<your key>"
                                .into(),
                    });
                }
                self.auth = Some(GeminiAuth::ApiKey(api_key.clone()));
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
                            "  1. Verify the key file is valid JSON\n  2. Re-download the key from the cloud console"
                                .into(),
                    }
                })?;
                if parsed.get("type").and_then(|v| v.as_str()) != Some("service_account") {
                    return Err(JaatoError::CredentialsInvalid {
                        auth_method: "service_account_file".into(),
                        reason: "file does not contain a service_account credential".into(),
                        remediation: "  Ensure the file contains \"type\": \"service_account\""
                            .into(),
                    });
                }
                if project.is_none() || location.is_none() {
                    return Err(JaatoError::ProjectMisconfigured {
                        project: project.clone(),
                        location: location.clone(),
                        remediation:
                            "  1. Set JAATO_PROJECT\n  2. Set JAATO_LOCATION (e.g. 'us-central1')"
                                .into(),
                    });
                }
                self.project = project.clone();
                self.auth = Some(GeminiAuth::Bearer(Self::bearer_from_env(
                    "service_account_file",
                )?));
            }
            ProviderConfig::Adc { project, location } => {
                if project.is_none() || location.is_none() {
                    return Err(JaatoError::ProjectMisconfigured {
                        project: project.clone(),
                        location: location.clone(),
                        remediation:
                            "  1. Set JAATO_PROJECT\n  2. Set JAATO_LOCATION (e.g. 'us-central1')"
                                .into(),
                    });
                }
                self.project = project.clone();
                self.auth = Some(GeminiAuth::Bearer(Self::bearer_from_env("adc")?));
            }
            ProviderConfig::Impersonation {
                target_service_account,
                project,
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
                self.project = project.clone();
                self.auth = Some(GeminiAuth::Bearer(Self::bearer_from_env("impersonation")?));
            }
        }

        // Connectivity probe: the model list must answer.
        let probe = self.list_models(None).await;
        if let Err(err) = probe {
            self.auth = None;
            return Err(match err {
                JaatoError::Permanent(message) if message.contains("401") => {
                    JaatoError::CredentialsInvalid {
                        auth_method: config.auth_method().into(),
                        reason: message,
                        remediation: "  Verify the key or token is current and not revoked".into(),
                    }
                }
                JaatoError::Permanent(message) if message.contains("403") => {
                    JaatoError::CredentialsPermissionDenied {
                        project: self.project.clone(),
                        remediation:
                            "  Grant the calling principal the Generative Language API role".into(),
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
        self.auth.is_some() && self.model.is_some()
    }

    fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn list_models(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let builder = self.http.get(&url);
        let builder = match &self.auth {
            Some(GeminiAuth::ApiKey(key)) => builder.header("x-goog-api-key", key.as_str()),
            Some(GeminiAuth::Bearer(token)) => {
                builder.header("Authorization", format!("Bearer {}", token))
            }
            None => return Err(JaatoError::NotConnected),
        };
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }
        let wire: Value = serde_json::from_str(&text)
            .map_err(|e| JaatoError::Permanent(format!("malformed model list: {}", e)))?;
        let mut models: Vec<String> = wire["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|name| name.trim_start_matches("models/").to_string())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(prefix) = prefix {
            models.retain(|m| m.starts_with(prefix));
        }
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
        let mut seen = std::collections::HashSet::new();
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

// ---- Converters ----

fn declarations_to_wire(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect()
}

/// Convert one internal message into a wire `Content`, preserving part
/// order. Tool results travel on the user role (the Gemini convention),
/// and their attachments embed natively as sibling `inlineData` parts.
fn message_to_wire(message: &Message) -> Value {
    let role = match message.role {
        Role::User | Role::Tool => "user",
        Role::Model => "model",
    };
    let mut parts = Vec::new();
    for part in &message.parts {
        match part {
            Part::Text(text) => parts.push(json!({"text": text})),
            Part::FunctionCall(call) => parts.push(json!({
                "functionCall": {
                    "name": call.name,
                    "args": Value::Object(call.args.clone()),
                },
            })),
            Part::FunctionResponse(result) => {
                parts.push(json!({
                    "functionResponse": {
                        "name": result.name,
                        "response": wrap_result(&result.result),
                    },
                }));
                for attachment in result.attachments.iter().flatten() {
                    parts.push(json!({
                        "inlineData": {
                            "mimeType": attachment.mime_type,
                            "data": BASE64.encode(&attachment.data),
                        },
                    }));
                }
            }
            Part::InlineData(InlineData { mime_type, data }) => parts.push(json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": BASE64.encode(data),
                },
            })),
            Part::Unknown(repr) => parts.push(json!({"text": repr})),
        }
    }
    json!({"role": role, "parts": parts})
}

/// The wire `response` field must be an object; non-object results are
/// wrapped the same way the runtime wraps them for metadata.
fn wrap_result(result: &Value) -> Value {
    if result.is_object() {
        result.clone()
    } else {
        json!({"result": result})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jaato::types::Attachment;

    #[test]
    fn test_tool_message_travels_on_user_role() {
        let message = Message {
            role: Role::Tool,
            parts: vec![Part::FunctionResponse(ToolResult {
                call_id: "call_1".into(),
                name: "lookup".into(),
                result: json!({"hits": 2}),
                is_error: false,
                attachments: None,
            })],
        };
        let wire = message_to_wire(&message);
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["parts"][0]["functionResponse"]["name"], "lookup");
        assert_eq!(
            wire["parts"][0]["functionResponse"]["response"]["hits"],
            2
        );
    }

    #[test]
    fn test_attachments_embed_natively_as_inline_data() {
        let message = Message {
            role: Role::Tool,
            parts: vec![Part::FunctionResponse(ToolResult {
                call_id: "call_1".into(),
                name: "screenshot".into(),
                result: json!({"ok": true}),
                is_error: false,
                attachments: Some(vec![Attachment {
                    mime_type: "image/png".into(),
                    data: vec![1, 2, 3],
                    display_name: Some("shot".into()),
                }]),
            })],
        };
        let wire = message_to_wire(&message);
        let parts = wire["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "AQID");
    }

    #[test]
    fn test_non_object_results_are_wrapped() {
        assert_eq!(wrap_result(&json!("plain")), json!({"result": "plain"}));
        assert_eq!(wrap_result(&json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_convert_response_generates_call_ids() {
        let mut provider = GeminiProvider::new();
        provider.connect("gemini-2.5-flash");
        let wire = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Checking."},
                        {"functionCall": {"name": "lookup", "args": {"q": "rust"}}}
                    ]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 12,
                "candidatesTokenCount": 4,
                "totalTokenCount": 16
            }
        });

        let response = provider.convert_response(&wire, false);
        assert_eq!(response.text.as_deref(), Some("Checking."));
        assert_eq!(response.function_calls.len(), 1);
        assert!(response.function_calls[0].id.starts_with("call_"));
        assert_eq!(response.function_calls[0].args["q"], "rust");
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.usage.total_tokens, 16);
        assert_eq!(provider.history().len(), 1);
    }

    #[test]
    fn test_request_body_shape() {
        let mut provider = GeminiProvider::new();
        provider.connect("gemini-2.5-flash");
        provider.create_session(
            Some("Be terse.".into()),
            vec![ToolSchema::new("lookup", "Search things")],
            vec![Message::from_text(Role::User, "hi")],
        );

        let body = provider.request_body(Some(&json!({"type": "object"})));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be terse.");
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "lookup"
        );
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn test_safety_finish_reason() {
        let mut provider = GeminiProvider::new();
        let wire = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "…"}]},
                "finishReason": "SAFETY"
            }],
            "usageMetadata": {}
        });
        let response = provider.convert_response(&wire, false);
        assert_eq!(response.finish_reason, FinishReason::Safety);
    }
}
