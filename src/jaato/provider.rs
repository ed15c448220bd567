//! Trait-driven abstraction over concrete model providers.
//!
//! A [`ModelProvider`] translates runtime requests into a vendor's wire
//! format and returns responses in the uniform [`ProviderResponse`] shape.
//! The abstraction deliberately excludes orchestration concerns: tool
//! dispatch, permission gating, and accounting belong to
//! [`JaatoClient`](crate::JaatoClient). In particular, any automatic tool
//! execution offered by an underlying SDK must stay disabled; the
//! orchestrator owns dispatch.
//!
//! Providers are owned exclusively by one session, so the messaging methods
//! take `&mut self` and no internal synchronization is required.
//!
//! # Example
//!
//! ```rust,no_run
//! use jaato::provider::{ModelProvider, ProviderConfig};
//! use jaato::providers::openai_compat::OpenAiCompatProvider;
//!
//! # async fn demo() -> jaato::Result<()> {
//! let mut provider = OpenAiCompatProvider::new("https://api.openai.com/v1");
//! provider
//!     .initialize(&ProviderConfig::ApiKey { api_key: std::env::var("JAATO_API_KEY").unwrap() })
//!     .await?;
//! provider.connect("gpt-4o");
//! let response = provider.send_message("Hello!", None).await?;
//! println!("{}", response.text.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;

use crate::jaato::error::Result;
use crate::jaato::types::{Message, Part, ProviderResponse, TokenUsage, ToolResult, ToolSchema};

/// Authentication/configuration record for provider initialization.
///
/// A discriminated record: each variant carries exactly the fields its auth
/// method needs. Initialization fails fast with the typed credential errors
/// in [`crate::error::JaatoError`] when a variant is incomplete.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    /// Direct API-key authentication.
    ApiKey { api_key: String },
    /// Service-account key file plus project/location.
    ServiceAccountFile {
        path: String,
        project: Option<String>,
        location: Option<String>,
    },
    /// Ambient default cloud credentials.
    Adc {
        project: Option<String>,
        location: Option<String>,
    },
    /// Impersonate a target service account from a source credential.
    Impersonation {
        target_service_account: String,
        project: Option<String>,
        location: Option<String>,
        /// `"adc"` or `"sa_file"`.
        source: ImpersonationSource,
        credentials_path: Option<String>,
    },
}

/// Source credential used to mint impersonated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpersonationSource {
    Adc,
    SaFile,
}

impl ProviderConfig {
    /// Short name of the auth method, used in error messages.
    pub fn auth_method(&self) -> &'static str {
        match self {
            ProviderConfig::ApiKey { .. } => "api_key",
            ProviderConfig::ServiceAccountFile { .. } => "service_account_file",
            ProviderConfig::Adc { .. } => "adc",
            ProviderConfig::Impersonation { .. } => "impersonation",
        }
    }

    /// Cloud project carried by this config, if any.
    pub fn project(&self) -> Option<&str> {
        match self {
            ProviderConfig::ApiKey { .. } => None,
            ProviderConfig::ServiceAccountFile { project, .. }
            | ProviderConfig::Adc { project, .. }
            | ProviderConfig::Impersonation { project, .. } => project.as_deref(),
        }
    }

    /// Region/location carried by this config, if any.
    pub fn location(&self) -> Option<&str> {
        match self {
            ProviderConfig::ApiKey { .. } => None,
            ProviderConfig::ServiceAccountFile { location, .. }
            | ProviderConfig::Adc { location, .. }
            | ProviderConfig::Impersonation { location, .. } => location.as_deref(),
        }
    }

    /// Build a config from the `JAATO_*` environment variables.
    ///
    /// `JAATO_AUTH_METHOD` selects the variant (`api_key`,
    /// `service_account_file`, `adc`, `impersonation`); unset defaults to
    /// `api_key` when `JAATO_API_KEY` is present and `adc` otherwise.
    /// `JAATO_CREDENTIALS_PATH`, `JAATO_PROJECT`, `JAATO_LOCATION`, and
    /// `JAATO_TARGET_SERVICE_ACCOUNT` fill in the variant fields.
    pub fn from_env() -> Self {
        let api_key = std::env::var("JAATO_API_KEY").ok();
        let project = std::env::var("JAATO_PROJECT").ok();
        let location = std::env::var("JAATO_LOCATION").ok();
        let credentials_path = std::env::var("JAATO_CREDENTIALS_PATH").ok();
        let method = std::env::var("JAATO_AUTH_METHOD").unwrap_or_else(|_| {
            if api_key.is_some() {
                "api_key".to_string()
            } else {
                "adc".to_string()
            }
        });
        match method.as_str() {
            "api_key" => ProviderConfig::ApiKey {
                api_key: api_key.unwrap_or_default(),
            },
            "service_account_file" => ProviderConfig::ServiceAccountFile {
                path: credentials_path.unwrap_or_default(),
                project,
                location,
            },
            "impersonation" => ProviderConfig::Impersonation {
                target_service_account: std::env::var("JAATO_TARGET_SERVICE_ACCOUNT")
                    .unwrap_or_default(),
                project,
                location,
                source: if credentials_path.is_some() {
                    ImpersonationSource::SaFile
                } else {
                    ImpersonationSource::Adc
                },
                credentials_path,
            },
            _ => ProviderConfig::Adc { project, location },
        }
    }
}

/// Interface every concrete provider implements.
///
/// Messaging methods return [`ProviderResponse`]; transient failures
/// (rate limit, service unavailable, deadline exceeded, aborted, internal)
/// surface as `JaatoError::Transient` so the ledger's retry policy can act,
/// while permanent failures propagate immediately.
#[async_trait]
pub trait ModelProvider: Send {
    /// Unique provider identifier (e.g. `"openai_compat"`).
    fn name(&self) -> &str;

    /// Establish auth and a client handle; must fail fast with the typed
    /// credential errors. After success a lightweight connectivity probe
    /// (model list) must succeed.
    async fn initialize(&mut self, config: &ProviderConfig) -> Result<()>;

    /// Set the active model id. Idempotent.
    fn connect(&mut self, model: &str);

    /// Whether `connect` has been called with a model.
    fn is_connected(&self) -> bool;

    /// Currently configured model, if any.
    fn model_name(&self) -> Option<&str>;

    /// List model ids available from this provider, optionally filtered by
    /// prefix.
    async fn list_models(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Open a fresh chat context with an optional system instruction, tool
    /// declarations, and restored history. Replaces any prior session.
    fn create_session(
        &mut self,
        system_instruction: Option<String>,
        tools: Vec<ToolSchema>,
        history: Vec<Message>,
    );

    /// Current conversation history in provider-agnostic form.
    fn history(&self) -> &[Message];

    /// Replace the conversation history (used by GC collapse and
    /// revert-to-turn).
    fn set_history(&mut self, history: Vec<Message>);

    /// Send a user text turn; returns the model's next response. When
    /// `response_schema` is set and [`supports_structured_output`] is true,
    /// output is constrained to JSON matching the schema and
    /// `structured_output` is populated (silent fall-through on parse
    /// failure).
    ///
    /// [`supports_structured_output`]: ModelProvider::supports_structured_output
    async fn send_message(
        &mut self,
        text: &str,
        response_schema: Option<&Value>,
    ) -> Result<ProviderResponse>;

    /// Multimodal variant of [`send_message`](ModelProvider::send_message).
    async fn send_message_with_parts(
        &mut self,
        parts: Vec<Part>,
        response_schema: Option<&Value>,
    ) -> Result<ProviderResponse>;

    /// Post one or more tool outputs back to the model in a single turn.
    async fn send_tool_results(
        &mut self,
        results: Vec<ToolResult>,
        response_schema: Option<&Value>,
    ) -> Result<ProviderResponse>;

    /// Token estimate for a piece of text. The default mirrors the common
    /// chars/4 heuristic; providers with a real tokenizer endpoint override.
    fn count_tokens(&self, text: &str) -> usize {
        (text.len() / 4).max(1)
    }

    /// Context window for the current model, from the static lookup table.
    fn context_limit(&self) -> usize {
        context_limit_for(self.model_name().unwrap_or_default())
    }

    /// Token usage reported by the most recent response.
    fn token_usage(&self) -> TokenUsage;

    /// Whether `response_schema` is honored by this provider.
    fn supports_structured_output(&self) -> bool {
        false
    }

    /// Serialize a history to stable JSON. Round-trips every part variant,
    /// including binary inline data (base64).
    fn serialize_history(&self, history: &[Message]) -> Result<String> {
        Ok(serde_json::to_string_pretty(history)?)
    }

    /// Inverse of [`serialize_history`](ModelProvider::serialize_history).
    fn deserialize_history(&self, data: &str) -> Result<Vec<Message>> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Fallback context window for models missing from the table.
pub const DEFAULT_CONTEXT_LIMIT: usize = 32_768;

lazy_static! {
    /// Model-prefix → context-window table. Longest matching prefix wins.
    static ref CONTEXT_LIMITS: Vec<(&'static str, usize)> = vec![
        ("gemini-1.5-pro", 2_097_152),
        ("gemini-1.5-flash", 1_048_576),
        ("gemini-2.0", 1_048_576),
        ("gemini-2.5", 1_048_576),
        ("gpt-4o-mini", 128_000),
        ("gpt-4o", 128_000),
        ("gpt-4.1", 1_047_576),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo", 16_385),
        ("o3", 200_000),
        ("o4-mini", 200_000),
        ("claude-3-5", 200_000),
        ("claude-3", 200_000),
        ("claude-opus-4", 200_000),
        ("claude-sonnet-4", 200_000),
        ("claude-haiku-3-5", 200_000),
        ("grok-3", 131_072),
        ("grok-4", 256_000),
        ("llama-3", 128_000),
        ("qwen2.5", 32_768),
    ];
}

/// Look up the context window for a model id.
///
/// Uses longest-prefix match against the static table and falls back to a
/// conservative [`DEFAULT_CONTEXT_LIMIT`].
pub fn context_limit_for(model: &str) -> usize {
    let mut best: Option<(&str, usize)> = None;
    for (prefix, limit) in CONTEXT_LIMITS.iter() {
        if model.starts_with(prefix) {
            match best {
                Some((b, _)) if b.len() >= prefix.len() => {}
                _ => best = Some((prefix, *limit)),
            }
        }
    }
    best.map(|(_, limit)| limit).unwrap_or(DEFAULT_CONTEXT_LIMIT)
}
