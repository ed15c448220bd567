//! Shared test doubles: a scripted provider, small plugins, and helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use jaato::error::{JaatoError, Result, TransientClass};
use jaato::provider::{ModelProvider, ProviderConfig};
use jaato::types::{
    FinishReason, FunctionCall, Message, Part, ProviderResponse, Role, TokenUsage, ToolResult,
    ToolSchema,
};
use jaato::ToolPlugin;

/// One scripted provider reply.
pub enum ScriptStep {
    Respond(ProviderResponse),
    TransientFail(TransientClass, &'static str),
}

/// A [`ModelProvider`] that replays a script instead of talking to a
/// backend. Appends to history the way a real provider does so turn
/// boundaries and serialization behave realistically.
pub struct MockProvider {
    script: VecDeque<ScriptStep>,
    history: Vec<Message>,
    system_instruction: Option<String>,
    tools: Vec<ToolSchema>,
    last_usage: TokenUsage,
    model: Option<String>,
    /// Count of provider round-trips attempted (including scripted
    /// failures).
    pub attempts: Arc<AtomicUsize>,
    /// Tool-result batch sizes seen by `send_tool_results`.
    pub result_batches: Arc<Mutex<Vec<usize>>>,
}

impl MockProvider {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: script.into(),
            history: Vec::new(),
            system_instruction: None,
            tools: Vec::new(),
            last_usage: TokenUsage::default(),
            model: Some("mock-model".to_string()),
            attempts: Arc::new(AtomicUsize::new(0)),
            result_batches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn step(&mut self) -> Result<ProviderResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front() {
            Some(ScriptStep::Respond(response)) => {
                let mut parts = Vec::new();
                if let Some(text) = &response.text {
                    parts.push(Part::Text(text.clone()));
                }
                for call in &response.function_calls {
                    parts.push(Part::FunctionCall(call.clone()));
                }
                if !parts.is_empty() {
                    self.history.push(Message {
                        role: Role::Model,
                        parts,
                    });
                }
                self.last_usage = response.usage;
                Ok(response)
            }
            Some(ScriptStep::TransientFail(class, message)) => {
                // A failed round leaves no outbound message behind.
                self.history.pop();
                Err(JaatoError::Transient {
                    class,
                    message: message.to_string(),
                })
            }
            None => Err(JaatoError::Permanent("mock script exhausted".to_string())),
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize(&mut self, _config: &ProviderConfig) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, model: &str) {
        self.model = Some(model.to_string());
    }

    fn is_connected(&self) -> bool {
        self.model.is_some()
    }

    fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn list_models(&self, _prefix: Option<&str>) -> Result<Vec<String>> {
        Ok(vec!["mock-model".to_string()])
    }

    fn create_session(
        &mut self,
        system_instruction: Option<String>,
        tools: Vec<ToolSchema>,
        history: Vec<Message>,
    ) {
        self.system_instruction = system_instruction;
        self.tools = tools;
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
        _response_schema: Option<&Value>,
    ) -> Result<ProviderResponse> {
        self.history.push(Message::from_text(Role::User, text));
        self.step()
    }

    async fn send_message_with_parts(
        &mut self,
        parts: Vec<Part>,
        _response_schema: Option<&Value>,
    ) -> Result<ProviderResponse> {
        self.history.push(Message {
            role: Role::User,
            parts,
        });
        self.step()
    }

    async fn send_tool_results(
        &mut self,
        results: Vec<ToolResult>,
        _response_schema: Option<&Value>,
    ) -> Result<ProviderResponse> {
        self.result_batches.lock().unwrap().push(results.len());
        self.history.push(Message {
            role: Role::Tool,
            parts: results.into_iter().map(Part::FunctionResponse).collect(),
        });
        self.step()
    }

    fn token_usage(&self) -> TokenUsage {
        self.last_usage
    }
}

/// Scripted reply: text only.
pub fn text_reply(text: &str) -> ScriptStep {
    ScriptStep::Respond(ProviderResponse {
        text: Some(text.to_string()),
        function_calls: Vec::new(),
        usage: TokenUsage {
            prompt_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
        finish_reason: FinishReason::Stop,
        structured_output: None,
        raw: None,
    })
}

/// Scripted reply: function calls, optionally alongside text.
pub fn tool_reply(text: Option<&str>, calls: Vec<FunctionCall>) -> ScriptStep {
    ScriptStep::Respond(ProviderResponse {
        text: text.map(|t| t.to_string()),
        function_calls: calls,
        usage: TokenUsage {
            prompt_tokens: 20,
            output_tokens: 8,
            total_tokens: 28,
        },
        finish_reason: FinishReason::ToolUse,
        structured_output: None,
        raw: None,
    })
}

/// Build a function call with explicit id.
pub fn call(id: &str, name: &str, args: Value) -> FunctionCall {
    FunctionCall {
        id: id.to_string(),
        name: name.to_string(),
        args: args.as_object().cloned().unwrap_or_default(),
    }
}

/// All tool results present in a history, in order.
pub fn tool_results(history: &[Message]) -> Vec<&ToolResult> {
    history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            Part::FunctionResponse(r) => Some(r),
            _ => None,
        })
        .collect()
}

/// Plugin exposing `echo(text) -> {echoed}`; optionally auto-approved.
pub struct EchoPlugin {
    pub auto_approved: bool,
}

#[async_trait]
impl ToolPlugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        vec![ToolSchema::new("echo", "Echo the given text back").with_parameters(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }))]
    }

    async fn execute(&self, _tool: &str, args: &Value) -> std::result::Result<Value, String> {
        Ok(json!({"echoed": args.get("text").cloned().unwrap_or(Value::Null)}))
    }

    fn auto_approved_tools(&self) -> Vec<String> {
        if self.auto_approved {
            vec!["echo".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Plugin exposing `sleep(ms) -> {slept}`; auto-approved, used for fan-out
/// timing tests.
pub struct SleepPlugin;

#[async_trait]
impl ToolPlugin for SleepPlugin {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        vec![ToolSchema::new("sleep", "Sleep for the given milliseconds")]
    }

    async fn execute(&self, _tool: &str, args: &Value) -> std::result::Result<Value, String> {
        let ms = args.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({"slept": ms}))
    }

    fn auto_approved_tools(&self) -> Vec<String> {
        vec!["sleep".to_string()]
    }
}

/// Plugin whose executor always fails; auto-approved.
pub struct FailingPlugin;

#[async_trait]
impl ToolPlugin for FailingPlugin {
    fn name(&self) -> &str {
        "failing"
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        vec![ToolSchema::new("explode", "Always fails")]
    }

    async fn execute(&self, _tool: &str, _args: &Value) -> std::result::Result<Value, String> {
        Err("executor blew up".to_string())
    }

    fn auto_approved_tools(&self) -> Vec<String> {
        vec!["explode".to_string()]
    }
}
