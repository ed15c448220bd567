//! The uniform contract every tool plugin implements.
//!
//! A plugin bundles a set of tools: their schemas, their execution, optional
//! system-prompt material, an auto-approved list, user-typable commands with
//! completions, and an optional prompt-enrichment pass. The registry
//! aggregates these contributions across the exposed set; the orchestrator
//! routes function calls back to the owning plugin.
//!
//! Executor failures are returned as `Err(String)` and become
//! `ToolResult { is_error: true }`; they are conversation data, never
//! runtime errors.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use jaato::plugin::ToolPlugin;
//! use jaato::types::ToolSchema;
//! use serde_json::{json, Value};
//!
//! struct EchoPlugin;
//!
//! #[async_trait]
//! impl ToolPlugin for EchoPlugin {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn tool_schemas(&self) -> Vec<ToolSchema> {
//!         vec![ToolSchema::new("echo", "Echo the given text back").with_parameters(json!({
//!             "type": "object",
//!             "properties": {"text": {"type": "string"}},
//!             "required": ["text"]
//!         }))]
//!     }
//!
//!     async fn execute(&self, _tool: &str, args: &Value) -> Result<Value, String> {
//!         Ok(json!({"echoed": args.get("text").cloned().unwrap_or(Value::Null)}))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::jaato::types::{
    Completion, ContextUsage, EnrichedPrompt, Message, ToolSchema, TurnAccounting, UserCommand,
};

/// Contract between the registry/orchestrator and a tool plugin.
///
/// Lifecycle methods take `&self`; plugins that hold mutable state use
/// interior mutability so an exposed plugin can be shared with in-flight
/// executors.
#[async_trait]
pub trait ToolPlugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Called once when the plugin is exposed, with its configuration.
    async fn initialize(&self, _config: Option<&Value>) -> Result<(), String> {
        Ok(())
    }

    /// Called when the plugin is unexposed; release held resources.
    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }

    /// Declarations for every tool this plugin provides.
    fn tool_schemas(&self) -> Vec<ToolSchema>;

    /// Execute one of this plugin's tools by name.
    ///
    /// The returned object MAY include an `attachments` array of
    /// `{mime_type, base64_data, display_name?}` entries; the orchestrator
    /// lifts those into [`crate::types::ToolResult::attachments`].
    async fn execute(&self, tool: &str, args: &Value) -> Result<Value, String>;

    /// Text appended to the model's system prompt while this plugin is
    /// exposed.
    fn system_instructions(&self) -> Option<String> {
        None
    }

    /// Tool names exempt from permission gating while this plugin is
    /// exposed.
    fn auto_approved_tools(&self) -> Vec<String> {
        Vec::new()
    }

    /// Commands the user can type directly (`/name ...`).
    fn user_commands(&self) -> Vec<UserCommand> {
        Vec::new()
    }

    /// Run a user command. Only called for names this plugin declared.
    async fn execute_command(&self, name: &str, _args: &[String]) -> Result<String, String> {
        Err(format!("unknown command: {}", name))
    }

    /// Completion candidates for a command's argument position.
    fn command_completions(&self, _command: &str, _args: &[String]) -> Vec<Completion> {
        Vec::new()
    }

    /// Whether [`enrich_prompt`](ToolPlugin::enrich_prompt) should be called
    /// for each user prompt.
    fn subscribes_to_prompt_enrichment(&self) -> bool {
        false
    }

    /// Rewrite or annotate a user prompt before it reaches the model.
    async fn enrich_prompt(&self, prompt: &str) -> EnrichedPrompt {
        EnrichedPrompt {
            prompt: prompt.to_string(),
            metadata: Default::default(),
        }
    }
}

/// Why a history collapse was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTrigger {
    /// Context usage crossed the configured threshold.
    Threshold,
    /// Turn count crossed the configured limit.
    TurnLimit,
    /// Explicitly requested by the caller.
    Manual,
}

/// Outcome of one collapse.
#[derive(Debug, Clone)]
pub struct GcOutcome {
    /// The replacement history.
    pub history: Vec<Message>,
    /// Number of messages removed or merged away.
    pub items_collected: usize,
    /// Optional notice injected so the model knows context was collapsed.
    pub notification: Option<String>,
}

/// Strategy seam for context garbage collection.
///
/// The orchestrator consults `should_collect` at the start of each turn and,
/// when it fires, replaces the provider history with the collapsed one from
/// `collect`. The collapse itself (truncation, summarization, …) is the
/// plugin's business.
#[async_trait]
pub trait GcPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Decide whether to collapse before the next message.
    fn should_collect(&self, usage: &ContextUsage, turn_count: usize) -> Option<GcTrigger>;

    /// Produce the collapsed history.
    async fn collect(&self, history: Vec<Message>) -> GcOutcome;
}

/// Session-lifecycle seam used by persistence plugins.
///
/// The orchestrator notifies the hook at turn boundaries and honors its
/// request to append a description hint to the user's prompt (used to ask
/// the model for a one-line session description after N turns).
#[async_trait]
pub trait SessionHook: Send + Sync {
    /// Extra text appended to the prompt in the prepare phase, if the hook
    /// wants one this turn.
    fn description_request(&self, _turn_count: usize) -> Option<String> {
        None
    }

    /// Called after each completed turn with its accounting row.
    async fn on_turn_complete(&self, _turn_index: usize, _accounting: &TurnAccounting) {}

    /// Called after history was truncated back to `turn_index` turns.
    async fn on_revert(&self, _turn_index: usize) {}
}
