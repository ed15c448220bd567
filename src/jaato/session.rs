//! One conversation: a model bound to a runtime, with its own provider
//! connection, history, accounting, and permission memory.
//!
//! A [`JaatoSession`] is the unit of concurrency. Operations on one session
//! are sequential from the caller's point of view (an overlapping
//! `send_message` is rejected with [`JaatoError::SessionBusy`]) while the
//! client may fan tool executions out in parallel internally. Many sessions
//! can share one runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jaato::client::{CancelHandle, ClientConfig, JaatoClient};
use crate::jaato::error::{JaatoError, Result};
use crate::jaato::event::EventHandler;
use crate::jaato::permission::PermissionEngine;
use crate::jaato::plugin::{GcPlugin, SessionHook};
use crate::jaato::runtime::JaatoRuntime;
use crate::jaato::types::{ContextUsage, Message, Part, ToolSchema, TurnAccounting};

/// Whether this session drives the main conversation or a subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Main,
    Subagent,
}

/// Options applied when configuring a session.
#[derive(Default)]
pub struct SessionOptions {
    /// Restrict the session to tools from these plugins; `None` exposes the
    /// full registry aggregation.
    pub tools: Option<Vec<String>>,
    /// Session-specific system instructions appended after the plugin
    /// contributions.
    pub extra_instructions: Option<String>,
    /// Restored conversation history (e.g. from a persisted session file).
    pub history: Option<Vec<Message>>,
    /// Orchestration loop tuning.
    pub client_config: ClientConfig,
    /// Optional context-GC strategy.
    pub gc_plugin: Option<Arc<dyn GcPlugin>>,
    /// Optional session-lifecycle hook (persistence).
    pub session_hook: Option<Arc<dyn SessionHook>>,
    /// Optional event handler for observability.
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

/// Output of a user command plus its echo policy.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Text produced by the command.
    pub output: String,
    /// Whether the caller should forward the output to the model.
    pub share_with_model: bool,
}

/// Provider connection coordinates stored in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Persistable state of one session (format version 2.0).
///
/// This is the seam persistence plugins store and reload: stable JSON with
/// Part-tagged history (binary inline data as base64), accounting rows, and
/// the raw user inputs for prompt-history restoration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: String,
    /// `YYYYMMDD_HHMMSS` identifier assigned when the snapshot is first
    /// taken.
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: usize,
    #[serde(default)]
    pub turn_accounting: Vec<TurnAccounting>,
    #[serde(default)]
    pub user_inputs: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub history: Vec<Message>,
}

impl SessionSnapshot {
    /// Stable JSON rendering.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a snapshot, accepting any 2.x version.
    pub fn from_json(data: &str) -> Result<Self> {
        let snapshot: SessionSnapshot = serde_json::from_str(data)?;
        if !snapshot.version.starts_with("2.") {
            return Err(JaatoError::Permanent(format!(
                "unsupported session snapshot version: {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Generate a fresh `YYYYMMDD_HHMMSS` session id.
    pub fn generate_id() -> String {
        Utc::now().format("%Y%m%d_%H%M%S").to_string()
    }
}

/// A conversation bound to a [`JaatoRuntime`].
pub struct JaatoSession {
    runtime: Arc<JaatoRuntime>,
    model_name: String,
    client: Option<JaatoClient>,
    agent_kind: AgentKind,
    agent_name: Option<String>,
    /// Raw user inputs in submission order, for prompt-history restoration.
    pending_user_inputs: Vec<String>,
    /// Captured at configure time so `reset` can rebuild the conversation.
    configured_instruction: Option<String>,
    configured_schemas: Vec<ToolSchema>,
    in_flight: Arc<AtomicBool>,
}

impl JaatoSession {
    pub(crate) fn new(runtime: Arc<JaatoRuntime>, model: &str) -> Self {
        Self {
            runtime,
            model_name: model.to_string(),
            client: None,
            agent_kind: AgentKind::Main,
            agent_name: None,
            pending_user_inputs: Vec::new(),
            configured_instruction: None,
            configured_schemas: Vec::new(),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The model this session talks to.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Whether [`configure`](JaatoSession::configure) has run.
    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    /// The runtime this session runs on.
    pub fn runtime(&self) -> &Arc<JaatoRuntime> {
        &self.runtime
    }

    /// Mark this session as the main conversation or a named subagent.
    pub fn set_agent_context(&mut self, kind: AgentKind, name: Option<String>) {
        self.agent_kind = kind;
        self.agent_name = name;
    }

    /// Agent context: kind plus optional name.
    pub fn agent_context(&self) -> (AgentKind, Option<&str>) {
        (self.agent_kind, self.agent_name.as_deref())
    }

    /// Build the provider, open its chat context, and wire up the
    /// orchestration client. Must run before the first `send_message`.
    pub async fn configure(&mut self, options: SessionOptions) -> Result<()> {
        let provider = self.runtime.create_provider(&self.model_name).await?;

        let schemas = self
            .runtime
            .tool_schemas(options.tools.as_deref())
            .await;
        let instruction = self
            .runtime
            .system_instructions(options.extra_instructions.as_deref())
            .await;

        let mut provider = provider;
        provider.create_session(
            instruction.clone(),
            schemas.clone(),
            options.history.unwrap_or_default(),
        );

        let permission = Arc::new(self.runtime.permission_engine());
        let mut config = options.client_config;
        if config.permission_context.is_none() {
            config.permission_context = Some(match (&self.agent_kind, &self.agent_name) {
                (AgentKind::Main, _) => "main".to_string(),
                (AgentKind::Subagent, Some(name)) => format!("subagent:{}", name),
                (AgentKind::Subagent, None) => "subagent".to_string(),
            });
        }

        let mut client = JaatoClient::new(
            provider,
            self.runtime.registry(),
            permission,
            self.runtime.ledger(),
        )
        .with_config(config);
        if let Some(gc) = options.gc_plugin {
            client = client.with_gc_plugin(gc);
        }
        if let Some(hook) = options.session_hook {
            client = client.with_session_hook(hook);
        }
        if let Some(handler) = options.event_handler {
            client = client.with_event_handler(handler);
        }
        client
            .refresh_auto_approved(&self.runtime.extra_auto_approved())
            .await;

        self.configured_instruction = instruction;
        self.configured_schemas = schemas;
        self.client = Some(client);
        Ok(())
    }

    /// Drive one full turn; see
    /// [`JaatoClient::send_message`](crate::JaatoClient::send_message) for
    /// the loop semantics. Overlapping calls on one session are rejected
    /// with [`JaatoError::SessionBusy`].
    pub async fn send_message(&mut self, user_text: &str) -> Result<String> {
        let _guard = self.enter_turn()?;
        let client = self.client.as_mut().ok_or(JaatoError::NotConfigured)?;
        self.pending_user_inputs.push(user_text.to_string());
        client.send_message(user_text).await
    }

    /// Multimodal turn from a list of parts.
    pub async fn send_parts(&mut self, parts: Vec<Part>) -> Result<String> {
        let _guard = self.enter_turn()?;
        let client = self.client.as_mut().ok_or(JaatoError::NotConfigured)?;
        client.send_parts(parts).await
    }

    /// Turn with a response schema constraining the final answer; the
    /// parsed structured output is available from
    /// [`last_structured_output`](JaatoSession::last_structured_output).
    pub async fn send_message_structured(
        &mut self,
        user_text: &str,
        response_schema: Value,
    ) -> Result<String> {
        let _guard = self.enter_turn()?;
        let client = self.client.as_mut().ok_or(JaatoError::NotConfigured)?;
        self.pending_user_inputs.push(user_text.to_string());
        client
            .send_message_structured(user_text, response_schema)
            .await
    }

    /// Structured output of the most recent turn, if any.
    pub fn last_structured_output(&self) -> Option<&Value> {
        self.client.as_ref()?.last_structured_output()
    }

    /// Handle that cancels the in-flight send from another task.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.client.as_ref().map(|c| c.cancel_handle())
    }

    /// Run a plugin-contributed user command by name.
    ///
    /// Commands do not pass through the model; the returned
    /// [`CommandOutcome::share_with_model`] tells the caller whether to
    /// forward the output there.
    pub async fn run_user_command(&self, name: &str, args: &[String]) -> Result<CommandOutcome> {
        let registry = self.runtime.registry();
        let registry = registry.read().await;
        let command = registry
            .user_commands()
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| JaatoError::PluginNotFound(format!("command '{}'", name)))?;
        let plugin = registry
            .plugin_for_command(name)
            .ok_or_else(|| JaatoError::PluginNotFound(format!("command '{}'", name)))?;
        drop(registry);

        let output = plugin
            .execute_command(name, args)
            .await
            .unwrap_or_else(|err| format!("command failed: {}", err));
        Ok(CommandOutcome {
            output,
            share_with_model: command.share_with_model,
        })
    }

    /// Conversation history, empty before `configure`.
    pub fn history(&self) -> Vec<Message> {
        self.client
            .as_ref()
            .map(|c| c.history().to_vec())
            .unwrap_or_default()
    }

    /// Completed turn-accounting rows, in strict turn order.
    pub fn turn_accounting(&self) -> Vec<TurnAccounting> {
        self.client
            .as_ref()
            .map(|c| c.turn_accounting().to_vec())
            .unwrap_or_default()
    }

    /// Number of recorded turns.
    pub fn turn_count(&self) -> usize {
        self.client.as_ref().map(|c| c.turn_count()).unwrap_or(0)
    }

    /// User inputs submitted so far, for prompt-history restoration.
    pub fn user_inputs(&self) -> &[String] {
        &self.pending_user_inputs
    }

    /// Context-window usage for this session's model.
    pub fn context_usage(&self) -> ContextUsage {
        match &self.client {
            Some(client) => client.context_usage(),
            None => ContextUsage {
                model: Some(self.model_name.clone()),
                context_limit: crate::jaato::provider::context_limit_for(&self.model_name),
                total_tokens: 0,
                percent_used: 0.0,
            },
        }
    }

    /// Truncate history and accounting back to the first `n` turns.
    pub async fn revert_to_turn(&mut self, n: usize) -> Result<()> {
        let client = self.client.as_mut().ok_or(JaatoError::NotConfigured)?;
        client.revert_to_turn(n).await?;
        self.pending_user_inputs.truncate(n);
        Ok(())
    }

    /// Clear history, accounting, prompt history, and session permission
    /// rules, keeping the provider connection and tool wiring.
    pub fn reset(&mut self) -> Result<()> {
        let instruction = self.configured_instruction.clone();
        let schemas = self.configured_schemas.clone();
        let client = self.client.as_mut().ok_or(JaatoError::NotConfigured)?;
        client.reset_conversation(instruction, schemas, Vec::new());
        client.permission().clear_session_rules();
        self.pending_user_inputs.clear();
        Ok(())
    }

    /// Serialize this session's history via the provider's stable JSON
    /// format.
    pub fn serialize_history(&self) -> Result<String> {
        let client = self.client.as_ref().ok_or(JaatoError::NotConfigured)?;
        let history = client.history().to_vec();
        client.provider().serialize_history(&history)
    }

    /// Capture the session's persistable state.
    ///
    /// `session_id` is kept when resuming an existing snapshot; pass `None`
    /// for a fresh id. The caller (a persistence plugin) owns writing the
    /// snapshot somewhere and updating `description`/`metadata`.
    pub fn snapshot(&self, session_id: Option<String>) -> SessionSnapshot {
        let now = Utc::now();
        let connection = match self.runtime.provider_config() {
            Some(config) => ConnectionInfo {
                project: config.project().map(|p| p.to_string()),
                location: config.location().map(|l| l.to_string()),
                model: Some(self.model_name.clone()),
            },
            None => ConnectionInfo {
                model: Some(self.model_name.clone()),
                ..ConnectionInfo::default()
            },
        };
        SessionSnapshot {
            version: "2.0".to_string(),
            session_id: session_id.unwrap_or_else(SessionSnapshot::generate_id),
            description: None,
            created_at: now,
            updated_at: now,
            turn_count: self.turn_count(),
            turn_accounting: self.turn_accounting(),
            user_inputs: self.pending_user_inputs.clone(),
            metadata: serde_json::Map::new(),
            connection,
            history: self.history(),
        }
    }

    /// Restore history and prompt inputs from a snapshot. Must be called
    /// after [`configure`](JaatoSession::configure); the provider's chat
    /// context is replaced.
    pub fn restore(&mut self, snapshot: &SessionSnapshot) -> Result<()> {
        let instruction = self.configured_instruction.clone();
        let schemas = self.configured_schemas.clone();
        let client = self.client.as_mut().ok_or(JaatoError::NotConfigured)?;
        client.reset_conversation(instruction, schemas, snapshot.history.clone());
        client.restore_accounting(snapshot.turn_accounting.clone());
        self.pending_user_inputs = snapshot.user_inputs.clone();
        Ok(())
    }

    /// The permission engine gating this session, once configured.
    pub fn permission(&self) -> Option<&Arc<PermissionEngine>> {
        self.client.as_ref().map(|c| c.permission())
    }

    fn enter_turn(&self) -> Result<TurnGuard> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(JaatoError::SessionBusy);
        }
        Ok(TurnGuard {
            flag: Arc::clone(&self.in_flight),
        })
    }
}

/// Clears the busy flag when a turn ends, also on early returns and panics.
struct TurnGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_session_rejects_send() {
        let runtime = Arc::new(JaatoRuntime::new("openai_compat"));
        let mut session = runtime.create_session("gpt-4o");
        assert!(!session.is_configured());
        let err = session.send_message("hi").await.unwrap_err();
        assert!(matches!(err, JaatoError::NotConfigured));
    }

    #[test]
    fn test_agent_context_defaults_to_main() {
        let runtime = Arc::new(JaatoRuntime::new("openai_compat"));
        let mut session = runtime.create_session("gpt-4o");
        assert_eq!(session.agent_context(), (AgentKind::Main, None));

        session.set_agent_context(AgentKind::Subagent, Some("researcher".into()));
        assert_eq!(
            session.agent_context(),
            (AgentKind::Subagent, Some("researcher"))
        );
    }

    #[test]
    fn test_context_usage_before_configure_uses_lookup() {
        let runtime = Arc::new(JaatoRuntime::new("openai_compat"));
        let session = runtime.create_session("gpt-4o");
        let usage = session.context_usage();
        assert_eq!(usage.context_limit, 128_000);
        assert_eq!(usage.total_tokens, 0);
    }
}
