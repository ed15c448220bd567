//! The orchestration loop: prompt in, gated tool dispatch, final text out.
//!
//! [`JaatoClient`] drives one conversation. Each call to
//! [`send_message`](JaatoClient::send_message) runs the full turn state
//! machine:
//!
//! 1. **Prepare**: thread the prompt through registry enrichment, append
//!    any session-hook description request, and collapse history via the GC
//!    plugin when it asks for it.
//! 2. **Send**: post the prompt to the provider (retried per the ledger's
//!    policy) and open the turn-accounting row.
//! 3. **Dispatch**: route every function call in the response to its
//!    owning plugin, gate it through the permission engine, execute it
//!    (in parallel up to a configurable cap), and wrap the outcome in a
//!    [`ToolResult`] carrying the gating decision under `_permission`.
//! 4. **Return**: post all results back to the model in the order it
//!    issued the calls, then loop until the model stops calling tools or the
//!    iteration cap fires.
//! 5. **Finalize**: close the accounting row, notify the session hook, and
//!    return the final text.
//!
//! Executor failures never unwind the loop: they become
//! `ToolResult { is_error: true }` and flow back to the model so the
//! conversation can self-correct. Only provider-permanent and configuration
//! errors escape `send_message`.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};

use crate::jaato::error::{JaatoError, Result};
use crate::jaato::event::{ClientEvent, EventHandler, NullEventHandler, OutputMode};
use crate::jaato::ledger::TokenLedger;
use crate::jaato::permission::PermissionEngine;
use crate::jaato::plugin::{GcPlugin, SessionHook, ToolPlugin};
use crate::jaato::provider::ModelProvider;
use crate::jaato::registry::PluginRegistry;
use crate::jaato::types::{
    Attachment, ContextUsage, FunctionCall, FunctionCallTiming, Message, Part, ProviderResponse,
    ToolResult, ToolSchema, TurnAccounting,
};

/// Tuning knobs for the orchestration loop.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on tool rounds per turn; when hit, the loop returns the last
    /// model text with a diagnostic note.
    pub max_tool_iterations: usize,
    /// Execute a response's function calls concurrently.
    pub parallel_tools: bool,
    /// Concurrency cap for parallel execution.
    pub parallel_tool_limit: usize,
    /// Tool results larger than this are truncated with a
    /// `{"truncated": true}` flag and a hint to the model.
    pub max_result_bytes: usize,
    /// Free-form context shown alongside permission prompts (e.g. the agent
    /// name).
    pub permission_context: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 8,
            parallel_tools: true,
            parallel_tool_limit: 4,
            max_result_bytes: 50_000,
            permission_context: None,
        }
    }
}

/// Cooperative cancellation handle for an in-flight `send_message`.
///
/// Cancelling stops new tool dispatch, signals running executors, discards
/// partial results, and leaves the accounting row marked `cancelled`.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Request cancellation of the running send.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// What a provider round-trip carries.
enum ProviderCall {
    Text(String),
    Parts(Vec<Part>),
    Results(Vec<ToolResult>),
}

/// Outcome of one gated call, produced by the per-call task.
struct CallOutcome {
    result: ToolResult,
    timing: Option<FunctionCallTiming>,
    plan: Option<Value>,
    cancelled: bool,
}

/// The function-call loop over one provider conversation.
pub struct JaatoClient {
    provider: Box<dyn ModelProvider>,
    registry: Arc<RwLock<PluginRegistry>>,
    permission: Arc<PermissionEngine>,
    ledger: Arc<TokenLedger>,
    events: Arc<dyn EventHandler>,
    config: ClientConfig,
    gc: Option<Arc<dyn GcPlugin>>,
    session_hook: Option<Arc<dyn SessionHook>>,
    turn_accounting: Vec<TurnAccounting>,
    turn_count: usize,
    /// Provider history length at the start of each turn; the consistent
    /// boundaries revert-to-turn truncates at.
    history_marks: Vec<usize>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    last_structured_output: Option<Value>,
}

impl JaatoClient {
    /// Bind a provider conversation to the shared registry, permission
    /// engine, and ledger.
    pub fn new(
        provider: Box<dyn ModelProvider>,
        registry: Arc<RwLock<PluginRegistry>>,
        permission: Arc<PermissionEngine>,
        ledger: Arc<TokenLedger>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            provider,
            registry,
            permission,
            ledger,
            events: Arc::new(NullEventHandler),
            config: ClientConfig::default(),
            gc: None,
            session_hook: None,
            turn_accounting: Vec::new(),
            turn_count: 0,
            history_marks: Vec::new(),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            last_structured_output: None,
        }
    }

    /// Override the loop configuration (builder pattern).
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an event handler (builder pattern).
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Attach a context-GC strategy (builder pattern).
    pub fn with_gc_plugin(mut self, gc: Arc<dyn GcPlugin>) -> Self {
        self.gc = Some(gc);
        self
    }

    /// Attach a session-lifecycle hook (builder pattern).
    pub fn with_session_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.session_hook = Some(hook);
        self
    }

    /// Handle that cancels the in-flight send from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// The permission engine gating this client's calls.
    pub fn permission(&self) -> &Arc<PermissionEngine> {
        &self.permission
    }

    /// Completed turn-accounting rows, in strict turn order.
    pub fn turn_accounting(&self) -> &[TurnAccounting] {
        &self.turn_accounting
    }

    /// Number of recorded turns.
    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    /// Current conversation history.
    pub fn history(&self) -> &[Message] {
        self.provider.history()
    }

    /// Borrow the underlying provider.
    pub fn provider(&self) -> &dyn ModelProvider {
        self.provider.as_ref()
    }

    /// Structured output of the most recent turn's final response, if a
    /// response schema was supplied and honored.
    pub fn last_structured_output(&self) -> Option<&Value> {
        self.last_structured_output.as_ref()
    }

    /// Context-window usage derived from the last response's token counts.
    pub fn context_usage(&self) -> ContextUsage {
        let context_limit = self.provider.context_limit();
        let total_tokens = self.provider.token_usage().total_tokens;
        let percent_used = if context_limit > 0 {
            total_tokens as f64 * 100.0 / context_limit as f64
        } else {
            0.0
        };
        ContextUsage {
            model: self.provider.model_name().map(|m| m.to_string()),
            context_limit,
            total_tokens,
            percent_used,
        }
    }

    /// Re-read the registry's auto-approved union into the permission
    /// engine. Called whenever the exposed plugin set changes.
    pub async fn refresh_auto_approved(&self, extra: &[String]) {
        let mut tools = self.registry.read().await.auto_approved_tools();
        tools.extend(extra.iter().cloned());
        self.permission.set_auto_approved(tools);
    }

    /// Open a fresh provider conversation and clear per-turn state.
    pub fn reset_conversation(
        &mut self,
        system_instruction: Option<String>,
        tools: Vec<ToolSchema>,
        history: Vec<Message>,
    ) {
        self.provider.create_session(system_instruction, tools, history);
        self.turn_accounting.clear();
        self.turn_count = 0;
        self.history_marks.clear();
        self.last_structured_output = None;
    }

    /// Adopt accounting rows from a restored snapshot.
    ///
    /// Turn boundaries inside a restored history are unknown, so reverting
    /// into the restored prefix truncates to the restore point rather than
    /// an interior boundary.
    pub fn restore_accounting(&mut self, rows: Vec<TurnAccounting>) {
        self.turn_count = rows.len();
        self.turn_accounting = rows;
        self.history_marks = vec![self.provider.history().len(); self.turn_count];
    }

    /// Truncate history and accounting back to the first `n` turns.
    ///
    /// The cut lands on the turn boundary recorded when turn `n` started, so
    /// the conversation stays consistent. The session hook is informed.
    pub async fn revert_to_turn(&mut self, n: usize) -> Result<()> {
        if n > self.turn_count {
            return Err(JaatoError::InvalidTurn {
                index: n,
                turns: self.turn_count,
            });
        }
        if n == self.turn_count {
            return Ok(());
        }
        let mark = self.history_marks[n];
        let mut history = self.provider.history().to_vec();
        history.truncate(mark);
        self.provider.set_history(history);
        self.turn_accounting.truncate(n);
        self.history_marks.truncate(n);
        self.turn_count = n;
        if let Some(hook) = self.session_hook.clone() {
            hook.on_revert(n).await;
        }
        Ok(())
    }

    /// Run one full turn from a user text prompt. Returns the model's final
    /// text once it stops requesting tools.
    pub async fn send_message(&mut self, user_text: &str) -> Result<String> {
        let prompt = self.prepare_prompt(user_text).await;
        self.run_turn(ProviderCall::Text(prompt), None).await
    }

    /// Text-prompt turn with a response schema constraining the final
    /// answer. The parsed structured output (when the provider honors the
    /// schema) is available via
    /// [`last_structured_output`](JaatoClient::last_structured_output).
    pub async fn send_message_structured(
        &mut self,
        user_text: &str,
        response_schema: Value,
    ) -> Result<String> {
        let prompt = self.prepare_prompt(user_text).await;
        self.run_turn(ProviderCall::Text(prompt), Some(response_schema))
            .await
    }

    /// Multimodal variant: run one full turn from a list of parts.
    /// Prompt enrichment applies only to text prompts and is skipped here.
    pub async fn send_parts(&mut self, parts: Vec<Part>) -> Result<String> {
        self.run_turn(ProviderCall::Parts(parts), None).await
    }

    // ---- Turn state machine ----

    /// Prepare phase for text prompts: registry enrichment plus the session
    /// hook's description request.
    async fn prepare_prompt(&self, user_text: &str) -> String {
        let enriched = self.registry.read().await.enrich_prompt(user_text).await;
        let mut prompt = enriched.prompt;
        if let Some(hook) = &self.session_hook {
            if let Some(hint) = hook.description_request(self.turn_count) {
                prompt.push_str("\n\n");
                prompt.push_str(&hint);
            }
        }
        prompt
    }

    async fn run_turn(
        &mut self,
        initial: ProviderCall,
        response_schema: Option<Value>,
    ) -> Result<String> {
        // A cancel from a previous turn must not kill this one.
        self.cancel_tx.send_replace(false);
        let mut accounting = TurnAccounting::start();
        self.last_structured_output = None;

        self.maybe_collect_garbage(&mut accounting).await;
        self.history_marks.push(self.provider.history().len());

        let preview = match &initial {
            ProviderCall::Text(text) => preview(text),
            ProviderCall::Parts(_) => "<multimodal parts>".to_string(),
            ProviderCall::Results(_) => String::new(),
        };
        self.emit(ClientEvent::TurnStarted {
            turn: self.turn_count,
            prompt_preview: preview,
        })
        .await;

        if let ProviderCall::Text(text) = &initial {
            self.ledger.record_precount(self.provider.count_tokens(text));
        }

        let mut round = 1usize;
        let mut response = match self.provider_call(initial, response_schema.as_ref()).await {
            Ok(response) => response,
            Err(err) => return Err(self.close_turn_err(accounting, err)),
        };
        accounting.add_usage(response.usage);
        self.emit_round(round, &response).await;

        let mut final_text = response.text.clone().unwrap_or_default();
        let mut iterations = 0usize;

        while response.has_function_calls() {
            if iterations >= self.config.max_tool_iterations {
                accounting.max_iterations_hit = true;
                log::warn!(
                    "tool-iteration cap ({}) hit; returning last model text",
                    self.config.max_tool_iterations
                );
                final_text = format!(
                    "{}\n\n[Warning: Maximum tool iterations reached]",
                    final_text
                );
                break;
            }
            iterations += 1;

            let results = match self
                .dispatch_calls(&response.function_calls, &mut accounting)
                .await
            {
                Ok(results) => results,
                Err(err) => return Err(self.close_turn_err(accounting, err)),
            };

            round += 1;
            response = match self
                .provider_call(ProviderCall::Results(results), response_schema.as_ref())
                .await
            {
                Ok(response) => response,
                Err(err) => return Err(self.close_turn_err(accounting, err)),
            };
            accounting.add_usage(response.usage);
            self.emit_round(round, &response).await;

            if let Some(text) = &response.text {
                if !text.is_empty() {
                    final_text = text.clone();
                }
            }
        }

        self.last_structured_output = response.structured_output.clone();

        accounting.close();
        let row = accounting.clone();
        self.turn_accounting.push(accounting);
        let turn_index = self.turn_count;
        self.turn_count += 1;
        self.emit(ClientEvent::TurnCompleted {
            turn: turn_index,
            accounting: row.clone(),
        })
        .await;
        if let Some(hook) = self.session_hook.clone() {
            hook.on_turn_complete(turn_index, &row).await;
        }
        Ok(final_text)
    }

    /// GC check at the top of the prepare phase.
    async fn maybe_collect_garbage(&mut self, accounting: &mut TurnAccounting) {
        let gc = match &self.gc {
            Some(gc) => Arc::clone(gc),
            None => return,
        };
        let usage = self.context_usage();
        if gc.should_collect(&usage, self.turn_count).is_none() {
            return;
        }
        let before = self.provider.history().len();
        let outcome = gc.collect(self.provider.history().to_vec()).await;
        let after = outcome.history.len();
        self.provider.set_history(outcome.history);
        // Old turn boundaries may now point past the collapsed history.
        for mark in self.history_marks.iter_mut() {
            if *mark > after {
                *mark = after;
            }
        }
        accounting.gc_performed = true;
        if let Some(note) = &outcome.notification {
            log::info!("context collapsed by '{}': {}", gc.name(), note);
        }
        self.emit(ClientEvent::GcPerformed {
            items_collected: outcome.items_collected,
            messages_before: before,
            messages_after: after,
        })
        .await;
    }

    /// Gate and execute every call of one model response, preserving the
    /// model's issue order in the returned results.
    async fn dispatch_calls(
        &mut self,
        calls: &[FunctionCall],
        accounting: &mut TurnAccounting,
    ) -> Result<Vec<ToolResult>> {
        // Resolve owners under one registry read lock, then release it so
        // executors never hold the lock across their await points.
        let plugins: Vec<Option<Arc<dyn ToolPlugin>>> = {
            let registry = self.registry.read().await;
            calls
                .iter()
                .map(|call| registry.plugin_for_tool(&call.name))
                .collect()
        };

        let futures: Vec<_> = calls
            .iter()
            .cloned()
            .zip(plugins)
            .map(|(call, plugin)| {
                run_one_call(
                    call,
                    plugin,
                    Arc::clone(&self.permission),
                    Arc::clone(&self.events),
                    self.config.permission_context.clone(),
                    self.config.max_result_bytes,
                    self.cancel_rx.clone(),
                )
            })
            .collect();

        let outcomes: Vec<CallOutcome> = if self.config.parallel_tools {
            futures_util::stream::iter(futures)
                .buffered(self.config.parallel_tool_limit.max(1))
                .collect()
                .await
        } else {
            let mut outcomes = Vec::with_capacity(futures.len());
            for future in futures {
                outcomes.push(future.await);
            }
            outcomes
        };

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if outcome.cancelled {
                return Err(JaatoError::Cancelled);
            }
            if let Some(timing) = outcome.timing {
                accounting.function_calls.push(timing);
            }
            if let Some(plan) = outcome.plan {
                self.emit(ClientEvent::PlanUpdated { plan }).await;
            }
            results.push(outcome.result);
        }
        Ok(results)
    }

    /// One provider round-trip with the ledger's retry policy applied.
    async fn provider_call(
        &mut self,
        call: ProviderCall,
        response_schema: Option<&Value>,
    ) -> Result<ProviderResponse> {
        let policy = self.ledger.retry_policy();
        let mut attempt: u32 = 1;
        loop {
            if *self.cancel_rx.borrow() {
                return Err(JaatoError::Cancelled);
            }
            let result = match &call {
                ProviderCall::Text(text) => self.provider.send_message(text, response_schema).await,
                ProviderCall::Parts(parts) => {
                    self.provider
                        .send_message_with_parts(parts.clone(), response_schema)
                        .await
                }
                ProviderCall::Results(results) => {
                    self.provider
                        .send_tool_results(results.clone(), response_schema)
                        .await
                }
            };
            match result {
                Ok(response) => {
                    self.ledger.record_response(Some(response.usage));
                    return Ok(response);
                }
                Err(JaatoError::Ssl(message)) => {
                    self.ledger.record_ssl_error(attempt, &message);
                    return Err(JaatoError::Ssl(message));
                }
                Err(JaatoError::Transient { class, message }) => {
                    self.ledger.record_api_error(attempt, &message, Some(class));
                    if attempt >= policy.max_attempts {
                        return Err(JaatoError::TransientExhausted {
                            attempts: attempt,
                            last_error: message,
                        });
                    }
                    let delay = policy.delay_for(attempt);
                    log::warn!(
                        "[retry {}/{}] {}: {} | sleeping {:.2}s",
                        attempt,
                        policy.max_attempts,
                        class.tag(),
                        preview(&message),
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.ledger
                        .record_api_error(attempt, &err.to_string(), None);
                    return Err(err);
                }
            }
        }
    }

    fn close_turn_err(&mut self, mut accounting: TurnAccounting, err: JaatoError) -> JaatoError {
        accounting.cancelled = matches!(err, JaatoError::Cancelled);
        accounting.close();
        self.turn_accounting.push(accounting);
        self.turn_count += 1;
        err
    }

    async fn emit(&self, event: ClientEvent) {
        self.events.on_client_event(&event).await;
    }

    async fn emit_round(&self, round: usize, response: &ProviderResponse) {
        self.emit(ClientEvent::ModelCallCompleted {
            round,
            usage: response.usage,
            function_calls: response.function_calls.len(),
        })
        .await;
        if let Some(text) = &response.text {
            if !text.is_empty() {
                self.emit(ClientEvent::Output {
                    source: "model".to_string(),
                    text: text.clone(),
                    mode: OutputMode::Write,
                })
                .await;
            }
        }
    }
}

/// First ~120 characters of a prompt, for events and logs.
fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(120).collect();
    if preview.len() < text.len() {
        preview.push('…');
    }
    preview
}

/// Gate and execute a single call. Runs without borrowing the client so
/// calls can fan out concurrently.
async fn run_one_call(
    call: FunctionCall,
    plugin: Option<Arc<dyn ToolPlugin>>,
    permission: Arc<PermissionEngine>,
    events: Arc<dyn EventHandler>,
    context: Option<String>,
    max_result_bytes: usize,
    mut cancel_rx: watch::Receiver<bool>,
) -> CallOutcome {
    let args = call.args_value();

    let plugin = match plugin {
        Some(plugin) => plugin,
        None => {
            log::warn!("model requested unknown tool '{}'", call.name);
            return CallOutcome {
                result: ToolResult::error(&call, format!("unknown tool: {}", call.name)),
                timing: None,
                plan: None,
                cancelled: false,
            };
        }
    };

    let decision = permission.ask(&call.name, &args, context.as_deref()).await;
    events
        .on_client_event(&ClientEvent::PermissionDecided {
            decision: decision.clone(),
        })
        .await;

    if !decision.is_allowed() {
        let mut result = ToolResult::ok(
            &call,
            json!({"denied": true, "reason": decision.reason.clone()}),
        );
        attach_permission(&mut result, &decision.to_metadata());
        events
            .on_client_event(&ClientEvent::ToolCompleted {
                tool: call.name.clone(),
                call_id: call.id.clone(),
                duration_seconds: 0.0,
                is_error: false,
                denied: true,
            })
            .await;
        return CallOutcome {
            result,
            timing: None,
            plan: None,
            cancelled: false,
        };
    }

    events
        .on_client_event(&ClientEvent::ToolStarted {
            tool: call.name.clone(),
            call_id: call.id.clone(),
            args: args.clone(),
        })
        .await;

    let started = Instant::now();
    let cancelled = async move {
        if cancel_rx.wait_for(|flag| *flag).await.is_err() {
            // Sender gone: cancellation can never arrive.
            std::future::pending::<()>().await;
        }
    };
    let executed = tokio::select! {
        biased;
        _ = cancelled => None,
        outcome = plugin.execute(&call.name, &args) => Some(outcome),
    };
    let duration_seconds = started.elapsed().as_secs_f64();

    let executed = match executed {
        Some(executed) => executed,
        None => {
            return CallOutcome {
                result: ToolResult::error(&call, "cancelled"),
                timing: None,
                plan: None,
                cancelled: true,
            }
        }
    };

    let mut plan = None;
    let mut result = match executed {
        Ok(mut value) => {
            let attachments = extract_attachments(&mut value);
            plan = value
                .as_object()
                .and_then(|obj| obj.get("plan"))
                .cloned();
            let mut result = ToolResult::ok(&call, truncate_value(value, max_result_bytes));
            result.attachments = attachments;
            result
        }
        Err(message) => ToolResult::error(&call, truncate_text(message, max_result_bytes)),
    };
    attach_permission(&mut result, &decision.to_metadata());

    events
        .on_client_event(&ClientEvent::ToolCompleted {
            tool: call.name.clone(),
            call_id: call.id.clone(),
            duration_seconds,
            is_error: result.is_error,
            denied: false,
        })
        .await;

    CallOutcome {
        result,
        timing: Some(FunctionCallTiming {
            name: call.name.clone(),
            duration_seconds,
        }),
        plan,
        cancelled: false,
    }
}

/// Attach the gating decision under `_permission`, wrapping non-object
/// payloads so the metadata always has somewhere to live.
fn attach_permission(result: &mut ToolResult, metadata: &Value) {
    match result.result.as_object_mut() {
        Some(obj) => {
            obj.insert("_permission".to_string(), metadata.clone());
        }
        None => {
            result.result = json!({
                "result": result.result,
                "_permission": metadata,
            });
        }
    }
}

/// Lift an executor-provided `attachments` array out of the result payload.
fn extract_attachments(value: &mut Value) -> Option<Vec<Attachment>> {
    let raw = value.as_object_mut()?.remove("attachments")?;
    let items = raw.as_array()?;
    let attachments: Vec<Attachment> = items.iter().filter_map(Attachment::from_envelope).collect();
    if attachments.is_empty() {
        None
    } else {
        Some(attachments)
    }
}

/// Truncate an oversized result payload, flagging the truncation so the
/// model knows content is missing.
fn truncate_value(value: Value, max_bytes: usize) -> Value {
    let rendered = value.to_string();
    if rendered.len() <= max_bytes {
        return value;
    }
    let kept: String = rendered.chars().take(max_bytes).collect();
    json!({
        "truncated": true,
        "result": kept,
        "hint": format!("tool output exceeded {} bytes and was truncated", max_bytes),
    })
}

/// Truncate an oversized error string the same way.
fn truncate_text(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let kept: String = text.chars().take(max_bytes).collect();
    format!("{}… [truncated to {} bytes]", kept, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jaato::permission::PermissionPolicy;
    use serde_json::json;

    #[test]
    fn test_truncate_value_flags_oversize() {
        let value = json!({"stdout": "x".repeat(100)});
        let truncated = truncate_value(value.clone(), 40);
        assert_eq!(truncated["truncated"], true);
        assert!(truncated["hint"].as_str().unwrap().contains("truncated"));

        let small = truncate_value(value.clone(), 10_000);
        assert_eq!(small, value);
    }

    #[test]
    fn test_attach_permission_wraps_non_objects() {
        let call = FunctionCall::new("t", serde_json::Map::new());
        let mut result = ToolResult::ok(&call, json!("plain string"));
        attach_permission(&mut result, &json!({"decision": "allowed"}));
        assert_eq!(result.result["result"], "plain string");
        assert_eq!(result.result["_permission"]["decision"], "allowed");

        let mut object_result = ToolResult::ok(&call, json!({"ok": true}));
        attach_permission(&mut object_result, &json!({"decision": "allowed"}));
        assert_eq!(object_result.result["ok"], true);
        assert!(object_result.result.get("_permission").is_some());
    }

    #[test]
    fn test_extract_attachments() {
        let mut value = json!({
            "ok": true,
            "attachments": [
                {"mime_type": "image/png", "base64_data": "AQID", "display_name": "shot"}
            ]
        });
        let attachments = extract_attachments(&mut value).unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].data, vec![1, 2, 3]);
        assert!(value.get("attachments").is_none());
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_unknown_tool_synthesizes_error_result() {
        let permission = Arc::new(PermissionEngine::new(PermissionPolicy::allow_all()));
        let call = FunctionCall::new("ghost", serde_json::Map::new());
        let outcome = run_one_call(
            call.clone(),
            None,
            permission,
            Arc::new(NullEventHandler),
            None,
            50_000,
            watch::channel(false).1,
        )
        .await;
        assert!(outcome.result.is_error);
        assert_eq!(outcome.result.call_id, call.id);
        assert!(outcome
            .result
            .result
            .as_str()
            .unwrap()
            .contains("unknown tool"));
    }
}
