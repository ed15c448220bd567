//! Permission policy evaluation and the gating engine.
//!
//! Every non-auto-approved tool call is gated before execution. The engine
//! evaluates its policy in a fixed order (auto-approved set, session rules,
//! blacklist, whitelist, default policy) and only consults the interactive
//! channel when the default policy is `ask`.
//!
//! Prompts are a critical section for the whole runtime: the channel sits
//! behind one async mutex shared by every engine built from the same
//! [`SharedPrompter`], so console prompts never interleave even across
//! sessions. Concurrent asks for the same `(tool, args_digest)` coalesce
//! onto a single prompt and all adopt the leader's decision.
//!
//! # Example
//!
//! ```rust
//! use jaato::permission::{PermissionEngine, PermissionMethod, PermissionPolicy};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = PermissionEngine::new(PermissionPolicy::allow_all());
//! let decision = engine.ask("read_file", &json!({"path": "/tmp/x"}), None).await;
//! assert!(decision.is_allowed());
//! assert_eq!(decision.method, PermissionMethod::Default);
//! # }
//! ```

pub mod channels;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};

use crate::jaato::permission::channels::{
    AutoChannel, InteractionChannel, PermissionRequest, PromptAction,
};
use crate::jaato::types::canonical_json;

/// Outcome of a gating decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied,
}

/// Which policy step produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMethod {
    AutoApproved,
    SessionRule,
    Blacklist,
    Whitelist,
    UserOnce,
    UserAlways,
    UserNever,
    Default,
}

/// How long a user answer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionScope {
    /// This call only.
    Once,
    /// Remembered for the rest of the session.
    Session,
}

/// A gating decision, attached to every tool result under `_permission`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub decision: Decision,
    pub reason: String,
    pub method: PermissionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<DecisionScope>,
    pub tool_name: String,
    pub args_digest: String,
}

impl PermissionDecision {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allowed
    }

    /// JSON form used for the `_permission` metadata field.
    pub fn to_metadata(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Default policy applied when no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    Allow,
    Deny,
    Ask,
}

/// A whitelist/blacklist entry.
///
/// `tool` matches exactly, or by prefix when it ends with `*`. When
/// `args_pattern` is set, the rule additionally requires the pattern to
/// occur as a substring of the canonical JSON of the call arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_pattern: Option<String>,
}

impl PermissionRule {
    /// Rule matching a tool name (exact or trailing-`*` prefix).
    pub fn tool(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args_pattern: None,
        }
    }

    /// Rule matching a tool name plus an argument substring pattern.
    pub fn tool_with_args(tool: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args_pattern: Some(pattern.into()),
        }
    }

    fn matches(&self, tool: &str, canonical_args: &str) -> bool {
        let tool_match = if let Some(prefix) = self.tool.strip_suffix('*') {
            tool.starts_with(prefix)
        } else {
            self.tool == tool
        };
        if !tool_match {
            return false;
        }
        match &self.args_pattern {
            Some(pattern) => canonical_args.contains(pattern.as_str()),
            None => true,
        }
    }
}

/// The evaluable policy: default plus white/black lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub default_policy: DefaultPolicy,
    #[serde(default)]
    pub whitelist: Vec<PermissionRule>,
    #[serde(default)]
    pub blacklist: Vec<PermissionRule>,
}

impl PermissionPolicy {
    /// Everything allowed unless blacklisted.
    pub fn allow_all() -> Self {
        Self {
            default_policy: DefaultPolicy::Allow,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    /// Everything denied unless whitelisted.
    pub fn deny_all() -> Self {
        Self {
            default_policy: DefaultPolicy::Deny,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    /// Consult the interaction channel unless a list matches.
    pub fn ask() -> Self {
        Self {
            default_policy: DefaultPolicy::Ask,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    /// Add a whitelist rule (builder pattern).
    pub fn with_whitelist(mut self, rule: PermissionRule) -> Self {
        self.whitelist.push(rule);
        self
    }

    /// Add a blacklist rule (builder pattern).
    pub fn with_blacklist(mut self, rule: PermissionRule) -> Self {
        self.blacklist.push(rule);
        self
    }
}

/// Tuning knobs for a [`PermissionEngine`].
#[derive(Debug, Clone)]
pub struct PermissionEngineConfig {
    /// Key session rules by `(tool, args_digest)` instead of tool alone.
    pub rule_key_includes_args: bool,
    /// How long to wait for the channel before treating the ask as denied.
    pub channel_timeout: Duration,
}

impl Default for PermissionEngineConfig {
    fn default() -> Self {
        Self {
            rule_key_includes_args: false,
            channel_timeout: Duration::from_secs(300),
        }
    }
}

/// The interaction channel plus its serialization lock, shared runtime-wide.
///
/// Building every session's engine from one `SharedPrompter` guarantees that
/// prompts from different sessions never interleave on the user's terminal.
pub struct SharedPrompter {
    channel: Mutex<Box<dyn InteractionChannel>>,
    timeout: Duration,
}

impl SharedPrompter {
    /// Wrap a channel with the default ask timeout.
    pub fn new(channel: Box<dyn InteractionChannel>) -> Self {
        Self {
            channel: Mutex::new(channel),
            timeout: PermissionEngineConfig::default().channel_timeout,
        }
    }

    /// Wrap a channel with an explicit ask timeout.
    pub fn with_timeout(channel: Box<dyn InteractionChannel>, timeout: Duration) -> Self {
        Self {
            channel: Mutex::new(channel),
            timeout,
        }
    }

    /// Present one request, holding the runtime-wide prompt lock.
    async fn prompt(&self, request: &PermissionRequest) -> Option<PromptAction> {
        let channel = self.channel.lock().await;
        match tokio::time::timeout(self.timeout, channel.prompt(request)).await {
            Ok(Ok(action)) => Some(action),
            Ok(Err(err)) => {
                log::warn!(
                    "permission channel error for tool '{}': {}",
                    request.tool,
                    err
                );
                None
            }
            Err(_) => None,
        }
    }
}

/// A remembered user answer for the session.
#[derive(Debug, Clone, Copy)]
struct SessionRule {
    allowed: bool,
}

/// Policy evaluator plus session memory plus channel consultation.
///
/// One engine per session; the policy and prompter may be shared across
/// engines via `Arc`.
pub struct PermissionEngine {
    policy: RwLock<PermissionPolicy>,
    prompter: Arc<SharedPrompter>,
    config: PermissionEngineConfig,
    auto_approved: RwLock<HashSet<String>>,
    session_rules: RwLock<HashMap<String, SessionRule>>,
    /// In-flight channel consultations keyed by `(tool, digest)`; followers
    /// subscribe to the leader's decision instead of prompting again.
    pending: StdMutex<HashMap<String, watch::Receiver<Option<PermissionDecision>>>>,
}

impl PermissionEngine {
    /// Engine with the given policy and a non-interactive auto channel that
    /// answers `once` to every ask. Useful for tests and `allow`/`deny`
    /// policies that never consult the channel.
    pub fn new(policy: PermissionPolicy) -> Self {
        Self::with_prompter(
            policy,
            Arc::new(SharedPrompter::new(Box::new(AutoChannel::always(
                PromptAction::No,
            )))),
        )
    }

    /// Engine with the given policy and a shared prompter.
    pub fn with_prompter(policy: PermissionPolicy, prompter: Arc<SharedPrompter>) -> Self {
        Self {
            policy: RwLock::new(policy),
            prompter,
            config: PermissionEngineConfig::default(),
            auto_approved: RwLock::new(HashSet::new()),
            session_rules: RwLock::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
        }
    }

    /// Override engine configuration (builder pattern).
    pub fn with_config(mut self, config: PermissionEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the auto-approved tool set (union of plugin contributions and
    /// runtime extras). Refreshed whenever the exposed plugin set changes.
    pub fn set_auto_approved(&self, tools: impl IntoIterator<Item = String>) {
        let mut set = self.auto_approved.write().expect("permission poisoned");
        set.clear();
        set.extend(tools);
    }

    /// Whether a tool bypasses gating entirely.
    pub fn is_auto_approved(&self, tool: &str) -> bool {
        self.auto_approved
            .read()
            .expect("permission poisoned")
            .contains(tool)
    }

    /// Replace the policy.
    pub fn set_policy(&self, policy: PermissionPolicy) {
        *self.policy.write().expect("permission poisoned") = policy;
    }

    /// Drop all session rules (on session reset).
    pub fn clear_session_rules(&self) {
        self.session_rules
            .write()
            .expect("permission poisoned")
            .clear();
    }

    /// Number of installed session rules.
    pub fn session_rule_count(&self) -> usize {
        self.session_rules
            .read()
            .expect("permission poisoned")
            .len()
    }

    fn rule_key(&self, tool: &str, digest: &str) -> String {
        if self.config.rule_key_includes_args {
            format!("{}:{}", tool, digest)
        } else {
            tool.to_string()
        }
    }

    fn install_rule(&self, tool: &str, digest: &str, allowed: bool) {
        self.session_rules
            .write()
            .expect("permission poisoned")
            .insert(self.rule_key(tool, digest), SessionRule { allowed });
    }

    /// Evaluate the policy without consulting the channel.
    ///
    /// Returns `None` when the default policy is `ask` and no earlier step
    /// matched; the caller then consults the channel via [`ask`].
    ///
    /// [`ask`]: PermissionEngine::ask
    pub fn evaluate(&self, tool: &str, args: &Value) -> Option<PermissionDecision> {
        let digest = args_digest(args);
        let canonical = canonical_json(args);

        // 1. Auto-approved set.
        if self.is_auto_approved(tool) {
            return Some(PermissionDecision {
                decision: Decision::Allowed,
                reason: "tool is auto-approved".into(),
                method: PermissionMethod::AutoApproved,
                scope: None,
                tool_name: tool.to_string(),
                args_digest: digest,
            });
        }

        // 2. Session rule.
        if let Some(rule) = self
            .session_rules
            .read()
            .expect("permission poisoned")
            .get(&self.rule_key(tool, &digest))
        {
            return Some(PermissionDecision {
                decision: if rule.allowed {
                    Decision::Allowed
                } else {
                    Decision::Denied
                },
                reason: "session rule".into(),
                method: PermissionMethod::SessionRule,
                scope: Some(DecisionScope::Session),
                tool_name: tool.to_string(),
                args_digest: digest,
            });
        }

        let policy = self.policy.read().expect("permission poisoned");

        // 3. Blacklist.
        if policy.blacklist.iter().any(|r| r.matches(tool, &canonical)) {
            return Some(PermissionDecision {
                decision: Decision::Denied,
                reason: "tool matches blacklist".into(),
                method: PermissionMethod::Blacklist,
                scope: None,
                tool_name: tool.to_string(),
                args_digest: digest,
            });
        }

        // 4. Whitelist.
        if policy.whitelist.iter().any(|r| r.matches(tool, &canonical)) {
            return Some(PermissionDecision {
                decision: Decision::Allowed,
                reason: "tool matches whitelist".into(),
                method: PermissionMethod::Whitelist,
                scope: None,
                tool_name: tool.to_string(),
                args_digest: digest,
            });
        }

        // 5. Default allow/deny; 6. ask falls through to the channel.
        match policy.default_policy {
            DefaultPolicy::Allow => Some(PermissionDecision {
                decision: Decision::Allowed,
                reason: "default policy allows".into(),
                method: PermissionMethod::Default,
                scope: None,
                tool_name: tool.to_string(),
                args_digest: digest,
            }),
            DefaultPolicy::Deny => Some(PermissionDecision {
                decision: Decision::Denied,
                reason: "default policy denies".into(),
                method: PermissionMethod::Default,
                scope: None,
                tool_name: tool.to_string(),
                args_digest: digest,
            }),
            DefaultPolicy::Ask => None,
        }
    }

    /// Gate one call: evaluate the policy and consult the channel when
    /// needed. Never fails: a channel timeout or error becomes a denial
    /// with reason `"timeout"`.
    pub async fn ask(&self, tool: &str, args: &Value, context: Option<&str>) -> PermissionDecision {
        if let Some(decision) = self.evaluate(tool, args) {
            return decision;
        }

        let digest = args_digest(args);
        let key = format!("{}:{}", tool, digest);

        // Coalesce duplicate asks: the first caller for a key becomes the
        // leader and prompts; later callers wait for the leader's decision.
        // Membership check and insertion happen under one lock so a key has
        // exactly one leader.
        let leader_tx = {
            let mut pending = self.pending.lock().expect("permission poisoned");
            match pending.get(&key) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(key.clone(), rx);
                    Ok(tx)
                }
            }
        };

        let tx = match leader_tx {
            Ok(tx) => tx,
            Err(mut rx) => {
                loop {
                    if let Some(decision) = rx.borrow().clone() {
                        return decision;
                    }
                    if rx.changed().await.is_err() {
                        // Leader vanished without answering; evaluate again
                        // (a rule may have landed) and otherwise deny like a
                        // timed-out channel.
                        break;
                    }
                }
                return self
                    .evaluate(tool, args)
                    .unwrap_or_else(|| self.decision_from_action(tool, &digest, None));
            }
        };

        // A rule may have been installed while we were queueing.
        let decision = match self.evaluate(tool, args) {
            Some(decision) => decision,
            None => {
                let request = PermissionRequest::new(tool, args.clone(), context);
                let action = self.prompter.prompt(&request).await;
                self.decision_from_action(tool, &digest, action)
            }
        };

        let _ = tx.send(Some(decision.clone()));
        self.pending
            .lock()
            .expect("permission poisoned")
            .remove(&key);
        decision
    }

    fn decision_from_action(
        &self,
        tool: &str,
        digest: &str,
        action: Option<PromptAction>,
    ) -> PermissionDecision {
        match action {
            Some(PromptAction::Yes) | Some(PromptAction::Once) => PermissionDecision {
                decision: Decision::Allowed,
                reason: "user approved this call".into(),
                method: PermissionMethod::UserOnce,
                scope: Some(DecisionScope::Once),
                tool_name: tool.to_string(),
                args_digest: digest.to_string(),
            },
            Some(PromptAction::No) => PermissionDecision {
                decision: Decision::Denied,
                reason: "user denied this call".into(),
                method: PermissionMethod::UserOnce,
                scope: Some(DecisionScope::Once),
                tool_name: tool.to_string(),
                args_digest: digest.to_string(),
            },
            Some(PromptAction::Always) => {
                self.install_rule(tool, digest, true);
                PermissionDecision {
                    decision: Decision::Allowed,
                    reason: "user approved for the session".into(),
                    method: PermissionMethod::UserAlways,
                    scope: Some(DecisionScope::Session),
                    tool_name: tool.to_string(),
                    args_digest: digest.to_string(),
                }
            }
            Some(PromptAction::Never) => {
                self.install_rule(tool, digest, false);
                PermissionDecision {
                    decision: Decision::Denied,
                    reason: "user denied for the session".into(),
                    method: PermissionMethod::UserNever,
                    scope: Some(DecisionScope::Session),
                    tool_name: tool.to_string(),
                    args_digest: digest.to_string(),
                }
            }
            None => PermissionDecision {
                decision: Decision::Denied,
                reason: "timeout".into(),
                method: PermissionMethod::UserOnce,
                scope: Some(DecisionScope::Once),
                tool_name: tool.to_string(),
                args_digest: digest.to_string(),
            },
        }
    }
}

/// Hex SHA-256 of the canonical JSON of a call's arguments.
pub fn args_digest(args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(args).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_digest_is_order_insensitive() {
        let a = json!({"x": 1, "y": {"b": 2, "a": 3}});
        let b = json!({"y": {"a": 3, "b": 2}, "x": 1});
        assert_eq!(args_digest(&a), args_digest(&b));
        assert_ne!(args_digest(&a), args_digest(&json!({"x": 2})));
    }

    #[test]
    fn test_rule_matching() {
        let exact = PermissionRule::tool("run_shell");
        assert!(exact.matches("run_shell", "{}"));
        assert!(!exact.matches("run_shell_2", "{}"));

        let prefix = PermissionRule::tool("mcp_*");
        assert!(prefix.matches("mcp_search", "{}"));
        assert!(!prefix.matches("cli", "{}"));

        let with_args = PermissionRule::tool_with_args("run_shell", "rm -rf");
        assert!(with_args.matches("run_shell", r#"{"command":"rm -rf /"}"#));
        assert!(!with_args.matches("run_shell", r#"{"command":"ls"}"#));
    }

    #[test]
    fn test_evaluation_order_blacklist_beats_whitelist() {
        let engine = PermissionEngine::new(
            PermissionPolicy::ask()
                .with_whitelist(PermissionRule::tool("run_shell"))
                .with_blacklist(PermissionRule::tool_with_args("run_shell", "rm -rf")),
        );
        let denied = engine
            .evaluate("run_shell", &json!({"command": "rm -rf /"}))
            .unwrap();
        assert_eq!(denied.decision, Decision::Denied);
        assert_eq!(denied.method, PermissionMethod::Blacklist);

        let allowed = engine
            .evaluate("run_shell", &json!({"command": "ls"}))
            .unwrap();
        assert_eq!(allowed.decision, Decision::Allowed);
        assert_eq!(allowed.method, PermissionMethod::Whitelist);
    }

    #[test]
    fn test_auto_approved_wins_over_blacklist() {
        let engine = PermissionEngine::new(
            PermissionPolicy::deny_all().with_blacklist(PermissionRule::tool("echo")),
        );
        engine.set_auto_approved(vec!["echo".to_string()]);
        let decision = engine.evaluate("echo", &json!({})).unwrap();
        assert_eq!(decision.method, PermissionMethod::AutoApproved);
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_always_installs_session_rule() {
        let prompter = Arc::new(SharedPrompter::new(Box::new(AutoChannel::scripted(vec![
            PromptAction::Always,
        ]))));
        let engine = PermissionEngine::with_prompter(PermissionPolicy::ask(), prompter);

        let first = engine.ask("fetch", &json!({"url": "a"}), None).await;
        assert_eq!(first.method, PermissionMethod::UserAlways);
        assert!(first.is_allowed());

        // Second ask hits the session rule without prompting (the scripted
        // channel has no answers left and would deny).
        let second = engine.ask("fetch", &json!({"url": "b"}), None).await;
        assert_eq!(second.method, PermissionMethod::SessionRule);
        assert!(second.is_allowed());
    }

    #[tokio::test]
    async fn test_once_installs_no_rule() {
        let prompter = Arc::new(SharedPrompter::new(Box::new(AutoChannel::scripted(vec![
            PromptAction::No,
            PromptAction::Yes,
        ]))));
        let engine = PermissionEngine::with_prompter(PermissionPolicy::ask(), prompter);

        let first = engine.ask("fetch", &json!({}), None).await;
        assert!(!first.is_allowed());
        assert_eq!(first.method, PermissionMethod::UserOnce);
        assert_eq!(engine.session_rule_count(), 0);

        let second = engine.ask("fetch", &json!({}), None).await;
        assert!(second.is_allowed());
    }

    #[tokio::test]
    async fn test_channel_timeout_denies() {
        let prompter = Arc::new(SharedPrompter::with_timeout(
            Box::new(channels::HangingChannel),
            Duration::from_millis(20),
        ));
        let engine = PermissionEngine::with_prompter(PermissionPolicy::ask(), prompter);
        let decision = engine.ask("slow", &json!({}), None).await;
        assert!(!decision.is_allowed());
        assert_eq!(decision.reason, "timeout");
    }

    #[tokio::test]
    async fn test_coalesced_asks_share_one_prompt() {
        let channel = AutoChannel::scripted(vec![PromptAction::Yes])
            .with_delay(Duration::from_millis(50));
        let counter = channel.prompt_counter();
        let prompter = Arc::new(SharedPrompter::new(Box::new(channel)));
        let engine = Arc::new(PermissionEngine::with_prompter(
            PermissionPolicy::ask(),
            prompter,
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.ask("fetch", &json!({"url": "same"}), None).await
            }));
        }
        for handle in handles {
            let decision = handle.await.unwrap();
            assert!(decision.is_allowed());
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
