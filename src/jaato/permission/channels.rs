//! Interaction channels that put a human (or automation) behind the `ask`
//! default policy.
//!
//! A channel presents one [`PermissionRequest`] and returns one
//! [`PromptAction`]. Channels never install rules themselves; scope
//! semantics (`always`/`never` install session rules, `yes`/`no`/`once` are
//! one-shot) live in the engine.
//!
//! Four implementations ship with the runtime:
//!
//! - [`ConsoleChannel`] prompts on the terminal with the tool name, a
//!   truncated argument preview, and a y/n/a/v menu.
//! - [`WebhookChannel`] POSTs the request JSON to a configured URL and polls
//!   for the decision.
//! - [`FileChannel`] drops a `<id>.request.json` file and polls for the
//!   matching `<id>.response.json`.
//! - [`AutoChannel`] replays scripted answers; the non-interactive channel
//!   used by tests and headless runs.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The five actions a channel may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptAction {
    /// Approve this call (one-shot; synonym of `once`).
    Yes,
    /// Deny this call (one-shot).
    No,
    /// Approve and remember for the session.
    Always,
    /// Deny and remember for the session.
    Never,
    /// Approve this call only.
    Once,
}

impl PromptAction {
    /// Parse the wire/console spelling of an action.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(PromptAction::Yes),
            "n" | "no" => Some(PromptAction::No),
            "a" | "always" => Some(PromptAction::Always),
            "v" | "never" => Some(PromptAction::Never),
            "o" | "once" => Some(PromptAction::Once),
            _ => None,
        }
    }
}

/// One gating request presented to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Correlation id, echoed back in webhook/file responses.
    pub request_id: String,
    /// ISO-8601 creation timestamp.
    pub timestamp: String,
    /// Tool the model wants to invoke.
    pub tool: String,
    /// The call arguments.
    pub args: Value,
    /// Optional free-form context (e.g. agent name) shown to the approver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl PermissionRequest {
    /// Build a request with a fresh id and current timestamp.
    pub fn new(tool: &str, args: Value, context: Option<&str>) -> Self {
        Self {
            request_id: format!("perm_{}", &Uuid::new_v4().simple().to_string()[..12]),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            tool: tool.to_string(),
            args,
            context: context.map(|s| s.to_string()),
        }
    }

    /// Argument preview capped at `max_len` characters for display.
    pub fn args_preview(&self, max_len: usize) -> String {
        let rendered = self.args.to_string();
        if rendered.chars().count() <= max_len {
            return rendered;
        }
        let truncated: String = rendered.chars().take(max_len).collect();
        format!("{}…", truncated)
    }
}

/// Decision payload returned by webhook and file channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub request_id: String,
    /// One of `yes`, `no`, `always`, `never`, `once`.
    pub decision: PromptAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A pluggable approval surface.
#[async_trait]
pub trait InteractionChannel: Send + Sync {
    /// Present the request and block until the user (or automation) answers.
    ///
    /// The engine wraps this call in its own timeout; implementations may
    /// block indefinitely.
    async fn prompt(&self, request: &PermissionRequest) -> Result<PromptAction, String>;
}

// ---- Console ----

/// Terminal prompt channel.
///
/// Prints the tool name, a truncated argument preview, and a single-line
/// menu, then reads one line from stdin. Input is read on a blocking worker
/// so the runtime is never stalled.
pub struct ConsoleChannel {
    /// Maximum characters of the argument preview.
    preview_len: usize,
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self { preview_len: 200 }
    }
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InteractionChannel for ConsoleChannel {
    async fn prompt(&self, request: &PermissionRequest) -> Result<PromptAction, String> {
        let header = format!(
            "\n{}\n  Permission needed: {}\n{}\n  args: {}\n{}",
            "═".repeat(60),
            request.tool,
            request
                .context
                .as_deref()
                .map(|c| format!("  context: {}\n", c))
                .unwrap_or_default(),
            request.args_preview(self.preview_len),
            "═".repeat(60),
        );
        let answer = tokio::task::spawn_blocking(move || {
            let stdout = std::io::stdout();
            {
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", header);
                let _ = write!(out, "  [y]es once / [n]o / [a]lways / ne[v]er > ");
                let _ = out.flush();
            }
            loop {
                let mut line = String::new();
                if std::io::stdin().read_line(&mut line).is_err() {
                    return None;
                }
                if line.is_empty() {
                    // EOF: treat as a one-shot denial.
                    return Some(PromptAction::No);
                }
                if let Some(action) = PromptAction::parse(&line) {
                    return Some(action);
                }
                let mut out = stdout.lock();
                let _ = write!(out, "  invalid choice; enter y, n, a, or v > ");
                let _ = out.flush();
            }
        })
        .await
        .map_err(|e| format!("console prompt task failed: {}", e))?;
        answer.ok_or_else(|| "stdin unavailable".to_string())
    }
}

// ---- Webhook ----

/// Channel that POSTs the request to a URL and polls for the decision.
///
/// The request body is the [`PermissionRequest`] JSON. The channel then GETs
/// `<poll_url>/<request_id>` until it yields a [`PermissionResponse`] with a
/// matching `request_id`; non-200 poll responses mean "not answered yet".
pub struct WebhookChannel {
    http: reqwest::Client,
    submit_url: String,
    poll_url: String,
    poll_interval: Duration,
}

impl WebhookChannel {
    /// Channel posting to `submit_url` and polling `<submit_url>/<id>`.
    pub fn new(submit_url: impl Into<String>) -> Self {
        let submit_url = submit_url.into();
        let poll_url = submit_url.trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            submit_url,
            poll_url,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Override the poll endpoint (builder pattern).
    pub fn with_poll_url(mut self, poll_url: impl Into<String>) -> Self {
        self.poll_url = poll_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the poll interval (builder pattern).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl InteractionChannel for WebhookChannel {
    async fn prompt(&self, request: &PermissionRequest) -> Result<PromptAction, String> {
        self.http
            .post(&self.submit_url)
            .json(request)
            .send()
            .await
            .map_err(|e| format!("webhook submit failed: {}", e))?
            .error_for_status()
            .map_err(|e| format!("webhook submit rejected: {}", e))?;

        let poll = format!("{}/{}", self.poll_url, request.request_id);
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let response = match self.http.get(&poll).send().await {
                Ok(r) => r,
                Err(err) => {
                    log::debug!("webhook poll error (will retry): {}", err);
                    continue;
                }
            };
            if !response.status().is_success() {
                continue;
            }
            match response.json::<PermissionResponse>().await {
                Ok(decision) if decision.request_id == request.request_id => {
                    return Ok(decision.decision);
                }
                Ok(_) => continue,
                Err(err) => {
                    log::debug!("webhook poll returned malformed body: {}", err);
                    continue;
                }
            }
        }
    }
}

// ---- File ----

/// Channel that exchanges request/response JSON files in a directory.
///
/// Writes `<request_id>.request.json`, then polls for
/// `<request_id>.response.json`. The response file is consumed (deleted)
/// once read so a directory can serve many requests.
pub struct FileChannel {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Override the poll interval (builder pattern).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl InteractionChannel for FileChannel {
    async fn prompt(&self, request: &PermissionRequest) -> Result<PromptAction, String> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("cannot create channel dir: {}", e))?;
        let request_path = self.dir.join(format!("{}.request.json", request.request_id));
        let response_path = self
            .dir
            .join(format!("{}.response.json", request.request_id));

        let body = serde_json::to_string_pretty(request)
            .map_err(|e| format!("cannot serialize request: {}", e))?;
        std::fs::write(&request_path, body).map_err(|e| format!("cannot write request: {}", e))?;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            if !response_path.exists() {
                continue;
            }
            let raw = match std::fs::read_to_string(&response_path) {
                Ok(raw) => raw,
                // The approver may still be mid-write.
                Err(_) => continue,
            };
            match serde_json::from_str::<PermissionResponse>(&raw) {
                Ok(response) if response.request_id == request.request_id => {
                    let _ = std::fs::remove_file(&response_path);
                    let _ = std::fs::remove_file(&request_path);
                    return Ok(response.decision);
                }
                Ok(_) => continue,
                Err(err) => {
                    log::debug!("file channel response not yet parseable: {}", err);
                    continue;
                }
            }
        }
    }
}

// ---- Auto ----

/// Non-interactive channel replaying scripted answers.
///
/// Answers are consumed in order; once the script is exhausted the default
/// action is returned. An optional artificial delay makes coalescing
/// observable in tests.
pub struct AutoChannel {
    script: Mutex<Vec<PromptAction>>,
    default_action: PromptAction,
    delay: Option<Duration>,
    prompts: Arc<AtomicUsize>,
}

impl AutoChannel {
    /// Channel that always answers `action`.
    pub fn always(action: PromptAction) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            default_action: action,
            delay: None,
            prompts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Channel that replays `script` in order, then denies.
    pub fn scripted(script: Vec<PromptAction>) -> Self {
        Self {
            script: Mutex::new(script),
            default_action: PromptAction::No,
            delay: None,
            prompts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add an artificial answer delay (builder pattern).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter of how many prompts this channel has served.
    pub fn prompt_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.prompts)
    }
}

#[async_trait]
impl InteractionChannel for AutoChannel {
    async fn prompt(&self, _request: &PermissionRequest) -> Result<PromptAction, String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().expect("auto channel poisoned");
        if script.is_empty() {
            Ok(self.default_action)
        } else {
            Ok(script.remove(0))
        }
    }
}

/// Test-support channel that never answers; exercises the engine timeout.
#[cfg(test)]
pub struct HangingChannel;

#[cfg(test)]
#[async_trait]
impl InteractionChannel for HangingChannel {
    async fn prompt(&self, _request: &PermissionRequest) -> Result<PromptAction, String> {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}
