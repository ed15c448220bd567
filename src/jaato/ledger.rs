//! Append-only token accounting and the retry policy around provider calls.
//!
//! The [`TokenLedger`] records one event per provider-call attempt: a
//! pre-call token estimate, each transient API error with its
//! classification, the final response with its token counts, and any SSL
//! failure. The ledger is shared by every session of a runtime and is
//! thread-safe.
//!
//! The ledger also owns the [`RetryPolicy`] the orchestrator applies around
//! provider calls: exponential backoff with jitter on transient failures,
//! immediate propagation of permanent errors, and a one-shot guidance
//! message (never a retry) for SSL certificate failures.
//!
//! # Example
//!
//! ```rust
//! use jaato::ledger::TokenLedger;
//! use jaato::types::TokenUsage;
//!
//! let ledger = TokenLedger::new();
//! ledger.record_response(Some(TokenUsage { prompt_tokens: 10, output_tokens: 4, total_tokens: 14 }));
//! let summary = ledger.summarize();
//! assert_eq!(summary.calls, 1);
//! assert_eq!(summary.total_tokens, 14);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::jaato::error::{Result, TransientClass};
use crate::jaato::types::TokenUsage;

/// Stage of a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerStage {
    /// Token estimate taken before the call.
    #[serde(rename = "pre-count")]
    PreCount,
    /// The pre-call estimate itself failed.
    #[serde(rename = "pre-count-error")]
    PreCountError,
    /// A transient or permanent API error on some attempt.
    #[serde(rename = "api-error")]
    ApiError,
    /// The call completed; token counts captured when reported.
    #[serde(rename = "response")]
    Response,
    /// TLS certificate failure; surfaced once, not retried.
    #[serde(rename = "ssl-error")]
    SslError,
}

/// One recorded ledger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub stage: LedgerStage,
    /// Unix timestamp of the event.
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `true` when the error was rate-limit shaped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<bool>,
    /// `true` when the error was infrastructure shaped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infra: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<usize>,
}

impl LedgerEvent {
    fn new(stage: LedgerStage) -> Self {
        Self {
            stage,
            ts: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            attempt: None,
            error: None,
            rate_limit: None,
            infra: None,
            prompt_tokens: None,
            output_tokens: None,
            total_tokens: None,
        }
    }
}

/// Aggregate view over the recorded events.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    /// Number of completed calls (`response` events).
    pub calls: usize,
    pub total_prompt_tokens: usize,
    pub total_output_tokens: usize,
    pub total_tokens: usize,
    /// Number of `api-error` events.
    pub retry_attempts: usize,
    /// Number of rate-limit classified `api-error` events.
    pub rate_limit_retries: usize,
    /// Most recent rate-limit error text, if any.
    pub last_rate_limit_error: Option<String>,
    /// Highest attempt index seen on an error event.
    pub max_retry_attempt_index: u32,
}

/// Backoff parameters applied to transient provider failures.
///
/// Sleep for attempt `n` (1-based) is
/// `min(max_delay, base_delay * 2^(n-1)) * U(0.5, 1.5)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Read overrides from `JAATO_RETRY_ATTEMPTS`, `JAATO_RETRY_BASE_DELAY`,
    /// and `JAATO_RETRY_MAX_DELAY` (seconds, fractional allowed).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_attempts = std::env::var("JAATO_RETRY_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts);
        let base_delay = std::env::var("JAATO_RETRY_BASE_DELAY")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.base_delay);
        let max_delay = std::env::var("JAATO_RETRY_MAX_DELAY")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.max_delay);
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Jittered sleep for the given 1-based attempt index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Thread-safe, append-only record of provider calls and retries.
pub struct TokenLedger {
    events: Mutex<Vec<LedgerEvent>>,
    policy: RetryPolicy,
    /// SSL guidance is emitted at most once per ledger.
    ssl_guidance_shown: Mutex<bool>,
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenLedger {
    /// Create a ledger with the environment-tuned retry policy.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            policy: RetryPolicy::from_env(),
            ssl_guidance_shown: Mutex::new(false),
        }
    }

    /// Create a ledger with an explicit retry policy.
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            policy,
            ssl_guidance_shown: Mutex::new(false),
        }
    }

    /// Retry parameters used around provider calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    fn push(&self, event: LedgerEvent) {
        self.events.lock().expect("ledger poisoned").push(event);
    }

    /// Record the pre-call token estimate.
    pub fn record_precount(&self, total_tokens: usize) {
        let mut event = LedgerEvent::new(LedgerStage::PreCount);
        event.total_tokens = Some(total_tokens);
        self.push(event);
    }

    /// Record a failed pre-call estimate.
    pub fn record_precount_error(&self, error: &str) {
        let mut event = LedgerEvent::new(LedgerStage::PreCountError);
        event.error = Some(error.to_string());
        self.push(event);
    }

    /// Record a transient/permanent API error on a given attempt.
    pub fn record_api_error(&self, attempt: u32, error: &str, class: Option<TransientClass>) {
        let mut event = LedgerEvent::new(LedgerStage::ApiError);
        event.attempt = Some(attempt);
        event.error = Some(error.to_string());
        event.rate_limit = Some(class == Some(TransientClass::RateLimit));
        event.infra = Some(class == Some(TransientClass::Infra));
        self.push(event);
    }

    /// Record a completed call, with token counts when the provider reported
    /// them.
    pub fn record_response(&self, usage: Option<TokenUsage>) {
        let mut event = LedgerEvent::new(LedgerStage::Response);
        if let Some(usage) = usage {
            event.prompt_tokens = Some(usage.prompt_tokens);
            event.output_tokens = Some(usage.output_tokens);
            event.total_tokens = Some(usage.total_tokens);
        }
        self.push(event);
    }

    /// Record an SSL certificate failure and emit the one-shot guidance.
    pub fn record_ssl_error(&self, attempt: u32, error: &str) {
        let mut event = LedgerEvent::new(LedgerStage::SslError);
        event.attempt = Some(attempt);
        event.error = Some(error.to_string());
        self.push(event);

        let mut shown = self.ssl_guidance_shown.lock().expect("ledger poisoned");
        if !*shown {
            *shown = true;
            log::error!(
                "SSL certificate verification failed: {}. \
                 If you are behind a corporate proxy, export its root CA bundle \
                 and point SSL_CERT_FILE at it. This error is not retried.",
                error
            );
        }
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().expect("ledger poisoned").clone()
    }

    /// Aggregate totals, retry counts, and the most recent rate-limit error.
    pub fn summarize(&self) -> LedgerSummary {
        let events = self.events.lock().expect("ledger poisoned");
        let mut summary = LedgerSummary {
            calls: 0,
            total_prompt_tokens: 0,
            total_output_tokens: 0,
            total_tokens: 0,
            retry_attempts: 0,
            rate_limit_retries: 0,
            last_rate_limit_error: None,
            max_retry_attempt_index: 0,
        };
        for event in events.iter() {
            match event.stage {
                LedgerStage::Response => {
                    summary.calls += 1;
                    summary.total_prompt_tokens += event.prompt_tokens.unwrap_or(0);
                    summary.total_output_tokens += event.output_tokens.unwrap_or(0);
                    summary.total_tokens += event.total_tokens.unwrap_or(0);
                }
                LedgerStage::ApiError => {
                    summary.retry_attempts += 1;
                    if event.rate_limit == Some(true) {
                        summary.rate_limit_retries += 1;
                        summary.last_rate_limit_error = event.error.clone();
                    }
                    summary.max_retry_attempt_index =
                        summary.max_retry_attempt_index.max(event.attempt.unwrap_or(0));
                }
                _ => {}
            }
        }
        summary
    }

    /// Append all events to a JSONL file, one enriched line per event.
    ///
    /// `JAATO_LEDGER_PATH` overrides the target path. Each line carries the
    /// event fields plus `iso_ts`, `event_index`, and `internal_tokens`
    /// (total minus prompt+output) when counts are present. A write failure
    /// is logged and swallowed; accounting must never take the runtime down.
    pub fn write_ledger(&self, filepath: impl AsRef<Path>) -> Option<PathBuf> {
        let path = std::env::var("JAATO_LEDGER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| filepath.as_ref().to_path_buf());
        match self.write_ledger_inner(&path) {
            Ok(()) => Some(path),
            Err(err) => {
                log::warn!("ledger write to {} failed: {}", path.display(), err);
                None
            }
        }
    }

    fn write_ledger_inner(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let events = self.events();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for (index, event) in events.iter().enumerate() {
            let mut line = serde_json::to_value(event)?;
            let obj = line.as_object_mut().expect("event serializes to object");
            let iso = chrono::DateTime::from_timestamp_micros((event.ts * 1_000_000.0) as i64)
                .unwrap_or_else(Utc::now)
                .to_rfc3339_opts(SecondsFormat::Micros, true);
            obj.insert("iso_ts".into(), serde_json::Value::String(iso));
            obj.insert("event_index".into(), serde_json::Value::from(index));
            if let (Some(prompt), Some(output), Some(total)) =
                (event.prompt_tokens, event.output_tokens, event.total_tokens)
            {
                let internal = total as i64 - (prompt as i64 + output as i64);
                obj.insert("internal_tokens".into(), serde_json::Value::from(internal));
            }
            writeln!(file, "{}", serde_json::to_string(&line)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_counts_by_class() {
        let ledger = TokenLedger::with_policy(RetryPolicy::default());
        ledger.record_api_error(1, "429 too many requests", Some(TransientClass::RateLimit));
        ledger.record_api_error(2, "503 unavailable", Some(TransientClass::Infra));
        ledger.record_response(Some(TokenUsage {
            prompt_tokens: 100,
            output_tokens: 20,
            total_tokens: 120,
        }));

        let summary = ledger.summarize();
        assert_eq!(summary.calls, 1);
        assert_eq!(summary.retry_attempts, 2);
        assert_eq!(summary.rate_limit_retries, 1);
        assert_eq!(summary.max_retry_attempt_index, 2);
        assert_eq!(
            summary.last_rate_limit_error.as_deref(),
            Some("429 too many requests")
        );
        assert_eq!(summary.total_tokens, 120);
    }

    #[test]
    fn test_retry_delay_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };
        for attempt in 1..=6 {
            let delay = policy.delay_for(attempt);
            let exp = (2f64.powi(attempt as i32 - 1)).min(30.0);
            assert!(delay.as_secs_f64() >= exp * 0.5 - f64::EPSILON);
            assert!(delay.as_secs_f64() <= exp * 1.5 + f64::EPSILON);
        }
    }

    #[test]
    fn test_write_ledger_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let ledger = TokenLedger::with_policy(RetryPolicy::default());
        ledger.record_precount(42);
        ledger.record_response(Some(TokenUsage {
            prompt_tokens: 40,
            output_tokens: 10,
            total_tokens: 55,
        }));

        let written = ledger.write_ledger(&path).unwrap();
        let content = std::fs::read_to_string(written).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["stage"], "pre-count");
        assert_eq!(first["event_index"], 0);
        assert!(first["iso_ts"].as_str().unwrap().ends_with('Z'));

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["stage"], "response");
        // 55 total - (40 + 10) visible as internal tokens.
        assert_eq!(second["internal_tokens"], 5);
    }

    #[test]
    fn test_ssl_guidance_recorded_once() {
        let ledger = TokenLedger::with_policy(RetryPolicy::default());
        ledger.record_ssl_error(1, "certificate verify failed");
        ledger.record_ssl_error(1, "certificate verify failed");
        let events = ledger.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.stage == LedgerStage::SslError));
    }
}
