//! Error taxonomy for the runtime.
//!
//! One crate-level [`JaatoError`] covers every failure class the runtime can
//! surface. The split that matters most to callers:
//!
//! - **Configuration errors** (credentials, project, impersonation, plugin
//!   wiring) are fatal and carry multi-line remediation text in their
//!   `Display` output.
//! - **Transient provider errors** are retried by the token ledger's policy
//!   and only surface as [`JaatoError::TransientExhausted`] once retries run
//!   out; permanent provider errors propagate immediately.
//! - **Tool-execution failures are not errors.** An executor that fails
//!   produces a `ToolResult { is_error: true, .. }` that is fed back to the
//!   model; nothing in this module is involved.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, JaatoError>;

/// Classification of a transient provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientClass {
    /// Rate limiting / quota exhaustion (HTTP 429 and friends).
    RateLimit,
    /// Infrastructure trouble: service unavailable, deadline exceeded,
    /// aborted, internal error.
    Infra,
}

impl TransientClass {
    /// Short tag used in ledger events and log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            TransientClass::RateLimit => "rate_limit",
            TransientClass::Infra => "infra",
        }
    }
}

/// All errors surfaced by the runtime.
#[derive(Debug, Error)]
pub enum JaatoError {
    /// No credentials could be located for the configured auth method.
    #[error("no credentials found for authentication method: {auth_method}\n\nTo fix:\n{remediation}")]
    CredentialsNotFound {
        auth_method: String,
        remediation: String,
    },

    /// Credentials exist but are malformed or rejected.
    #[error("invalid credentials for authentication method: {auth_method}\nReason: {reason}\n\nTo fix:\n{remediation}")]
    CredentialsInvalid {
        auth_method: String,
        reason: String,
        remediation: String,
    },

    /// Authentication succeeded but the principal lacks permissions.
    #[error("credentials lack required permissions{}\n\nTo fix:\n{remediation}", project.as_ref().map(|p| format!(" (project: {})", p)).unwrap_or_default())]
    CredentialsPermissionDenied {
        project: Option<String>,
        remediation: String,
    },

    /// Project or location missing/invalid for the provider.
    #[error("invalid provider project configuration (project: {}, location: {})\n\nTo fix:\n{remediation}", project.as_deref().unwrap_or("not set"), location.as_deref().unwrap_or("not set"))]
    ProjectMisconfigured {
        project: Option<String>,
        location: Option<String>,
        remediation: String,
    },

    /// Service-account impersonation failed or was misconfigured.
    #[error("service account impersonation failed (target: {})\n\nTo fix:\n{remediation}", target.as_deref().unwrap_or("not set"))]
    ImpersonationFailed {
        target: Option<String>,
        remediation: String,
    },

    /// A plugin failed to discover or construct. Individual discovery
    /// failures are logged and skipped; this surfaces only when a caller
    /// requests the failed plugin explicitly.
    #[error("plugin discovery failed for '{plugin}': {message}")]
    PluginDiscoveryFailure { plugin: String, message: String },

    /// Two exposed plugins declared the same tool name.
    #[error("duplicate tool name '{tool}' declared by plugins '{first}' and '{second}'")]
    DuplicateToolName {
        tool: String,
        first: String,
        second: String,
    },

    /// Requested plugin is not available to the registry.
    #[error("unknown plugin: {0}")]
    PluginNotFound(String),

    /// Requested provider factory is not registered with the runtime.
    #[error("unknown provider: {0}")]
    ProviderNotFound(String),

    /// A transient provider failure (retried by the ledger).
    #[error("transient provider error ({}): {message}", class.tag())]
    Transient {
        class: TransientClass,
        message: String,
    },

    /// The retry budget was exhausted on transient failures.
    #[error("provider call failed after {attempts} attempts; last error: {last_error}")]
    TransientExhausted { attempts: u32, last_error: String },

    /// A permanent provider failure (schema, malformed message, unsupported
    /// operation); never retried.
    #[error("provider error: {0}")]
    Permanent(String),

    /// TLS/certificate trouble; reported once with guidance, never retried.
    #[error("SSL certificate verification failed: {0}\nIf you are behind a corporate proxy, export its root CA bundle and point REQUESTS_CA_BUNDLE / SSL_CERT_FILE at it.")]
    Ssl(String),

    /// Operation requires a connected runtime/provider.
    #[error("runtime is not connected; call connect() first")]
    NotConnected,

    /// Operation requires a configured session.
    #[error("session is not configured; call configure() first")]
    NotConfigured,

    /// A second `send_message` entered a session that is already mid-turn.
    #[error("session is busy: a send_message call is already in flight")]
    SessionBusy,

    /// The in-flight send was cancelled cooperatively.
    #[error("send cancelled")]
    Cancelled,

    /// Requested turn index is outside the recorded history.
    #[error("invalid turn index {index}: session has {turns} turns")]
    InvalidTurn { index: usize, turns: usize },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure (ledger, file channel, manifest scan).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl JaatoError {
    /// Whether the ledger's retry policy applies to this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, JaatoError::Transient { .. })
    }

    /// Transient classification, when applicable.
    pub fn transient_class(&self) -> Option<TransientClass> {
        match self {
            JaatoError::Transient { class, .. } => Some(*class),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_carry_remediation() {
        let err = JaatoError::CredentialsNotFound {
            auth_method: "api_key".into(),
            remediation: "  1. Obtain an API key from your provider console\n  2. Set JAATO_API_KEY".into(),
        };
        let text = err.to_string();
        assert!(text.contains("api_key"));
        assert!(text.contains("To fix:"));
        assert!(text.contains("JAATO_API_KEY"));
    }

    #[test]
    fn test_transient_classification() {
        let err = JaatoError::Transient {
            class: TransientClass::RateLimit,
            message: "429 too many requests".into(),
        };
        assert!(err.is_transient());
        assert_eq!(err.transient_class(), Some(TransientClass::RateLimit));
        assert!(!JaatoError::Permanent("bad schema".into()).is_transient());
    }
}
