//! Shared plumbing for HTTP-backed providers.
//!
//! Providers share one pooled [`reqwest`] client (TLS sessions and DNS
//! lookups stay warm across instances) and one error-mapping policy:
//! HTTP 429 is a rate-limit transient, 5xx is an infrastructure transient,
//! TLS trouble is the non-retried SSL class, and everything else is
//! permanent.

use std::time::Duration;

use lazy_static::lazy_static;

use crate::jaato::error::{JaatoError, TransientClass};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialized shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Map a transport-level failure onto the runtime's error classes.
pub fn map_reqwest_error(err: reqwest::Error) -> JaatoError {
    let rendered = err.to_string();
    let lower = rendered.to_ascii_lowercase();
    if lower.contains("certificate") || lower.contains("ssl") || lower.contains("tls") {
        return JaatoError::Ssl(rendered);
    }
    if err.is_timeout() || err.is_connect() {
        return JaatoError::Transient {
            class: TransientClass::Infra,
            message: rendered,
        };
    }
    JaatoError::Permanent(rendered)
}

/// Map a non-success HTTP status onto the runtime's error classes.
pub fn map_status_error(status: reqwest::StatusCode, body: &str) -> JaatoError {
    let message = format!("{}: {}", status.as_u16(), snippet(body));
    match status.as_u16() {
        429 => JaatoError::Transient {
            class: TransientClass::RateLimit,
            message,
        },
        500 | 502 | 503 | 504 => JaatoError::Transient {
            class: TransientClass::Infra,
            message,
        },
        _ => JaatoError::Permanent(message),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_classification() {
        let rate = map_status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(rate.transient_class(), Some(TransientClass::RateLimit));

        let infra = map_status_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert_eq!(infra.transient_class(), Some(TransientClass::Infra));

        let permanent = map_status_error(reqwest::StatusCode::BAD_REQUEST, "bad schema");
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_body_snippet_is_bounded() {
        let err = map_status_error(reqwest::StatusCode::BAD_REQUEST, &"x".repeat(5000));
        assert!(err.to_string().len() < 300);
    }
}
