//! Structured error taxonomy shared by every provider.
//!
//! The reference crate this workspace is built from returns `Box<dyn std::error::Error>`
//! everywhere; callers can't distinguish an auth failure from a transient network error
//! without string-matching. `LlmError` gives every failure a `kind`, a `retryable` hint, and
//! (for rate limits) a `retry_after`, so a caller can implement its own retry/backoff policy
//! without the core scheduling retries itself.

use std::collections::HashMap;

/// The enumerated error categories. See `HTTP-status to Type mapping` in the design notes
/// for how HTTP responses are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Network,
    Validation,
    Provider,
    Timeout,
    Quota,
    Model,
    Internal,
}

impl ErrorKind {
    /// Default retryability for this kind, before any per-instance override (e.g. a 429's
    /// `Retry-After` header still marks it retryable; nothing flips it to non-retryable).
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Provider
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::Provider => "provider",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Quota => "quota",
            ErrorKind::Model => "model",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status → Type mapping from the error handling design.
    pub fn from_status(status: u16) -> ErrorKind {
        match status {
            401 | 403 => ErrorKind::Auth,
            402 => ErrorKind::Quota,
            404 => ErrorKind::Model,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            400 => ErrorKind::Validation,
            s if s >= 500 => ErrorKind::Provider,
            _ => ErrorKind::Internal,
        }
    }
}

/// A single typed error carrying enough context for a caller to decide what to do next.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?} error from {provider}{model_suffix}: {message}", model_suffix = self.model.as_deref().map(|m| format!(" (model {})", m)).unwrap_or_default())]
pub struct LlmError {
    pub kind: ErrorKind,
    pub code: Option<String>,
    pub message: String,
    pub provider: String,
    pub model: Option<String>,
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub retryable: bool,
    pub retry_after: Option<u64>,
}

impl LlmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, provider: impl Into<String>) -> Self {
        let retryable = kind.default_retryable();
        LlmError {
            kind,
            code: None,
            message: message.into(),
            provider: provider.into(),
            model: None,
            status_code: None,
            headers: HashMap::new(),
            retryable,
            retry_after: None,
        }
    }

    pub fn validation(
        message: impl Into<String>,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Self {
        let mut e = LlmError::new(ErrorKind::Validation, message, provider.unwrap_or(""));
        e.model = model.map(|m| m.to_string());
        e
    }

    pub fn network(message: impl Into<String>, provider: impl Into<String>) -> Self {
        LlmError::new(ErrorKind::Network, message, provider)
    }

    pub fn internal(message: impl Into<String>, provider: impl Into<String>) -> Self {
        LlmError::new(ErrorKind::Internal, message, provider)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builds a typed error from an HTTP response that came back non-2xx, applying the
    /// status→kind mapping and honoring `Retry-After` on 429s.
    pub fn from_http_status(
        status: u16,
        headers: &HashMap<String, String>,
        body: &str,
        provider: impl Into<String>,
        model: Option<&str>,
    ) -> Self {
        let kind = ErrorKind::from_status(status);
        let retry_after = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, v)| v.parse::<u64>().ok());
        LlmError {
            retryable: kind.default_retryable() || retry_after.is_some(),
            kind,
            code: Some(status.to_string()),
            message: if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                body.to_string()
            },
            provider: provider.into(),
            model: model.map(|m| m.to_string()),
            status_code: Some(status),
            headers: headers.clone(),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_design() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_status(402), ErrorKind::Quota);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::Model);
        assert_eq!(ErrorKind::from_status(408), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::Validation);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::Provider);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::Provider);
    }

    #[test]
    fn retryability_defaults_match_design() {
        assert!(ErrorKind::Network.default_retryable());
        assert!(ErrorKind::Timeout.default_retryable());
        assert!(ErrorKind::RateLimit.default_retryable());
        assert!(ErrorKind::Provider.default_retryable());
        assert!(!ErrorKind::Auth.default_retryable());
        assert!(!ErrorKind::Validation.default_retryable());
        assert!(!ErrorKind::Model.default_retryable());
        assert!(!ErrorKind::Quota.default_retryable());
    }

    #[test]
    fn retry_after_header_is_parsed() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "30".to_string());
        let err = LlmError::from_http_status(429, &headers, "", "openai", None);
        assert_eq!(err.retry_after, Some(30));
        assert!(err.retryable);
    }
}
