use std::time::Duration;

use serde_json::json;

use crate::store::StoreError;

/// Failures raised by the manager's registry and selection paths.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth not found: {0}")]
    NotFound(String),
    #[error("no auth available for {provider}/{model}")]
    NoAuthAvailable { provider: String, model: String },
    /// Every candidate is blocked on the requested model. `provider` is
    /// `None` for cross-provider (`mixed`) selection, where the error body
    /// must not leak which provider was consulted.
    #[error("all auths cooling down for {model}")]
    ModelCooldown {
        provider: Option<String>,
        model: String,
        retry_after: Option<Duration>,
    },
    #[error("no executor registered for provider {0}")]
    ExecutorMissing(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl AuthError {
    pub fn http_status(&self) -> u16 {
        match self {
            AuthError::NotFound(_) => 404,
            AuthError::NoAuthAvailable { .. } => 503,
            AuthError::ModelCooldown { .. } => 429,
            AuthError::ExecutorMissing(_) => 503,
            AuthError::Store(_) => 500,
            AuthError::Exec(err) => err.http_status.unwrap_or(502),
        }
    }

    /// `Retry-After` value in whole seconds, when the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AuthError::ModelCooldown {
                retry_after: Some(wait),
                ..
            } => Some(wait.as_secs().max(1)),
            _ => None,
        }
    }

    pub fn to_json_body(&self) -> serde_json::Value {
        match self {
            AuthError::ModelCooldown {
                provider, model, ..
            } => {
                let mut body = json!({
                    "error": "model_cooldown",
                    "model": model,
                });
                if let Some(provider) = provider {
                    body["provider"] = json!(provider);
                }
                body
            }
            AuthError::NoAuthAvailable { provider, model } => json!({
                "error": "no_auth_available",
                "provider": provider,
                "model": model,
            }),
            AuthError::NotFound(id) => json!({
                "error": "auth_not_found",
                "id": id,
            }),
            other => json!({
                "error": "upstream_error",
                "message": other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// Provider-declared quota exhaustion (usually 429).
    QuotaExceeded,
    /// The access token expired; a refresh has been scheduled.
    RefreshRequired,
    RefreshFailed,
    /// 5xx or otherwise transient upstream condition.
    UpstreamTransient,
    /// Non-auth 4xx; retrying will not help.
    UpstreamFatal,
    /// Transport-level failure with no HTTP response.
    Network,
    Unsupported,
    Cancelled,
}

/// One upstream execution failure, classified for the retry machinery.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
}

impl ExecError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => ExecErrorKind::QuotaExceeded,
            401 | 403 => ExecErrorKind::RefreshRequired,
            500 | 502 | 503 | 504 => ExecErrorKind::UpstreamTransient,
            _ => ExecErrorKind::UpstreamFatal,
        };
        Self {
            kind,
            http_status: Some(status),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ExecErrorKind::Network,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn refresh_failed(message: impl Into<String>) -> Self {
        Self {
            kind: ExecErrorKind::RefreshFailed,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn unsupported(what: &str) -> Self {
        Self {
            kind: ExecErrorKind::Unsupported,
            http_status: None,
            message: format!("unsupported: {what}"),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ExecErrorKind::Cancelled,
            http_status: None,
            message: "cancelled".to_string(),
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            ExecErrorKind::QuotaExceeded
                | ExecErrorKind::RefreshRequired
                | ExecErrorKind::UpstreamTransient
                | ExecErrorKind::Network
        )
    }
}
