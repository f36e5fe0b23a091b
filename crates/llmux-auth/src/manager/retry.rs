use std::time::Duration;

use time::OffsetDateTime;

use crate::entity::{Auth, AuthStatus, LastError};
use crate::error::{ExecError, ExecErrorKind};

/// Base quota cooldown; doubles per backoff level up to the cap.
const QUOTA_COOLDOWN_BASE: Duration = Duration::from_secs(60);
const QUOTA_COOLDOWN_CAP: Duration = Duration::from_secs(3600);
/// Base wait for 5xx/network retries, scaled by attempt count.
const TRANSIENT_RETRY_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Global retry budget per request; overridable per auth.
    pub request_retry: u32,
    /// Cap for the transient-failure wait.
    pub max_retry_interval: Duration,
    /// Global switch: never write cooldown timestamps.
    pub disable_cooling: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            request_retry: 3,
            max_retry_interval: Duration::from_secs(30),
            disable_cooling: false,
        }
    }
}

pub fn quota_cooldown(backoff_level: u32) -> Duration {
    let factor = 1u64 << backoff_level.min(10);
    QUOTA_COOLDOWN_BASE
        .saturating_mul(factor as u32)
        .min(QUOTA_COOLDOWN_CAP)
}

pub fn transient_wait(attempt: u32, max: Duration) -> Duration {
    TRANSIENT_RETRY_BASE
        .saturating_mul(attempt.max(1))
        .min(max)
}

/// Decide whether another attempt is worth it and how long to wait first.
///
/// Consults, in order: the auth's `request_retry` override, the global
/// budget, then the error classification. A spent budget always answers no.
pub fn should_retry_after_error(
    err: &ExecError,
    attempt: u32,
    auth: &Auth,
    cfg: &RetryConfig,
) -> (Duration, bool) {
    let budget = auth
        .request_retry_override()
        .unwrap_or(cfg.request_retry);
    if attempt >= budget {
        return (Duration::ZERO, false);
    }
    if !err.retryable() {
        return (Duration::ZERO, false);
    }
    let wait = match err.kind {
        // The cooled-down auth is excluded on re-pick; siblings can be tried
        // immediately.
        ExecErrorKind::QuotaExceeded | ExecErrorKind::RefreshRequired => Duration::ZERO,
        _ => transient_wait(attempt, cfg.max_retry_interval),
    };
    (wait, true)
}

/// Apply one execution outcome to the per-model state. This is the only
/// place quota/cooldown state changes.
pub fn apply_success(auth: &mut Auth, model: &str, now: OffsetDateTime) {
    let ms = auth.model_state_mut(model);
    ms.status = AuthStatus::Active;
    ms.status_message = None;
    ms.unavailable = false;
    ms.next_retry_after = None;
    ms.last_error = None;
    ms.quota.exceeded = false;
    ms.quota.reason.clear();
    ms.quota.next_recover_at = None;
    ms.quota.backoff_level = 0;
    ms.updated_at = Some(now);

    auth.status = AuthStatus::Active;
    auth.last_error = None;
    auth.aggregate(now);
}

pub fn apply_failure(
    auth: &mut Auth,
    model: &str,
    err: &ExecError,
    attempt: u32,
    cfg: &RetryConfig,
    now: OffsetDateTime,
) {
    let cooling_disabled = auth
        .disable_cooling_override()
        .unwrap_or(cfg.disable_cooling);
    let max_retry_interval = cfg.max_retry_interval;

    let last_error = LastError {
        code: format!("{:?}", err.kind),
        message: err.message.clone(),
        retryable: err.retryable(),
        http_status: err.http_status,
    };

    let ms = auth.model_state_mut(model);
    ms.updated_at = Some(now);
    ms.last_error = Some(last_error.clone());

    match err.kind {
        ExecErrorKind::QuotaExceeded => {
            ms.status = AuthStatus::Error;
            ms.status_message = Some("quota exceeded".to_string());
            ms.quota.exceeded = true;
            ms.quota.reason = err.message.clone();
            ms.unavailable = true;
            if cooling_disabled {
                ms.quota.next_recover_at = None;
                ms.next_retry_after = None;
            } else {
                let cooldown = quota_cooldown(ms.quota.backoff_level);
                let until = now + cooldown;
                ms.quota.next_recover_at = Some(until);
                ms.next_retry_after = Some(until);
            }
            ms.quota.backoff_level = ms.quota.backoff_level.saturating_add(1);
        }
        ExecErrorKind::UpstreamTransient | ExecErrorKind::Network => {
            ms.status = AuthStatus::Error;
            ms.unavailable = true;
            ms.next_retry_after = if cooling_disabled {
                None
            } else {
                Some(now + transient_wait(attempt, max_retry_interval))
            };
        }
        ExecErrorKind::RefreshRequired => {
            // Token expired: hand the auth to the refresh loop instead of
            // cooling the model.
            auth.status = AuthStatus::Refreshing;
            auth.next_refresh_after = Some(now);
            auth.last_error = Some(last_error);
            auth.aggregate(now);
            return;
        }
        ExecErrorKind::RefreshFailed => {
            auth.status = AuthStatus::Error;
            auth.last_error = Some(last_error);
            auth.aggregate(now);
            return;
        }
        // Not retryable: record only, never mark unavailable.
        ExecErrorKind::UpstreamFatal
        | ExecErrorKind::Unsupported
        | ExecErrorKind::Cancelled => {}
    }

    auth.last_error = Some(last_error);
    auth.aggregate(now);
}
